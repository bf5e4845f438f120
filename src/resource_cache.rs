//! The [ResourceCache] loads resources by URI through a [SchemeTable], and keeps them until nothing uses them.
//!
//! Every request carries a [UsageDetector].  Requests for the same URI share one handle, one handler and one load; the
//! detectors of all of them are folded into a [ComposeUsageDetector].  Calling [ResourceCache::sweep] once per
//! frame (or on any other fixed tick) releases every resource whose composite says it is no longer in use.
//!
//! Locking is two-level.  The registry lock covers membership of the URI map and the tracking vec, and is never held
//! across a load.  Everything else about a resource is behind that resource's own lock, so unrelated URIs don't contend.
use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use url::Url;

use crate::resource_handle::{Join, LoadFlight, LoadOutcome, ResourceHandle};
use crate::*;

type CacheHashMap<V> = HashMap<String, V, ahash::RandomState>;

/// Used when a load doesn't specify a timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(3000);

#[derive(Clone, Debug, derive_builder::Builder)]
pub struct ResourceCacheConfig {
    /// How long requesters wait on an in-flight load when they don't pass a timeout.
    #[builder(default = "DEFAULT_TIMEOUT")]
    pub default_timeout: Duration,
    /// Whether dropping the cache releases everything it still tracks.
    #[builder(default = "true")]
    pub release_on_drop: bool,
}

impl Default for ResourceCacheConfig {
    fn default() -> Self {
        ResourceCacheConfig {
            default_timeout: DEFAULT_TIMEOUT,
            release_on_drop: true,
        }
    }
}

#[derive(Clone, Debug, thiserror::Error)]
pub enum CacheError {
    #[error("no resource handler registered for scheme `{scheme}` (requested `{uri}`)")]
    SchemeNotFound { scheme: String, uri: String },
    #[error("resource handler scheme `{0}` registered more than once")]
    DuplicateScheme(String),
    #[error("invalid resource location `{uri}`: {reason}")]
    InvalidLocation { uri: String, reason: String },
    #[error("failed to load `{uri}`")]
    LoadFailed {
        uri: String,
        #[source]
        source: Arc<HandlerError>,
    },
    #[error("timed out after {timeout:?} waiting for `{uri}`")]
    Timeout { uri: String, timeout: Duration },
    #[error("resource `{uri}` is not a `{expected}`")]
    TypeMismatch { uri: String, expected: &'static str },
}

#[derive(Default)]
struct Registry {
    by_uri: CacheHashMap<Arc<ResourceHandle>>,
    /// The same handles as `by_uri`, kept in a vec so that sweeping can compact in place.
    tracking: Vec<Arc<ResourceHandle>>,
}

pub struct ResourceCache {
    config: ResourceCacheConfig,
    schemes: SchemeTable,
    registry: Mutex<Registry>,
    clock: Arc<UsageClock>,
}

fn downcast<T: Any + Send + Sync>(uri: &str, resource: Resource) -> Result<Arc<T>, CacheError> {
    resource.downcast::<T>().map_err(|_| CacheError::TypeMismatch {
        uri: uri.to_string(),
        expected: std::any::type_name::<T>(),
    })
}

fn finish<T: Any + Send + Sync>(uri: &str, outcome: LoadOutcome) -> Result<Arc<T>, CacheError> {
    let resource = outcome.map_err(|source| CacheError::LoadFailed {
        uri: uri.to_string(),
        source,
    })?;
    downcast(uri, resource)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("handler panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("handler panicked: {}", s)
    } else {
        "handler panicked".to_string()
    }
}

impl ResourceCache {
    pub fn new(schemes: SchemeTable, config: ResourceCacheConfig) -> ResourceCache {
        ResourceCache {
            config,
            schemes,
            registry: Default::default(),
            clock: Arc::new(UsageClock::new()),
        }
    }

    pub fn config(&self) -> &ResourceCacheConfig {
        &self.config
    }

    /// The clock this cache's detectors run on.  Scene transitions should be reported here.
    pub fn clock(&self) -> &Arc<UsageClock> {
        &self.clock
    }

    /// Number of tracked URIs, loaded or not.
    pub fn len(&self) -> usize {
        self.registry.lock().tracking.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, uri: &str) -> bool {
        self.registry.lock().by_uri.contains_key(uri)
    }

    /// Describe what is keeping a URI alive, for debugging.  `None` if the URI isn't tracked.
    pub fn usages(&self, uri: &str) -> Option<Vec<String>> {
        let handle = self.registry.lock().by_uri.get(uri)?.clone();
        Some(handle.usages())
    }

    /// Find the handle for a URI, creating and initializing its handler if this is the first request.
    ///
    /// The registry lock is held throughout, so concurrent first requests create exactly one handler.
    fn get_or_register(&self, uri: &str) -> Result<Arc<ResourceHandle>, CacheError> {
        let mut registry = self.registry.lock();
        if let Some(h) = registry.by_uri.get(uri) {
            return Ok(h.clone());
        }

        let parsed = Url::parse(uri).map_err(|e| CacheError::InvalidLocation {
            uri: uri.to_string(),
            reason: e.to_string(),
        })?;
        let mut handler = self
            .schemes
            .create(parsed.scheme())
            .ok_or_else(|| CacheError::SchemeNotFound {
                scheme: parsed.scheme().to_string(),
                uri: uri.to_string(),
            })?;
        handler
            .initialize(&parsed)
            .map_err(|e| CacheError::InvalidLocation {
                uri: uri.to_string(),
                reason: e.to_string(),
            })?;

        let handle = Arc::new(ResourceHandle::new(uri.to_string(), Arc::from(handler)));
        registry.by_uri.insert(uri.to_string(), handle.clone());
        registry.tracking.push(handle.clone());
        log::debug!("Registered resource `{}`", uri);
        Ok(handle)
    }

    /// Attach a detector to the handle for `uri`, going back to the registry if a sweep evicted the handle first.
    fn join(&self, uri: &str, mut detector: UsageDetector) -> Result<(Arc<ResourceHandle>, Join), CacheError> {
        loop {
            let handle = self.get_or_register(uri)?;
            match handle.join(detector, &self.clock) {
                Ok(join) => return Ok((handle, join)),
                Err(d) => detector = d,
            }
        }
    }

    fn timeout_error(&self, uri: &str, timeout: Duration) -> CacheError {
        log::warn!("Timed out after {:?} waiting for `{}`", timeout, uri);
        CacheError::Timeout {
            uri: uri.to_string(),
            timeout,
        }
    }

    /// Load a resource, blocking the current thread.
    ///
    /// If nobody is loading the resource, the load runs on this thread.  If a load is already in flight, this waits on
    /// it for at most `timeout` (the configured default if `None`).
    pub fn load<T: Any + Send + Sync>(
        &self,
        uri: &str,
        detector: UsageDetector,
        timeout: Option<Duration>,
    ) -> Result<Arc<T>, CacheError> {
        let timeout = timeout.unwrap_or(self.config.default_timeout);
        let (handle, join) = self.join(uri, detector)?;
        let outcome = match join {
            Join::Ready(r) => return downcast(uri, r),
            Join::Wait(flight) => flight
                .wait_blocking(timeout)
                .ok_or_else(|| self.timeout_error(uri, timeout))?,
            Join::Lead(flight) => {
                // Settle even if the handler panics, or every later request for this URI would wait forever.
                let outcome = match panic::catch_unwind(AssertUnwindSafe(|| handle.handler().load())) {
                    Ok(r) => r.map_err(Arc::new),
                    Err(payload) => Err(Arc::new(HandlerError::Aborted(panic_message(payload.as_ref())))),
                };
                handle.settle(&flight, outcome.clone(), &self.clock);
                outcome
            }
        };
        finish(uri, outcome)
    }

    /// Load a resource without blocking.
    ///
    /// Concurrent requests for the same URI share one load.  If it doesn't finish within `timeout` (the configured
    /// default if `None`) this fails with [CacheError::Timeout], but the load keeps going in the background and its
    /// result is kept for whoever asks next.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn load_async<T: Any + Send + Sync>(
        &self,
        uri: &str,
        detector: UsageDetector,
        timeout: Option<Duration>,
    ) -> Result<Arc<T>, CacheError> {
        let timeout = timeout.unwrap_or(self.config.default_timeout);
        let (handle, join) = self.join(uri, detector)?;
        let flight = match join {
            Join::Ready(r) => return downcast(uri, r),
            Join::Wait(flight) => flight,
            Join::Lead(flight) => {
                self.spawn_load(handle, flight.clone());
                flight
            }
        };

        let outcome = tokio::time::timeout(timeout, flight.wait())
            .await
            .map_err(|_| self.timeout_error(uri, timeout))?;
        finish(uri, outcome)
    }

    /// Run the physical load on its own task, so that it outlives any requester that gives up on it.
    fn spawn_load(&self, handle: Arc<ResourceHandle>, flight: Arc<LoadFlight>) {
        let clock = self.clock.clone();
        tokio::spawn(async move {
            let handler = handle.handler().clone();
            // A second task, so that a panicking handler still settles the flight.
            let outcome = match tokio::spawn(async move { handler.load_async().await }).await {
                Ok(r) => r.map_err(Arc::new),
                Err(e) => Err(Arc::new(HandlerError::Aborted(e.to_string()))),
            };
            handle.settle(&flight, outcome, &clock);
        });
    }

    /// Release and forget every resource which is neither loading nor in use, then advance the frame clock.
    ///
    /// Call once per tick.  Returns how many resources were released.
    pub fn sweep(&self) -> usize {
        let evicted = {
            let mut registry = self.registry.lock();
            let Registry { by_uri, tracking } = &mut *registry;

            // Dead handles are swapped past `alive` and cut off in one go at the end.
            let mut alive = tracking.len();
            let mut i = 0;
            while i < alive {
                if tracking[i].try_evict(&self.clock) {
                    by_uri.remove(tracking[i].uri());
                    alive -= 1;
                    tracking.swap(i, alive);
                } else {
                    i += 1;
                }
            }

            let evicted = tracking.len() - alive;
            tracking.truncate(alive);
            evicted
        };

        self.clock.advance_frame();
        evicted
    }

    /// Release everything, whether in use or not, and forget it.
    ///
    /// Resources which are still loading are released as soon as their load finishes.  Calling this more than once is
    /// harmless.
    pub fn release_all(&self) {
        let mut registry = self.registry.lock();
        if registry.tracking.is_empty() {
            return;
        }

        log::info!("Releasing {} tracked resources", registry.tracking.len());
        for handle in registry.tracking.drain(..) {
            handle.tear_down();
        }
        registry.by_uri.clear();
    }
}

impl Drop for ResourceCache {
    fn drop(&mut self) {
        if self.config.release_on_drop {
            self.release_all();
        }
    }
}

impl std::fmt::Debug for ResourceCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceCache")
            .field("config", &self.config)
            .field("schemes", &self.schemes)
            .field("tracked", &self.len())
            .finish()
    }
}
