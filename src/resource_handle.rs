//! Per-URI book-keeping for the cache.
//!
//! A [ResourceHandle] owns the handler for one URI, the composite of everything using it, and the single in-flight
//! load, if any.  All of that is behind one lock which is only ever held for short, non-blocking sections; the loads
//! themselves run outside it and report back through a [LoadFlight].
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tokio::sync::Notify;

use crate::*;

pub(crate) type LoadOutcome = Result<Resource, Arc<HandlerError>>;

/// One physical load, which any number of requesters can wait on, from threads or tasks.
#[derive(Default)]
pub(crate) struct LoadFlight {
    outcome: Mutex<Option<LoadOutcome>>,
    settled: Condvar,
    notify: Notify,
}

impl LoadFlight {
    fn complete(&self, outcome: LoadOutcome) {
        *self.outcome.lock() = Some(outcome);
        self.settled.notify_all();
        self.notify.notify_waiters();
    }

    fn outcome(&self) -> Option<LoadOutcome> {
        self.outcome.lock().clone()
    }

    /// Block for up to `timeout`, returning `None` if the load is still running.
    pub(crate) fn wait_blocking(&self, timeout: Duration) -> Option<LoadOutcome> {
        let mut guard = self.outcome.lock();
        self.settled.wait_while_for(&mut guard, |o| o.is_none(), timeout);
        guard.clone()
    }

    pub(crate) async fn wait(&self) -> LoadOutcome {
        loop {
            // Register interest before checking, so that a completion between the check and the await isn't missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(o) = self.outcome() {
                return o;
            }
            notified.await;
        }
    }
}

/// What a requester should do after attaching its detector to a handle.
pub(crate) enum Join {
    /// Already loaded.
    Ready(Resource),
    /// Someone else is loading; wait on their flight.
    Wait(Arc<LoadFlight>),
    /// Nobody is loading; the requester must run the load and settle this flight.
    Lead(Arc<LoadFlight>),
}

struct HandleState {
    resource: Option<Resource>,
    usage: ComposeUsageDetector,
    in_flight: Option<Arc<LoadFlight>>,
    /// Registered, but nobody has joined yet.  The sweep must leave it alone until its creator attaches a detector.
    fresh: bool,
    /// No longer in the registry.  Nothing may be attached or loaded.
    evicted: bool,
    /// Torn down while loading; release the handler as soon as the load lands.
    orphaned: bool,
}

pub(crate) struct ResourceHandle {
    uri: String,
    handler: Arc<dyn ResourceHandler>,
    state: Mutex<HandleState>,
}

impl ResourceHandle {
    pub(crate) fn new(uri: String, handler: Arc<dyn ResourceHandler>) -> ResourceHandle {
        ResourceHandle {
            uri,
            handler,
            state: Mutex::new(HandleState {
                resource: None,
                usage: ComposeUsageDetector::new(),
                in_flight: None,
                fresh: true,
                evicted: false,
                orphaned: false,
            }),
        }
    }

    pub(crate) fn uri(&self) -> &str {
        &self.uri
    }

    pub(crate) fn handler(&self) -> &Arc<dyn ResourceHandler> {
        &self.handler
    }

    /// Attach a detector and decide how the requester gets the resource.
    ///
    /// Fails, handing the detector back, if the handle was evicted after the requester found it.  The requester must go
    /// back to the registry.
    pub(crate) fn join(&self, detector: UsageDetector, clock: &UsageClock) -> Result<Join, UsageDetector> {
        let mut state = self.state.lock();
        if state.evicted {
            return Err(detector);
        }

        state.fresh = false;
        state.usage.combine(detector);
        if let Some(r) = state.resource.clone() {
            state.usage.arm(clock.frame());
            return Ok(Join::Ready(r));
        }

        if let Some(f) = &state.in_flight {
            return Ok(Join::Wait(f.clone()));
        }

        let flight = Arc::new(LoadFlight::default());
        state.in_flight = Some(flight.clone());
        Ok(Join::Lead(flight))
    }

    /// Record the result of the load led through `flight`, then wake everyone waiting on it.
    pub(crate) fn settle(&self, flight: &LoadFlight, outcome: LoadOutcome, clock: &UsageClock) {
        let orphaned = {
            let mut state = self.state.lock();
            state.in_flight = None;
            state.usage.arm(clock.frame());
            match &outcome {
                Ok(r) if !state.orphaned => state.resource = Some(r.clone()),
                Ok(_) => {}
                Err(e) => log::warn!("Failed to load `{}`: {}", self.uri, e),
            }
            state.orphaned
        };

        if orphaned {
            log::debug!("Releasing `{}`, which finished loading after teardown", self.uri);
            self.handler.release();
        }
        flight.complete(outcome);
    }

    /// Release and mark evicted if nothing is loading and nothing is using the resource.
    pub(crate) fn try_evict(&self, clock: &UsageClock) -> bool {
        let mut state = self.state.lock();
        if state.evicted || state.fresh || state.in_flight.is_some() || state.usage.is_using(clock) {
            return false;
        }

        log::debug!("Evicting unused resource `{}`", self.uri);
        self.handler.release();
        state.resource = None;
        state.evicted = true;
        true
    }

    /// Release unconditionally, or arrange for release once an in-flight load lands.  Safe to call repeatedly.
    pub(crate) fn tear_down(&self) {
        let mut state = self.state.lock();
        if state.evicted {
            return;
        }

        state.evicted = true;
        if state.in_flight.is_some() {
            state.orphaned = true;
            return;
        }

        self.handler.release();
        state.resource = None;
    }

    /// Descriptions of the detectors still tracked by this handle.
    pub(crate) fn usages(&self) -> Vec<String> {
        self.state.lock().usage.iter().map(|d| d.to_string()).collect()
    }

    #[cfg(test)]
    pub(crate) fn is_loading(&self) -> bool {
        self.state.lock().in_flight.is_some()
    }
}
