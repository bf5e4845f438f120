//! The [ResourceHandler] trait is responsible for turning a URI into a loaded [Resource].
//!
//! Handlers are chosen by URI scheme through a [SchemeTable], which is built once at startup and handed to the cache.
//! The cache creates one handler per URI and guarantees that it only ever has one load in flight, so implementations
//! don't need to cope with concurrent loads of their own.
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use ahash::RandomState;
use async_trait::async_trait;
use url::Url;

use crate::*;

/// A loaded resource.  The cache keeps one reference and gives clones to callers.
pub type Resource = Arc<dyn Any + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("invalid location: {0}")]
    InvalidLocation(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("load task aborted: {0}")]
    Aborted(String),
    #[error("{0}")]
    Backend(String),
}

#[async_trait]
pub trait ResourceHandler: Send + Sync + 'static {
    /// Pull whatever addressing this handler needs out of the URI.
    ///
    /// Called once, before the handler is shared.  Must not load anything.
    fn initialize(&mut self, uri: &Url) -> Result<(), HandlerError>;

    /// Load the resource, blocking the calling thread.
    fn load(&self) -> Result<Resource, HandlerError>;

    /// Load the resource without blocking.  Defaults to [ResourceHandler::load].
    async fn load_async(&self) -> Result<Resource, HandlerError> {
        self.load()
    }

    /// Free backend resources.
    ///
    /// Must be idempotent, and fine to call if nothing was ever loaded.
    fn release(&self);
}

/// A handler type which registers itself under a fixed scheme.
pub trait SchemeHandler: ResourceHandler + Default {
    const SCHEME: &'static str;
}

pub type HandlerFactory = Arc<dyn Fn() -> Box<dyn ResourceHandler> + Send + Sync>;

/// Map from URI scheme to the factory for its handler.  Schemes are case-insensitive.
#[derive(Clone, Default)]
pub struct SchemeTable {
    factories: HashMap<String, HandlerFactory, RandomState>,
}

impl SchemeTable {
    pub fn new() -> SchemeTable {
        Default::default()
    }

    /// Register a handler type under its own scheme.
    pub fn register<H: SchemeHandler>(&mut self) -> Result<&mut Self, CacheError> {
        self.register_with(H::SCHEME, || Box::new(H::default()))
    }

    /// Register a factory under a scheme.  Registering the same scheme twice is an error.
    pub fn register_with<F>(&mut self, scheme: &str, factory: F) -> Result<&mut Self, CacheError>
    where
        F: Fn() -> Box<dyn ResourceHandler> + Send + Sync + 'static,
    {
        let scheme = scheme.to_ascii_lowercase();
        if self.factories.contains_key(&scheme) {
            return Err(CacheError::DuplicateScheme(scheme));
        }

        log::debug!("Registered resource handler for scheme `{}`", scheme);
        self.factories.insert(scheme, Arc::new(factory));
        Ok(self)
    }

    pub fn contains(&self, scheme: &str) -> bool {
        self.factories.contains_key(&scheme.to_ascii_lowercase())
    }

    pub fn schemes(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(|x| x.as_str())
    }

    /// Build a fresh, uninitialized handler for a scheme.
    pub(crate) fn create(&self, scheme: &str) -> Option<Box<dyn ResourceHandler>> {
        self.factories.get(scheme).map(|f| f())
    }
}

impl std::fmt::Debug for SchemeTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.schemes()).finish()
    }
}
