//! A resource cache which keeps things loaded exactly as long as something is using them.
//!
//! Resources are named by URIs such as `res://textures/grass.png`.  The scheme picks a [ResourceHandler] out of a
//! [SchemeTable] built at startup, and the rest of the URI is the handler's business.  Each request also says who is
//! using the resource, in the form of a [UsageDetector]:
//!
//! - [UsageDetector::manual] keeps the resource until the returned [ManualRelease] is released.
//! - [UsageDetector::bound_to] keeps the resource while some `Arc` is alive.
//! - [UsageDetector::scene] keeps the resource until the next scene transition on the cache's [UsageClock].
//! - [UsageDetector::transient] keeps the resource for a number of sweeps after it finished loading.
//!
//! Requests for the same URI share one handler and one load, whether they come through the blocking
//! [ResourceCache::load] or the async [ResourceCache::load_async], and their detectors are merged into one
//! [ComposeUsageDetector].  The owner of the cache calls [ResourceCache::sweep] once per tick, which releases anything
//! nobody is using any more, and [ResourceCache::release_all] on shutdown.
//!
//! To use this crate, implement [ResourceHandler] (or use [FilesystemHandler]), register it in a [SchemeTable], then
//! construct a [ResourceCache] with your chosen [ResourceCacheConfig].
mod compose_detector;
mod filesystem_handler;
mod handler;
mod resource_cache;
mod resource_handle;
mod usage_detector;

pub use compose_detector::*;
pub use filesystem_handler::*;
pub use handler::*;
pub use resource_cache::*;
pub use usage_detector::*;
