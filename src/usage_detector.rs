//! A [UsageDetector] answers one question for the cache: does anything still depend on this resource?
//!
//! Detectors come in a closed set of kinds.  Some are controlled by their owner ([UsageDetector::manual]), some follow
//! the lifetime of another object ([UsageDetector::bound_to]), and some are driven by the [UsageClock] that every
//! [crate::ResourceCache] owns ([UsageDetector::scene] and [UsageDetector::transient]).
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Counters which detectors compare against instead of subscribing to events.
///
/// The scene epoch is advanced by whoever drives scene transitions, once per committed transition.  The frame counter
/// is advanced by [crate::ResourceCache::sweep], once per sweep.
#[derive(Debug, Default)]
pub struct UsageClock {
    scene_epoch: AtomicU64,
    frame: AtomicU64,
}

impl UsageClock {
    pub fn new() -> UsageClock {
        Default::default()
    }

    pub fn scene_epoch(&self) -> u64 {
        self.scene_epoch.load(Ordering::Acquire)
    }

    /// Mark a scene transition, returning the new epoch.
    ///
    /// Every [UsageDetector::scene] bound before this call stops reporting usage.
    pub fn advance_scene(&self) -> u64 {
        self.scene_epoch.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn frame(&self) -> u64 {
        self.frame.load(Ordering::Acquire)
    }

    pub(crate) fn advance_frame(&self) -> u64 {
        self.frame.fetch_add(1, Ordering::AcqRel) + 1
    }
}

/// The owner side of a [UsageDetector::manual] detector.
///
/// Clones share state.  Dropping every clone without calling [ManualRelease::release] keeps the resource alive for the
/// lifetime of the cache.
#[derive(Clone, Debug, Default)]
pub struct ManualRelease(Arc<AtomicBool>);

impl ManualRelease {
    /// Stop reporting usage.  The next sweep may evict the resource if nothing else uses it.
    pub fn release(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_released(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[derive(Debug)]
pub struct ManualUsage {
    released: ManualRelease,
}

/// Usage tied to the lifetime of an object held behind an `Arc`.
pub struct ObjectLink {
    /// `None` once the object has been observed dead.  We never look at it again after that.
    target: Option<Weak<dyn Any + Send + Sync>>,
    key: usize,
}

impl ObjectLink {
    /// Address of the linked allocation, used to deduplicate links to the same object.
    pub fn key(&self) -> usize {
        self.key
    }

    fn is_alive(&mut self) -> bool {
        if self.target.as_ref().map_or(false, |w| w.strong_count() > 0) {
            return true;
        }
        self.target = None;
        false
    }
}

impl fmt::Debug for ObjectLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectLink")
            .field("key", &format_args!("{:#x}", self.key))
            .field("dead", &self.target.is_none())
            .finish()
    }
}

#[derive(Debug)]
pub struct SceneBinding {
    epoch: u64,
}

impl SceneBinding {
    pub fn epoch(&self) -> u64 {
        self.epoch
    }
}

/// Usage which lasts a fixed number of sweeps after the resource became ready.
#[derive(Debug)]
pub struct TransientCountdown {
    frames: u64,
    /// Frame at which usage stops; set once the resource is ready.
    deadline: Option<u64>,
}

impl TransientCountdown {
    pub fn remaining_frames(&self, clock: &UsageClock) -> u64 {
        match self.deadline {
            Some(d) => d.saturating_sub(clock.frame()),
            None => self.frames,
        }
    }

    fn arm(&mut self, now: u64) {
        if self.deadline.is_none() {
            self.deadline = Some(now + self.frames);
        }
    }
}

#[derive(Debug)]
pub enum UsageDetector {
    Manual(ManualUsage),
    BoundObject(ObjectLink),
    SceneEpoch(SceneBinding),
    Transient(TransientCountdown),
}

impl UsageDetector {
    /// A detector which reports usage until the returned [ManualRelease] is released.
    pub fn manual() -> (UsageDetector, ManualRelease) {
        let released = ManualRelease::default();
        let detector = UsageDetector::Manual(ManualUsage {
            released: released.clone(),
        });
        (detector, released)
    }

    /// A detector which reports usage while `object` has strong references.
    pub fn bound_to<T: Any + Send + Sync>(object: &Arc<T>) -> UsageDetector {
        let weak: Weak<T> = Arc::downgrade(object);
        let weak: Weak<dyn Any + Send + Sync> = weak;
        let key = Weak::as_ptr(&weak) as *const () as usize;
        UsageDetector::BoundObject(ObjectLink {
            target: Some(weak),
            key,
        })
    }

    /// A detector which reports usage until the clock's scene epoch moves on.
    pub fn scene(clock: &UsageClock) -> UsageDetector {
        UsageDetector::SceneEpoch(SceneBinding {
            epoch: clock.scene_epoch(),
        })
    }

    /// A detector which reports usage for `frames` sweeps after the resource is ready.
    pub fn transient(frames: u64) -> UsageDetector {
        UsageDetector::Transient(TransientCountdown {
            frames,
            deadline: None,
        })
    }

    pub fn is_using(&mut self, clock: &UsageClock) -> bool {
        match self {
            UsageDetector::Manual(m) => !m.released.is_released(),
            UsageDetector::BoundObject(link) => link.is_alive(),
            UsageDetector::SceneEpoch(s) => s.epoch == clock.scene_epoch(),
            UsageDetector::Transient(t) => match t.deadline {
                Some(d) => clock.frame() < d,
                None => true,
            },
        }
    }

    /// Start any countdown.  Called when the owning resource becomes ready.
    pub(crate) fn arm(&mut self, now: u64) {
        if let UsageDetector::Transient(t) = self {
            t.arm(now);
        }
    }
}

impl fmt::Display for UsageDetector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UsageDetector::Manual(m) if m.released.is_released() => write!(f, "manual release (released)"),
            UsageDetector::Manual(_) => write!(f, "manual release"),
            UsageDetector::BoundObject(link) if link.target.is_none() => {
                write!(f, "used by object {:#x} (dead)", link.key)
            }
            UsageDetector::BoundObject(link) => write!(f, "used by object {:#x}", link.key),
            UsageDetector::SceneEpoch(s) => write!(f, "release after scene epoch {}", s.epoch),
            UsageDetector::Transient(TransientCountdown {
                deadline: Some(d), ..
            }) => write!(f, "release at frame {}", d),
            UsageDetector::Transient(t) => write!(f, "release {} frames after ready", t.frames),
        }
    }
}
