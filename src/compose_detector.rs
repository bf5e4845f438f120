//! A [ComposeUsageDetector] folds any number of [UsageDetector]s into one.
//!
//! This is implemented as a vec of slots with a cursor marking a prefix of dead slots, plus two auxiliary hash-based
//! indices used to refuse duplicate scene and object detectors.
//!
//! Callers tend to attach lots of short-lived detectors over the life of a resource, so dead slots are handed out again
//! rather than growing the vec: querying moves the cursor past every dead detector in front of the first live one, and
//! combining writes into the slot just before the cursor.
use std::collections::HashSet;

use ahash::RandomState;

use crate::*;

#[derive(Debug, Default)]
pub struct ComposeUsageDetector {
    detectors: Vec<UsageDetector>,
    /// Everything before this index is dead and free to be overwritten.
    start: usize,
    scenes: HashSet<u64, RandomState>,
    objects: HashSet<usize, RandomState>,
}

impl ComposeUsageDetector {
    pub fn new() -> ComposeUsageDetector {
        Default::default()
    }

    /// Merge a detector in.
    ///
    /// A scene detector for an epoch we already track, or an object detector for an object we already track, is
    /// dropped.
    pub fn combine(&mut self, detector: UsageDetector) -> &mut Self {
        let fresh = match &detector {
            UsageDetector::SceneEpoch(s) => self.scenes.insert(s.epoch()),
            UsageDetector::BoundObject(link) => self.objects.insert(link.key()),
            UsageDetector::Manual(_) | UsageDetector::Transient(_) => true,
        };
        if !fresh {
            return self;
        }

        if self.start == 0 {
            self.detectors.push(detector);
        } else {
            self.start -= 1;
            self.detectors[self.start] = detector;
        }
        self
    }

    /// Returns true if any tracked detector reports usage.
    ///
    /// Stops at the first live detector.  Dead detectors in front of it are retired and never queried again.
    pub fn is_using(&mut self, clock: &UsageClock) -> bool {
        while self.start < self.detectors.len() {
            if self.detectors[self.start].is_using(clock) {
                return true;
            }

            self.retire(self.start);
            self.start += 1;
        }

        false
    }

    /// Start the countdown of every transient detector which hasn't started yet.
    pub(crate) fn arm(&mut self, now: u64) {
        for d in &mut self.detectors[self.start..] {
            d.arm(now);
        }
    }

    /// Number of detectors not yet retired.
    pub fn len(&self) -> usize {
        self.detectors.len() - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterate the detectors which haven't been retired, in query order.
    pub fn iter(&self) -> impl Iterator<Item = &UsageDetector> {
        self.detectors[self.start..].iter()
    }

    /// Drop the dedup entry of a dead detector, so that its key may be tracked again.
    fn retire(&mut self, index: usize) {
        match &self.detectors[index] {
            UsageDetector::SceneEpoch(s) => {
                self.scenes.remove(&s.epoch());
            }
            UsageDetector::BoundObject(link) => {
                self.objects.remove(&link.key());
            }
            UsageDetector::Manual(_) | UsageDetector::Transient(_) => {}
        }
    }
}
