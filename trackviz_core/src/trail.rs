//! Bounded per-entity trail of the most recent samples.

use std::collections::VecDeque;
use trackviz_env::Sample;

/// Default trail length.
pub const TRAIL_LENGTH: usize = 5;

/// The last `capacity` samples of one entity, oldest first.
#[derive(Debug, Clone)]
pub struct TrailHistory {
    capacity: usize,
    samples: VecDeque<Sample>,
}

impl TrailHistory {
    /// Creates an empty trail. A zero capacity is bumped to 1.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            samples: VecDeque::with_capacity(capacity + 1),
        }
    }

    /// Appends a sample, evicting the oldest once over capacity.
    pub fn push(&mut self, sample: Sample) {
        self.samples.push_back(sample);
        while self.samples.len() > self.capacity {
            self.samples.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Most recent sample.
    pub fn latest(&self) -> Option<&Sample> {
        self.samples.back()
    }

    /// Samples from oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &Sample> + '_ {
        self.samples.iter()
    }
}

impl Default for TrailHistory {
    fn default() -> Self {
        Self::new(TRAIL_LENGTH)
    }
}
