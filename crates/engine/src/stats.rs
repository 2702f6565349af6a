//! Timing statistics for the end-of-session report.

use std::time::Duration;

/// Min/max/mean/median over a set of durations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimingSummary {
    pub count: usize,
    pub min: Duration,
    pub max: Duration,
    pub mean: Duration,
    /// Element at index `count / 2` of the sorted samples (the upper median
    /// for an even count).
    pub median: Duration,
}

impl TimingSummary {
    /// Summarizes `samples`, or returns `None` if there are none.
    pub fn from_samples(samples: &[Duration]) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }
        let mut sorted = samples.to_vec();
        sorted.sort_unstable();

        let total: Duration = sorted.iter().sum();
        let count = sorted.len();
        Some(Self {
            count,
            min: sorted[0],
            max: sorted[count - 1],
            mean: total / count as u32,
            median: sorted[count / 2],
        })
    }
}
