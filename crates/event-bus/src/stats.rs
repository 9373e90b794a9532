use std::time::Duration;

use serde::Serialize;

/// A point-in-time view of bus activity.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BusStatistics {
    pub is_running: bool,
    pub total_published: u64,
    pub total_processed: u64,
    pub total_failed: u64,
    pub active_subscriptions: usize,

    /// Cumulative moving average over every handler invocation.
    pub average_processing_time_ms: f64,

    pub dead_letter_queue_size: usize,
    pub retry_queue_size: usize,
    pub uptime_seconds: i64,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub published: u64,
    pub processed: u64,
    pub failed: u64,
    samples: u64,
    pub average_ms: f64,
}

impl Counters {
    /// Adds `count` freshly stored events.
    pub fn record_published(&mut self, count: usize) {
        self.published += count as u64;
    }

    /// Counts one handler outcome and folds its duration into the moving average.
    pub fn record_outcome(&mut self, success: bool, elapsed: Duration) {
        if success {
            self.processed += 1;
        } else {
            self.failed += 1;
        }
        self.samples += 1;
        let sample = elapsed.as_secs_f64() * 1_000.0;
        self.average_ms += (sample - self.average_ms) / self.samples as f64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn moving_average_matches_mean() {
        let mut counters = Counters::default();
        counters.record_outcome(true, Duration::from_millis(10));
        counters.record_outcome(false, Duration::from_millis(20));
        counters.record_outcome(true, Duration::from_millis(30));

        assert_eq!(counters.processed, 2);
        assert_eq!(counters.failed, 1);
        assert!((counters.average_ms - 20.0).abs() < 1e-9);
    }

    #[test]
    fn published_accumulates() {
        let mut counters = Counters::default();
        counters.record_published(2);
        counters.record_published(3);
        assert_eq!(counters.published, 5);
        assert_eq!(counters.average_ms, 0.0);
    }
}
