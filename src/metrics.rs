//! Failure tracking and metrics for circuit breakers.

use parking_lot::Mutex;
use smallvec::SmallVec;
use std::time::{Duration, Instant};

use crate::state::State;

/// How a call through the breaker ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallOutcome {
    /// The operation succeeded.
    Success,
    /// The operation failed and counted against the breaker.
    Failure,
    /// The operation timed out.
    Timeout,
    /// The operation failed with an error excluded by the error filter.
    Filtered,
}

impl CallOutcome {
    /// Lower-case label used in metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            CallOutcome::Success => "success",
            CallOutcome::Failure => "failure",
            CallOutcome::Timeout => "timeout",
            CallOutcome::Filtered => "filtered",
        }
    }
}

/// Trait for metrics sinks that can receive circuit breaker events.
///
/// Every method receives the breaker's `group:name` key.
pub trait MetricSink: Send + Sync + 'static {
    /// Records a state transition event.
    fn record_state_transition(&self, breaker: &str, from: State, to: State);

    /// Records the error percentage observed when the breaker tripped.
    fn record_error_rate(&self, breaker: &str, percentage: f64);

    /// Records a call that reached the operation.
    fn record_call(&self, breaker: &str, outcome: CallOutcome, duration: Duration);

    /// Records a call rejected without reaching the operation.
    fn record_rejection(&self, breaker: &str);
}

/// A null metrics sink that discards all events.
pub struct NullMetricSink;

impl MetricSink for NullMetricSink {
    fn record_state_transition(&self, _breaker: &str, _from: State, _to: State) {}
    fn record_error_rate(&self, _breaker: &str, _percentage: f64) {}
    fn record_call(&self, _breaker: &str, _outcome: CallOutcome, _duration: Duration) {}
    fn record_rejection(&self, _breaker: &str) {}
}

/// Counters for one rolling window (or one bucket of it).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct BreakerStats {
    /// Calls submitted to the breaker.
    pub fires: u64,
    /// Successful operations.
    pub successes: u64,
    /// Failed operations, timeouts included.
    pub failures: u64,
    /// Operations that exceeded the timeout.
    pub timeouts: u64,
    /// Calls rejected by an open circuit.
    pub rejects: u64,
    /// Calls rejected by the capacity limit.
    pub semaphore_rejections: u64,
    /// Fallback invocations.
    pub fallbacks: u64,
    /// Failures excluded by the error filter.
    pub filtered: u64,
    /// Responses served from the cache.
    pub cache_hits: u64,
    /// Cache lookups that found nothing.
    pub cache_misses: u64,
}

impl BreakerStats {
    /// Percentage of fired calls that failed, in `0.0..=100.0`.
    pub fn error_percentage(&self) -> f64 {
        if self.fires == 0 {
            return 0.0;
        }

        self.failures as f64 / self.fires as f64 * 100.0
    }

    fn absorb(&mut self, other: &BreakerStats) {
        self.fires += other.fires;
        self.successes += other.successes;
        self.failures += other.failures;
        self.timeouts += other.timeouts;
        self.rejects += other.rejects;
        self.semaphore_rejections += other.semaphore_rejections;
        self.fallbacks += other.fallbacks;
        self.filtered += other.filtered;
        self.cache_hits += other.cache_hits;
        self.cache_misses += other.cache_misses;
    }
}

/// A rolling time window split into fixed buckets.
///
/// Buckets older than the window are dropped on every access, so the
/// snapshot only ever covers the last `window_size`.
pub struct RollingWindow {
    buckets: Mutex<SmallVec<[(Instant, BreakerStats); 16]>>,
    window_size: Duration,
    bucket_size: Duration,
}

impl RollingWindow {
    /// Creates a new rolling window tracker.
    pub fn new(window_size: Duration, bucket_count: u32) -> Self {
        let bucket_size = window_size / bucket_count.max(1);
        Self {
            buckets: Mutex::new(SmallVec::new()),
            window_size,
            bucket_size,
        }
    }

    /// Applies `update` to the current bucket.
    pub fn record<F>(&self, update: F)
    where
        F: FnOnce(&mut BreakerStats),
    {
        let mut buckets = self.buckets.lock();
        self.clean_old_buckets(&mut buckets);

        let now = Instant::now();
        if let Some(bucket) = buckets.last_mut() {
            if now.duration_since(bucket.0) < self.bucket_size {
                update(&mut bucket.1);
                return;
            }
        }

        let mut stats = BreakerStats::default();
        update(&mut stats);
        buckets.push((now, stats));
    }

    /// Sums every live bucket.
    pub fn snapshot(&self) -> BreakerStats {
        let mut buckets = self.buckets.lock();
        self.clean_old_buckets(&mut buckets);

        let mut total = BreakerStats::default();
        for (_, stats) in buckets.iter() {
            total.absorb(stats);
        }
        total
    }

    /// Discards all buckets.
    pub fn reset(&self) {
        self.buckets.lock().clear();
    }

    /// Length of the window.
    pub fn window_size(&self) -> Duration {
        self.window_size
    }

    fn clean_old_buckets(&self, buckets: &mut SmallVec<[(Instant, BreakerStats); 16]>) {
        let Some(cutoff) = Instant::now().checked_sub(self.window_size) else {
            return;
        };

        let stale = buckets.iter().take_while(|bucket| bucket.0 < cutoff).count();
        if stale > 0 {
            buckets.drain(..stale);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn error_percentage_counts_failures_over_fires() {
        let stats = BreakerStats {
            fires: 4,
            failures: 1,
            successes: 3,
            ..BreakerStats::default()
        };
        assert_eq!(stats.error_percentage(), 25.0);
        assert_eq!(BreakerStats::default().error_percentage(), 0.0);
    }

    #[test]
    fn window_sums_buckets() {
        let window = RollingWindow::new(Duration::from_secs(10), 10);
        window.record(|s| s.fires += 1);
        window.record(|s| {
            s.fires += 1;
            s.failures += 1;
        });

        let snapshot = window.snapshot();
        assert_eq!(snapshot.fires, 2);
        assert_eq!(snapshot.failures, 1);
    }

    #[test]
    fn window_forgets_expired_buckets() {
        let window = RollingWindow::new(Duration::from_millis(40), 4);
        window.record(|s| s.failures += 1);
        thread::sleep(Duration::from_millis(80));
        window.record(|s| s.successes += 1);

        let snapshot = window.snapshot();
        assert_eq!(snapshot.failures, 0);
        assert_eq!(snapshot.successes, 1);
    }

    #[test]
    fn reset_clears_everything() {
        let window = RollingWindow::new(Duration::from_secs(1), 2);
        window.record(|s| s.rejects += 3);
        window.reset();
        assert_eq!(window.snapshot(), BreakerStats::default());
    }
}
