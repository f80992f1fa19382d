//! Policy engine for circuit breaker trip decisions.

use crate::metrics::BreakerStats;

/// A policy that determines when a closed circuit should trip open.
///
/// Recovery is not a policy decision: a single successful trial call in the
/// half-open state closes the circuit, a failed one re-opens it.
pub trait BreakerPolicy: Send + Sync + 'static {
    /// Determines if the circuit should trip open based on the rolling stats.
    fn should_trip(&self, stats: &BreakerStats) -> bool;
}

/// Trips once the window has seen enough calls and the error percentage
/// exceeds the threshold.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThresholdPolicy {
    error_threshold_percentage: f64,
    volume_threshold: u64,
}

impl ThresholdPolicy {
    /// Creates a new threshold policy.
    pub fn new(error_threshold_percentage: f64, volume_threshold: u64) -> Self {
        Self {
            error_threshold_percentage,
            volume_threshold,
        }
    }
}

impl BreakerPolicy for ThresholdPolicy {
    fn should_trip(&self, stats: &BreakerStats) -> bool {
        if stats.fires < self.volume_threshold {
            return false;
        }

        stats.error_percentage() > self.error_threshold_percentage
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(fires: u64, failures: u64) -> BreakerStats {
        BreakerStats {
            fires,
            failures,
            ..BreakerStats::default()
        }
    }

    #[test]
    fn trips_above_threshold() {
        let policy = ThresholdPolicy::new(50.0, 0);
        assert!(!policy.should_trip(&stats(2, 1)));
        assert!(policy.should_trip(&stats(3, 2)));
    }

    #[test]
    fn waits_for_volume() {
        let policy = ThresholdPolicy::new(10.0, 5);
        assert!(!policy.should_trip(&stats(4, 4)));
        assert!(policy.should_trip(&stats(5, 4)));
    }
}
