//! Prometheus metric sink, enabled with the `prometheus` feature.

use std::sync::atomic::AtomicU64;
use std::time::Duration;

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

use crate::metrics::{CallOutcome, MetricSink};
use crate::state::State;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct BreakerLabels {
    breaker: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct CallLabels {
    breaker: String,
    outcome: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct TransitionLabels {
    breaker: String,
    from: String,
    to: String,
}

/// Publishes breaker activity as Prometheus counters and gauges.
pub struct PrometheusMetricSink {
    calls: Family<CallLabels, Counter>,
    call_seconds: Family<CallLabels, Counter<f64, AtomicU64>>,
    rejections: Family<BreakerLabels, Counter>,
    transitions: Family<TransitionLabels, Counter>,
    error_percentage: Family<BreakerLabels, Gauge<f64, AtomicU64>>,
}

impl PrometheusMetricSink {
    /// Creates the sink and registers its metric families with `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let sink = Self {
            calls: Family::default(),
            call_seconds: Family::default(),
            rejections: Family::default(),
            transitions: Family::default(),
            error_percentage: Family::default(),
        };

        registry.register(
            "circuit_breaker_calls",
            "Calls that reached the protected operation",
            sink.calls.clone(),
        );
        registry.register(
            "circuit_breaker_call_seconds",
            "Time spent in the protected operation",
            sink.call_seconds.clone(),
        );
        registry.register(
            "circuit_breaker_rejections",
            "Calls rejected by an open circuit",
            sink.rejections.clone(),
        );
        registry.register(
            "circuit_breaker_transitions",
            "Circuit state transitions",
            sink.transitions.clone(),
        );
        registry.register(
            "circuit_breaker_error_percentage",
            "Error percentage observed when the circuit last tripped",
            sink.error_percentage.clone(),
        );

        sink
    }
}

impl MetricSink for PrometheusMetricSink {
    fn record_state_transition(&self, breaker: &str, from: State, to: State) {
        self.transitions
            .get_or_create(&TransitionLabels {
                breaker: breaker.to_string(),
                from: from.as_str().to_string(),
                to: to.as_str().to_string(),
            })
            .inc();
    }

    fn record_error_rate(&self, breaker: &str, percentage: f64) {
        self.error_percentage
            .get_or_create(&BreakerLabels {
                breaker: breaker.to_string(),
            })
            .set(percentage);
    }

    fn record_call(&self, breaker: &str, outcome: CallOutcome, duration: Duration) {
        let labels = CallLabels {
            breaker: breaker.to_string(),
            outcome: outcome.as_str().to_string(),
        };
        self.calls.get_or_create(&labels).inc();
        self.call_seconds
            .get_or_create(&labels)
            .inc_by(duration.as_secs_f64());
    }

    fn record_rejection(&self, breaker: &str) {
        self.rejections
            .get_or_create(&BreakerLabels {
                breaker: breaker.to_string(),
            })
            .inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus_client::encoding::text::encode;

    #[test]
    fn transitions_and_calls_are_exported() {
        let mut registry = Registry::default();
        let sink = PrometheusMetricSink::new(&mut registry);

        sink.record_call("api:fetch", CallOutcome::Failure, Duration::from_millis(5));
        sink.record_state_transition("api:fetch", State::Closed, State::Open);
        sink.record_rejection("api:fetch");

        let mut output = String::new();
        encode(&mut output, &registry).unwrap();

        assert!(output.contains("circuit_breaker_calls_total"));
        assert!(output.contains("outcome=\"failure\""));
        assert!(output.contains("to=\"open\""));
        assert!(output.contains("circuit_breaker_rejections_total"));
    }
}
