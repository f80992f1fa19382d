//! Builder for circuit breakers.

use std::error::Error;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;

use crate::breaker::{Action, CacheKeyFn, CircuitBreaker, Fallback};
use crate::error::BreakerError;
use crate::events::{BreakerEvent, Listener};
use crate::metrics::{MetricSink, NullMetricSink};
use crate::options::{BreakerOptions, BreakerSettings};
use crate::policy::{BreakerPolicy, ThresholdPolicy};
use crate::registry::BreakerIdentity;

/// Builder for creating circuit breakers with custom configurations.
///
/// Unset options take the engine defaults described on [`BreakerSettings`].
/// A breaker without a name is called `circuit`; without a group it uses its
/// name as the group.
pub struct BreakerBuilder<A, T, E> {
    options: BreakerOptions,
    policy: Option<Box<dyn BreakerPolicy>>,
    metric_sink: Arc<dyn MetricSink>,
    cache_key: Option<CacheKeyFn<A>>,
    fallback: Option<Fallback<A, T, E>>,
    listeners: Vec<Listener>,
}

impl<A, T, E> Default for BreakerBuilder<A, T, E>
where
    A: Clone + Send + 'static,
    T: Clone + Send + 'static,
    E: Error + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<A, T, E> BreakerBuilder<A, T, E>
where
    A: Clone + Send + 'static,
    T: Clone + Send + 'static,
    E: Error + Send + 'static,
{
    /// Creates a new builder with default settings.
    pub fn new() -> Self {
        Self {
            options: BreakerOptions::default(),
            policy: None,
            metric_sink: Arc::new(NullMetricSink),
            cache_key: None,
            fallback: None,
            listeners: Vec::new(),
        }
    }

    /// Layers `options` over what has been configured so far.
    pub fn options(mut self, options: BreakerOptions) -> Self {
        self.options = self.options.merge(&options);
        self
    }

    /// Sets the identity group.
    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.options.group = Some(group.into());
        self
    }

    /// Sets the identity name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.options.name = Some(name.into());
        self
    }

    /// Sets the call timeout. `Duration::ZERO` disables it.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.options.timeout = Some(timeout);
        self
    }

    /// Sets the error percentage that will trip the circuit.
    pub fn error_threshold_percentage(mut self, percentage: f64) -> Self {
        self.options.error_threshold_percentage = Some(percentage);
        self
    }

    /// Sets how long the circuit stays open before a trial call.
    pub fn reset_timeout(mut self, duration: Duration) -> Self {
        self.options.reset_timeout = Some(duration);
        self
    }

    /// Sets the minimum number of calls required before the circuit may open.
    pub fn volume_threshold(mut self, volume: u64) -> Self {
        self.options.volume_threshold = Some(volume);
        self
    }

    /// Sets the error filter.
    pub fn error_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&(dyn Error + 'static)) -> bool + Send + Sync + 'static,
    {
        self.options.error_filter = Some(Arc::new(filter));
        self
    }

    /// Replaces the threshold policy built from the options.
    pub fn policy<P: BreakerPolicy>(mut self, policy: P) -> Self {
        self.policy = Some(Box::new(policy));
        self
    }

    /// Sets a metric sink for the circuit breaker.
    pub fn metric_sink<M: MetricSink>(mut self, sink: M) -> Self {
        self.metric_sink = Arc::new(sink);
        self
    }

    /// Sets a shared metric sink for the circuit breaker.
    pub fn shared_metric_sink(mut self, sink: Arc<dyn MetricSink>) -> Self {
        self.metric_sink = sink;
        self
    }

    /// Derives response cache keys from call arguments.
    ///
    /// Without a key function every call shares one cache entry.
    pub fn cache_key<F>(mut self, key: F) -> Self
    where
        F: Fn(&A) -> String + Send + Sync + 'static,
    {
        self.cache_key = Some(Arc::new(key));
        self
    }

    pub(crate) fn shared_cache_key(mut self, key: Option<CacheKeyFn<A>>) -> Self {
        self.cache_key = key;
        self
    }

    /// Attaches a fallback.
    pub fn fallback<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(A, BreakerError<E>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let fallback: Fallback<A, T, E> =
            Arc::new(move |args: A, error: BreakerError<E>| f(args, error).boxed());
        self.fallback = Some(fallback);
        self
    }

    /// Subscribes a listener before the breaker sees its first call.
    pub fn on_event<F>(mut self, f: F) -> Self
    where
        F: Fn(&BreakerEvent) + Send + Sync + 'static,
    {
        self.listeners.push(Arc::new(f));
        self
    }

    /// Builds a circuit breaker around `action`.
    pub fn build<F, Fut>(self, action: F) -> CircuitBreaker<A, T, E>
    where
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let action: Action<A, T, E> = Arc::new(move |args: A| action(args).boxed());
        self.build_with_action(action)
    }

    /// Builds a circuit breaker around an already boxed action.
    pub fn build_with_action(self, action: Action<A, T, E>) -> CircuitBreaker<A, T, E> {
        let name = self
            .options
            .name
            .clone()
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| "circuit".to_string());
        let group = self
            .options
            .group
            .clone()
            .filter(|group| !group.is_empty())
            .unwrap_or_else(|| name.clone());
        let identity = BreakerIdentity::from_parts(group, name);

        let settings = BreakerSettings::from(&self.options);
        let policy = self.policy.unwrap_or_else(|| {
            Box::new(ThresholdPolicy::new(
                settings.error_threshold_percentage,
                settings.volume_threshold,
            ))
        });

        let breaker = CircuitBreaker::new(
            identity,
            action,
            settings,
            policy,
            self.metric_sink,
            self.cache_key,
        );

        for listener in self.listeners {
            breaker.subscribe(listener);
        }
        if let Some(fallback) = self.fallback {
            breaker.set_fallback(fallback);
        }

        breaker
    }
}
