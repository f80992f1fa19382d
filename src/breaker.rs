//! Core circuit breaker implementation.

use std::any::Any;
use std::error::Error;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::RwLock;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::cache::ResponseCache;
use crate::error::{BreakerError, BreakerResult};
use crate::events::{BreakerEvent, EventKind, EventListeners, Listener};
use crate::metrics::{BreakerStats, CallOutcome, MetricSink, RollingWindow};
use crate::options::BreakerSettings;
use crate::policy::BreakerPolicy;
use crate::registry::{BreakerHandle, BreakerIdentity};
use crate::state::{State, StateManager, TrialSlot};

/// The operation a breaker protects.
pub type Action<A, T, E> = Arc<dyn Fn(A) -> BoxFuture<'static, Result<T, E>> + Send + Sync + 'static>;

/// Substitute operation run when a call fails or is rejected.
///
/// It receives the call's arguments and the error that triggered it.
pub type Fallback<A, T, E> =
    Arc<dyn Fn(A, BreakerError<E>) -> BoxFuture<'static, Result<T, E>> + Send + Sync + 'static>;

/// Derives the response cache key from a call's arguments.
pub type CacheKeyFn<A> = Arc<dyn Fn(&A) -> String + Send + Sync + 'static>;

/// Inner state of the circuit breaker, shared between clones.
struct BreakerInner<A, T, E> {
    identity: BreakerIdentity,
    key: String,
    action: Action<A, T, E>,
    settings: BreakerSettings,
    policy: Box<dyn BreakerPolicy>,
    state_manager: StateManager,
    window: RollingWindow,
    semaphore: Option<Semaphore>,
    cache: Option<ResponseCache<T>>,
    cache_key: Option<CacheKeyFn<A>>,
    fallback: RwLock<Option<Fallback<A, T, E>>>,
    events: EventListeners,
    metric_sink: Arc<dyn MetricSink>,
    enabled: AtomicBool,
    shut_down: AtomicBool,
    created_at: Instant,
}

/// How a call got past the admission check.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Admission {
    Normal,
    Trial,
}

/// An asynchronous circuit breaker around an operation taking `A` and
/// producing `Result<T, E>`.
///
/// Cloning is cheap and yields a handle to the same breaker.
pub struct CircuitBreaker<A, T, E> {
    inner: Arc<BreakerInner<A, T, E>>,
}

impl<A, T, E> CircuitBreaker<A, T, E>
where
    A: Clone + Send + 'static,
    T: Clone + Send + 'static,
    E: Error + Send + 'static,
{
    pub(crate) fn new(
        identity: BreakerIdentity,
        action: Action<A, T, E>,
        settings: BreakerSettings,
        policy: Box<dyn BreakerPolicy>,
        metric_sink: Arc<dyn MetricSink>,
        cache_key: Option<CacheKeyFn<A>>,
    ) -> Self {
        let key = identity.key();
        debug!(
            breaker = %key,
            timeout_ms = settings.timeout.map(|t| t.as_millis() as u64),
            error_threshold_percentage = settings.error_threshold_percentage,
            reset_timeout_ms = settings.reset_timeout.as_millis() as u64,
            "circuit breaker initialized"
        );

        let inner = BreakerInner {
            key,
            identity,
            action,
            policy,
            state_manager: StateManager::new(),
            window: RollingWindow::new(
                settings.rolling_count_timeout,
                settings.rolling_count_buckets,
            ),
            semaphore: settings
                .capacity
                .map(|capacity| Semaphore::new(capacity.min(Semaphore::MAX_PERMITS))),
            cache: settings
                .cache
                .then(|| ResponseCache::new(settings.cache_ttl)),
            cache_key,
            fallback: RwLock::new(None),
            events: EventListeners::new(),
            metric_sink,
            enabled: AtomicBool::new(settings.enabled),
            shut_down: AtomicBool::new(false),
            created_at: Instant::now(),
            settings,
        };

        Self {
            inner: Arc::new(inner),
        }
    }

    /// Creates a new builder for customizing a circuit breaker.
    pub fn builder() -> crate::config::BreakerBuilder<A, T, E> {
        crate::config::BreakerBuilder::new()
    }

    /// The breaker's identity.
    pub fn identity(&self) -> &BreakerIdentity {
        &self.inner.identity
    }

    /// The breaker's `group:name` key.
    pub fn key(&self) -> &str {
        &self.inner.key
    }

    /// The settings the breaker was built with.
    pub fn settings(&self) -> &BreakerSettings {
        &self.inner.settings
    }

    /// Gets the current state of the circuit breaker.
    pub fn current_state(&self) -> State {
        self.inner.state_manager.current()
    }

    /// Counters for the current rolling window.
    pub fn stats(&self) -> BreakerStats {
        self.inner.window.snapshot()
    }

    /// Error percentage over the current rolling window.
    pub fn error_percentage(&self) -> f64 {
        self.stats().error_percentage()
    }

    /// Runs the operation under the breaker's policy.
    ///
    /// Failures, timeouts and rejections are handed to the fallback when one is
    /// attached. Errors matched by the error filter are returned as they are.
    pub async fn fire(&self, args: A) -> BreakerResult<T, E> {
        let inner = &self.inner;
        if inner.shut_down.load(Ordering::Acquire) {
            return Err(BreakerError::Shutdown);
        }

        inner.events.emit(BreakerEvent::Fire);

        if !inner.enabled.load(Ordering::Acquire) {
            return (inner.action)(args).await.map_err(BreakerError::Operation);
        }

        inner.window.record(|s| s.fires += 1);

        let cache_key = match &inner.cache {
            Some(cache) => {
                let key = self.cache_key_for(&args);
                if let Some(hit) = cache.get(&key) {
                    inner.window.record(|s| s.cache_hits += 1);
                    inner.events.emit(BreakerEvent::CacheHit);
                    return Ok(hit);
                }
                inner.window.record(|s| s.cache_misses += 1);
                inner.events.emit(BreakerEvent::CacheMiss);
                Some(key)
            }
            None => None,
        };

        let Some(admission) = self.admit() else {
            inner.window.record(|s| s.rejects += 1);
            inner.events.emit(BreakerEvent::Reject);
            inner.metric_sink.record_rejection(&inner.key);
            return self.call_fallback(args, BreakerError::Open).await;
        };
        let trial = TrialSlot::new(&inner.state_manager, admission == Admission::Trial);

        let permit = match &inner.semaphore {
            Some(semaphore) => match semaphore.try_acquire() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    drop(trial);
                    inner.window.record(|s| s.semaphore_rejections += 1);
                    inner.events.emit(BreakerEvent::SemaphoreLocked);
                    return self
                        .call_fallback(args, BreakerError::CapacityExceeded)
                        .await;
                }
            },
            None => None,
        };

        let start = Instant::now();
        let call = (inner.action)(args.clone());
        let outcome = match inner.settings.timeout {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(result) => result.map_err(BreakerError::Operation),
                Err(_) => Err(BreakerError::Timeout(limit)),
            },
            None => call.await.map_err(BreakerError::Operation),
        };
        let latency = start.elapsed();
        drop(permit);

        match outcome {
            Ok(value) => {
                self.on_success(latency, admission);
                trial.settled();
                if let (Some(cache), Some(key)) = (&inner.cache, cache_key) {
                    cache.insert(key, value.clone());
                }
                Ok(value)
            }
            Err(BreakerError::Operation(err)) if self.is_filtered(&err) => {
                self.on_filtered(latency, admission);
                trial.settled();
                Err(BreakerError::Operation(err))
            }
            Err(err) => {
                self.on_failure(&err, latency, admission);
                trial.settled();
                self.call_fallback(args, err).await
            }
        }
    }

    /// Runs the attached fallback for `error`, or returns `error` when there is none.
    pub async fn call_fallback(&self, args: A, error: BreakerError<E>) -> BreakerResult<T, E> {
        let fallback = self.inner.fallback.read().clone();
        let Some(fallback) = fallback else {
            return Err(error);
        };

        self.inner.window.record(|s| s.fallbacks += 1);
        self.inner.events.emit(BreakerEvent::Fallback);
        debug!(breaker = %self.inner.key, cause = %error, "invoking fallback");

        fallback(args, error).await.map_err(BreakerError::Operation)
    }

    /// Attaches a fallback, replacing any previous one.
    pub fn fallback<F, Fut>(&self, f: F)
    where
        F: Fn(A, BreakerError<E>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let fallback: Fallback<A, T, E> =
            Arc::new(move |args: A, error: BreakerError<E>| f(args, error).boxed());
        self.set_fallback(fallback);
    }

    /// Attaches an already boxed fallback, replacing any previous one.
    pub fn set_fallback(&self, fallback: Fallback<A, T, E>) {
        *self.inner.fallback.write() = Some(fallback);
    }

    /// Whether a fallback is attached.
    pub fn has_fallback(&self) -> bool {
        self.inner.fallback.read().is_some()
    }

    /// Subscribes to every event of this breaker.
    pub fn on_event<F>(&self, f: F)
    where
        F: Fn(&BreakerEvent) + Send + Sync + 'static,
    {
        self.inner.events.subscribe(Arc::new(f));
    }

    /// Subscribes an already boxed listener.
    pub fn subscribe(&self, listener: Listener) {
        self.inner.events.subscribe(listener);
    }

    /// Subscribes to one kind of event.
    pub fn on<F>(&self, kind: EventKind, f: F)
    where
        F: Fn(&BreakerEvent) + Send + Sync + 'static,
    {
        self.inner.events.subscribe_kind(kind, f);
    }

    /// Forces the circuit breaker to the open state.
    pub fn force_open(&self) -> bool {
        match self.inner.state_manager.trip_open() {
            Some(from) => {
                self.announce(from, State::Open);
                true
            }
            None => false,
        }
    }

    /// Forces the circuit breaker to the closed state.
    pub fn force_closed(&self) -> bool {
        let current = self.inner.state_manager.current();
        let closed = match current {
            State::Open => self
                .inner
                .state_manager
                .transition_from_to(State::Open, State::Closed),
            State::HalfOpen => self.inner.state_manager.reset_closed(),
            State::Closed => false,
        };

        if closed {
            self.inner.window.reset();
            self.announce(current, State::Closed);
        }

        closed
    }

    /// Turns the breaker back on after [`disable`](Self::disable).
    pub fn enable(&self) {
        self.inner.enabled.store(true, Ordering::Release);
    }

    /// Passes every call straight to the operation, bypassing the policy.
    pub fn disable(&self) {
        self.inner.enabled.store(false, Ordering::Release);
    }

    /// Whether the breaker applies its policy.
    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::Acquire)
    }

    /// Permanently stops the breaker; later calls fail with [`BreakerError::Shutdown`].
    pub fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }

        self.disable();
        if let Some(cache) = &self.inner.cache {
            cache.clear();
        }
        info!(breaker = %self.inner.key, "circuit breaker shut down");
        self.inner.events.emit(BreakerEvent::Shutdown);
    }

    /// Whether [`shutdown`](Self::shutdown) was called.
    pub fn is_shutdown(&self) -> bool {
        self.inner.shut_down.load(Ordering::Acquire)
    }

    /// Drops every cached response.
    pub fn clear_cache(&self) {
        if let Some(cache) = &self.inner.cache {
            cache.clear();
        }
    }

    /// Resets the rolling statistics.
    pub fn reset_stats(&self) {
        self.inner.window.reset();
    }

    fn cache_key_for(&self, args: &A) -> String {
        match &self.inner.cache_key {
            Some(key_fn) => key_fn(args),
            None => String::new(),
        }
    }

    fn is_filtered(&self, err: &E) -> bool {
        match &self.inner.settings.error_filter {
            Some(filter) => filter(err as &(dyn Error + 'static)),
            None => false,
        }
    }

    fn warming_up(&self) -> bool {
        self.inner.settings.allow_warm_up
            && self.inner.created_at.elapsed() < self.inner.window.window_size()
    }

    /// Checks if a call is allowed based on the current state.
    fn admit(&self) -> Option<Admission> {
        let manager = &self.inner.state_manager;
        match manager.current() {
            State::Closed => Some(Admission::Normal),
            State::Open => {
                if manager.time_in_state() >= self.inner.settings.reset_timeout
                    && manager.attempt_half_open()
                {
                    self.announce(State::Open, State::HalfOpen);
                    if manager.begin_trial() {
                        return Some(Admission::Trial);
                    }
                }
                None
            }
            State::HalfOpen => manager.begin_trial().then_some(Admission::Trial),
        }
    }

    fn on_success(&self, latency: Duration, admission: Admission) {
        self.inner.window.record(|s| s.successes += 1);
        self.inner.events.emit(BreakerEvent::Success { latency });
        self.inner
            .metric_sink
            .record_call(&self.inner.key, CallOutcome::Success, latency);
        self.settle_trial(admission, true);
    }

    fn on_filtered(&self, latency: Duration, admission: Admission) {
        self.inner.window.record(|s| s.filtered += 1);
        self.inner.events.emit(BreakerEvent::Filtered { latency });
        self.inner
            .metric_sink
            .record_call(&self.inner.key, CallOutcome::Filtered, latency);
        self.settle_trial(admission, true);
    }

    fn on_failure(&self, error: &BreakerError<E>, latency: Duration, admission: Admission) {
        let inner = &self.inner;
        let outcome = match error {
            BreakerError::Timeout(after) => {
                inner.events.emit(BreakerEvent::Timeout { after: *after });
                CallOutcome::Timeout
            }
            _ => CallOutcome::Failure,
        };

        inner.window.record(|s| {
            s.failures += 1;
            if outcome == CallOutcome::Timeout {
                s.timeouts += 1;
            }
        });
        inner.events.emit(BreakerEvent::Failure { latency });
        inner.metric_sink.record_call(&inner.key, outcome, latency);
        debug!(breaker = %inner.key, error = %error, "operation failed");

        if admission == Admission::Trial {
            self.settle_trial(admission, false);
            return;
        }

        if inner.state_manager.current() != State::Closed || self.warming_up() {
            return;
        }

        let stats = inner.window.snapshot();
        if inner.policy.should_trip(&stats) {
            if let Some(from) = inner.state_manager.trip_open() {
                inner
                    .metric_sink
                    .record_error_rate(&inner.key, stats.error_percentage());
                self.announce(from, State::Open);
            }
        }
    }

    /// Closes or re-opens the circuit after a half-open trial call.
    fn settle_trial(&self, admission: Admission, healthy: bool) {
        if admission != Admission::Trial {
            return;
        }

        let manager = &self.inner.state_manager;
        if healthy {
            if manager.reset_closed() {
                self.inner.window.reset();
                self.announce(State::HalfOpen, State::Closed);
            }
        } else if manager.revert_to_open() {
            self.announce(State::HalfOpen, State::Open);
        }
        manager.end_trial();
    }

    /// Logs, emits and records a transition this caller performed.
    fn announce(&self, from: State, to: State) {
        let key = &self.inner.key;
        match to {
            State::Open => warn!(breaker = %key, from = %from, "circuit breaker opened"),
            State::HalfOpen => info!(breaker = %key, "circuit breaker half-open, allowing a trial call"),
            State::Closed => info!(breaker = %key, from = %from, "circuit breaker closed"),
        }

        self.inner.events.emit(BreakerEvent::StateChange { from, to });
        self.inner.metric_sink.record_state_transition(key, from, to);
    }
}

// Cheap: the inner state is Arc'd.
impl<A, T, E> Clone for CircuitBreaker<A, T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A, T, E> fmt::Debug for CircuitBreaker<A, T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("key", &self.inner.key)
            .field("state", &self.inner.state_manager.current())
            .finish()
    }
}

impl<A, T, E> BreakerHandle for CircuitBreaker<A, T, E>
where
    A: Clone + Send + 'static,
    T: Clone + Send + 'static,
    E: Error + Send + 'static,
{
    fn identity(&self) -> BreakerIdentity {
        self.inner.identity.clone()
    }

    fn state(&self) -> State {
        self.current_state()
    }

    fn stats(&self) -> BreakerStats {
        CircuitBreaker::stats(self)
    }

    fn settings(&self) -> BreakerSettings {
        self.inner.settings.clone()
    }

    fn subscribe(&self, listener: Listener) {
        CircuitBreaker::subscribe(self, listener)
    }

    fn has_fallback(&self) -> bool {
        CircuitBreaker::has_fallback(self)
    }

    fn force_open(&self) -> bool {
        CircuitBreaker::force_open(self)
    }

    fn force_closed(&self) -> bool {
        CircuitBreaker::force_closed(self)
    }

    fn shutdown(&self) {
        CircuitBreaker::shutdown(self)
    }

    fn is_shutdown(&self) -> bool {
        CircuitBreaker::is_shutdown(self)
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
