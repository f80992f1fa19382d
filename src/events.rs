//! Lifecycle notifications emitted by circuit breakers.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use smallvec::SmallVec;

use crate::state::State;

/// A callback subscribed to a breaker's events.
pub type Listener = Arc<dyn Fn(&BreakerEvent) + Send + Sync + 'static>;

/// Something that happened to a breaker.
#[derive(Debug, Clone, PartialEq)]
pub enum BreakerEvent {
    /// A call was submitted to the breaker.
    Fire,
    /// The operation completed successfully.
    Success {
        /// Time spent in the operation.
        latency: Duration,
    },
    /// The operation failed and the failure was counted.
    Failure {
        /// Time spent in the operation.
        latency: Duration,
    },
    /// The operation failed with an error the error filter excluded from the stats.
    Filtered {
        /// Time spent in the operation.
        latency: Duration,
    },
    /// The operation exceeded the configured timeout.
    Timeout {
        /// The timeout that elapsed.
        after: Duration,
    },
    /// The call was rejected because the circuit is open.
    Reject,
    /// The call was rejected because every call slot was taken.
    SemaphoreLocked,
    /// The circuit changed state.
    StateChange {
        /// State before the transition.
        from: State,
        /// State after the transition.
        to: State,
    },
    /// The fallback was invoked.
    Fallback,
    /// The result was served from the response cache.
    CacheHit,
    /// The response cache had no entry for the call.
    CacheMiss,
    /// The breaker was shut down.
    Shutdown,
}

/// Coarse event category, used to subscribe to one kind of event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// See [`BreakerEvent::Fire`].
    Fire,
    /// See [`BreakerEvent::Success`].
    Success,
    /// See [`BreakerEvent::Failure`].
    Failure,
    /// See [`BreakerEvent::Filtered`].
    Filtered,
    /// See [`BreakerEvent::Timeout`].
    Timeout,
    /// See [`BreakerEvent::Reject`].
    Reject,
    /// See [`BreakerEvent::SemaphoreLocked`].
    SemaphoreLocked,
    /// Transition into [`State::Open`].
    Open,
    /// Transition into [`State::Closed`].
    Close,
    /// Transition into [`State::HalfOpen`].
    HalfOpen,
    /// See [`BreakerEvent::Fallback`].
    Fallback,
    /// See [`BreakerEvent::CacheHit`].
    CacheHit,
    /// See [`BreakerEvent::CacheMiss`].
    CacheMiss,
    /// See [`BreakerEvent::Shutdown`].
    Shutdown,
}

impl BreakerEvent {
    /// Returns the category of this event.
    pub fn kind(&self) -> EventKind {
        match self {
            BreakerEvent::Fire => EventKind::Fire,
            BreakerEvent::Success { .. } => EventKind::Success,
            BreakerEvent::Failure { .. } => EventKind::Failure,
            BreakerEvent::Filtered { .. } => EventKind::Filtered,
            BreakerEvent::Timeout { .. } => EventKind::Timeout,
            BreakerEvent::Reject => EventKind::Reject,
            BreakerEvent::SemaphoreLocked => EventKind::SemaphoreLocked,
            BreakerEvent::StateChange { to, .. } => match to {
                State::Open => EventKind::Open,
                State::Closed => EventKind::Close,
                State::HalfOpen => EventKind::HalfOpen,
            },
            BreakerEvent::Fallback => EventKind::Fallback,
            BreakerEvent::CacheHit => EventKind::CacheHit,
            BreakerEvent::CacheMiss => EventKind::CacheMiss,
            BreakerEvent::Shutdown => EventKind::Shutdown,
        }
    }
}

/// The listeners subscribed to one breaker.
pub(crate) struct EventListeners {
    listeners: RwLock<SmallVec<[Listener; 4]>>,
}

impl Default for EventListeners {
    fn default() -> Self {
        Self::new()
    }
}

impl EventListeners {
    pub(crate) fn new() -> Self {
        Self {
            listeners: RwLock::new(SmallVec::new()),
        }
    }

    pub(crate) fn subscribe(&self, listener: Listener) {
        self.listeners.write().push(listener);
    }

    pub(crate) fn subscribe_kind<F>(&self, kind: EventKind, f: F)
    where
        F: Fn(&BreakerEvent) + Send + Sync + 'static,
    {
        self.subscribe(Arc::new(move |event: &BreakerEvent| {
            if event.kind() == kind {
                f(event);
            }
        }));
    }

    /// Delivers the event to every listener.
    ///
    /// The listener list is copied first, so a listener may subscribe more
    /// listeners without deadlocking.
    pub(crate) fn emit(&self, event: BreakerEvent) {
        let listeners: SmallVec<[Listener; 4]> = self.listeners.read().iter().cloned().collect();
        for listener in listeners {
            listener(&event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn kind_subscription_only_sees_matching_events() {
        let listeners = EventListeners::new();
        let opened = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&opened);
        listeners.subscribe_kind(EventKind::Open, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        listeners.emit(BreakerEvent::Fire);
        listeners.emit(BreakerEvent::StateChange {
            from: State::Closed,
            to: State::Open,
        });
        listeners.emit(BreakerEvent::StateChange {
            from: State::Open,
            to: State::HalfOpen,
        });

        assert_eq!(opened.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn listener_may_subscribe_while_handling() {
        let listeners = Arc::new(EventListeners::new());
        let inner = Arc::clone(&listeners);
        listeners.subscribe(Arc::new(move |_: &BreakerEvent| {
            inner.subscribe(Arc::new(|_: &BreakerEvent| {}));
        }));

        listeners.emit(BreakerEvent::Fire);
        assert_eq!(listeners.listeners.read().len(), 2);
    }
}
