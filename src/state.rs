//! Circuit breaker state machine implementation.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::{Duration, Instant};

/// Represents the possible states of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum State {
    /// Circuit is closed and operations are allowed.
    Closed = 0,

    /// Circuit is open and operations are rejected.
    Open = 1,

    /// Circuit lets a single trial call through to test recovery.
    HalfOpen = 2,
}

impl State {
    /// Lower-case label used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            State::Closed => "closed",
            State::Open => "open",
            State::HalfOpen => "half-open",
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<u8> for State {
    fn from(value: u8) -> Self {
        match value {
            0 => State::Closed,
            1 => State::Open,
            2 => State::HalfOpen,
            _ => State::Open,
        }
    }
}

/// Owns the current state and the half-open trial slot.
///
/// Transitions are compare-and-swap, so of several racing callers exactly one
/// observes a given transition succeed and is responsible for announcing it.
pub(crate) struct StateManager {
    state: AtomicU8,
    last_transition: parking_lot::Mutex<Instant>,
    trial_in_flight: AtomicBool,
}

impl StateManager {
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicU8::new(State::Closed as u8),
            last_transition: parking_lot::Mutex::new(Instant::now()),
            trial_in_flight: AtomicBool::new(false),
        }
    }

    pub(crate) fn current(&self) -> State {
        State::from(self.state.load(Ordering::Acquire))
    }

    /// Duration since the last state transition.
    pub(crate) fn time_in_state(&self) -> Duration {
        self.last_transition.lock().elapsed()
    }

    /// Returns true if this caller performed the transition.
    pub(crate) fn transition_from_to(&self, from: State, to: State) -> bool {
        let swapped = self
            .state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();

        if swapped {
            *self.last_transition.lock() = Instant::now();
            if to != State::HalfOpen {
                self.trial_in_flight.store(false, Ordering::Release);
            }
        }

        swapped
    }

    /// Opens the circuit from whatever state it is in. Returns the previous
    /// state when this caller opened it.
    pub(crate) fn trip_open(&self) -> Option<State> {
        let current = self.current();
        if current == State::Open {
            return None;
        }

        self.transition_from_to(current, State::Open).then_some(current)
    }

    pub(crate) fn attempt_half_open(&self) -> bool {
        self.transition_from_to(State::Open, State::HalfOpen)
    }

    pub(crate) fn reset_closed(&self) -> bool {
        self.transition_from_to(State::HalfOpen, State::Closed)
    }

    pub(crate) fn revert_to_open(&self) -> bool {
        self.transition_from_to(State::HalfOpen, State::Open)
    }

    /// Claims the single half-open trial slot.
    pub(crate) fn begin_trial(&self) -> bool {
        self.trial_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn end_trial(&self) {
        self.trial_in_flight.store(false, Ordering::Release);
    }
}

/// A claimed half-open trial slot.
///
/// Dropping the slot before [`TrialSlot::settled`] frees it, so a cancelled
/// trial call hands the trial to the next caller.
pub(crate) struct TrialSlot<'a> {
    manager: Option<&'a StateManager>,
}

impl<'a> TrialSlot<'a> {
    /// Tracks the slot when `claimed`; otherwise the guard does nothing.
    pub(crate) fn new(manager: &'a StateManager, claimed: bool) -> Self {
        Self {
            manager: claimed.then_some(manager),
        }
    }

    /// The trial outcome was applied and the slot already released.
    pub(crate) fn settled(mut self) {
        self.manager = None;
    }
}

impl Drop for TrialSlot<'_> {
    fn drop(&mut self) {
        if let Some(manager) = self.manager.take() {
            manager.end_trial();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_one_half_open_trial_at_a_time() {
        let manager = StateManager::new();
        assert_eq!(manager.trip_open(), Some(State::Closed));
        assert!(manager.attempt_half_open());

        assert!(manager.begin_trial());
        assert!(!manager.begin_trial());

        manager.end_trial();
        assert!(manager.begin_trial());
    }

    #[test]
    fn dropped_trial_slot_is_released() {
        let manager = StateManager::new();
        manager.trip_open();
        assert!(manager.attempt_half_open());
        assert!(manager.begin_trial());

        drop(TrialSlot::new(&manager, true));
        assert_eq!(manager.current(), State::HalfOpen);
        assert!(manager.begin_trial());

        TrialSlot::new(&manager, true).settled();
        assert!(!manager.begin_trial());

        // An unclaimed slot never releases someone else's trial
        drop(TrialSlot::new(&manager, false));
        assert!(!manager.begin_trial());
    }

    #[test]
    fn trip_open_reports_previous_state_once() {
        let manager = StateManager::new();
        assert_eq!(manager.trip_open(), Some(State::Closed));
        assert_eq!(manager.trip_open(), None);
        assert_eq!(manager.current(), State::Open);
    }
}
