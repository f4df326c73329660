//! Proxy State Machine: the single authoritative [`ProxyState`].
//!
//! Every transition runs under one mutex and performs, in order:
//!
//! 1. no-op if the new state equals the current one;
//! 2. reject (and log) edges the transition table does not allow;
//! 3. clear the previous notification when leaving an active state;
//! 4. publish the new state's notification, unless the new state is
//!    `Stopped`;
//! 5. commit the new state;
//! 6. deliver a [`StateChange`] to every subscribed [`StateListener`].
//!
//! Because listeners are called while the lock is held, each change is
//! delivered to all of them before the next transition is processed.
//! Listeners therefore must not call back into the machine.
//!
//! [`ProxyStateMachine::exclusive`] lets a caller run its own
//! read-decide-write step under the same lock; the supervisor uses it to
//! record a stop request atomically with respect to the worker's final
//! transition.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use sercd_core::{Notification, ProxyState};
use tracing::{debug, info, warn};

/// Receives the observer-facing notification side effects of transitions.
pub trait NotificationSink: Send + Sync {
    /// Shows `notification` as the one active, ongoing notification.
    fn publish(&self, notification: &Notification);
    /// Removes the active notification, if any.
    fn clear(&self);
}

/// One applied transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChange {
    pub from: ProxyState,
    pub to: ProxyState,
}

/// Observer of applied transitions.
pub trait StateListener: Send + Sync {
    fn on_state_change(&self, change: StateChange);
}

/// Result of a transition request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    Applied(StateChange),
    /// The machine was already in the requested state, or the caller chose
    /// not to move.
    Unchanged,
    /// The edge is not in the transition table.
    Rejected { from: ProxyState, to: ProxyState },
}

pub struct ProxyStateMachine {
    current: Mutex<ProxyState>,
    sink: Arc<dyn NotificationSink>,
    listeners: Mutex<Vec<Arc<dyn StateListener>>>,
}

impl ProxyStateMachine {
    /// Creates a machine in the `Stopped` state.
    pub fn new(sink: Arc<dyn NotificationSink>) -> Self {
        Self {
            current: Mutex::new(ProxyState::Stopped),
            sink,
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn current(&self) -> ProxyState {
        *self.lock_state()
    }

    /// Registers a listener for all subsequent transitions.
    pub fn subscribe(&self, listener: Arc<dyn StateListener>) {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    /// Moves the machine to `next`.
    pub fn transition(&self, next: ProxyState) -> TransitionOutcome {
        self.transition_with(|_| Some(next))
    }

    /// Chooses the next state from the current one under the lock.
    ///
    /// Returning `None` leaves the machine untouched.
    pub fn transition_with<F>(&self, decide: F) -> TransitionOutcome
    where
        F: FnOnce(ProxyState) -> Option<ProxyState>,
    {
        let mut current = self.lock_state();
        match decide(*current) {
            Some(next) => self.apply(&mut current, next),
            None => TransitionOutcome::Unchanged,
        }
    }

    /// Runs `f` with the current state while holding the transition lock.
    pub fn exclusive<R>(&self, f: impl FnOnce(ProxyState) -> R) -> R {
        let current = self.lock_state();
        f(*current)
    }

    fn apply(&self, current: &mut MutexGuard<'_, ProxyState>, next: ProxyState) -> TransitionOutcome {
        let from = **current;
        if from == next {
            debug!(state = %next, "state unchanged");
            return TransitionOutcome::Unchanged;
        }
        if !from.can_transition_to(next) {
            warn!(from = %from, to = %next, "rejected illegal state transition");
            return TransitionOutcome::Rejected { from, to: next };
        }

        if from.is_active() {
            self.sink.clear();
        }
        if let Some(notification) = Notification::for_state(next) {
            self.sink.publish(&notification);
        }
        **current = next;
        info!(from = %from, to = %next, "proxy state changed");

        let change = StateChange { from, to: next };
        let listeners = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for listener in &listeners {
            listener.on_state_change(change);
        }
        TransitionOutcome::Applied(change)
    }

    fn lock_state(&self) -> MutexGuard<'_, ProxyState> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
