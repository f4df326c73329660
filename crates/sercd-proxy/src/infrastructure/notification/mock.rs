//! Recording doubles for the notification sink and state listeners.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use sercd_core::{Notification, ProxyState};

use crate::application::state_machine::{NotificationSink, StateChange, StateListener};

/// One call made on a [`RecordingNotificationSink`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkEvent {
    Published(ProxyState),
    Cleared,
}

/// Records every publish/clear and flags publishes over an active
/// notification.
#[derive(Debug, Default)]
pub struct RecordingNotificationSink {
    events: Mutex<Vec<SinkEvent>>,
    active: Mutex<Option<Notification>>,
    violations: AtomicUsize,
}

impl RecordingNotificationSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<SinkEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn active(&self) -> Option<Notification> {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// States that were published, in order.
    pub fn published_states(&self) -> Vec<ProxyState> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                SinkEvent::Published(state) => Some(state),
                SinkEvent::Cleared => None,
            })
            .collect()
    }

    /// How many times `state` was published.
    pub fn publish_count(&self, state: ProxyState) -> usize {
        self.published_states()
            .into_iter()
            .filter(|s| *s == state)
            .count()
    }

    /// Publishes made while another notification was still active.
    pub fn violations(&self) -> usize {
        self.violations.load(Ordering::SeqCst)
    }
}

impl NotificationSink for RecordingNotificationSink {
    fn publish(&self, notification: &Notification) {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if active.is_some() {
            self.violations.fetch_add(1, Ordering::SeqCst);
        }
        *active = Some(notification.clone());
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(SinkEvent::Published(notification.state));
    }

    fn clear(&self) {
        *self.active.lock().unwrap_or_else(PoisonError::into_inner) = None;
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(SinkEvent::Cleared);
    }
}

/// Records every state change it is told about.
#[derive(Debug, Default)]
pub struct RecordingListener {
    changes: Mutex<Vec<StateChange>>,
}

impl RecordingListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn changes(&self) -> Vec<StateChange> {
        self.changes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Target states of the recorded changes, in order.
    pub fn states(&self) -> Vec<ProxyState> {
        self.changes().into_iter().map(|change| change.to).collect()
    }
}

impl StateListener for RecordingListener {
    fn on_state_change(&self, change: StateChange) {
        self.changes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(change);
    }
}
