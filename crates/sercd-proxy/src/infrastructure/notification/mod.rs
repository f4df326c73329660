//! Notification sinks and state listeners.
//!
//! The daemon has no notification drawer, so [`TracingNotificationSink`]
//! renders notifications as log lines and remembers the active one.
//! [`ChannelStateListener`] forwards state changes into a Tokio channel so
//! async code (the CLI's main loop) can react to them.

pub mod mock;

use std::sync::{Mutex, PoisonError};

use sercd_core::Notification;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::application::state_machine::{NotificationSink, StateChange, StateListener};

/// Logs notifications and keeps the currently active one.
#[derive(Debug, Default)]
pub struct TracingNotificationSink {
    active: Mutex<Option<Notification>>,
}

impl TracingNotificationSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// The notification currently shown, if any.
    pub fn active(&self) -> Option<Notification> {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl NotificationSink for TracingNotificationSink {
    fn publish(&self, notification: &Notification) {
        if notification.state == sercd_core::ProxyState::Crashed {
            warn!(icon = ?notification.icon, "[{}] {}", notification.title, notification.text);
        } else {
            info!(icon = ?notification.icon, "[{}] {}", notification.title, notification.text);
        }
        *self.active.lock().unwrap_or_else(PoisonError::into_inner) = Some(notification.clone());
    }

    fn clear(&self) {
        if let Some(previous) = self.active.lock().unwrap_or_else(PoisonError::into_inner).take() {
            debug!(state = %previous.state, "notification cleared");
        }
    }
}

/// Forwards every [`StateChange`] into an unbounded Tokio channel.
///
/// Unbounded so that the state machine, which calls listeners under its lock,
/// never waits on a slow consumer.
#[derive(Debug)]
pub struct ChannelStateListener {
    tx: mpsc::UnboundedSender<StateChange>,
}

impl ChannelStateListener {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<StateChange>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl StateListener for ChannelStateListener {
    fn on_state_change(&self, change: StateChange) {
        if self.tx.send(change).is_err() {
            debug!("state change receiver dropped; discarding {:?}", change);
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
