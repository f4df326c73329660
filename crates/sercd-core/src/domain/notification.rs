//! Observer-facing status notifications.
//!
//! Every active proxy state maps to exactly one persistent notification; the
//! `Stopped` state maps to none.  The notification UI itself lives outside
//! this crate; it receives [`Notification`] values through the sink the
//! supervisor is constructed with.

use crate::domain::state::ProxyState;

/// Title shown on every proxy notification.
pub const NOTIFICATION_TITLE: &str = "Serial proxy";

/// Icon variants a notification renderer can choose from.
///
/// `Ready` and `Connected` share the idle icon: a client being attached does
/// not yet mean serial traffic can flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationIcon {
    Idle,
    Linked,
    Fault,
}

/// A persistent, non-dismissable status notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// The state this notification describes.
    pub state: ProxyState,
    pub title: &'static str,
    pub text: &'static str,
    pub icon: NotificationIcon,
    /// Ongoing notifications cannot be cleared by the user.
    pub ongoing: bool,
}

impl Notification {
    /// Builds the notification for `state`, or `None` for `Stopped`.
    pub fn for_state(state: ProxyState) -> Option<Self> {
        let (icon, text) = match state {
            ProxyState::Ready => (NotificationIcon::Idle, "Waiting for a network client"),
            ProxyState::Connected => (NotificationIcon::Idle, "Network client connected"),
            ProxyState::PortOpened => (NotificationIcon::Linked, "Serial port opened"),
            ProxyState::Crashed => (NotificationIcon::Fault, "Proxy crashed unexpectedly"),
            ProxyState::Stopped => return None,
        };

        Some(Self {
            state,
            title: NOTIFICATION_TITLE,
            text,
            icon,
            ongoing: true,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
