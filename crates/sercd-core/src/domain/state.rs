//! Proxy states and the transition table.
//!
//! # State lifecycle
//!
//! ```text
//!             start                engine                  engine
//! Stopped ──────────►  Ready  ───────────►  Connected  ───────────►  PortOpened
//!    ▲                  ▲ │                     │                       │
//!    │                  │ └── client dropped ◄──┴───────────────────────┘
//!    │                  │
//!    │  stop (any)      │  start after crash
//!    └───────────── Crashed ◄── engine exited without a stop request
//! ```
//!
//! - `Ready`: the engine is listening for a network client.
//! - `Connected`: a network client is attached.
//! - `PortOpened`: the serial device is attached to the client and bytes flow.
//! - `Stopped`: no session; stop was requested (reachable from every state).
//! - `Crashed`: the engine returned on its own; needs operator attention.
//!
//! Within one client connection the order is strictly
//! `Ready → Connected → PortOpened`.  When the client goes away the engine
//! resumes listening and the session falls back to `Ready`.

use std::fmt;

/// Health of the proxy subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProxyState {
    Ready,
    Connected,
    PortOpened,
    Stopped,
    Crashed,
}

impl ProxyState {
    /// Every state except `Stopped` has an observer notification on screen.
    pub fn is_active(self) -> bool {
        !matches!(self, ProxyState::Stopped)
    }

    /// `Stopped` and `Crashed` end a session.
    pub fn is_terminal(self) -> bool {
        matches!(self, ProxyState::Stopped | ProxyState::Crashed)
    }

    /// Returns `true` if moving from `self` to `next` is a legal edge.
    ///
    /// Self-transitions are not edges; callers treat them as no-ops before
    /// consulting this table.
    pub fn can_transition_to(self, next: ProxyState) -> bool {
        use ProxyState::*;

        match (self, next) {
            (a, b) if a == b => false,
            (_, Stopped) => true,
            (Stopped | Crashed, Ready) => true,
            (Ready, Connected) | (Connected, PortOpened) => true,
            (Connected | PortOpened, Ready) => true,
            (Ready | Connected | PortOpened, Crashed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ProxyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProxyState::Ready => "ready",
            ProxyState::Connected => "connected",
            ProxyState::PortOpened => "port-opened",
            ProxyState::Stopped => "stopped",
            ProxyState::Crashed => "crashed",
        };
        f.write_str(name)
    }
}

/// Progress a bridge engine reports while it runs.
///
/// Engines only ever describe what happened on the wire; the terminal states
/// (`Stopped`, `Crashed`) are decided by the supervisor when the engine
/// returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineEvent {
    /// The engine is bound and waiting for a network client.
    Listening,
    /// A network client was accepted.
    ClientConnected,
    /// The serial device is attached to the connected client.
    PortOpened,
    /// The client went away (or the device failed); back to listening.
    ClientDropped,
}

impl EngineEvent {
    /// The proxy state this event moves the session into.
    pub fn target_state(self) -> ProxyState {
        match self {
            EngineEvent::Listening | EngineEvent::ClientDropped => ProxyState::Ready,
            EngineEvent::ClientConnected => ProxyState::Connected,
            EngineEvent::PortOpened => ProxyState::PortOpened,
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
