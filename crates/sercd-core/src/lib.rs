//! # sercd-core
//!
//! Shared domain types for the serial-to-network proxy.  The crate has no
//! dependencies on OS APIs, serial drivers, or sockets; everything here can be
//! compiled and tested on any platform.
//!
//! # Architecture overview
//!
//! The proxy bridges a local serial device (for example `/dev/ttyS0`) to a
//! TCP endpoint so that a remote machine can use the serial line as if it
//! were plugged in locally.  A long-running supervisor owns the device,
//! launches a *bridge engine* on a worker thread, and keeps an explicit state
//! machine that an operator-facing notification follows.
//!
//! This crate defines the vocabulary shared by every layer:
//!
//! - **`domain::config`** – The immutable [`ProxyConfig`] a start request
//!   carries (device path, baud rate, interface address, TCP port) and its
//!   validation rules.
//!
//! - **`domain::state`** – [`ProxyState`], the table of legal transitions
//!   between states, and the [`EngineEvent`]s a bridge engine reports.
//!
//! - **`domain::notification`** – The persistent status [`Notification`]
//!   rendered for each state.

pub mod domain;

// Re-export the most-used types at the crate root so callers can write
// `sercd_core::ProxyState` instead of `sercd_core::domain::state::ProxyState`.
pub use domain::config::{ConfigError, ProxyConfig, DEFAULT_BAUD_RATE, SUPPORTED_BAUD_RATES};
pub use domain::notification::{Notification, NotificationIcon};
pub use domain::state::{EngineEvent, ProxyState};
