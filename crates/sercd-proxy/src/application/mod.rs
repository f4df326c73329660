//! Application layer use cases for the proxy daemon.
//!
//! # What lives here? (for beginners)
//!
//! The application layer coordinates domain types from `sercd_core` with the
//! outside world, but only through traits ("ports").  Nothing in this module
//! opens a real serial device, binds a socket, or spawns a shell; those
//! concrete adapters live in `infrastructure` and are injected at start-up.
//! Tests inject in-memory mocks instead.
//!
//! # Sub-modules
//!
//! - **`device_access`** – Opens a serial device, elevating its permissions
//!   through a privileged helper when read/write access is missing.
//!
//! - **`state_machine`** – The single authoritative [`ProxyState`] plus the
//!   notification side effects of every transition.
//!
//! - **`supervisor`** – Starts and stops proxy sessions: owns the worker
//!   thread running the bridge engine and decides `Stopped` versus `Crashed`
//!   when it exits.
//!
//! - **`stream_pump`** – Direct streaming mode: two loops moving raw bytes
//!   between a device and a callback, used by the loopback self-test.
//!
//! [`ProxyState`]: sercd_core::ProxyState

pub mod device_access;
pub mod state_machine;
pub mod stream_pump;
pub mod supervisor;
