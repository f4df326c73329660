//! Infrastructure layer for the proxy daemon.
//!
//! Contains OS-facing adapters: serial device access, the `su` privileged
//! helper, the raw TCP bridge engine, notification sinks, and TOML config
//! storage.  Each adapter directory also ships an always-compiled `mock`
//! module used by unit and integration tests.
//!
//! **Dependency rule**: this layer may depend on `application` and
//! `sercd_core`, but MUST NOT be imported by the `application` or domain
//! layers outside of their tests.

pub mod bridge;
pub mod device;
pub mod notification;
pub mod storage;
