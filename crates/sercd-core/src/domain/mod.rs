//! Domain entities for the serial proxy.
//!
//! This module contains pure business rules with no infrastructure
//! dependencies.  The supervisor, the device access layer, and the bridge
//! engines in `sercd-proxy` all depend on these types, but nothing here
//! depends on them.

/// Start-request configuration and its validation.
pub mod config;

/// Observer-facing notification content for each proxy state.
pub mod notification;

/// Proxy states and the transition table.
pub mod state;
