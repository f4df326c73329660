//! Storage infrastructure: configuration file persistence.
//!
//! The `config` sub-module reads and writes the daemon's TOML configuration
//! file and turns it into the validated [`sercd_core::ProxyConfig`] a start
//! request needs.  A missing file is not an error; defaults apply.

pub mod config;
