//! Proxy start-request configuration.
//!
//! A [`ProxyConfig`] is built once per start request and never mutated
//! afterwards.  Construction validates every field so that the supervisor can
//! rely on a well-formed value:
//!
//! - the serial device path is non-empty,
//! - the network interface is an IPv4 or IPv6 address literal,
//! - the TCP port is in `1..=65535`,
//! - the baud rate is one of the standard termios line speeds.
//!
//! # Example
//!
//! ```rust
//! use sercd_core::ProxyConfig;
//!
//! let cfg = ProxyConfig::new("/dev/ttyS0", "192.168.1.5", 30001)
//!     .unwrap()
//!     .with_baud_rate(115_200)
//!     .unwrap();
//! assert_eq!(cfg.socket_addr().to_string(), "192.168.1.5:30001");
//! ```

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Baud rate used when a start request does not specify one.
pub const DEFAULT_BAUD_RATE: u32 = 9600;

/// Line speeds accepted by [`ProxyConfig::with_baud_rate`].
///
/// These are the POSIX termios speeds from `B50` up to `B460800`.
pub const SUPPORTED_BAUD_RATES: [u32; 19] = [
    50, 75, 110, 134, 150, 200, 300, 600, 1200, 1800, 2400, 4800, 9600, 19200, 38400, 57600,
    115_200, 230_400, 460_800,
];

/// Validation failures for a [`ProxyConfig`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// The serial device path was empty.
    #[error("serial device path must not be empty")]
    EmptyDevicePath,

    /// The network interface string is not an IP address literal.
    #[error("invalid network interface address: {0:?}")]
    InvalidInterface(String),

    /// The TCP port was zero.
    #[error("network port must be between 1 and 65535, got {0}")]
    InvalidPort(u16),

    /// The baud rate is not a standard line speed.
    #[error("unsupported baud rate: {0}")]
    UnsupportedBaudRate(u32),
}

/// Immutable parameters for one proxy session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    device_path: PathBuf,
    baud_rate: u32,
    interface: IpAddr,
    port: u16,
}

impl ProxyConfig {
    /// Builds a configuration with the [`DEFAULT_BAUD_RATE`].
    ///
    /// # Errors
    ///
    /// - [`ConfigError::EmptyDevicePath`] if `device_path` is empty.
    /// - [`ConfigError::InvalidInterface`] if `interface` does not parse as an
    ///   IP address.
    /// - [`ConfigError::InvalidPort`] if `port` is zero.
    pub fn new(
        device_path: impl Into<PathBuf>,
        interface: &str,
        port: u16,
    ) -> Result<Self, ConfigError> {
        let device_path = device_path.into();
        if device_path.as_os_str().is_empty() {
            return Err(ConfigError::EmptyDevicePath);
        }

        let interface: IpAddr = interface
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidInterface(interface.to_string()))?;

        if port == 0 {
            return Err(ConfigError::InvalidPort(port));
        }

        Ok(Self {
            device_path,
            baud_rate: DEFAULT_BAUD_RATE,
            interface,
            port,
        })
    }

    /// Returns a copy of this configuration using `baud_rate`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnsupportedBaudRate`] unless `baud_rate` is one
    /// of [`SUPPORTED_BAUD_RATES`].
    pub fn with_baud_rate(self, baud_rate: u32) -> Result<Self, ConfigError> {
        if !is_supported_baud_rate(baud_rate) {
            return Err(ConfigError::UnsupportedBaudRate(baud_rate));
        }
        Ok(Self { baud_rate, ..self })
    }

    pub fn device_path(&self) -> &Path {
        &self.device_path
    }

    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    pub fn interface(&self) -> IpAddr {
        self.interface
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// The address the bridge engine listens on.
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.interface, self.port)
    }
}

/// Returns `true` if `baud_rate` is a standard termios line speed.
pub fn is_supported_baud_rate(baud_rate: u32) -> bool {
    SUPPORTED_BAUD_RATES.contains(&baud_rate)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
