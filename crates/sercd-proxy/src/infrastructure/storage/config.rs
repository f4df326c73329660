//! TOML-based configuration persistence for the proxy daemon.
//!
//! Reads and writes [`AppConfig`] at the platform-appropriate location:
//! - Linux:    `$XDG_CONFIG_HOME/sercd-proxy/config.toml` or
//!   `~/.config/sercd-proxy/config.toml`
//! - Windows:  `%APPDATA%\SercdProxy\config.toml`
//! - macOS:    `~/Library/Application Support/SercdProxy/config.toml`
//!
//! # File layout
//!
//! ```toml
//! [serial]
//! device = "/dev/ttyS0"
//! baud_rate = 115200
//!
//! [network]
//! interface = "192.168.1.5"
//! port = 30001
//!
//! [helper]
//! program = "/system/bin/su"
//! timeout_secs = 10
//!
//! [daemon]
//! log_level = "info"
//! poll_interval_ms = 100
//! ```
//!
//! Every field has a default (`#[serde(default = "...")]`), so a partial file
//! or no file at all still loads.  Validation happens later, in
//! [`AppConfig::to_proxy_config`], because an empty device path is a fine
//! thing to *store* but not to *start* with.

use std::path::{Path, PathBuf};
use std::time::Duration;

use sercd_core::{ConfigError, ProxyConfig, DEFAULT_BAUD_RATE};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::infrastructure::device::su_helper::DEFAULT_SU_PROGRAM;

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The platform config directory could not be determined.
    #[error("could not determine platform config directory")]
    NoPlatformConfigDir,

    /// A file system I/O error occurred.
    #[error("I/O error accessing config at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// The config could not be serialized to TOML.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level daemon configuration stored on disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    #[serde(default)]
    pub serial: SerialConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub helper: HelperConfig,
    #[serde(default)]
    pub daemon: DaemonConfig,
}

/// The serial device to bridge.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SerialConfig {
    /// Device node path, e.g. `/dev/ttyS0`.  Empty until configured.
    #[serde(default)]
    pub device: PathBuf,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
}

/// Where the bridge listens for its network client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetworkConfig {
    /// IP address literal to bind.  `"0.0.0.0"` binds all interfaces.
    #[serde(default = "default_interface")]
    pub interface: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Privileged helper used to fix device permissions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HelperConfig {
    #[serde(default = "default_helper_program")]
    pub program: PathBuf,
    /// Upper bound on how long the helper may run.
    #[serde(default = "default_helper_timeout_secs")]
    pub timeout_secs: u64,
}

/// Daemon behaviour settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DaemonConfig {
    /// `tracing` filter used when `RUST_LOG` is not set.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Accept/read poll interval of the bridge engine, in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_baud_rate() -> u32 {
    DEFAULT_BAUD_RATE
}
fn default_interface() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    7000
}
fn default_helper_program() -> PathBuf {
    PathBuf::from(DEFAULT_SU_PROGRAM)
}
fn default_helper_timeout_secs() -> u64 {
    10
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_poll_interval_ms() -> u64 {
    100
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            device: PathBuf::new(),
            baud_rate: default_baud_rate(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            interface: default_interface(),
            port: default_port(),
        }
    }
}

impl Default for HelperConfig {
    fn default() -> Self {
        Self {
            program: default_helper_program(),
            timeout_secs: default_helper_timeout_secs(),
        }
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl AppConfig {
    /// Builds the validated start request described by this file.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found in the serial or network
    /// sections.
    pub fn to_proxy_config(&self) -> Result<ProxyConfig, ConfigError> {
        ProxyConfig::new(
            self.serial.device.clone(),
            &self.network.interface,
            self.network.port,
        )?
        .with_baud_rate(self.serial.baud_rate)
    }

    pub fn helper_timeout(&self) -> Duration {
        Duration::from_secs(self.helper.timeout_secs)
    }

    /// Poll interval, never shorter than one millisecond.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.daemon.poll_interval_ms.max(1))
    }
}

// ── Config repository ─────────────────────────────────────────────────────────

/// Resolves the full path to the default config file.
///
/// # Errors
///
/// Returns [`StorageError::NoPlatformConfigDir`] if the base directory cannot
/// be determined from the environment.
pub fn config_file_path() -> Result<PathBuf, StorageError> {
    platform_config_dir()
        .map(|dir| dir.join("config.toml"))
        .ok_or(StorageError::NoPlatformConfigDir)
}

/// Loads the config from the default location.
///
/// # Errors
///
/// See [`load_config_from`].
pub fn load_config() -> Result<AppConfig, StorageError> {
    load_config_from(&config_file_path()?)
}

/// Loads `AppConfig` from `path`, returning defaults if the file does not
/// exist.
///
/// # Errors
///
/// Returns [`StorageError::Io`] for file-system errors other than "not found",
/// and [`StorageError::Parse`] if the TOML is malformed.
pub fn load_config_from(path: &Path) -> Result<AppConfig, StorageError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(toml::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(AppConfig::default()),
        Err(source) => Err(StorageError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Persists `config` to `path`, creating parent directories as needed.
///
/// # Errors
///
/// Returns [`StorageError::Io`] for file-system failures or
/// [`StorageError::Serialize`] if serialization fails.
pub fn save_config_to(path: &Path, config: &AppConfig) -> Result<(), StorageError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|source| StorageError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
    }

    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content).map_err(|source| StorageError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Resolves the platform config directory including the app subdirectory.
fn platform_config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA").map(|p| PathBuf::from(p).join("SercdProxy"))
    }

    #[cfg(target_os = "macos")]
    {
        std::env::var_os("HOME").map(|h| {
            PathBuf::from(h)
                .join("Library")
                .join("Application Support")
                .join("SercdProxy")
        })
    }

    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    {
        // XDG_CONFIG_HOME or ~/.config
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))?;
        Some(base.join("sercd-proxy"))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
