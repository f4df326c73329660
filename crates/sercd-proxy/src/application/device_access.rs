//! Device Access Layer: opening a serial device node for read/write.
//!
//! Opening follows a fixed sequence:
//!
//! 1. Probe the device node for read **and** write access.
//! 2. If access is missing, run the privileged helper exactly once with the
//!    two-line script `chmod 666 <absolute path>` / `exit`, bounded by a
//!    timeout.  This mutates filesystem permissions outside the process, so
//!    every attempt is logged at `warn`.
//! 3. Re-probe.  Remediation only counts as successful if the helper exited
//!    with status 0 *and* the probe now passes.
//! 4. Open the port at the requested baud rate.
//!
//! A device that is already accessible never reaches the helper.
//!
//! # Ownership
//!
//! The returned [`DeviceHandle`] is the single owner of the open descriptor.
//! [`DeviceHandle::split`] hands out independent reader/writer streams over
//! cloned descriptors for the loops that move bytes, but only the handle
//! closes the device, and it does so exactly once: on [`DeviceHandle::close`]
//! or on drop, whichever comes first.

use std::fmt;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use sercd_core::domain::config::is_supported_baud_rate;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Helper wait used when none is configured.
pub const DEFAULT_HELPER_TIMEOUT: Duration = Duration::from_secs(10);

// ── Errors ────────────────────────────────────────────────────────────────────

/// Failure to run the privileged helper process.
#[derive(Debug, Error)]
pub enum HelperError {
    /// The helper binary does not exist.
    #[error("privileged helper {program} not found")]
    NotFound { program: PathBuf },

    /// The helper could not be launched for another reason.
    #[error("failed to launch privileged helper {program}: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The script could not be written to the helper's stdin.
    #[error("failed to send script to privileged helper: {0}")]
    Stdin(#[source] io::Error),

    /// Waiting for the helper failed.
    #[error("failed to wait for privileged helper: {0}")]
    Wait(#[source] io::Error),

    /// The helper did not exit in time and was killed.
    #[error("privileged helper did not exit within {0:?}")]
    TimedOut(Duration),

    /// The helper was terminated by a signal and has no exit code.
    #[error("privileged helper was terminated by a signal")]
    Killed,
}

/// Why permission remediation did not make the device accessible.
#[derive(Debug, Error)]
pub enum RemediationFailure {
    #[error("no privileged helper is available")]
    HelperUnavailable,

    #[error("privileged helper failed: {0}")]
    HelperFailed(#[source] HelperError),

    #[error("privileged helper exited with status {0}")]
    NonZeroExit(i32),

    #[error("device is still inaccessible after remediation")]
    StillInaccessible,

    #[error("device path cannot be passed to the privileged helper")]
    UnsafePath,
}

/// Errors returned by [`DeviceOpener::open`].
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("serial device path must not be empty")]
    EmptyPath,

    #[error("unsupported baud rate: {0}")]
    UnsupportedBaudRate(u32),

    /// Read/write access is missing and could not be granted.
    #[error("permission denied on {}: {reason}", path.display())]
    PermissionDenied {
        path: PathBuf,
        #[source]
        reason: RemediationFailure,
    },

    /// Access is confirmed but the open call itself failed (missing, busy, ...).
    #[error("failed to open {}: {source}", path.display())]
    OpenFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

// ── Ports ─────────────────────────────────────────────────────────────────────

/// A raw, bidirectional serial byte stream.
///
/// Reads are expected to time out periodically (`TimedOut` / `WouldBlock`)
/// rather than block forever, so that loops can observe cancellation.
pub trait SerialIo: Read + Write + Send {
    /// Returns a second stream over the same underlying device.
    fn try_clone_io(&self) -> io::Result<Box<dyn SerialIo>>;

    /// Releases the device.  Called at most once, by [`DeviceHandle`].
    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Checks whether the current process may read and write a device node.
pub trait AccessProbe: Send + Sync {
    fn has_read_write(&self, path: &Path) -> bool;
}

/// An out-of-process privileged helper that executes a shell script.
#[cfg_attr(test, mockall::automock)]
pub trait PrivilegeHelper: Send + Sync {
    /// Runs `script`, waiting at most `timeout`, and returns the exit code.
    fn run_script(&self, script: &str, timeout: Duration) -> Result<i32, HelperError>;
}

/// Opens a serial port once access has been confirmed.
pub trait PortOpener: Send + Sync {
    fn open_port(&self, path: &Path, baud_rate: u32) -> io::Result<Box<dyn SerialIo>>;
}

/// The contract the supervisor depends on: `open(path, baudrate)`.
pub trait DeviceOpener: Send + Sync {
    fn open(&self, path: &Path, baud_rate: u32) -> Result<DeviceHandle, DeviceError>;
}

// ── DeviceHandle ──────────────────────────────────────────────────────────────

/// An open serial device, closed exactly once.
pub struct DeviceHandle {
    path: PathBuf,
    baud_rate: u32,
    io: Option<Box<dyn SerialIo>>,
}

impl DeviceHandle {
    pub fn new(path: impl Into<PathBuf>, baud_rate: u32, io: Box<dyn SerialIo>) -> Self {
        Self {
            path: path.into(),
            baud_rate,
            io: Some(io),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    /// Returns independent read and write streams over the device.
    ///
    /// The streams do not own the device: closing the handle makes their
    /// pending and future calls fail.
    pub fn split(&self) -> io::Result<(DeviceReader, DeviceWriter)> {
        let io = self
            .io
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "device is closed"))?;
        let reader = DeviceReader(io.try_clone_io()?);
        let writer = DeviceWriter(io.try_clone_io()?);
        Ok((reader, writer))
    }

    /// Closes the device now and reports the result.
    pub fn close(mut self) -> io::Result<()> {
        self.close_inner()
    }

    fn close_inner(&mut self) -> io::Result<()> {
        match self.io.take() {
            Some(mut io) => {
                debug!(device = %self.path.display(), "closing serial device");
                io.close()
            }
            None => Ok(()),
        }
    }
}

impl fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("path", &self.path)
            .field("baud_rate", &self.baud_rate)
            .field("open", &self.io.is_some())
            .finish()
    }
}

impl Drop for DeviceHandle {
    fn drop(&mut self) {
        if let Err(e) = self.close_inner() {
            warn!(device = %self.path.display(), "error closing serial device: {e}");
        }
    }
}

/// Read half returned by [`DeviceHandle::split`].
pub struct DeviceReader(Box<dyn SerialIo>);

impl Read for DeviceReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

/// Write half returned by [`DeviceHandle::split`].
pub struct DeviceWriter(Box<dyn SerialIo>);

impl Write for DeviceWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

// ── DeviceAccess use case ─────────────────────────────────────────────────────

/// Builds the remediation script for `path`.
///
/// Relative paths are resolved against the working directory so the helper,
/// which may start in a different directory, targets the same node.  The path
/// is passed as a single-quoted shell word, since the script runs in a root
/// shell.
///
/// # Errors
///
/// Returns [`RemediationFailure::UnsafePath`] if the path contains a line
/// break or NUL byte, which cannot be expressed on one script line.
pub fn remediation_script(path: &Path) -> Result<String, RemediationFailure> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };
    let target = absolute.display().to_string();
    if target.contains(['\n', '\r', '\0']) {
        return Err(RemediationFailure::UnsafePath);
    }
    Ok(format!("chmod 666 {}\nexit\n", shell_quote(&target)))
}

/// Quotes `word` for a POSIX shell: `it's` becomes `'it'\''s'`.
fn shell_quote(word: &str) -> String {
    format!("'{}'", word.replace('\'', "'\\''"))
}

/// Opens devices, remediating missing permissions through a helper.
pub struct DeviceAccess {
    probe: Arc<dyn AccessProbe>,
    helper: Option<Arc<dyn PrivilegeHelper>>,
    opener: Arc<dyn PortOpener>,
    helper_timeout: Duration,
}

impl DeviceAccess {
    /// Creates an access layer with no privileged helper.
    pub fn new(probe: Arc<dyn AccessProbe>, opener: Arc<dyn PortOpener>) -> Self {
        Self {
            probe,
            helper: None,
            opener,
            helper_timeout: DEFAULT_HELPER_TIMEOUT,
        }
    }

    pub fn with_helper(mut self, helper: Arc<dyn PrivilegeHelper>) -> Self {
        self.helper = Some(helper);
        self
    }

    pub fn with_helper_timeout(mut self, timeout: Duration) -> Self {
        self.helper_timeout = timeout;
        self
    }

    /// Ensures `path` is readable and writable, running the helper at most once.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::PermissionDenied`] with the reason remediation
    /// did not succeed.
    pub fn ensure_access(&self, path: &Path) -> Result<(), DeviceError> {
        if self.probe.has_read_write(path) {
            return Ok(());
        }

        let denied = |reason| DeviceError::PermissionDenied {
            path: path.to_path_buf(),
            reason,
        };

        let Some(helper) = self.helper.as_ref() else {
            warn!(device = %path.display(), "no read/write access and no privileged helper");
            return Err(denied(RemediationFailure::HelperUnavailable));
        };

        warn!(
            device = %path.display(),
            "no read/write access; changing device permissions via privileged helper"
        );
        let script = remediation_script(path).map_err(|reason| {
            warn!(device = %path.display(), "refusing to run privileged helper: {reason}");
            denied(reason)
        })?;
        let code = match helper.run_script(&script, self.helper_timeout) {
            Ok(code) => code,
            Err(HelperError::NotFound { program }) => {
                warn!("privileged helper {} not found", program.display());
                return Err(denied(RemediationFailure::HelperUnavailable));
            }
            Err(e) => {
                warn!(device = %path.display(), "privileged helper failed: {e}");
                return Err(denied(RemediationFailure::HelperFailed(e)));
            }
        };

        if code != 0 {
            warn!(device = %path.display(), "privileged helper exited with status {code}");
            return Err(denied(RemediationFailure::NonZeroExit(code)));
        }
        if !self.probe.has_read_write(path) {
            warn!(device = %path.display(), "device still inaccessible after remediation");
            return Err(denied(RemediationFailure::StillInaccessible));
        }

        info!(device = %path.display(), "device permissions changed to 0666");
        Ok(())
    }
}

impl DeviceOpener for DeviceAccess {
    fn open(&self, path: &Path, baud_rate: u32) -> Result<DeviceHandle, DeviceError> {
        if path.as_os_str().is_empty() {
            return Err(DeviceError::EmptyPath);
        }
        if !is_supported_baud_rate(baud_rate) {
            return Err(DeviceError::UnsupportedBaudRate(baud_rate));
        }

        self.ensure_access(path)?;

        let io = self
            .opener
            .open_port(path, baud_rate)
            .map_err(|source| DeviceError::OpenFailed {
                path: path.to_path_buf(),
                source,
            })?;

        info!(device = %path.display(), baud_rate, "serial device opened");
        Ok(DeviceHandle::new(path, baud_rate, io))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
