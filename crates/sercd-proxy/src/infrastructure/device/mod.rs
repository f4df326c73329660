//! Native serial device adapters.
//!
//! - [`NativeAccessProbe`] checks read/write permission with `access(2)`.
//! - [`NativePortOpener`] opens ports through the `serialport` crate.
//! - [`su_helper::SuHelper`] runs the permission script through `su`.
//!
//! # Read timeouts
//!
//! Ports are opened with a short read timeout (default 100 ms).  A read that
//! sees no data returns `TimedOut` instead of blocking forever, which is what
//! lets the bridge engine and the stream pump observe cancellation between
//! calls.

pub mod mock;
pub mod su_helper;

use std::io::{self, Read, Write};
use std::path::Path;
use std::time::Duration;

use tracing::debug;

use crate::application::device_access::{AccessProbe, PortOpener, SerialIo};

/// Default read timeout for native ports.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Probes device nodes with the real user and group ids of the process.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeAccessProbe;

impl AccessProbe for NativeAccessProbe {
    fn has_read_write(&self, path: &Path) -> bool {
        #[cfg(unix)]
        {
            use std::ffi::CString;
            use std::os::unix::ffi::OsStrExt;

            let Ok(c_path) = CString::new(path.as_os_str().as_bytes()) else {
                return false;
            };
            // SAFETY: `c_path` is a valid NUL-terminated string that outlives the call.
            let rc = unsafe { libc::access(c_path.as_ptr(), libc::R_OK | libc::W_OK) };
            debug!(device = %path.display(), accessible = rc == 0, "probed device access");
            rc == 0
        }

        #[cfg(not(unix))]
        {
            let ok = std::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .open(path)
                .is_ok();
            debug!(device = %path.display(), accessible = ok, "probed device access");
            ok
        }
    }
}

/// Opens serial ports with 8N1 framing at the requested baud rate.
#[derive(Debug, Clone, Copy)]
pub struct NativePortOpener {
    read_timeout: Duration,
}

impl NativePortOpener {
    pub fn new(read_timeout: Duration) -> Self {
        Self { read_timeout }
    }
}

impl Default for NativePortOpener {
    fn default() -> Self {
        Self::new(DEFAULT_READ_TIMEOUT)
    }
}

impl PortOpener for NativePortOpener {
    fn open_port(&self, path: &Path, baud_rate: u32) -> io::Result<Box<dyn SerialIo>> {
        let name = path.to_str().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "device path is not valid UTF-8")
        })?;
        let port = serialport::new(name, baud_rate)
            .timeout(self.read_timeout)
            .open()
            .map_err(io::Error::from)?;
        Ok(Box::new(NativePort(port)))
    }
}

struct NativePort(Box<dyn serialport::SerialPort>);

impl Read for NativePort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

impl Write for NativePort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

impl SerialIo for NativePort {
    fn try_clone_io(&self) -> io::Result<Box<dyn SerialIo>> {
        let clone = self.0.try_clone().map_err(io::Error::from)?;
        Ok(Box::new(NativePort(clone)))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
