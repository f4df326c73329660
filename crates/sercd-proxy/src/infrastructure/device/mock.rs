//! In-memory device doubles for unit and integration tests.
//!
//! - [`MockSerialDevice`] behaves like a serial port with a read timeout:
//!   bytes pushed with [`MockSerialDevice::feed`] become readable, reads with
//!   no data time out, and closing the device makes every call fail.
//! - [`MockPortOpener`] hands out registered devices by path.
//! - [`MockAccessProbe`] answers permission checks from a set of granted
//!   paths.
//! - [`ScriptedHelper`] plays the privileged helper and, on success, grants
//!   the (single-quoted) path named in the `chmod` line.

use std::collections::{HashMap, HashSet, VecDeque};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::application::device_access::{
    AccessProbe, HelperError, PortOpener, PrivilegeHelper, SerialIo,
};

/// Read timeout of [`MockSerialDevice`].
pub const MOCK_READ_TIMEOUT: Duration = Duration::from_millis(20);

/// Default number of bytes a mock device accepts before writes block.
pub const MOCK_WRITE_CAPACITY: usize = 64 * 1024;

struct DeviceState {
    input: VecDeque<u8>,
    input_finished: bool,
    read_error: Option<io::ErrorKind>,
    written: Vec<u8>,
    write_capacity: usize,
    write_chunk: Option<usize>,
    write_timeout_pending: bool,
    open: bool,
    closed: bool,
    close_count: usize,
    overlapping_opens: usize,
}

/// A shared, cloneable fake serial device.
#[derive(Clone)]
pub struct MockSerialDevice {
    shared: Arc<(Mutex<DeviceState>, Condvar)>,
}

impl MockSerialDevice {
    pub fn new() -> Self {
        Self::with_write_capacity(MOCK_WRITE_CAPACITY)
    }

    /// A device whose writes block once `capacity` bytes have been written.
    pub fn with_write_capacity(capacity: usize) -> Self {
        let state = DeviceState {
            input: VecDeque::new(),
            input_finished: false,
            read_error: None,
            written: Vec::new(),
            write_capacity: capacity,
            write_chunk: None,
            write_timeout_pending: false,
            open: false,
            closed: false,
            close_count: 0,
            overlapping_opens: 0,
        };
        Self {
            shared: Arc::new((Mutex::new(state), Condvar::new())),
        }
    }

    /// Makes `data` available to readers.
    pub fn feed(&self, data: &[u8]) {
        let (lock, cvar) = &*self.shared;
        lock.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .input
            .extend(data);
        cvar.notify_all();
    }

    /// Readers see end of stream once the fed bytes are drained.
    pub fn finish_input(&self) {
        self.update(|state| state.input_finished = true);
    }

    /// Every subsequent read fails with `kind`.
    pub fn fail_reads(&self, kind: io::ErrorKind) {
        self.update(|state| state.read_error = Some(kind));
    }

    /// Each write accepts at most `chunk` bytes, and the write after it
    /// fails with `TimedOut`.
    pub fn throttle_writes(&self, chunk: usize) {
        self.update(|state| state.write_chunk = Some(chunk.max(1)));
    }

    /// All bytes written so far.
    pub fn written(&self) -> Vec<u8> {
        self.state().written.clone()
    }

    pub fn close_count(&self) -> usize {
        self.state().close_count
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    /// Number of times the device was opened while already open.
    pub fn overlapping_opens(&self) -> usize {
        self.state().overlapping_opens
    }

    fn reopen(&self) {
        self.update(|state| {
            if state.open {
                state.overlapping_opens += 1;
            }
            state.open = true;
            state.closed = false;
        });
    }

    fn update(&self, f: impl FnOnce(&mut DeviceState)) {
        let (lock, cvar) = &*self.shared;
        f(&mut lock.lock().unwrap_or_else(PoisonError::into_inner));
        cvar.notify_all();
    }

    fn state(&self) -> MutexGuard<'_, DeviceState> {
        self.shared.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for MockSerialDevice {
    fn default() -> Self {
        Self::new()
    }
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "device closed")
}

impl Read for MockSerialDevice {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let (lock, cvar) = &*self.shared;
        let mut state = lock.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if state.closed {
                return Err(closed_error());
            }
            if let Some(kind) = state.read_error {
                return Err(io::Error::new(kind, "injected read failure"));
            }
            if !state.input.is_empty() {
                let n = buf.len().min(state.input.len());
                for (slot, byte) in buf.iter_mut().zip(state.input.drain(..n)) {
                    *slot = byte;
                }
                return Ok(n);
            }
            if state.input_finished {
                return Ok(0);
            }
            let (next, timeout) = cvar
                .wait_timeout(state, MOCK_READ_TIMEOUT)
                .unwrap_or_else(PoisonError::into_inner);
            state = next;
            if timeout.timed_out() && state.input.is_empty() && !state.closed {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "read timed out"));
            }
        }
    }
}

impl Write for MockSerialDevice {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let (lock, cvar) = &*self.shared;
        let mut state = lock.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if state.closed {
                return Err(closed_error());
            }
            if state.write_timeout_pending {
                state.write_timeout_pending = false;
                return Err(io::Error::new(io::ErrorKind::TimedOut, "write timed out"));
            }
            let room = state.write_capacity.saturating_sub(state.written.len());
            if room > 0 {
                let limit = state.write_chunk.unwrap_or(usize::MAX);
                let n = room.min(buf.len()).min(limit);
                state.written.extend_from_slice(&buf[..n]);
                state.write_timeout_pending = state.write_chunk.is_some();
                return Ok(n);
            }
            state = cvar.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl SerialIo for MockSerialDevice {
    fn try_clone_io(&self) -> io::Result<Box<dyn SerialIo>> {
        Ok(Box::new(self.clone()))
    }

    fn close(&mut self) -> io::Result<()> {
        self.update(|state| {
            state.open = false;
            state.closed = true;
            state.close_count += 1;
        });
        Ok(())
    }
}

// ── MockPortOpener ────────────────────────────────────────────────────────────

/// Opens registered [`MockSerialDevice`]s by path.
#[derive(Default)]
pub struct MockPortOpener {
    devices: Mutex<HashMap<PathBuf, MockSerialDevice>>,
    failure: Mutex<Option<io::ErrorKind>>,
    open_count: AtomicUsize,
}

impl MockPortOpener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_device(&self, path: impl Into<PathBuf>, device: MockSerialDevice) {
        self.devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path.into(), device);
    }

    /// Every subsequent open fails with `kind`.
    pub fn fail_opens(&self, kind: io::ErrorKind) {
        *self.failure.lock().unwrap_or_else(PoisonError::into_inner) = Some(kind);
    }

    /// Number of successful opens.
    pub fn open_count(&self) -> usize {
        self.open_count.load(Ordering::SeqCst)
    }
}

impl PortOpener for MockPortOpener {
    fn open_port(&self, path: &Path, _baud_rate: u32) -> io::Result<Box<dyn SerialIo>> {
        if let Some(kind) = *self.failure.lock().unwrap_or_else(PoisonError::into_inner) {
            return Err(io::Error::new(kind, "injected open failure"));
        }
        let device = self
            .devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(path)
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such device"))?;
        device.reopen();
        self.open_count.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(device))
    }
}

// ── MockAccessProbe ───────────────────────────────────────────────────────────

/// Permission probe answering from a set of granted paths.
#[derive(Default)]
pub struct MockAccessProbe {
    granted: Mutex<HashSet<PathBuf>>,
    checks: AtomicUsize,
}

impl MockAccessProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(&self, path: impl Into<PathBuf>) {
        self.granted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path.into());
    }

    /// Number of `has_read_write` calls so far.
    pub fn check_count(&self) -> usize {
        self.checks.load(Ordering::SeqCst)
    }
}

impl AccessProbe for MockAccessProbe {
    fn has_read_write(&self, path: &Path) -> bool {
        self.checks.fetch_add(1, Ordering::SeqCst);
        self.granted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(path)
    }
}

// ── ScriptedHelper ────────────────────────────────────────────────────────────

enum HelperScript {
    Grant(Arc<MockAccessProbe>),
    Exit(i32),
    Missing,
}

/// Privileged helper double that records every script it receives.
pub struct ScriptedHelper {
    script: HelperScript,
    received: Mutex<Vec<String>>,
}

impl ScriptedHelper {
    /// Exits 0 and grants access to the `chmod` target on `probe`.
    pub fn granting(probe: Arc<MockAccessProbe>) -> Self {
        Self::with(HelperScript::Grant(probe))
    }

    /// Exits with `code` without changing any permission.
    pub fn exiting(code: i32) -> Self {
        Self::with(HelperScript::Exit(code))
    }

    /// Behaves as if the helper binary does not exist.
    pub fn missing() -> Self {
        Self::with(HelperScript::Missing)
    }

    fn with(script: HelperScript) -> Self {
        Self {
            script,
            received: Mutex::new(Vec::new()),
        }
    }

    /// Scripts received so far, in order.
    pub fn scripts(&self) -> Vec<String> {
        self.received
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl PrivilegeHelper for ScriptedHelper {
    fn run_script(&self, script: &str, _timeout: Duration) -> Result<i32, HelperError> {
        self.received
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(script.to_string());

        match &self.script {
            HelperScript::Grant(probe) => {
                if let Some(target) = script
                    .lines()
                    .find_map(|line| line.strip_prefix("chmod 666 "))
                {
                    probe.grant(target.trim_matches('\''));
                }
                Ok(0)
            }
            HelperScript::Exit(code) => Ok(*code),
            HelperScript::Missing => Err(HelperError::NotFound {
                program: PathBuf::from(super::su_helper::DEFAULT_SU_PROGRAM),
            }),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_times_out_without_data() {
        let mut device = MockSerialDevice::new();
        let mut buf = [0u8; 4];
        let err = device.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[test]
    fn test_fed_bytes_are_read_in_order() {
        let mut device = MockSerialDevice::new();
        device.feed(b"abcdef");

        let mut buf = [0u8; 4];
        let first = device.read(&mut buf).unwrap();
        assert_eq!(&buf[..first], b"abcd");
        let second = device.read(&mut buf).unwrap();
        assert_eq!(&buf[..second], b"ef");
    }

    #[test]
    fn test_write_stops_at_capacity() {
        let mut device = MockSerialDevice::with_write_capacity(3);
        assert_eq!(device.write(b"hello").unwrap(), 3);
        assert_eq!(device.written(), b"hel".to_vec());
    }

    #[test]
    fn test_throttled_write_times_out_after_a_chunk() {
        let mut device = MockSerialDevice::new();
        device.throttle_writes(2);

        assert_eq!(device.write(b"hello").unwrap(), 2);
        let err = device.write(b"llo").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert_eq!(device.write(b"llo").unwrap(), 2);
        assert_eq!(device.written(), b"hell".to_vec());
    }

    #[test]
    fn test_close_unblocks_full_writer() {
        // Arrange
        let device = MockSerialDevice::with_write_capacity(1);
        let mut writer = device.clone();
        writer.write_all(b"x").unwrap();

        // Act
        let blocked = std::thread::spawn(move || writer.write(b"y"));
        std::thread::sleep(Duration::from_millis(50));
        device.clone().close().unwrap();

        // Assert
        let err = blocked.join().unwrap().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[test]
    fn test_reopening_an_open_device_is_counted() {
        let opener = MockPortOpener::new();
        let device = MockSerialDevice::new();
        opener.add_device("/dev/ttyS0", device.clone());

        let _first = opener.open_port(Path::new("/dev/ttyS0"), 9600).unwrap();
        let _second = opener.open_port(Path::new("/dev/ttyS0"), 9600).unwrap();

        assert_eq!(device.overlapping_opens(), 1);
        assert_eq!(opener.open_count(), 2);
    }

    #[test]
    fn test_scripted_helper_grants_chmod_target() {
        let probe = Arc::new(MockAccessProbe::new());
        let helper = ScriptedHelper::granting(Arc::clone(&probe));

        let code = helper
            .run_script("chmod 666 '/dev/ttyUSB1'\nexit\n", Duration::from_secs(1))
            .unwrap();

        assert_eq!(code, 0);
        assert!(probe.has_read_write(Path::new("/dev/ttyUSB1")));
        assert_eq!(helper.scripts().len(), 1);
    }
}
