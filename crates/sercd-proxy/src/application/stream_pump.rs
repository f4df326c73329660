//! Stream Pump: direct streaming between a serial device and a callback.
//!
//! A pump owns a [`DeviceHandle`] and runs up to two independent loops on
//! dedicated threads:
//!
//! - the **reader** reads chunks of at most [`READ_CHUNK_SIZE`] bytes and
//!   hands every non-empty chunk to a [`DataListener`];
//! - the **writer** (loopback mode only) writes a [`LOOPBACK_PATTERN_LEN`]
//!   byte buffer of [`LOOPBACK_BYTE`] over and over, counting every byte the
//!   device accepts, including those of partial writes.
//!
//! The loops share an interruption flag they check before every call.  A loop
//! blocked inside a read or write only notices the flag once that call
//! returns, so [`StreamPump::shutdown`] waits a grace period, then closes the
//! device to make blocked calls fail, and finally joins both threads.
//!
//! End-of-stream and I/O errors end only the loop that hit them; they are
//! logged and never retried.

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::application::device_access::{DeviceHandle, DeviceReader, DeviceWriter};

/// Maximum bytes per read.
pub const READ_CHUNK_SIZE: usize = 64;
/// Size of the buffer the loopback writer sends per iteration.
pub const LOOPBACK_PATTERN_LEN: usize = 1024;
/// Fill byte of the loopback pattern (`0b0101_0101`).
pub const LOOPBACK_BYTE: u8 = 0x55;
/// Grace period used when a pump is dropped without an explicit shutdown.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

const JOIN_POLL_INTERVAL: Duration = Duration::from_millis(5);

#[derive(Debug, Error)]
pub enum PumpError {
    #[error("failed to split device streams: {0}")]
    Device(#[source] io::Error),

    #[error("failed to spawn pump thread: {0}")]
    Spawn(#[source] io::Error),
}

/// Consumer of the bytes the reader loop receives.
pub trait DataListener: Send + 'static {
    /// Called with every non-empty chunk, in arrival order.
    fn on_data_received(&mut self, data: &[u8]);
}

impl<F> DataListener for F
where
    F: FnMut(&[u8]) + Send + 'static,
{
    fn on_data_received(&mut self, data: &[u8]) {
        self(data)
    }
}

/// Why a loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// The interruption flag was observed.
    Interrupted,
    /// The device reported end of stream.
    EndOfStream,
    /// An I/O error ended the loop.
    Failed(io::ErrorKind),
    /// The loop thread panicked (for example inside the listener).
    Panicked,
}

/// Snapshot of the pump counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PumpStats {
    pub bytes_read: u64,
    pub bytes_written: u64,
    /// Number of listener invocations.
    pub chunks_delivered: u64,
}

/// Final state of a pump after [`StreamPump::shutdown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PumpReport {
    pub stats: PumpStats,
    pub reader: LoopExit,
    /// `None` when the pump ran without a writer.
    pub writer: Option<LoopExit>,
}

#[derive(Default)]
struct PumpCounters {
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    chunks_delivered: AtomicU64,
}

impl PumpCounters {
    fn snapshot(&self) -> PumpStats {
        PumpStats {
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            chunks_delivered: self.chunks_delivered.load(Ordering::Relaxed),
        }
    }
}

pub struct StreamPump {
    device: Option<DeviceHandle>,
    interrupted: Arc<AtomicBool>,
    counters: Arc<PumpCounters>,
    reader: Option<JoinHandle<LoopExit>>,
    writer: Option<JoinHandle<LoopExit>>,
}

impl StreamPump {
    /// Starts a reader loop delivering device bytes to `listener`.
    ///
    /// # Errors
    ///
    /// Returns [`PumpError`] if the device cannot be split or the thread
    /// cannot be spawned; the device is closed in both cases.
    pub fn start<L: DataListener>(device: DeviceHandle, listener: L) -> Result<Self, PumpError> {
        let (reader, _) = device.split().map_err(PumpError::Device)?;
        let mut pump = Self::idle(device);
        pump.spawn_reader(reader, Box::new(listener))?;
        info!("stream pump started");
        Ok(pump)
    }

    /// Starts a reader loop plus a writer loop that sends the loopback
    /// pattern, for self-tests with a looped-back cable.
    pub fn start_loopback<L: DataListener>(
        device: DeviceHandle,
        listener: L,
    ) -> Result<Self, PumpError> {
        let (reader, writer) = device.split().map_err(PumpError::Device)?;
        let mut pump = Self::idle(device);
        pump.spawn_reader(reader, Box::new(listener))?;
        pump.spawn_writer(writer)?;
        info!("stream pump started in loopback mode");
        Ok(pump)
    }

    fn idle(device: DeviceHandle) -> Self {
        Self {
            device: Some(device),
            interrupted: Arc::new(AtomicBool::new(false)),
            counters: Arc::new(PumpCounters::default()),
            reader: None,
            writer: None,
        }
    }

    fn spawn_reader(
        &mut self,
        reader: DeviceReader,
        listener: Box<dyn DataListener>,
    ) -> Result<(), PumpError> {
        let interrupted = Arc::clone(&self.interrupted);
        let counters = Arc::clone(&self.counters);
        let handle = thread::Builder::new()
            .name("sercd-pump-reader".to_string())
            .spawn(move || read_loop(reader, listener, &interrupted, &counters))
            .map_err(PumpError::Spawn)?;
        self.reader = Some(handle);
        Ok(())
    }

    fn spawn_writer(&mut self, writer: DeviceWriter) -> Result<(), PumpError> {
        let interrupted = Arc::clone(&self.interrupted);
        let counters = Arc::clone(&self.counters);
        let handle = thread::Builder::new()
            .name("sercd-pump-writer".to_string())
            .spawn(move || write_loop(writer, &interrupted, &counters))
            .map_err(PumpError::Spawn)?;
        self.writer = Some(handle);
        Ok(())
    }

    pub fn stats(&self) -> PumpStats {
        self.counters.snapshot()
    }

    /// Asks both loops to stop at their next iteration boundary.
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
    }

    /// `true` once every started loop has exited.
    pub fn is_finished(&self) -> bool {
        [&self.reader, &self.writer]
            .into_iter()
            .flatten()
            .all(JoinHandle::is_finished)
    }

    /// Interrupts the loops, closes the device, and waits for both to exit.
    ///
    /// The device is closed after `grace` at the latest, so this returns even
    /// if a loop is blocked in a call that never times out on its own.
    pub fn shutdown(mut self, grace: Duration) -> PumpReport {
        self.shutdown_inner(grace)
    }

    fn shutdown_inner(&mut self, grace: Duration) -> PumpReport {
        self.interrupt();

        let deadline = Instant::now() + grace;
        while !self.is_finished() && Instant::now() < deadline {
            thread::sleep(JOIN_POLL_INTERVAL);
        }

        if let Some(device) = self.device.take() {
            if let Err(e) = device.close() {
                warn!("error closing pump device: {e}");
            }
        }

        let reader = join_loop(self.reader.take()).unwrap_or(LoopExit::Interrupted);
        let writer = join_loop(self.writer.take());
        let report = PumpReport {
            stats: self.stats(),
            reader,
            writer,
        };
        info!(
            bytes_read = report.stats.bytes_read,
            bytes_written = report.stats.bytes_written,
            "stream pump stopped"
        );
        report
    }
}

impl Drop for StreamPump {
    fn drop(&mut self) {
        if self.device.is_some() || self.reader.is_some() || self.writer.is_some() {
            self.shutdown_inner(DEFAULT_SHUTDOWN_GRACE);
        }
    }
}

fn join_loop(handle: Option<JoinHandle<LoopExit>>) -> Option<LoopExit> {
    handle.map(|h| h.join().unwrap_or(LoopExit::Panicked))
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

fn read_loop(
    mut reader: DeviceReader,
    mut listener: Box<dyn DataListener>,
    interrupted: &AtomicBool,
    counters: &PumpCounters,
) -> LoopExit {
    let mut buf = [0u8; READ_CHUNK_SIZE];
    loop {
        if interrupted.load(Ordering::SeqCst) {
            debug!("pump reader interrupted");
            return LoopExit::Interrupted;
        }
        match reader.read(&mut buf) {
            Ok(0) => {
                info!("pump reader reached end of stream");
                return LoopExit::EndOfStream;
            }
            Ok(n) => {
                counters.bytes_read.fetch_add(n as u64, Ordering::Relaxed);
                counters.chunks_delivered.fetch_add(1, Ordering::Relaxed);
                listener.on_data_received(&buf[..n]);
            }
            Err(e) if is_transient(&e) => continue,
            Err(_) if interrupted.load(Ordering::SeqCst) => return LoopExit::Interrupted,
            Err(e) => {
                warn!("pump reader stopped on I/O error: {e}");
                return LoopExit::Failed(e.kind());
            }
        }
    }
}

fn write_loop(mut writer: DeviceWriter, interrupted: &AtomicBool, counters: &PumpCounters) -> LoopExit {
    let pattern = [LOOPBACK_BYTE; LOOPBACK_PATTERN_LEN];
    // Position inside the pattern; a partial write resumes where it stopped.
    let mut offset = 0;
    loop {
        if interrupted.load(Ordering::SeqCst) {
            debug!("pump writer interrupted");
            return LoopExit::Interrupted;
        }
        match writer.write(&pattern[offset..]) {
            Ok(0) => {
                warn!("pump writer stopped; device accepted no bytes");
                return LoopExit::Failed(io::ErrorKind::WriteZero);
            }
            Ok(n) => {
                counters.bytes_written.fetch_add(n as u64, Ordering::Relaxed);
                offset = (offset + n) % LOOPBACK_PATTERN_LEN;
            }
            Err(e) if is_transient(&e) => continue,
            Err(_) if interrupted.load(Ordering::SeqCst) => return LoopExit::Interrupted,
            Err(e) => {
                warn!("pump writer stopped on I/O error: {e}");
                return LoopExit::Failed(e.kind());
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::device::mock::MockSerialDevice;
    use std::sync::Mutex;

    fn handle(device: &MockSerialDevice) -> DeviceHandle {
        DeviceHandle::new("/dev/ttyS0", 9600, Box::new(device.clone()))
    }

    #[test]
    fn test_closure_is_a_data_listener() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let mut listener = move |data: &[u8]| sink.lock().unwrap().extend_from_slice(data);

        listener.on_data_received(b"abc");

        assert_eq!(*seen.lock().unwrap(), b"abc".to_vec());
    }

    #[test]
    fn test_reader_ends_on_end_of_stream() {
        // Arrange
        let device = MockSerialDevice::new();
        device.feed(b"hello");
        device.finish_input();

        // Act
        let pump = StreamPump::start(handle(&device), |_: &[u8]| {}).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while !pump.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        let report = pump.shutdown(Duration::from_millis(100));

        // Assert
        assert_eq!(report.reader, LoopExit::EndOfStream);
        assert_eq!(report.writer, None);
        assert_eq!(report.stats.bytes_read, 5);
    }

    #[test]
    fn test_chunks_never_exceed_read_chunk_size() {
        let device = MockSerialDevice::new();
        device.feed(&[7u8; 200]);
        device.finish_input();
        let sizes = Arc::new(Mutex::new(Vec::new()));
        let record = Arc::clone(&sizes);

        let pump = StreamPump::start(handle(&device), move |data: &[u8]| {
            record.lock().unwrap().push(data.len());
        })
        .unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while !pump.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        pump.shutdown(Duration::from_millis(100));

        let sizes = sizes.lock().unwrap();
        assert!(sizes.iter().all(|&n| n > 0 && n <= READ_CHUNK_SIZE));
        assert_eq!(sizes.iter().sum::<usize>(), 200);
    }

    #[test]
    fn test_partial_writes_are_counted_and_resumed() {
        // Arrange: every write takes at most 100 bytes and the next one
        // times out, like a slow line.
        let device = MockSerialDevice::with_write_capacity(2 * LOOPBACK_PATTERN_LEN);
        device.throttle_writes(100);

        // Act
        let pump = StreamPump::start_loopback(handle(&device), |_: &[u8]| {}).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while pump.stats().bytes_written < (2 * LOOPBACK_PATTERN_LEN) as u64
            && Instant::now() < deadline
        {
            thread::sleep(Duration::from_millis(5));
        }
        let report = pump.shutdown(Duration::from_millis(100));

        // Assert
        assert_eq!(device.written().len(), 2 * LOOPBACK_PATTERN_LEN);
        assert_eq!(report.stats.bytes_written, device.written().len() as u64);
        assert_eq!(report.writer, Some(LoopExit::Interrupted));
    }

    #[test]
    fn test_dropping_pump_closes_device_once() {
        let device = MockSerialDevice::new();
        let pump = StreamPump::start(handle(&device), |_: &[u8]| {}).unwrap();

        drop(pump);

        assert_eq!(device.close_count(), 1);
    }

    #[test]
    fn test_listener_panic_is_reported() {
        let device = MockSerialDevice::new();
        device.feed(b"x");
        let pump = StreamPump::start(handle(&device), |_: &[u8]| {
            panic!("listener failed");
        })
        .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while !pump.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        let report = pump.shutdown(Duration::from_millis(100));

        assert_eq!(report.reader, LoopExit::Panicked);
    }
}
