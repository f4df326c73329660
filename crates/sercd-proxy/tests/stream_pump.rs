//! Integration tests for the direct streaming mode.
//!
//! The [`StreamPump`] is exercised against a [`MockSerialDevice`], which
//! behaves like a serial port with a short read timeout.  The tests verify
//! the byte accounting, the loopback writer, and that shutdown terminates
//! loops even when they are blocked inside a device call.

use std::io;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use sercd_proxy::application::device_access::DeviceHandle;
use sercd_proxy::application::stream_pump::{
    LoopExit, StreamPump, LOOPBACK_BYTE, LOOPBACK_PATTERN_LEN, READ_CHUNK_SIZE,
};
use sercd_proxy::infrastructure::device::mock::MockSerialDevice;

fn open(device: &MockSerialDevice) -> DeviceHandle {
    DeviceHandle::new("/dev/ttyS0", 115_200, Box::new(device.clone()))
}

fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

/// Collects every chunk handed to the listener.
fn recorder() -> (Arc<Mutex<Vec<Vec<u8>>>>, impl FnMut(&[u8]) + Send + 'static) {
    let chunks = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&chunks);
    (chunks, move |data: &[u8]| sink.lock().unwrap().push(data.to_vec()))
}

// ── Reader accounting ─────────────────────────────────────────────────────────

#[test]
fn test_delivered_sizes_sum_to_bytes_read() {
    // Arrange
    let device = MockSerialDevice::new();
    let (chunks, listener) = recorder();
    let pump = StreamPump::start(open(&device), listener).unwrap();

    // Act: feed in several bursts of awkward sizes.
    let mut total = 0usize;
    for size in [1usize, 63, 64, 65, 200, 7] {
        device.feed(&vec![0xA5; size]);
        total += size;
        thread::sleep(Duration::from_millis(5));
    }
    assert!(wait_for(|| pump.stats().bytes_read == total as u64));
    let report = pump.shutdown(Duration::from_millis(200));

    // Assert
    let chunks = chunks.lock().unwrap();
    assert!(chunks.iter().all(|c| !c.is_empty() && c.len() <= READ_CHUNK_SIZE));
    assert_eq!(chunks.iter().map(Vec::len).sum::<usize>(), total);
    assert_eq!(report.stats.bytes_read, total as u64);
    assert_eq!(report.stats.chunks_delivered, chunks.len() as u64);
    assert_eq!(report.reader, LoopExit::Interrupted);
}

#[test]
fn test_bytes_arrive_in_order() {
    let device = MockSerialDevice::new();
    let (chunks, listener) = recorder();
    let pump = StreamPump::start(open(&device), listener).unwrap();
    let payload: Vec<u8> = (0..=255u8).cycle().take(1000).collect();

    device.feed(&payload);
    assert!(wait_for(|| pump.stats().bytes_read == payload.len() as u64));
    pump.shutdown(Duration::from_millis(200));

    let received: Vec<u8> = chunks.lock().unwrap().concat();
    assert_eq!(received, payload);
}

#[test]
fn test_idle_device_never_invokes_listener() {
    let device = MockSerialDevice::new();
    let (chunks, listener) = recorder();
    let pump = StreamPump::start(open(&device), listener).unwrap();

    thread::sleep(Duration::from_millis(100));
    let report = pump.shutdown(Duration::from_millis(200));

    assert!(chunks.lock().unwrap().is_empty());
    assert_eq!(report.stats.chunks_delivered, 0);
}

// ── Errors end only the affected loop ─────────────────────────────────────────

#[test]
fn test_read_error_stops_reader_but_not_writer() {
    // Arrange
    let device = MockSerialDevice::new();
    let (_chunks, listener) = recorder();
    let pump = StreamPump::start_loopback(open(&device), listener).unwrap();
    assert!(wait_for(|| pump.stats().bytes_written > 0));

    // Act
    device.fail_reads(io::ErrorKind::BrokenPipe);
    thread::sleep(Duration::from_millis(100));

    // Assert: the writer is still blocked on the full device, not finished.
    assert!(!pump.is_finished());
    let report = pump.shutdown(Duration::from_millis(100));
    assert_eq!(report.reader, LoopExit::Failed(io::ErrorKind::BrokenPipe));
    assert_eq!(report.writer, Some(LoopExit::Interrupted));
}

#[test]
fn test_end_of_stream_ends_reader() {
    let device = MockSerialDevice::new();
    let (_chunks, listener) = recorder();
    let pump = StreamPump::start(open(&device), listener).unwrap();

    device.feed(b"tail");
    device.finish_input();
    assert!(wait_for(|| pump.is_finished()));

    let report = pump.shutdown(Duration::from_millis(100));
    assert_eq!(report.reader, LoopExit::EndOfStream);
    assert_eq!(report.stats.bytes_read, 4);
}

// ── Loopback writer ───────────────────────────────────────────────────────────

#[test]
fn test_loopback_writes_pattern_bytes() {
    // Arrange: room for exactly three patterns before writes block.
    let device = MockSerialDevice::with_write_capacity(3 * LOOPBACK_PATTERN_LEN);
    let (_chunks, listener) = recorder();

    // Act
    let pump = StreamPump::start_loopback(open(&device), listener).unwrap();
    assert!(wait_for(|| device.written().len() == 3 * LOOPBACK_PATTERN_LEN));
    let report = pump.shutdown(Duration::from_millis(100));

    // Assert
    let written = device.written();
    assert!(written.iter().all(|&b| b == LOOPBACK_BYTE));
    assert_eq!(report.stats.bytes_written, (3 * LOOPBACK_PATTERN_LEN) as u64);
}

#[test]
fn test_loopback_counts_both_directions() {
    let device = MockSerialDevice::with_write_capacity(LOOPBACK_PATTERN_LEN);
    let (_chunks, listener) = recorder();
    let pump = StreamPump::start_loopback(open(&device), listener).unwrap();

    // Echo what the writer sent, as a looped-back cable would.
    assert!(wait_for(|| device.written().len() == LOOPBACK_PATTERN_LEN));
    device.feed(&device.written());
    assert!(wait_for(|| pump.stats().bytes_read == LOOPBACK_PATTERN_LEN as u64));

    let report = pump.shutdown(Duration::from_millis(100));
    assert_eq!(report.stats.bytes_written, LOOPBACK_PATTERN_LEN as u64);
    assert_eq!(report.stats.bytes_read, LOOPBACK_PATTERN_LEN as u64);
}

// ── Shutdown ──────────────────────────────────────────────────────────────────

#[test]
fn test_shutdown_unblocks_writer_by_closing_device() {
    // Arrange: a full device blocks the writer forever.
    let device = MockSerialDevice::with_write_capacity(LOOPBACK_PATTERN_LEN);
    let (_chunks, listener) = recorder();
    let pump = StreamPump::start_loopback(open(&device), listener).unwrap();
    assert!(wait_for(|| device.written().len() == LOOPBACK_PATTERN_LEN));

    // Act
    let started = Instant::now();
    let report = pump.shutdown(Duration::from_millis(50));

    // Assert
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(report.writer, Some(LoopExit::Interrupted));
    assert_eq!(report.reader, LoopExit::Interrupted);
    assert!(device.is_closed());
    assert_eq!(device.close_count(), 1);
}

#[test]
fn test_interrupt_stops_loops_at_iteration_boundary() {
    let device = MockSerialDevice::new();
    let (_chunks, listener) = recorder();
    let pump = StreamPump::start(open(&device), listener).unwrap();

    pump.interrupt();

    // The reader wakes from its read timeout and sees the flag.
    assert!(wait_for(|| pump.is_finished()));
    assert!(!device.is_closed());
    let report = pump.shutdown(Duration::from_millis(50));
    assert_eq!(report.reader, LoopExit::Interrupted);
    assert_eq!(device.close_count(), 1);
}
