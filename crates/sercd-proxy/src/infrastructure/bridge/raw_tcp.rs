//! Transparent TCP ↔ serial bridge engine.
//!
//! The engine listens on the session's `interface:port` and serves one client
//! at a time.  For each client it splits the device into reader and writer
//! streams and forwards raw bytes in both directions until the client leaves,
//! an I/O error occurs, or the session is cancelled.  No line-state or
//! control-signal protocol is spoken; bytes pass through unchanged.
//!
//! # Threads
//!
//! ```text
//! session worker ── accept loop (non-blocking, polls cancel)
//!                     └─ per client:
//!                          ├─ scoped thread: device → network
//!                          └─ worker thread: network → device
//!                                            (also drops extra clients)
//! ```
//!
//! Every blocking call has a timeout of one poll interval, so cancellation
//! is observed within roughly that interval.
//!
//! # Progress reports
//!
//! `Listening` after bind, `ClientConnected` on accept, `PortOpened` once the
//! device streams are attached, and `ClientDropped` when the client is gone.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use sercd_core::EngineEvent;
use tracing::{debug, info, warn};

use crate::application::device_access::{DeviceReader, DeviceWriter};
use crate::application::supervisor::{
    BridgeContext, BridgeEngine, CancelSignal, EngineError, EngineExit,
};

/// Accept and read poll interval used when none is configured.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Forwarding buffer size in each direction.
pub const FORWARD_BUFFER_SIZE: usize = 512;

#[derive(Debug, Clone, Copy)]
pub struct RawTcpEngine {
    poll_interval: Duration,
}

impl RawTcpEngine {
    pub fn new(poll_interval: Duration) -> Self {
        Self { poll_interval }
    }
}

impl Default for RawTcpEngine {
    fn default() -> Self {
        Self::new(DEFAULT_POLL_INTERVAL)
    }
}

impl BridgeEngine for RawTcpEngine {
    fn run(&self, ctx: BridgeContext<'_>) -> Result<EngineExit, EngineError> {
        let addr = ctx.config.socket_addr();
        let listener =
            TcpListener::bind(addr).map_err(|source| EngineError::Bind { addr, source })?;
        listener.set_nonblocking(true)?;
        info!("raw TCP bridge listening on {addr}");
        ctx.reporter.report(EngineEvent::Listening);

        loop {
            if ctx.cancel.is_cancelled() {
                info!("raw TCP bridge cancelled");
                return Ok(EngineExit::Cancelled);
            }
            match listener.accept() {
                Ok((stream, peer)) => {
                    self.serve(&ctx, &listener, stream, peer)?;
                    ctx.reporter.report(EngineEvent::ClientDropped);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(self.poll_interval)
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(EngineError::Io(e)),
            }
        }
    }
}

impl RawTcpEngine {
    fn serve(
        &self,
        ctx: &BridgeContext<'_>,
        listener: &TcpListener,
        stream: TcpStream,
        peer: SocketAddr,
    ) -> Result<(), EngineError> {
        info!("client {peer} connected");
        ctx.reporter.report(EngineEvent::ClientConnected);

        stream.set_nonblocking(false)?;
        stream.set_read_timeout(Some(self.poll_interval))?;
        stream.set_nodelay(true)?;
        let net_out = stream.try_clone()?;

        let (mut device_in, mut device_out) = ctx.device.split().map_err(EngineError::Device)?;
        ctx.reporter.report(EngineEvent::PortOpened);

        let done = AtomicBool::new(false);
        let cancel = ctx.cancel;
        let done_ref = &done;

        thread::scope(|scope| -> Result<(), EngineError> {
            let upstream = thread::Builder::new()
                .name("sercd-dev-to-net".to_string())
                .spawn_scoped(scope, move || {
                    device_to_network(&mut device_in, net_out, cancel, done_ref)
                })?;

            self.network_to_device(listener, &stream, &mut device_out, cancel, done_ref);
            done.store(true, Ordering::SeqCst);
            let _ = stream.shutdown(Shutdown::Both);
            let _ = upstream.join();
            Ok(())
        })?;

        info!("client {peer} disconnected");
        Ok(())
    }

    fn network_to_device(
        &self,
        listener: &TcpListener,
        mut stream: &TcpStream,
        device: &mut DeviceWriter,
        cancel: &CancelSignal,
        done: &AtomicBool,
    ) {
        let mut buf = [0u8; FORWARD_BUFFER_SIZE];
        while !done.load(Ordering::SeqCst) && !cancel.is_cancelled() {
            drop_extra_clients(listener);
            match stream.read(&mut buf) {
                Ok(0) => return,
                Ok(n) => {
                    if let Err(e) = device.write_all(&buf[..n]).and_then(|()| device.flush()) {
                        warn!("serial write failed; dropping client: {e}");
                        return;
                    }
                }
                Err(e) if is_transient(&e) => continue,
                Err(e) => {
                    debug!("network read failed: {e}");
                    return;
                }
            }
        }
    }
}

fn device_to_network(
    device: &mut DeviceReader,
    mut stream: TcpStream,
    cancel: &CancelSignal,
    done: &AtomicBool,
) {
    let mut buf = [0u8; FORWARD_BUFFER_SIZE];
    while !done.load(Ordering::SeqCst) && !cancel.is_cancelled() {
        match device.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if let Err(e) = stream.write_all(&buf[..n]) {
                    debug!("network write failed: {e}");
                    break;
                }
            }
            Err(e) if is_transient(&e) => continue,
            Err(e) => {
                warn!("serial read failed; dropping client: {e}");
                break;
            }
        }
    }
    done.store(true, Ordering::SeqCst);
    let _ = stream.shutdown(Shutdown::Both);
}

/// Accepts and immediately closes any client waiting behind the current one.
fn drop_extra_clients(listener: &TcpListener) {
    while let Ok((extra, peer)) = listener.accept() {
        info!("another client connected, dropping new connection from {peer}");
        let _ = extra.shutdown(Shutdown::Both);
    }
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

// ── Tests ─────────────────────────────────────────────────────────────────────
