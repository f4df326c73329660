//! Lifecycle Supervisor: starts, stops, and reconciles proxy sessions.
//!
//! # Session lifecycle
//!
//! ```text
//! start(config)
//!   ├─ live session?            → AlreadyRunning (no second worker)
//!   ├─ reap a crashed session   (join worker, close its device)
//!   ├─ DeviceOpener::open       → errors returned, no transition
//!   ├─ spawn gated worker       → spawn error returned, device released
//!   ├─ transition(Ready)
//!   └─ open the gate            → worker runs BridgeEngine::run
//!
//! stop()
//!   ├─ no session               → NotRunning
//!   ├─ stop_requested = true    (under the state-machine lock)
//!   ├─ cancel signal
//!   ├─ join worker
//!   ├─ transition(Stopped)
//!   └─ close device
//!
//! worker completion
//!   └─ stop_requested ? Stopped : Crashed   (decided under the same lock)
//! ```
//!
//! # Why the gate? (for beginners)
//!
//! The worker thread is created *before* the session enters `Ready` but
//! blocks on a one-shot channel until the supervisor has published `Ready`.
//! This keeps the state sequence strictly `Ready → Connected → ...` even if
//! the engine reports progress immediately, and a failed thread spawn leaves
//! the state machine untouched.
//!
//! # Stop always wins
//!
//! The "stop requested" flag is written inside
//! [`ProxyStateMachine::exclusive`], and the worker reads it inside
//! [`ProxyStateMachine::transition_with`].  Both run under the same mutex, so
//! once `stop()` has recorded the request the worker can only conclude
//! `Stopped`, and engine progress reports are ignored from then on.

use std::any::Any;
use std::io;
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use sercd_core::{EngineEvent, ProxyConfig, ProxyState};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::application::device_access::{DeviceError, DeviceHandle, DeviceOpener};
use crate::application::state_machine::ProxyStateMachine;

// ── Bridge engine port ────────────────────────────────────────────────────────

/// Cooperative cancellation flag handed to the bridge engine.
#[derive(Debug, Clone, Default)]
pub struct CancelSignal(Arc<AtomicBool>);

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Channel through which an engine reports its progress.
pub trait StateReporter: Send + Sync {
    fn report(&self, event: EngineEvent);
}

/// Everything an engine needs for one run.
pub struct BridgeContext<'a> {
    pub config: &'a ProxyConfig,
    pub device: &'a DeviceHandle,
    pub cancel: &'a CancelSignal,
    pub reporter: &'a dyn StateReporter,
}

/// How an engine run ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineExit {
    /// The engine observed the cancel signal.
    Cancelled,
    /// The engine ended on its own.
    Finished,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("network I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("serial device error: {0}")]
    Device(#[source] io::Error),

    #[error("bridge engine panicked: {0}")]
    Panicked(String),
}

/// A blocking serial ↔ network forwarding operation.
///
/// `run` blocks until the engine ends on its own, fails, or observes
/// `ctx.cancel`.  Implementations should check the signal at least every few
/// hundred milliseconds.
pub trait BridgeEngine: Send + Sync {
    fn run(&self, ctx: BridgeContext<'_>) -> Result<EngineExit, EngineError>;
}

// ── Supervisor ────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error("failed to spawn session worker: {0}")]
    WorkerSpawnFailed(#[source] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started(Uuid),
    AlreadyRunning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped,
    NotRunning,
}

struct Session {
    id: Uuid,
    config: ProxyConfig,
    cancel: CancelSignal,
    stop_requested: Arc<AtomicBool>,
    worker: JoinHandle<DeviceHandle>,
}

/// Owns at most one proxy session at a time.
pub struct Supervisor {
    opener: Arc<dyn DeviceOpener>,
    engine: Arc<dyn BridgeEngine>,
    machine: Arc<ProxyStateMachine>,
    session: Mutex<Option<Session>>,
}

impl Supervisor {
    pub fn new(
        opener: Arc<dyn DeviceOpener>,
        engine: Arc<dyn BridgeEngine>,
        machine: Arc<ProxyStateMachine>,
    ) -> Self {
        Self {
            opener,
            engine,
            machine,
            session: Mutex::new(None),
        }
    }

    /// Starts a session for `config` unless one is already live.
    ///
    /// # Errors
    ///
    /// - [`SupervisorError::Device`] if the device cannot be opened.
    /// - [`SupervisorError::WorkerSpawnFailed`] if the worker thread cannot
    ///   be created; the device is closed before returning.
    ///
    /// In both cases no session exists afterwards and the state is unchanged.
    pub fn start(&self, config: ProxyConfig) -> Result<StartOutcome, SupervisorError> {
        let mut slot = self.lock_session();

        if let Some(session) = slot.as_ref() {
            if self.is_live(session) {
                debug!(session = %session.id, "start ignored; session already running");
                return Ok(StartOutcome::AlreadyRunning);
            }
        }
        if let Some(stale) = slot.take() {
            info!(session = %stale.id, "reaping crashed session");
            close_device(stale.id, join_worker(stale.id, stale.worker));
        }

        let device = self.opener.open(config.device_path(), config.baud_rate())?;

        let id = Uuid::new_v4();
        let cancel = CancelSignal::new();
        let stop_requested = Arc::new(AtomicBool::new(false));
        let (gate_tx, gate_rx) = mpsc::channel();
        let worker = Worker {
            id,
            engine: Arc::clone(&self.engine),
            machine: Arc::clone(&self.machine),
            config: config.clone(),
            cancel: cancel.clone(),
            stop_requested: Arc::clone(&stop_requested),
        };

        let handle = thread::Builder::new()
            .name(format!("sercd-session-{}", &id.simple().to_string()[..8]))
            .spawn(move || worker.run(device, gate_rx))
            .map_err(|e| {
                error!("failed to spawn session worker: {e}");
                SupervisorError::WorkerSpawnFailed(e)
            })?;

        self.machine.transition(ProxyState::Ready);
        let _ = gate_tx.send(());

        info!(
            session = %id,
            device = %config.device_path().display(),
            listen = %config.socket_addr(),
            "proxy session started"
        );
        *slot = Some(Session {
            id,
            config,
            cancel,
            stop_requested,
            worker: handle,
        });
        Ok(StartOutcome::Started(id))
    }

    /// Stops the current session and blocks until its worker has exited.
    ///
    /// Always leaves the machine in `Stopped` when a session existed.
    pub fn stop(&self) -> StopOutcome {
        let mut slot = self.lock_session();
        let Some(session) = slot.take() else {
            debug!("stop ignored; no session");
            return StopOutcome::NotRunning;
        };

        info!(session = %session.id, "stopping proxy session");
        self.machine
            .exclusive(|_| session.stop_requested.store(true, Ordering::SeqCst));
        session.cancel.cancel();

        let device = join_worker(session.id, session.worker);
        self.machine.transition(ProxyState::Stopped);
        close_device(session.id, device);

        info!(session = %session.id, "proxy session stopped");
        StopOutcome::Stopped
    }

    pub fn state(&self) -> ProxyState {
        self.machine.current()
    }

    /// `true` while a session exists whose worker has not finished.
    pub fn is_running(&self) -> bool {
        self.lock_session()
            .as_ref()
            .is_some_and(|session| self.is_live(session))
    }

    pub fn session_id(&self) -> Option<Uuid> {
        self.lock_session().as_ref().map(|session| session.id)
    }

    /// The configuration of the current session, if any.
    pub fn session_config(&self) -> Option<ProxyConfig> {
        self.lock_session()
            .as_ref()
            .map(|session| session.config.clone())
    }

    pub fn state_machine(&self) -> &Arc<ProxyStateMachine> {
        &self.machine
    }

    // A worker that has published Crashed is past its last transition, so it
    // counts as finished even if the thread is still unwinding its stack.
    fn is_live(&self, session: &Session) -> bool {
        !session.worker.is_finished() && self.machine.current() != ProxyState::Crashed
    }

    fn lock_session(&self) -> MutexGuard<'_, Option<Session>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn join_worker(id: Uuid, worker: JoinHandle<DeviceHandle>) -> Option<DeviceHandle> {
    match worker.join() {
        Ok(device) => Some(device),
        Err(_) => {
            error!(session = %id, "session worker panicked outside the bridge engine");
            None
        }
    }
}

fn close_device(id: Uuid, device: Option<DeviceHandle>) {
    if let Some(device) = device {
        if let Err(e) = device.close() {
            warn!(session = %id, "error closing serial device: {e}");
        }
    }
}

// ── Worker ────────────────────────────────────────────────────────────────────

struct Worker {
    id: Uuid,
    engine: Arc<dyn BridgeEngine>,
    machine: Arc<ProxyStateMachine>,
    config: ProxyConfig,
    cancel: CancelSignal,
    stop_requested: Arc<AtomicBool>,
}

impl Worker {
    fn run(self, device: DeviceHandle, gate: mpsc::Receiver<()>) -> DeviceHandle {
        if gate.recv().is_err() {
            return device;
        }

        let reporter = SessionReporter {
            machine: &self.machine,
            stop_requested: &self.stop_requested,
        };
        let ctx = BridgeContext {
            config: &self.config,
            device: &device,
            cancel: &self.cancel,
            reporter: &reporter,
        };

        debug!(session = %self.id, "bridge engine starting");
        let result = panic::catch_unwind(AssertUnwindSafe(|| self.engine.run(ctx)))
            .unwrap_or_else(|payload| Err(EngineError::Panicked(panic_message(&*payload))));

        match &result {
            Ok(exit) => info!(session = %self.id, ?exit, "bridge engine returned"),
            Err(e) => error!(session = %self.id, "bridge engine failed: {e}"),
        }

        let stop_requested = &self.stop_requested;
        self.machine.transition_with(|_| {
            if stop_requested.load(Ordering::SeqCst) {
                Some(ProxyState::Stopped)
            } else {
                Some(ProxyState::Crashed)
            }
        });
        device
    }
}

/// Applies engine progress unless a stop has been requested.
struct SessionReporter<'a> {
    machine: &'a ProxyStateMachine,
    stop_requested: &'a AtomicBool,
}

impl StateReporter for SessionReporter<'_> {
    fn report(&self, event: EngineEvent) {
        self.machine.transition_with(|_| {
            if self.stop_requested.load(Ordering::SeqCst) {
                None
            } else {
                Some(event.target_state())
            }
        });
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::state_machine::NotificationSink;
    use crate::infrastructure::bridge::mock::{EngineBehaviour, ScriptedEngine};
    use crate::application::device_access::DeviceAccess;
    use crate::infrastructure::device::mock::{MockAccessProbe, MockPortOpener, MockSerialDevice};
    use crate::infrastructure::notification::mock::RecordingNotificationSink;
    use std::time::{Duration, Instant};

    fn config() -> ProxyConfig {
        ProxyConfig::new("/dev/ttyS0", "127.0.0.1", 30001).unwrap()
    }

    fn supervisor(engine: ScriptedEngine) -> (Supervisor, MockSerialDevice, Arc<ScriptedEngine>) {
        let device = MockSerialDevice::new();
        let probe = Arc::new(MockAccessProbe::new());
        probe.grant("/dev/ttyS0");
        let ports = Arc::new(MockPortOpener::new());
        ports.add_device("/dev/ttyS0", device.clone());
        let opener = Arc::new(DeviceAccess::new(probe, ports));
        let engine = Arc::new(engine);
        let sink = Arc::new(RecordingNotificationSink::new());
        let machine = Arc::new(ProxyStateMachine::new(sink as Arc<dyn NotificationSink>));
        let supervisor = Supervisor::new(opener, Arc::clone(&engine) as Arc<dyn BridgeEngine>, machine);
        (supervisor, device, engine)
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

    #[test]
    fn test_cancel_signal_clones_share_state() {
        let signal = CancelSignal::new();
        let clone = signal.clone();
        signal.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn test_start_returns_session_id_and_enters_ready() {
        let (supervisor, _device, _engine) =
            supervisor(ScriptedEngine::new(EngineBehaviour::WaitForCancel));

        let outcome = supervisor.start(config()).unwrap();

        assert_eq!(outcome, StartOutcome::Started(supervisor.session_id().unwrap()));
        assert_eq!(supervisor.state(), ProxyState::Ready);
        assert!(supervisor.is_running());
        assert_eq!(supervisor.session_config(), Some(config()));
    }

    #[test]
    fn test_stop_without_session_is_noop() {
        let (supervisor, _device, _engine) =
            supervisor(ScriptedEngine::new(EngineBehaviour::WaitForCancel));
        assert_eq!(supervisor.stop(), StopOutcome::NotRunning);
        assert_eq!(supervisor.state(), ProxyState::Stopped);
    }

    #[test]
    fn test_engine_panic_is_reported_as_crash() {
        // Arrange
        let (supervisor, device, _engine) =
            supervisor(ScriptedEngine::new(EngineBehaviour::Panic));

        // Act
        supervisor.start(config()).unwrap();

        // Assert
        assert!(wait_for(|| supervisor.state() == ProxyState::Crashed));
        assert!(wait_for(|| !supervisor.is_running()));
        assert_eq!(supervisor.stop(), StopOutcome::Stopped);
        assert_eq!(supervisor.state(), ProxyState::Stopped);
        assert_eq!(device.close_count(), 1);
    }

    #[test]
    fn test_dropping_supervisor_stops_session() {
        let (supervisor, device, engine) =
            supervisor(ScriptedEngine::new(EngineBehaviour::WaitForCancel));
        supervisor.start(config()).unwrap();
        assert!(wait_for(|| engine.run_count() == 1));

        drop(supervisor);

        assert_eq!(device.close_count(), 1);
        assert_eq!(engine.cancelled_count(), 1);
    }

    #[test]
    fn test_panic_message_extracts_strings() {
        let boxed: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(&*boxed), "boom");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(&*boxed), "bang");
        let boxed: Box<dyn Any + Send> = Box::new(42_u8);
        assert_eq!(panic_message(&*boxed), "unknown panic payload");
    }
}
