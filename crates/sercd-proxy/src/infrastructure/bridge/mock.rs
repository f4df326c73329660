//! Scripted bridge engine for supervisor tests.
//!
//! A [`ScriptedEngine`] reports a fixed list of [`EngineEvent`]s as soon as it
//! starts and then does whatever its [`EngineBehaviour`] says.  It counts
//! runs and observed cancellations so tests can assert on single-flight and
//! cancellation behaviour.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use sercd_core::EngineEvent;

use crate::application::supervisor::{BridgeContext, BridgeEngine, EngineError, EngineExit};

const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// What the engine does after reporting its events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineBehaviour {
    /// Block until cancelled, then return `Cancelled`.
    WaitForCancel,
    /// Return `Finished` straight away, as if the engine ended on its own.
    ExitImmediately,
    /// Run for the given time, then return `Finished` unless cancelled first.
    ExitAfter(Duration),
    /// Return an I/O error straight away.
    Fail,
    /// Panic straight away.
    Panic,
    /// Wait for the cancel signal, ignore it for the given time, then return
    /// `Finished` as if the engine had ended on its own.
    IgnoreCancelFor(Duration),
}

pub struct ScriptedEngine {
    events: Vec<EngineEvent>,
    behaviour: EngineBehaviour,
    runs: AtomicUsize,
    cancellations: AtomicUsize,
}

impl ScriptedEngine {
    /// An engine that reports no events.
    pub fn new(behaviour: EngineBehaviour) -> Self {
        Self::with_events(Vec::new(), behaviour)
    }

    pub fn with_events(events: Vec<EngineEvent>, behaviour: EngineBehaviour) -> Self {
        Self {
            events,
            behaviour,
            runs: AtomicUsize::new(0),
            cancellations: AtomicUsize::new(0),
        }
    }

    /// The usual progress of a client attaching to the proxy.
    pub fn happy_path(behaviour: EngineBehaviour) -> Self {
        Self::with_events(
            vec![
                EngineEvent::Listening,
                EngineEvent::ClientConnected,
                EngineEvent::PortOpened,
            ],
            behaviour,
        )
    }

    /// Number of times `run` has been entered.
    pub fn run_count(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    /// Number of runs that observed the cancel signal.
    pub fn cancelled_count(&self) -> usize {
        self.cancellations.load(Ordering::SeqCst)
    }

    fn wait_for_cancel(&self, ctx: &BridgeContext<'_>) {
        while !ctx.cancel.is_cancelled() {
            thread::sleep(CANCEL_POLL_INTERVAL);
        }
        self.cancellations.fetch_add(1, Ordering::SeqCst);
    }
}

impl BridgeEngine for ScriptedEngine {
    fn run(&self, ctx: BridgeContext<'_>) -> Result<EngineExit, EngineError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        for event in &self.events {
            ctx.reporter.report(*event);
        }

        match self.behaviour {
            EngineBehaviour::WaitForCancel => {
                self.wait_for_cancel(&ctx);
                Ok(EngineExit::Cancelled)
            }
            EngineBehaviour::ExitImmediately => Ok(EngineExit::Finished),
            EngineBehaviour::ExitAfter(delay) => {
                let step = CANCEL_POLL_INTERVAL;
                let mut waited = Duration::ZERO;
                while waited < delay {
                    if ctx.cancel.is_cancelled() {
                        self.cancellations.fetch_add(1, Ordering::SeqCst);
                        return Ok(EngineExit::Cancelled);
                    }
                    thread::sleep(step);
                    waited += step;
                }
                Ok(EngineExit::Finished)
            }
            EngineBehaviour::Fail => Err(EngineError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionAborted,
                "scripted engine failure",
            ))),
            EngineBehaviour::Panic => panic!("scripted engine panic"),
            EngineBehaviour::IgnoreCancelFor(delay) => {
                self.wait_for_cancel(&ctx);
                thread::sleep(delay);
                Ok(EngineExit::Finished)
            }
        }
    }
}
