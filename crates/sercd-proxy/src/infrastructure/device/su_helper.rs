//! Privileged helper backed by a `su`-style binary.
//!
//! The helper is started with no arguments and receives the script on its
//! standard input, exactly as an interactive root shell would.  Closing stdin
//! after the script lets the shell reach `exit` even if a line is missing.
//!
//! The process is polled until it exits or the timeout elapses; on timeout it
//! is killed and reaped so no zombie is left behind.

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::application::device_access::{HelperError, PrivilegeHelper};

/// Location of `su` on the devices this proxy usually runs on.
pub const DEFAULT_SU_PROGRAM: &str = "/system/bin/su";

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct SuHelper {
    program: PathBuf,
}

impl SuHelper {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Returns a helper only if `program` exists on this system.
    pub fn detect(program: impl Into<PathBuf>) -> Option<Self> {
        let program = program.into();
        if program.exists() {
            Some(Self::new(program))
        } else {
            debug!("privileged helper {} not present", program.display());
            None
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }
}

impl Default for SuHelper {
    fn default() -> Self {
        Self::new(DEFAULT_SU_PROGRAM)
    }
}

impl PrivilegeHelper for SuHelper {
    fn run_script(&self, script: &str, timeout: Duration) -> Result<i32, HelperError> {
        debug!(helper = %self.program.display(), "running privileged script");
        let mut child = Command::new(&self.program)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| match source.kind() {
                io::ErrorKind::NotFound => HelperError::NotFound {
                    program: self.program.clone(),
                },
                _ => HelperError::Spawn {
                    program: self.program.clone(),
                    source,
                },
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            if let Err(e) = stdin.write_all(script.as_bytes()) {
                let _ = child.kill();
                let _ = child.wait();
                return Err(HelperError::Stdin(e));
            }
        }

        let deadline = Instant::now() + timeout;
        loop {
            match child.try_wait().map_err(HelperError::Wait)? {
                Some(status) => return status.code().ok_or(HelperError::Killed),
                None if Instant::now() >= deadline => {
                    warn!(helper = %self.program.display(), "privileged helper timed out; killing it");
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(HelperError::TimedOut(timeout));
                }
                None => thread::sleep(WAIT_POLL_INTERVAL),
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
