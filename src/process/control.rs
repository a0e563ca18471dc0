//! OS process control
//!
//! The lifecycle manager never calls fork/exec, kill or waitpid directly; it
//! goes through `ProcessControl` so the state machine can be driven by a
//! scripted implementation in tests.

use nix::errno::Errno;
use nix::sys::signal::{self, SigHandler, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::process::table::ExitStatus;

/// Process control errors
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to spawn {path:?}: {source}")]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to send {signal} to pid {pid}: {source}")]
    Signal {
        pid: Pid,
        signal: Signal,
        #[source]
        source: Errno,
    },

    #[error("waitpid failed: {0}")]
    Wait(#[source] Errno),

    #[error("pid {pid} was not reaped within {timeout:?}")]
    StopTimeout { pid: Pid, timeout: Duration },

    #[error("failed to restore default SIGCHLD disposition: {0}")]
    Disposition(#[source] Errno),
}

/// A reaped child
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildExit {
    pub pid: Pid,
    pub status: ExitStatus,
}

/// Operations the lifecycle manager needs from the OS
pub trait ProcessControl {
    /// Launch the executable at `path`, returning its pid
    fn spawn(&mut self, path: &Path) -> Result<Pid, ProcessError>;

    /// Deliver `signal` to `pid`
    fn send_signal(&mut self, pid: Pid, signal: Signal) -> Result<(), ProcessError>;

    /// Reap one exited child without blocking; `None` when nothing is exitable
    fn try_reap_any(&mut self) -> Result<Option<ChildExit>, ProcessError>;

    /// Reap `pid` without blocking; `None` while it is still alive
    fn try_reap(&mut self, pid: Pid) -> Result<Option<ChildExit>, ProcessError>;

    /// Put SIGCHLD back to its default disposition
    fn restore_default_child_handler(&mut self) -> Result<(), ProcessError>;
}

/// `ProcessControl` backed by std::process and nix
#[derive(Debug, Default)]
pub struct OsProcessControl;

impl OsProcessControl {
    pub fn new() -> Self {
        Self
    }

    fn wait(target: Option<Pid>) -> Result<Option<ChildExit>, ProcessError> {
        loop {
            match waitpid(target, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => return Ok(None),
                Ok(status) => {
                    if let Some(exit) = child_exit(status) {
                        return Ok(Some(exit));
                    }
                    // Stop/continue notifications are not exits
                    debug!("Ignoring non-exit wait status: {:?}", status);
                }
                Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) => return Ok(None),
                Err(e) => return Err(ProcessError::Wait(e)),
            }
        }
    }
}

impl ProcessControl for OsProcessControl {
    fn spawn(&mut self, path: &Path) -> Result<Pid, ProcessError> {
        // The Child handle is dropped on purpose: exits are collected by
        // waitpid through the SIGCHLD path, not through std.
        let child = Command::new(path)
            .stdin(Stdio::null())
            .spawn()
            .map_err(|source| ProcessError::Spawn {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(Pid::from_raw(child.id() as i32))
    }

    fn send_signal(&mut self, pid: Pid, sig: Signal) -> Result<(), ProcessError> {
        signal::kill(pid, sig).map_err(|source| ProcessError::Signal {
            pid,
            signal: sig,
            source,
        })
    }

    fn try_reap_any(&mut self) -> Result<Option<ChildExit>, ProcessError> {
        Self::wait(None)
    }

    fn try_reap(&mut self, pid: Pid) -> Result<Option<ChildExit>, ProcessError> {
        Self::wait(Some(pid))
    }

    fn restore_default_child_handler(&mut self) -> Result<(), ProcessError> {
        // SAFETY: SIG_DFL installs no Rust code as a handler; the previous
        // handler is only replaced, never invoked from here.
        unsafe { signal::signal(Signal::SIGCHLD, SigHandler::SigDfl) }
            .map(drop)
            .map_err(ProcessError::Disposition)
    }
}

/// Convert a wait status into an exit record, if it is an exit
pub fn child_exit(status: WaitStatus) -> Option<ChildExit> {
    match status {
        WaitStatus::Exited(pid, code) => Some(ChildExit {
            pid,
            status: ExitStatus::Exited { code },
        }),
        WaitStatus::Signaled(pid, sig, core_dumped) => Some(ChildExit {
            pid,
            status: ExitStatus::Signaled {
                signal: sig as i32,
                core_dumped,
            },
        }),
        _ => None,
    }
}
