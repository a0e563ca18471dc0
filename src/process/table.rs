//! Process table
//!
//! One `ManagedProcess` per `ProcessSlot`. The table is the single source of
//! truth for "should this exist" (`active`) versus "does this exist"
//! (`running`).

use nix::unistd::Pid;
use serde::Serialize;
use std::ops::{Index, IndexMut};
use std::path::PathBuf;
use std::time::Instant;

use crate::process::slot::{validate_entry, ProcessSlot};

/// Lifecycle state of a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    /// Not running, no launch in progress
    Stopped,
    /// Launch handed to the process-creation collaborator
    Starting,
    /// Launched and believed alive
    Running,
    /// Reaped after exiting on its own
    Exited,
    /// Reaped after the supervisor signalled it
    Killed,
}

/// How a reaped child terminated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ExitStatus {
    /// Normal exit with a status code
    Exited { code: i32 },
    /// Terminated by a signal
    Signaled { signal: i32, core_dumped: bool },
}

impl ExitStatus {
    /// Exit code, or -1 when the process did not exit normally
    pub fn code(&self) -> i32 {
        match self {
            ExitStatus::Exited { code } => *code,
            ExitStatus::Signaled { .. } => -1,
        }
    }

    pub fn success(&self) -> bool {
        matches!(self, ExitStatus::Exited { code: 0 })
    }
}

/// Record for one managed process
#[derive(Debug, Clone)]
pub struct ManagedProcess {
    /// Short identifier
    pub name: String,
    /// Executable path
    pub path: PathBuf,
    /// Supervisor intent: this process should be running and monitored
    pub active: bool,
    /// Supervisor belief: the OS process is alive
    pub running: bool,
    /// Process ID while running
    pub pid: Option<Pid>,
    /// Runs that exited inside the short-live window
    pub short_live_count: u32,
    /// Instant of the last launch
    pub start_time: Option<Instant>,
    /// Last observed exit, `None` until the first exit
    pub exit_status: Option<ExitStatus>,
    /// Lifecycle state
    pub state: RunState,
    /// The supervisor signalled this pid and expects it to die
    pub kill_requested: bool,
    /// Failed launches and short-lived runs since the last healthy run
    pub consecutive_failures: u32,
    /// Earliest instant the next launch may happen
    pub next_start_at: Option<Instant>,
}

impl ManagedProcess {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            active: false,
            running: false,
            pid: None,
            short_live_count: 0,
            start_time: None,
            exit_status: None,
            state: RunState::Stopped,
            kill_requested: false,
            consecutive_failures: 0,
            next_start_at: None,
        }
    }

    /// Forget the OS process: clears `running` and `pid`
    pub(crate) fn clear_process(&mut self) {
        self.running = false;
        self.pid = None;
        self.kill_requested = false;
    }
}

/// Serializable view of one table entry, for status logging
#[derive(Debug, Clone, Serialize)]
pub struct ProcessSnapshot {
    pub slot: ProcessSlot,
    pub name: String,
    pub path: String,
    pub active: bool,
    pub running: bool,
    pub pid: Option<i32>,
    pub state: RunState,
    pub short_live_count: u32,
    pub exit_status: Option<ExitStatus>,
}

/// Fixed table of managed processes indexed by `ProcessSlot`
#[derive(Debug, Clone)]
pub struct ProcessTable {
    entries: [ManagedProcess; ProcessSlot::COUNT],
}

impl ProcessTable {
    /// Build a table from per-slot (name, path) pairs, validating every entry
    pub fn new(specs: [(String, PathBuf); ProcessSlot::COUNT]) -> Result<Self, String> {
        for (slot, (name, path)) in ProcessSlot::ALL.iter().zip(specs.iter()) {
            let path_str = path
                .to_str()
                .ok_or_else(|| format!("slot {} path is not valid UTF-8", slot))?;
            validate_entry(*slot, name, path_str)?;
        }
        Ok(Self {
            entries: specs.map(|(name, path)| ManagedProcess::new(name, path)),
        })
    }

    /// Table built from the compiled-in names and paths
    pub fn with_defaults() -> Self {
        Self {
            entries: ProcessSlot::ALL.map(|slot| {
                let spec = slot.default_spec();
                ManagedProcess::new(spec.name, spec.path)
            }),
        }
    }

    pub fn get(&self, slot: ProcessSlot) -> &ManagedProcess {
        &self.entries[slot.index()]
    }

    pub fn get_mut(&mut self, slot: ProcessSlot) -> &mut ManagedProcess {
        &mut self.entries[slot.index()]
    }

    /// Slot currently holding `pid`, if any
    pub fn slot_for_pid(&self, pid: Pid) -> Option<ProcessSlot> {
        ProcessSlot::ALL
            .into_iter()
            .find(|slot| self.entries[slot.index()].pid == Some(pid))
    }

    pub fn iter(&self) -> impl Iterator<Item = (ProcessSlot, &ManagedProcess)> {
        ProcessSlot::ALL.into_iter().zip(self.entries.iter())
    }

    pub fn snapshot(&self) -> Vec<ProcessSnapshot> {
        self.iter()
            .map(|(slot, p)| ProcessSnapshot {
                slot,
                name: p.name.clone(),
                path: p.path.display().to_string(),
                active: p.active,
                running: p.running,
                pid: p.pid.map(Pid::as_raw),
                state: p.state,
                short_live_count: p.short_live_count,
                exit_status: p.exit_status,
            })
            .collect()
    }
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl Index<ProcessSlot> for ProcessTable {
    type Output = ManagedProcess;

    fn index(&self, slot: ProcessSlot) -> &ManagedProcess {
        self.get(slot)
    }
}

impl IndexMut<ProcessSlot> for ProcessTable {
    fn index_mut(&mut self, slot: ProcessSlot) -> &mut ManagedProcess {
        self.get_mut(slot)
    }
}
