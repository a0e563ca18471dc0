#![allow(dead_code)]

use dpmon::heartbeat::{HeartbeatRegion, InMemoryHeartbeatChannel};
use dpmon::process::{ChildExit, ExitStatus, ProcessControl, ProcessError};
use dpmon::{SignalFlags, Supervisor, SupervisorConfig};
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Scripted `ProcessControl`: hands out sequential pids, records signals, and
/// reports exits queued by the test.
#[derive(Debug, Default)]
pub struct MockProcessControl {
    next_pid: i32,
    pub failing_paths: HashSet<PathBuf>,
    pub spawned: Vec<(PathBuf, Pid)>,
    pub signals: Vec<(Pid, Signal)>,
    pub exits: VecDeque<ChildExit>,
    pub restored_child_handler: bool,
}

impl MockProcessControl {
    pub fn new() -> Self {
        Self {
            next_pid: 1000,
            ..Self::default()
        }
    }

    /// Queue an exit for `pid`, to be returned by the next reap
    pub fn exit(&mut self, pid: Pid, status: ExitStatus) {
        self.exits.push_back(ChildExit { pid, status });
    }

    pub fn signals_for(&self, pid: Pid) -> Vec<Signal> {
        self.signals
            .iter()
            .filter(|(p, _)| *p == pid)
            .map(|(_, s)| *s)
            .collect()
    }
}

impl ProcessControl for MockProcessControl {
    fn spawn(&mut self, path: &Path) -> Result<Pid, ProcessError> {
        if self.failing_paths.contains(path) {
            return Err(ProcessError::Spawn {
                path: path.to_path_buf(),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            });
        }
        self.next_pid += 1;
        let pid = Pid::from_raw(self.next_pid);
        self.spawned.push((path.to_path_buf(), pid));
        Ok(pid)
    }

    fn send_signal(&mut self, pid: Pid, signal: Signal) -> Result<(), ProcessError> {
        self.signals.push((pid, signal));
        Ok(())
    }

    fn try_reap_any(&mut self) -> Result<Option<ChildExit>, ProcessError> {
        Ok(self.exits.pop_front())
    }

    fn try_reap(&mut self, pid: Pid) -> Result<Option<ChildExit>, ProcessError> {
        let pos = self.exits.iter().position(|e| e.pid == pid);
        Ok(pos.and_then(|i| self.exits.remove(i)))
    }

    fn restore_default_child_handler(&mut self) -> Result<(), ProcessError> {
        self.restored_child_handler = true;
        Ok(())
    }
}

pub fn test_config() -> SupervisorConfig {
    let mut config = SupervisorConfig::default();
    config.shutdown.grace_period_secs = 0;
    config.sysctl_command = None;
    config
}

/// Supervisor over a mock control and an in-memory channel, plus the
/// worker's view of the region
pub fn mock_supervisor(
    config: SupervisorConfig,
) -> (Supervisor<MockProcessControl>, Arc<HeartbeatRegion>) {
    let channel = InMemoryHeartbeatChannel::new();
    let region = channel.handle().expect("fresh channel is mapped");
    let supervisor = Supervisor::new(
        config,
        MockProcessControl::new(),
        Box::new(channel),
        Arc::new(SignalFlags::new()),
    )
    .expect("valid test config");
    (supervisor, region)
}
