//! Lifecycle manager
//!
//! Owns the process table and drives each slot through
//! `Stopped → Starting → Running → {Exited, Killed} → Stopped`.
//! Runs only on the supervisor loop, never from signal context.

use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::process::control::{ChildExit, ProcessControl, ProcessError};
use crate::process::slot::ProcessSlot;
use crate::process::table::{ProcessTable, RunState};
use crate::utils::retry::RetryConfig;

/// Restart and stop behaviour
#[derive(Debug, Clone)]
pub struct LifecyclePolicy {
    /// Relaunch active slots that are not running
    pub restart_enabled: bool,
    /// Spacing between relaunches after consecutive failures
    pub backoff: RetryConfig,
    /// Runs shorter than this count as short-lived
    pub short_live: Duration,
    /// Longest `stop_process` waits for the pid to be reaped
    pub stop_timeout: Duration,
    /// Poll period while waiting for a stopped pid
    pub stop_poll_interval: Duration,
}

impl Default for LifecyclePolicy {
    fn default() -> Self {
        Self {
            restart_enabled: true,
            backoff: RetryConfig::default(),
            short_live: Duration::from_secs(5),
            stop_timeout: Duration::from_secs(10),
            stop_poll_interval: Duration::from_millis(10),
        }
    }
}

/// Start, signal and reap managed processes
pub struct LifecycleManager<C: ProcessControl> {
    table: ProcessTable,
    control: C,
    policy: LifecyclePolicy,
}

impl<C: ProcessControl> LifecycleManager<C> {
    pub fn new(table: ProcessTable, control: C, policy: LifecyclePolicy) -> Self {
        Self {
            table,
            control,
            policy,
        }
    }

    pub fn table(&self) -> &ProcessTable {
        &self.table
    }

    pub fn control(&self) -> &C {
        &self.control
    }

    pub fn control_mut(&mut self) -> &mut C {
        &mut self.control
    }

    pub fn policy(&self) -> &LifecyclePolicy {
        &self.policy
    }

    /// Set the intent bit for `slot`
    pub fn mark_active(&mut self, slot: ProcessSlot, active: bool) {
        let entry = &mut self.table[slot];
        if entry.active != active {
            info!(slot = %slot, name = %entry.name, active, "process intent changed");
        }
        entry.active = active;
    }

    /// Set the belief bit for `slot`
    ///
    /// Marking a slot not running also forgets its pid. A slot without a pid
    /// cannot be marked running.
    pub fn mark_running(&mut self, slot: ProcessSlot, running: bool) {
        let entry = &mut self.table[slot];
        if running {
            if entry.pid.is_none() {
                warn!(slot = %slot, "cannot mark a slot without a pid as running");
                return;
            }
            entry.running = true;
            entry.state = RunState::Running;
        } else {
            entry.clear_process();
            if entry.state == RunState::Running || entry.state == RunState::Starting {
                entry.state = RunState::Stopped;
            }
        }
    }

    /// Clear every slot's intent bit
    pub fn deactivate_all(&mut self) {
        for slot in ProcessSlot::ALL {
            self.table[slot].active = false;
        }
    }

    /// Launch `slot`
    ///
    /// A failed launch is reported and leaves the slot stopped and eligible
    /// for a later retry after its backoff.
    pub fn start_process(&mut self, slot: ProcessSlot, now: Instant) -> Result<Pid, ProcessError> {
        let entry = &mut self.table[slot];
        if let (true, Some(pid)) = (entry.running, entry.pid) {
            debug!(slot = %slot, pid = %pid, "start requested for a running process");
            return Ok(pid);
        }

        entry.state = RunState::Starting;
        match self.control.spawn(&entry.path) {
            Ok(pid) => {
                entry.pid = Some(pid);
                entry.running = true;
                entry.kill_requested = false;
                entry.start_time = Some(now);
                entry.next_start_at = None;
                entry.state = RunState::Running;
                info!("Started {} ({:?}), pid={}", entry.name, entry.path, pid);
                Ok(pid)
            }
            Err(e) => {
                entry.clear_process();
                entry.state = RunState::Stopped;
                let delay = self.policy.backoff.delay_for_attempt(entry.consecutive_failures);
                entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);
                entry.next_start_at = Some(now + delay);
                error!("Failed to start {}: {}. Retrying in {:?}", entry.name, e, delay);
                Err(e)
            }
        }
    }

    /// Send `signal` to the slot's pid, optionally waiting until it is reaped
    ///
    /// A slot without a pid is left untouched and the call succeeds.
    pub fn stop_process(
        &mut self,
        slot: ProcessSlot,
        signal: Signal,
        wait_for_exit: bool,
    ) -> Result<(), ProcessError> {
        let Some(pid) = self.table[slot].pid else {
            return Ok(());
        };

        info!(
            "Kill {} with signal {}, pid={}",
            self.table[slot].name, signal, pid
        );
        self.table[slot].kill_requested = true;

        match self.control.send_signal(pid, signal) {
            Ok(()) => {}
            Err(ProcessError::Signal {
                source: Errno::ESRCH,
                ..
            }) => {
                // Already gone and reaped elsewhere
                warn!("{} (pid {}) no longer exists", self.table[slot].name, pid);
                let entry = &mut self.table[slot];
                entry.clear_process();
                entry.state = RunState::Stopped;
                return Ok(());
            }
            Err(e) => {
                self.table[slot].kill_requested = false;
                return Err(e);
            }
        }

        if !wait_for_exit {
            return Ok(());
        }

        let deadline = Instant::now() + self.policy.stop_timeout;
        loop {
            if let Some(exit) = self.control.try_reap(pid)? {
                self.record_exit(exit, Instant::now());
                info!("{} stopped.", self.table[slot].name);
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(ProcessError::StopTimeout {
                    pid,
                    timeout: self.policy.stop_timeout,
                });
            }
            std::thread::sleep(self.policy.stop_poll_interval);
        }
    }

    /// Reap every exitable child, returning how many were collected
    pub fn reap_children(&mut self, now: Instant) -> usize {
        let mut reaped = 0;
        loop {
            match self.control.try_reap_any() {
                Ok(Some(exit)) => {
                    reaped += 1;
                    self.record_exit(exit, now);
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("Failed to reap children: {}", e);
                    break;
                }
            }
        }
        reaped
    }

    /// Apply a reaped exit to the table, returning the owning slot
    pub fn record_exit(&mut self, exit: ChildExit, now: Instant) -> Option<ProcessSlot> {
        let Some(slot) = self.table.slot_for_pid(exit.pid) else {
            debug!("Reaped unmanaged child pid={}", exit.pid);
            return None;
        };

        let short_live = self.policy.short_live;
        let backoff = self.policy.backoff.clone();
        let entry = &mut self.table[slot];

        entry.exit_status = Some(exit.status);
        entry.state = if entry.kill_requested {
            RunState::Killed
        } else {
            RunState::Exited
        };
        entry.clear_process();

        let lifetime = entry.start_time.map(|t| now.saturating_duration_since(t));
        if lifetime.map_or(false, |l| l < short_live) {
            entry.short_live_count = entry.short_live_count.saturating_add(1);
            let delay = backoff.delay_for_attempt(entry.consecutive_failures);
            entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);
            entry.next_start_at = Some(now + delay);
            warn!(
                "{} exited after {:?} ({:?}), short-lived runs: {}",
                entry.name,
                lifetime.unwrap_or_default(),
                exit.status,
                entry.short_live_count
            );
        } else {
            entry.consecutive_failures = 0;
            entry.next_start_at = None;
            if exit.status.success() {
                info!("{} exited cleanly, pid={}", entry.name, exit.pid);
            } else {
                info!(
                    "{} exited, pid={} code={} status={:?}",
                    entry.name,
                    exit.pid,
                    exit.status.code(),
                    exit.status
                );
            }
        }

        Some(slot)
    }

    /// Relaunch active slots that are not running and whose backoff expired
    ///
    /// Also settles inactive, reaped slots back to `Stopped`. Returns the
    /// number of launches attempted.
    pub fn reconcile(&mut self, now: Instant) -> usize {
        let mut attempted = 0;
        for slot in ProcessSlot::ALL {
            let entry = &mut self.table[slot];
            if entry.running {
                continue;
            }
            if !entry.active {
                if matches!(entry.state, RunState::Exited | RunState::Killed) {
                    entry.state = RunState::Stopped;
                }
                continue;
            }
            if !self.policy.restart_enabled {
                continue;
            }
            if entry.next_start_at.map_or(false, |at| now < at) {
                continue;
            }
            attempted += 1;
            let _ = self.start_process(slot, now);
        }
        attempted
    }
}
