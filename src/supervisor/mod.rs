//! Supervisor main loop
//!
//! Single-threaded: every table mutation and every heartbeat sample happens
//! here. Signals only reach the loop through `SignalFlags`, and the wait on
//! those flags (bounded by the tick interval) is the only suspension point.

pub mod startup;

use nix::sys::signal::Signal;
use nix::unistd::Pid;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::SupervisorConfig;
use crate::heartbeat::{ChannelError, HeartbeatChannel, HeartbeatSampler, SampleReport};
use crate::process::{
    LifecycleManager, ProcessControl, ProcessError, ProcessSlot, ProcessTable,
};
use crate::process::table::ProcessSnapshot;
use crate::signal::{DataPlaneIntent, PendingSignals, SignalError, SignalFlags};

pub use startup::run_system_command;

/// Supervisor errors
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("heartbeat channel: {0}")]
    Channel(#[from] ChannelError),

    #[error("process control: {0}")]
    Process(#[from] ProcessError),

    #[error("signal handling: {0}")]
    Signal(#[from] SignalError),

    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Supervisor context
pub struct Supervisor<C: ProcessControl> {
    config: SupervisorConfig,
    lifecycle: LifecycleManager<C>,
    sampler: HeartbeatSampler,
    /// Data-plane pid the sampler's shadow state belongs to
    sampled_pid: Option<Pid>,
    channel: Box<dyn HeartbeatChannel>,
    flags: Arc<SignalFlags>,
    kill_signal: Signal,
}

impl<C: ProcessControl> Supervisor<C> {
    pub fn new(
        config: SupervisorConfig,
        control: C,
        channel: Box<dyn HeartbeatChannel>,
        flags: Arc<SignalFlags>,
    ) -> Result<Self, SupervisorError> {
        let table: ProcessTable = config
            .process_table()
            .map_err(|e| SupervisorError::Config(format!("{:#}", e)))?;
        let kill_signal = config
            .heartbeat
            .kill_signal()
            .map_err(|e| SupervisorError::Config(format!("{:#}", e)))?;
        let sampler = HeartbeatSampler::new(
            config.heartbeat.miss_log_threshold,
            config.heartbeat.miss_kill_threshold,
        );
        let lifecycle = LifecycleManager::new(table, control, config.lifecycle_policy());

        Ok(Self {
            config,
            lifecycle,
            sampler,
            sampled_pid: None,
            channel,
            flags,
            kill_signal,
        })
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn lifecycle(&self) -> &LifecycleManager<C> {
        &self.lifecycle
    }

    pub fn lifecycle_mut(&mut self) -> &mut LifecycleManager<C> {
        &mut self.lifecycle
    }

    pub fn sampler(&self) -> &HeartbeatSampler {
        &self.sampler
    }

    pub fn channel(&self) -> &dyn HeartbeatChannel {
        self.channel.as_ref()
    }

    pub fn flags(&self) -> &Arc<SignalFlags> {
        &self.flags
    }

    pub fn status(&self) -> Vec<ProcessSnapshot> {
        self.lifecycle.table().snapshot()
    }

    /// Mark every configured autostart slot active
    pub fn activate_autostart(&mut self) {
        for slot in self.config.autostart.clone() {
            self.lifecycle.mark_active(slot, true);
        }
    }

    /// Run until a termination request has been handled
    pub async fn run(&mut self) -> Result<(), SupervisorError> {
        let tick = self.config.heartbeat.tick_interval();
        let flags = Arc::clone(&self.flags);
        info!("Supervisor loop started, tick interval {:?}", tick);

        loop {
            if flags.exit_requested() {
                return self.shutdown().await;
            }

            match tokio::time::timeout(tick, flags.notified()).await {
                Ok(()) => {
                    self.dispatch_signals(Instant::now());
                }
                Err(_) => {
                    self.on_timeout(Instant::now());
                }
            }
        }
    }

    /// Apply pending signal events to the table
    pub fn dispatch_signals(&mut self, now: Instant) -> PendingSignals {
        let pending = self.flags.take_pending();
        if pending.is_empty() {
            return pending;
        }

        match pending.data_plane {
            Some(DataPlaneIntent::Pause) => {
                self.lifecycle.mark_active(ProcessSlot::DataPlane, false);
            }
            Some(DataPlaneIntent::Resume) => {
                self.lifecycle.mark_active(ProcessSlot::DataPlane, true);
            }
            None => {}
        }

        if pending.child_exited && !self.flags.child_exit_detached() {
            let reaped = self.lifecycle.reap_children(now);
            debug!("Reaped {} children", reaped);
        }

        pending
    }

    /// One timeout tick: drain signals, relaunch, then sample heartbeats
    pub fn on_timeout(&mut self, now: Instant) -> Option<SampleReport> {
        let pending = self.dispatch_signals(now);
        if pending.exit_requested {
            return None;
        }
        self.lifecycle.reconcile(now);
        self.check_heartbeat()
    }

    /// Sample the channel and kill a wedged data plane
    ///
    /// Nothing is sampled while the data plane is inactive.
    pub fn check_heartbeat(&mut self) -> Option<SampleReport> {
        if !self.lifecycle.table()[ProcessSlot::DataPlane].active {
            return None;
        }
        let region = self.channel.region()?;

        // A new data-plane instance starts with a clean miss history
        let pid = self.lifecycle.table()[ProcessSlot::DataPlane].pid;
        if pid != self.sampled_pid {
            if self.sampled_pid.is_some() {
                debug!("Data plane pid changed to {:?}, resetting heartbeat state", pid);
            }
            self.sampler.reset();
            self.sampled_pid = pid;
        }

        let report = self.sampler.sample(region);

        if report.wedged() {
            let wedged: Vec<usize> = report.wedged_slots().collect();
            error!(
                "Data plane heartbeat lost on thread slots {:?}, killing with {}",
                wedged, self.kill_signal
            );
            if let Err(e) =
                self.lifecycle
                    .stop_process(ProcessSlot::DataPlane, self.kill_signal, false)
            {
                error!("Failed to kill data plane: {}", e);
            }
        }

        Some(report)
    }

    /// Orderly shutdown
    ///
    /// Clears every intent bit, stops reacting to child exits, releases the
    /// channel, optionally stops children, then waits the grace period.
    pub async fn shutdown(&mut self) -> Result<(), SupervisorError> {
        info!("Shutting down supervisor");

        self.lifecycle.deactivate_all();
        self.flags.detach_child_exit();
        if let Err(e) = self.lifecycle.control_mut().restore_default_child_handler() {
            warn!("{}", e);
        }

        if let Err(e) = self.channel.release() {
            warn!("Failed to release heartbeat channel: {}", e);
        }

        if self.config.shutdown.stop_children {
            self.stop_children();
        }

        info!("Clean up.");
        let grace = self.config.grace_period();
        if grace > Duration::ZERO {
            debug!("Waiting {:?} before exit", grace);
            tokio::time::sleep(grace).await;
        }
        Ok(())
    }

    fn stop_children(&mut self) {
        for slot in ProcessSlot::ALL {
            if self.lifecycle.table()[slot].pid.is_none() {
                continue;
            }
            if let Err(e) = self.lifecycle.stop_process(slot, Signal::SIGTERM, true) {
                warn!("Failed to stop {}: {}", slot, e);
            }
        }
    }
}
