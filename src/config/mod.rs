//! Configuration management for dpmon
//!
//! Handles configuration loading (TOML or JSON) and validation. Every field
//! has a default, so an empty file is a valid configuration.

use anyhow::Context;
use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::heartbeat::channel::{validate_shm_name, DEFAULT_SHM_NAME};
use crate::heartbeat::sampler::{DEFAULT_MISS_KILL_THRESHOLD, DEFAULT_MISS_LOG_THRESHOLD};
use crate::process::lifecycle::LifecyclePolicy;
use crate::process::slot::ProcessSlot;
use crate::process::table::ProcessTable;
use crate::utils::retry::RetryConfig;

/// Heartbeat monitoring configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// POSIX shared-memory object name
    #[serde(default = "default_shm_name")]
    pub shm_name: String,

    /// Sampling cadence in milliseconds
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// Miss streak above which a warning is logged
    #[serde(default = "default_miss_log_threshold")]
    pub miss_log_threshold: u32,

    /// Miss streak above which the data plane is killed
    #[serde(default = "default_miss_kill_threshold")]
    pub miss_kill_threshold: u32,

    /// Signal used to kill a wedged data plane (e.g. "SIGSEGV")
    #[serde(default = "default_kill_signal")]
    pub kill_signal: String,
}

fn default_shm_name() -> String {
    DEFAULT_SHM_NAME.to_string()
}

fn default_tick_interval_ms() -> u64 {
    1000
}

fn default_miss_log_threshold() -> u32 {
    DEFAULT_MISS_LOG_THRESHOLD
}

fn default_miss_kill_threshold() -> u32 {
    DEFAULT_MISS_KILL_THRESHOLD
}

fn default_kill_signal() -> String {
    "SIGSEGV".to_string()
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            shm_name: default_shm_name(),
            tick_interval_ms: default_tick_interval_ms(),
            miss_log_threshold: default_miss_log_threshold(),
            miss_kill_threshold: default_miss_kill_threshold(),
            kill_signal: default_kill_signal(),
        }
    }
}

impl HeartbeatConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Parsed `kill_signal`
    pub fn kill_signal(&self) -> anyhow::Result<Signal> {
        Signal::from_str(&self.kill_signal)
            .map_err(|_| anyhow::anyhow!("unknown kill_signal {:?}", self.kill_signal))
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        validate_shm_name(&self.shm_name)?;
        if self.tick_interval_ms == 0 {
            return Err(anyhow::anyhow!("tick_interval_ms must be greater than 0"));
        }
        if self.miss_kill_threshold == 0 {
            return Err(anyhow::anyhow!("miss_kill_threshold must be greater than 0"));
        }
        if self.miss_log_threshold > self.miss_kill_threshold {
            return Err(anyhow::anyhow!(
                "miss_log_threshold ({}) must not exceed miss_kill_threshold ({})",
                self.miss_log_threshold,
                self.miss_kill_threshold
            ));
        }
        self.kill_signal()?;
        Ok(())
    }
}

/// Stop behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleConfig {
    /// Longest a waiting stop blocks for the child to be reaped
    #[serde(default = "default_stop_timeout_secs")]
    pub stop_timeout_secs: u64,
}

fn default_stop_timeout_secs() -> u64 {
    10
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            stop_timeout_secs: default_stop_timeout_secs(),
        }
    }
}

/// Automatic relaunch of active processes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestartConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Backoff between relaunches after consecutive failures
    #[serde(flatten)]
    pub backoff: RetryConfig,

    /// Runs shorter than this count as short-lived
    #[serde(default = "default_short_live_secs")]
    pub short_live_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_short_live_secs() -> u64 {
    5
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            backoff: RetryConfig::default(),
            short_live_secs: default_short_live_secs(),
        }
    }
}

/// Custom real-time signals that pause and resume data-plane monitoring
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalConfig {
    #[serde(default = "default_pause_signal")]
    pub pause: i32,

    #[serde(default = "default_resume_signal")]
    pub resume: i32,
}

fn default_pause_signal() -> i32 {
    40
}

fn default_resume_signal() -> i32 {
    41
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            pause: default_pause_signal(),
            resume: default_resume_signal(),
        }
    }
}

impl SignalConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        let range = libc::SIGRTMIN()..=libc::SIGRTMAX();
        for (label, signo) in [("pause", self.pause), ("resume", self.resume)] {
            if !range.contains(&signo) {
                return Err(anyhow::anyhow!(
                    "{} signal {} outside real-time range {}..={}",
                    label,
                    signo,
                    range.start(),
                    range.end()
                ));
            }
        }
        if self.pause == self.resume {
            return Err(anyhow::anyhow!(
                "pause and resume signals must differ (both {})",
                self.pause
            ));
        }
        Ok(())
    }
}

/// Orderly shutdown
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownConfig {
    /// Sleep before the supervisor exits
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,

    /// SIGTERM and reap every running child during shutdown
    #[serde(default)]
    pub stop_children: bool,
}

fn default_grace_period_secs() -> u64 {
    3
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            grace_period_secs: default_grace_period_secs(),
            stop_children: false,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log filter (e.g. "info", "dpmon=debug"); RUST_LOG takes precedence
    #[serde(default)]
    pub filter: Option<String>,

    /// Emit JSON lines (requires the `json-logging` feature)
    #[serde(default)]
    pub json_format: bool,
}

/// Per-slot override of the compiled-in name and path
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessOverride {
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// Top-level supervisor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    #[serde(default)]
    pub lifecycle: LifecycleConfig,

    #[serde(default)]
    pub restart: RestartConfig,

    #[serde(default)]
    pub signals: SignalConfig,

    #[serde(default)]
    pub shutdown: ShutdownConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// Overrides keyed by slot ("control", "data-plane", ...)
    #[serde(default)]
    pub processes: BTreeMap<String, ProcessOverride>,

    /// Slots marked active at startup
    #[serde(default = "default_autostart")]
    pub autostart: Vec<ProcessSlot>,

    /// System configuration command run once at startup; `None` disables it
    #[serde(default = "default_sysctl_command")]
    pub sysctl_command: Option<String>,
}

fn default_autostart() -> Vec<ProcessSlot> {
    vec![ProcessSlot::DataPlane]
}

fn default_sysctl_command() -> Option<String> {
    Some("sysctl -p".to_string())
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            heartbeat: HeartbeatConfig::default(),
            lifecycle: LifecycleConfig::default(),
            restart: RestartConfig::default(),
            signals: SignalConfig::default(),
            shutdown: ShutdownConfig::default(),
            logging: LoggingConfig::default(),
            processes: BTreeMap::new(),
            autostart: default_autostart(),
            sysctl_command: default_sysctl_command(),
        }
    }
}

impl SupervisorConfig {
    /// Load configuration, choosing the format from the file extension
    ///
    /// `.json` is parsed as JSON; anything else as TOML.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_file(path),
            _ => Self::from_toml_file(path),
        }
    }

    /// Load configuration from JSON file
    pub fn from_json_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config: SupervisorConfig = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Ok(config)
    }

    /// Load configuration from TOML file
    pub fn from_toml_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config: SupervisorConfig = toml::from_str(&content)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Ok(config)
    }

    /// Save configuration to JSON file
    pub fn to_json_file(&self, path: &Path) -> anyhow::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        self.heartbeat.validate().context("invalid [heartbeat]")?;
        self.signals.validate().context("invalid [signals]")?;

        let backoff = &self.restart.backoff;
        if backoff.backoff_multiplier < 1.0 {
            return Err(anyhow::anyhow!(
                "backoff_multiplier must be at least 1.0, got {}",
                backoff.backoff_multiplier
            ));
        }
        if backoff.initial_delay > backoff.max_delay {
            return Err(anyhow::anyhow!(
                "initial_backoff_secs must not exceed max_backoff_secs"
            ));
        }

        self.process_table().context("invalid [processes]")?;
        Ok(())
    }

    /// Process table with overrides applied
    pub fn process_table(&self) -> anyhow::Result<ProcessTable> {
        for key in self.processes.keys() {
            ProcessSlot::from_str(key).map_err(|e| anyhow::anyhow!(e))?;
        }
        let specs = ProcessSlot::ALL.map(|slot| {
            let spec = slot.default_spec();
            let o = self.processes.get(&slot.to_string());
            let name = o
                .and_then(|o| o.name.clone())
                .unwrap_or_else(|| spec.name.to_string());
            let path = o
                .and_then(|o| o.path.clone())
                .unwrap_or_else(|| PathBuf::from(spec.path));
            (name, path)
        });
        ProcessTable::new(specs).map_err(|e| anyhow::anyhow!(e))
    }

    /// Lifecycle policy derived from the `lifecycle` and `restart` sections
    pub fn lifecycle_policy(&self) -> LifecyclePolicy {
        LifecyclePolicy {
            restart_enabled: self.restart.enabled,
            backoff: self.restart.backoff.clone(),
            short_live: Duration::from_secs(self.restart.short_live_secs),
            stop_timeout: Duration::from_secs(self.lifecycle.stop_timeout_secs),
            ..LifecyclePolicy::default()
        }
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown.grace_period_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = SupervisorConfig::default();
        config.validate().unwrap();
        assert_eq!(config.heartbeat.shm_name, "/dp_mnt.shm");
        assert_eq!(config.heartbeat.kill_signal().unwrap(), Signal::SIGSEGV);
        assert_eq!(config.autostart, vec![ProcessSlot::DataPlane]);
        assert_eq!(config.sysctl_command.as_deref(), Some("sysctl -p"));
        assert_eq!(config.grace_period(), Duration::from_secs(3));
    }

    #[test]
    fn test_empty_toml_uses_defaults() {
        let config: SupervisorConfig = toml::from_str("").unwrap();
        assert_eq!(config.heartbeat.miss_kill_threshold, 60);
        assert_eq!(config.signals.pause, 40);
        assert_eq!(config.signals.resume, 41);
        assert!(config.restart.enabled);
        assert_eq!(config.restart.backoff, RetryConfig::default());
    }

    #[test]
    fn test_toml_file_with_overrides() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
autostart = ["data-plane", "agent"]
sysctl_command = "true"

[heartbeat]
miss_kill_threshold = 10
kill_signal = "SIGKILL"

[restart]
initial_backoff_secs = 0.5
max_backoff_secs = 30

[processes.agent]
path = "/opt/agent/bin/agent"
"#
        )
        .unwrap();

        let config = SupervisorConfig::from_file(file.path()).unwrap();
        config.validate().unwrap();
        assert_eq!(config.heartbeat.kill_signal().unwrap(), Signal::SIGKILL);
        assert_eq!(
            config.restart.backoff.initial_delay,
            Duration::from_millis(500)
        );
        assert_eq!(config.autostart.len(), 2);

        let table = config.process_table().unwrap();
        assert_eq!(
            table[ProcessSlot::Agent].path,
            PathBuf::from("/opt/agent/bin/agent")
        );
        assert_eq!(table[ProcessSlot::Control].name, "ctrl");
    }

    #[test]
    fn test_json_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dpmon.json");
        let mut config = SupervisorConfig::default();
        config.shutdown.stop_children = true;
        config.sysctl_command = None;
        config.to_json_file(&path).unwrap();

        let loaded = SupervisorConfig::from_file(&path).unwrap();
        assert!(loaded.shutdown.stop_children);
        assert!(loaded.sysctl_command.is_none());
    }

    #[test]
    fn test_validate_rejects_bad_signals() {
        let mut config = SupervisorConfig::default();
        config.signals.resume = config.signals.pause;
        assert!(config.validate().is_err());

        let mut config = SupervisorConfig::default();
        config.signals.pause = libc::SIGTERM;
        assert!(config.validate().is_err());

        let mut config = SupervisorConfig::default();
        config.heartbeat.kill_signal = "SIGNOPE".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_heartbeat_and_paths() {
        let mut config = SupervisorConfig::default();
        config.heartbeat.shm_name = "no-slash".to_string();
        assert!(config.validate().is_err());

        let mut config = SupervisorConfig::default();
        config.heartbeat.tick_interval_ms = 0;
        assert!(config.validate().is_err());

        let mut config = SupervisorConfig::default();
        config.processes.insert(
            "scanner".to_string(),
            ProcessOverride {
                name: None,
                path: Some(PathBuf::from(format!("/{}", "p".repeat(80)))),
            },
        );
        assert!(config.validate().is_err());

        let mut config = SupervisorConfig::default();
        config
            .processes
            .insert("monitor".to_string(), ProcessOverride::default());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_lifecycle_policy_from_config() {
        let mut config = SupervisorConfig::default();
        config.restart.enabled = false;
        config.lifecycle.stop_timeout_secs = 2;
        let policy = config.lifecycle_policy();
        assert!(!policy.restart_enabled);
        assert_eq!(policy.stop_timeout, Duration::from_secs(2));
        assert_eq!(policy.short_live, Duration::from_secs(5));
    }
}
