//! dpmon - data-plane supervisor
//!
//! Usage:
//!   dpmon [--config <path>] [--log-filter <filter>] [--shm-name <name>]
//!         [--no-sysctl] [--check-config]

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

use dpmon::heartbeat::SharedHeartbeatChannel;
use dpmon::supervisor::run_system_command;
use dpmon::utils::init_logging_from_config;
use dpmon::{OsProcessControl, SignalFlags, SignalRouter, Supervisor, SupervisorConfig};

/// Exit status when the configuration cannot be loaded or is invalid
const EXIT_CONFIG: i32 = 2;

/// Exit status when the heartbeat channel cannot be created
const EXIT_CHANNEL: i32 = -1;

#[derive(Parser, Debug)]
#[command(name = "dpmon", version, about = "Data-plane worker supervisor")]
struct Args {
    /// Configuration file (.toml or .json)
    #[arg(long, env = "DPMON_CONFIG")]
    config: Option<PathBuf>,

    /// Log filter; RUST_LOG takes precedence
    #[arg(long)]
    log_filter: Option<String>,

    /// Override the shared-memory object name
    #[arg(long)]
    shm_name: Option<String>,

    /// Skip the startup system configuration command
    #[arg(long)]
    no_sysctl: bool,

    /// Validate the configuration and exit
    #[arg(long)]
    check_config: bool,
}

fn load_config(args: &Args) -> anyhow::Result<SupervisorConfig> {
    let mut config = match &args.config {
        Some(path) => SupervisorConfig::from_file(path)?,
        None => SupervisorConfig::default(),
    };
    if let Some(filter) = &args.log_filter {
        config.logging.filter = Some(filter.clone());
    }
    if let Some(name) = &args.shm_name {
        config.heartbeat.shm_name = name.clone();
    }
    if args.no_sysctl {
        config.sysctl_command = None;
    }
    config.validate()?;
    Ok(config)
}

fn main() {
    let args = Args::parse();

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("dpmon: configuration error: {:#}", e);
            std::process::exit(EXIT_CONFIG);
        }
    };
    if args.check_config {
        println!("configuration OK");
        return;
    }

    init_logging_from_config(Some(&config.logging));

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!("Failed to build runtime: {}", e);
            std::process::exit(1);
        }
    };

    let code = runtime.block_on(run(config));
    std::process::exit(code);
}

async fn run(config: SupervisorConfig) -> i32 {
    let flags = Arc::new(SignalFlags::new());
    let _router = match SignalRouter::install(Arc::clone(&flags), &config.signals) {
        Ok(router) => router,
        Err(e) => {
            error!("{}", e);
            return 1;
        }
    };

    let channel = match SharedHeartbeatChannel::create(&config.heartbeat.shm_name) {
        Ok(channel) => channel,
        Err(e) => {
            error!("Failed to create heartbeat channel: {}", e);
            return EXIT_CHANNEL;
        }
    };

    info!("dpmon pid={}", std::process::id());

    if let Some(command) = &config.sysctl_command {
        run_system_command(command);
    }

    let mut supervisor = match Supervisor::new(
        config,
        OsProcessControl::new(),
        Box::new(channel),
        flags,
    ) {
        Ok(s) => s,
        Err(e) => {
            error!("{}", e);
            return EXIT_CONFIG;
        }
    };
    supervisor.activate_autostart();

    match supervisor.run().await {
        Ok(()) => {
            info!("dpmon exited");
            0
        }
        Err(e) => {
            error!("Supervisor failed: {}", e);
            1
        }
    }
}
