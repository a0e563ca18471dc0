//! Signal router
//!
//! Listens on tokio signal streams and turns each delivery into a
//! `SignalFlags::raise`. Must be installed from inside a tokio runtime.

use std::sync::Arc;
use thiserror::Error;
use tokio::signal::unix::{signal, Signal as SignalStream, SignalKind};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::SignalConfig;
use crate::signal::{SignalEvent, SignalFlags};

/// Signal registration errors
#[derive(Debug, Error)]
pub enum SignalError {
    #[error("failed to register handler for {name}: {source}")]
    Register {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

fn register(kind: SignalKind, name: &str) -> Result<SignalStream, SignalError> {
    signal(kind).map_err(|source| SignalError::Register {
        name: name.to_string(),
        source,
    })
}

/// Handle to the running router task
#[derive(Debug)]
pub struct SignalRouter {
    task: JoinHandle<()>,
}

impl SignalRouter {
    /// Register every handler, then spawn the routing task
    ///
    /// Registration happens before this returns, so a signal delivered after
    /// `install` is never lost.
    pub fn install(flags: Arc<SignalFlags>, config: &SignalConfig) -> Result<Self, SignalError> {
        let mut sigterm = register(SignalKind::terminate(), "SIGTERM")?;
        let mut sigint = register(SignalKind::interrupt(), "SIGINT")?;
        let mut sigquit = register(SignalKind::quit(), "SIGQUIT")?;
        let mut sigbus = register(SignalKind::from_raw(libc::SIGBUS), "SIGBUS")?;
        let mut sigchld = register(SignalKind::child(), "SIGCHLD")?;
        let mut pause = register(
            SignalKind::from_raw(config.pause),
            &format!("pause signal {}", config.pause),
        )?;
        let mut resume = register(
            SignalKind::from_raw(config.resume),
            &format!("resume signal {}", config.resume),
        )?;

        let task = tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    Some(()) = sigterm.recv() => {
                        info!("Received SIGTERM, shutting down gracefully...");
                        SignalEvent::Terminate
                    }
                    Some(()) = sigint.recv() => {
                        info!("Received SIGINT, shutting down gracefully...");
                        SignalEvent::Terminate
                    }
                    Some(()) = sigquit.recv() => {
                        info!("Received SIGQUIT, shutting down gracefully...");
                        SignalEvent::Terminate
                    }
                    Some(()) = sigbus.recv() => {
                        info!("Received SIGBUS, shutting down gracefully...");
                        SignalEvent::Terminate
                    }
                    Some(()) = sigchld.recv() => {
                        debug!("Received SIGCHLD");
                        SignalEvent::ChildExited
                    }
                    Some(()) = pause.recv() => {
                        info!("Received pause signal, data-plane monitoring suspended");
                        SignalEvent::PauseDataPlane
                    }
                    Some(()) = resume.recv() => {
                        info!("Received resume signal, data-plane monitoring resumed");
                        SignalEvent::ResumeDataPlane
                    }
                    else => break,
                };
                flags.raise(event);
            }
        });

        Ok(Self { task })
    }
}

impl Drop for SignalRouter {
    fn drop(&mut self) {
        self.task.abort();
    }
}
