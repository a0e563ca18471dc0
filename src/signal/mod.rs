//! Signal-driven event flags
//!
//! OS signal deliveries become atomic flag writes plus a wakeup of the main
//! loop. No work happens at delivery time; the loop drains the flags with
//! `take_pending` and acts on them.

pub mod router;

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use tokio::sync::futures::Notified;
use tokio::sync::Notify;

pub use router::{SignalError, SignalRouter};

/// Something a signal asked the supervisor to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalEvent {
    /// SIGTERM, SIGINT, SIGQUIT or SIGBUS
    Terminate,
    /// SIGCHLD
    ChildExited,
    /// Custom pause signal: stop monitoring the data plane
    PauseDataPlane,
    /// Custom resume signal: monitor the data plane again
    ResumeDataPlane,
}

/// Latest pause/resume request for the data plane
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataPlaneIntent {
    Pause,
    Resume,
}

const INTENT_NONE: u8 = 0;
const INTENT_PAUSE: u8 = 1;
const INTENT_RESUME: u8 = 2;

/// Snapshot of the flags taken by the main loop
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingSignals {
    pub exit_requested: bool,
    pub child_exited: bool,
    pub data_plane: Option<DataPlaneIntent>,
}

impl PendingSignals {
    pub fn is_empty(&self) -> bool {
        !self.exit_requested && !self.child_exited && self.data_plane.is_none()
    }
}

/// Flags shared between the signal router and the main loop
#[derive(Debug, Default)]
pub struct SignalFlags {
    exit_requested: AtomicBool,
    child_exited: AtomicBool,
    data_plane: AtomicU8,
    child_exit_detached: AtomicBool,
    notify: Notify,
}

impl SignalFlags {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `event` and wake the main loop
    pub fn raise(&self, event: SignalEvent) {
        match event {
            SignalEvent::Terminate => self.exit_requested.store(true, Ordering::Release),
            SignalEvent::ChildExited => {
                if self.child_exit_detached.load(Ordering::Acquire) {
                    return;
                }
                self.child_exited.store(true, Ordering::Release);
            }
            SignalEvent::PauseDataPlane => self.data_plane.store(INTENT_PAUSE, Ordering::Release),
            SignalEvent::ResumeDataPlane => {
                self.data_plane.store(INTENT_RESUME, Ordering::Release)
            }
        }
        self.notify.notify_one();
    }

    /// Drain the one-shot flags
    ///
    /// `exit_requested` is sticky and stays set once raised.
    pub fn take_pending(&self) -> PendingSignals {
        let data_plane = match self.data_plane.swap(INTENT_NONE, Ordering::AcqRel) {
            INTENT_PAUSE => Some(DataPlaneIntent::Pause),
            INTENT_RESUME => Some(DataPlaneIntent::Resume),
            _ => None,
        };
        PendingSignals {
            exit_requested: self.exit_requested.load(Ordering::Acquire),
            child_exited: self.child_exited.swap(false, Ordering::AcqRel),
            data_plane,
        }
    }

    pub fn exit_requested(&self) -> bool {
        self.exit_requested.load(Ordering::Acquire)
    }

    /// Ignore child exits from now on
    pub fn detach_child_exit(&self) {
        self.child_exit_detached.store(true, Ordering::Release);
        self.child_exited.store(false, Ordering::Release);
    }

    pub fn child_exit_detached(&self) -> bool {
        self.child_exit_detached.load(Ordering::Acquire)
    }

    /// Future resolved by the next `raise`
    ///
    /// A raise with no waiter leaves a permit, so a raise between two waits
    /// is never lost.
    pub fn notified(&self) -> Notified<'_> {
        self.notify.notified()
    }
}
