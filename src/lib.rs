//! dpmon - supervisor for data-plane worker processes
//!
//! Launches a fixed set of sibling workers, reaps them when they exit, and
//! watches the multi-threaded data-plane worker through per-thread heartbeat
//! counters in a POSIX shared-memory region. A data plane whose counters stop
//! moving for too long is killed so it can be relaunched.
//!
//! ## Components
//!
//! 1. `heartbeat`: shared channel, worker-side publisher, sampler
//! 2. `process`: process table, OS process control, lifecycle state machine
//! 3. `signal`: signal flags and the router feeding them
//! 4. `supervisor`: the single-threaded main loop and orderly shutdown
//! 5. `config` / `utils`: configuration, logging, backoff

pub mod config;
pub mod heartbeat;
pub mod process;
pub mod signal;
pub mod supervisor;
pub mod utils;

pub use config::SupervisorConfig;
pub use heartbeat::{HeartbeatChannel, HeartbeatPublisher, SharedHeartbeatChannel};
pub use process::{LifecycleManager, OsProcessControl, ProcessControl, ProcessSlot};
pub use signal::{SignalFlags, SignalRouter};
pub use supervisor::{Supervisor, SupervisorError};
