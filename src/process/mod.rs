//! Managed process table and lifecycle
//!
//! - `slot`: closed set of worker slots and their compiled-in defaults
//! - `table`: per-slot records (intent, belief, pid, exit history)
//! - `control`: OS boundary for spawn/kill/waitpid
//! - `lifecycle`: the state machine driving the table

pub mod control;
pub mod lifecycle;
pub mod slot;
pub mod table;

pub use control::{ChildExit, OsProcessControl, ProcessControl, ProcessError};
pub use lifecycle::{LifecycleManager, LifecyclePolicy};
pub use slot::ProcessSlot;
pub use table::{ExitStatus, ManagedProcess, ProcessTable, RunState};
