//! Process slots and the static process table
//!
//! The worker set is fixed at compile time. Each worker owns one slot,
//! identified by a closed enum so lookups are array indexing rather than
//! name scans.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Maximum length of a slot name, in bytes
pub const MAX_NAME_LEN: usize = 31;

/// Maximum length of an executable path, in bytes
pub const MAX_PATH_LEN: usize = 63;

/// Identifies one managed process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProcessSlot {
    /// Controller
    Control,
    /// Scanner attached to the controller
    Scanner,
    /// Multi-threaded data-plane worker (the only heartbeat-monitored slot)
    DataPlane,
    /// Host agent
    Agent,
    /// Scanner running without a controller
    StandaloneScanner,
}

impl ProcessSlot {
    /// Number of slots in the table
    pub const COUNT: usize = 5;

    /// Every slot, in table order
    pub const ALL: [ProcessSlot; Self::COUNT] = [
        ProcessSlot::Control,
        ProcessSlot::Scanner,
        ProcessSlot::DataPlane,
        ProcessSlot::Agent,
        ProcessSlot::StandaloneScanner,
    ];

    /// Position of this slot in the table
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Compiled-in name and executable path
    pub const fn default_spec(self) -> SlotSpec {
        DEFAULT_TABLE[self.index()]
    }
}

impl fmt::Display for ProcessSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProcessSlot::Control => "control",
            ProcessSlot::Scanner => "scanner",
            ProcessSlot::DataPlane => "data-plane",
            ProcessSlot::Agent => "agent",
            ProcessSlot::StandaloneScanner => "standalone-scanner",
        };
        f.write_str(s)
    }
}

impl FromStr for ProcessSlot {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ProcessSlot::ALL
            .into_iter()
            .find(|slot| slot.to_string() == s)
            .ok_or_else(|| format!("unknown process slot {:?}", s))
    }
}

/// Static (name, path) pair for a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotSpec {
    pub name: &'static str,
    pub path: &'static str,
}

const DEFAULT_TABLE: [SlotSpec; ProcessSlot::COUNT] = [
    SlotSpec {
        name: "ctrl",
        path: "/usr/local/bin/controller",
    },
    SlotSpec {
        name: "scanner",
        path: "/usr/local/bin/scanner",
    },
    SlotSpec {
        name: "dp",
        path: "/usr/local/bin/dp",
    },
    SlotSpec {
        name: "agent",
        path: "/usr/local/bin/agent",
    },
    SlotSpec {
        name: "scanner",
        path: "/usr/local/bin/scanner",
    },
];

/// Check a slot's name and path against the table bounds
pub fn validate_entry(slot: ProcessSlot, name: &str, path: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err(format!("slot {} has an empty name", slot));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(format!(
            "slot {} name {:?} exceeds {} bytes",
            slot, name, MAX_NAME_LEN
        ));
    }
    if path.is_empty() {
        return Err(format!("slot {} has an empty executable path", slot));
    }
    if path.len() > MAX_PATH_LEN {
        return Err(format!(
            "slot {} path {:?} exceeds {} bytes",
            slot, path, MAX_PATH_LEN
        ));
    }
    Ok(())
}
