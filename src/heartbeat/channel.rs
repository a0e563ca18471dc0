//! Shared heartbeat channel
//!
//! A fixed-size region holding one counter and one active flag per
//! data-plane thread. The supervisor creates it; the data-plane worker maps
//! the same named object and writes into it.

use nix::fcntl::OFlag;
use nix::sys::mman::{mmap, munmap, shm_open, shm_unlink, MapFlags, ProtFlags};
use nix::sys::stat::Mode;
use nix::unistd::ftruncate;
use std::fs::File;
use std::num::NonZeroUsize;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Number of data-plane thread slots in the channel
pub const MAX_DP_THREADS: usize = 4;

/// Default name of the shared-memory object
pub const DEFAULT_SHM_NAME: &str = "/dp_mnt.shm";

/// Size of the mapped region in bytes
pub const REGION_SIZE: usize = std::mem::size_of::<HeartbeatRegion>();

const REGION_LEN: NonZeroUsize = match NonZeroUsize::new(REGION_SIZE) {
    Some(len) => len,
    None => panic!("heartbeat region must not be zero-sized"),
};

/// Heartbeat channel errors
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("invalid shared memory name {0:?}: must start with '/' and contain no other '/'")]
    InvalidName(String),

    #[error("shm_open({name}) failed: {source}")]
    Open {
        name: String,
        #[source]
        source: nix::Error,
    },

    #[error("failed to size {name} to {size} bytes: {source}")]
    Truncate {
        name: String,
        size: usize,
        #[source]
        source: nix::Error,
    },

    #[error("{name} is {actual} bytes, expected at least {expected}")]
    SizeMismatch {
        name: String,
        actual: u64,
        expected: usize,
    },

    #[error("mmap of {name} failed: {source}")]
    Map {
        name: String,
        #[source]
        source: nix::Error,
    },

    #[error("failed to inspect {name}: {source}")]
    Io {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("heartbeat slot {0} out of range (max {MAX_DP_THREADS})")]
    SlotOutOfRange(usize),

    #[error("channel is not mapped")]
    NotMapped,
}

/// Memory layout of the channel: counters first, then flags
///
/// All access goes through atomics, so the supervisor and the worker never
/// observe a torn value.
#[repr(C)]
#[derive(Debug, Default)]
pub struct HeartbeatRegion {
    counters: [AtomicU32; MAX_DP_THREADS],
    active: [AtomicBool; MAX_DP_THREADS],
}

impl HeartbeatRegion {
    /// Current counter of thread slot `idx`
    ///
    /// Panics if `idx >= MAX_DP_THREADS`.
    pub fn counter(&self, idx: usize) -> u32 {
        self.counters[idx].load(Ordering::Acquire)
    }

    /// Active flag of thread slot `idx`
    ///
    /// Panics if `idx >= MAX_DP_THREADS`.
    pub fn is_active(&self, idx: usize) -> bool {
        self.active[idx].load(Ordering::Acquire)
    }

    /// Advance the counter of `idx`, wrapping on overflow
    pub fn beat(&self, idx: usize) -> u32 {
        self.counters[idx].fetch_add(1, Ordering::Release).wrapping_add(1)
    }

    pub fn set_active(&self, idx: usize, active: bool) {
        self.active[idx].store(active, Ordering::Release);
    }

    /// Overwrite the counter of `idx`
    pub fn store_counter(&self, idx: usize, value: u32) {
        self.counters[idx].store(value, Ordering::Release);
    }

    /// Zero every counter and flag
    pub fn reset(&self) {
        for idx in 0..MAX_DP_THREADS {
            self.store_counter(idx, 0);
            self.set_active(idx, false);
        }
    }
}

/// Access to a heartbeat region, however it is backed
pub trait HeartbeatChannel: Send + Sync {
    /// The mapped region, or `None` once released
    fn region(&self) -> Option<&HeartbeatRegion>;

    /// Unmap (and, for the creator, unlink) the region
    ///
    /// Idempotent.
    fn release(&mut self) -> Result<(), ChannelError>;

    fn is_mapped(&self) -> bool {
        self.region().is_some()
    }
}

/// Check a POSIX shm object name
pub fn validate_shm_name(name: &str) -> Result<(), ChannelError> {
    let valid = name.len() > 1 && name.starts_with('/') && !name[1..].contains('/');
    if valid {
        Ok(())
    } else {
        Err(ChannelError::InvalidName(name.to_string()))
    }
}

/// `HeartbeatChannel` backed by a POSIX named shared-memory object
#[derive(Debug)]
pub struct SharedHeartbeatChannel {
    name: String,
    ptr: Option<NonNull<HeartbeatRegion>>,
    owner: bool,
}

// SAFETY: the mapping is only accessed through `HeartbeatRegion`, whose
// fields are all atomics. The pointer stays valid until `release`, which
// requires `&mut self`.
unsafe impl Send for SharedHeartbeatChannel {}
unsafe impl Sync for SharedHeartbeatChannel {}

impl SharedHeartbeatChannel {
    /// Create (or truncate) the named object and map it zero-filled
    pub fn create(name: &str) -> Result<Self, ChannelError> {
        validate_shm_name(name)?;
        let mode = Mode::S_IRUSR | Mode::S_IWUSR | Mode::S_IRGRP | Mode::S_IWGRP;
        let fd = shm_open(name, OFlag::O_CREAT | OFlag::O_RDWR | OFlag::O_TRUNC, mode)
            .map_err(|source| ChannelError::Open {
                name: name.to_string(),
                source,
            })?;

        let mapped = ftruncate(&fd, REGION_SIZE as libc::off_t)
            .map_err(|source| ChannelError::Truncate {
                name: name.to_string(),
                size: REGION_SIZE,
                source,
            })
            .and_then(|()| Self::map(name, File::from(fd), true));

        match mapped {
            Ok(channel) => {
                if let Some(region) = channel.region() {
                    region.reset();
                }
                debug!("Created heartbeat channel {} ({} bytes)", name, REGION_SIZE);
                Ok(channel)
            }
            Err(e) => {
                let _ = shm_unlink(name);
                Err(e)
            }
        }
    }

    /// Map an existing named object without creating it
    pub fn open(name: &str) -> Result<Self, ChannelError> {
        validate_shm_name(name)?;
        let fd = shm_open(name, OFlag::O_RDWR, Mode::empty()).map_err(|source| {
            ChannelError::Open {
                name: name.to_string(),
                source,
            }
        })?;
        let file = File::from(fd);
        let actual = file
            .metadata()
            .map_err(|source| ChannelError::Io {
                name: name.to_string(),
                source,
            })?
            .len();
        if actual < REGION_SIZE as u64 {
            return Err(ChannelError::SizeMismatch {
                name: name.to_string(),
                actual,
                expected: REGION_SIZE,
            });
        }
        Self::map(name, file, false)
    }

    fn map(name: &str, file: File, owner: bool) -> Result<Self, ChannelError> {
        // SAFETY: fresh mapping at a kernel-chosen address, sized to the
        // region; the file descriptor may be closed once mapped.
        let ptr = unsafe {
            mmap(
                None,
                REGION_LEN,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                &file,
                0,
            )
        }
        .map_err(|source| ChannelError::Map {
            name: name.to_string(),
            source,
        })?;

        Ok(Self {
            name: name.to_string(),
            ptr: Some(ptr.cast::<HeartbeatRegion>()),
            owner,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this handle created the object and will unlink it
    pub fn is_owner(&self) -> bool {
        self.owner
    }
}

impl HeartbeatChannel for SharedHeartbeatChannel {
    fn region(&self) -> Option<&HeartbeatRegion> {
        // SAFETY: the pointer came from a successful mmap of REGION_SIZE
        // bytes and is only unmapped through `release(&mut self)`.
        self.ptr.map(|ptr| unsafe { ptr.as_ref() })
    }

    fn release(&mut self) -> Result<(), ChannelError> {
        let Some(ptr) = self.ptr.take() else {
            return Ok(());
        };
        // SAFETY: `ptr` is the start of our own mapping of REGION_SIZE bytes
        // and no reference into it outlives `&mut self`.
        unsafe { munmap(ptr.cast(), REGION_SIZE) }.map_err(|source| ChannelError::Map {
            name: self.name.clone(),
            source,
        })?;
        if self.owner {
            if let Err(e) = shm_unlink(self.name.as_str()) {
                warn!("Failed to unlink {}: {}", self.name, e);
            }
        }
        debug!("Released heartbeat channel {}", self.name);
        Ok(())
    }
}

impl Drop for SharedHeartbeatChannel {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!("Failed to release heartbeat channel: {}", e);
        }
    }
}

/// `HeartbeatChannel` over a heap region
///
/// Clones of the `Arc` returned by `handle()` play the worker's role.
#[derive(Debug, Clone, Default)]
pub struct InMemoryHeartbeatChannel {
    region: Option<Arc<HeartbeatRegion>>,
}

impl InMemoryHeartbeatChannel {
    pub fn new() -> Self {
        Self {
            region: Some(Arc::new(HeartbeatRegion::default())),
        }
    }

    /// Shared handle to the region, `None` once released
    pub fn handle(&self) -> Option<Arc<HeartbeatRegion>> {
        self.region.clone()
    }
}

impl HeartbeatChannel for InMemoryHeartbeatChannel {
    fn region(&self) -> Option<&HeartbeatRegion> {
        self.region.as_deref()
    }

    fn release(&mut self) -> Result<(), ChannelError> {
        self.region = None;
        Ok(())
    }
}
