//! Heartbeat liveness monitoring
//!
//! The data-plane worker bumps one counter per thread in a shared region;
//! the supervisor samples the region once per tick and declares the worker
//! wedged when a counter stops moving for too long.

pub mod channel;
pub mod publisher;
pub mod sampler;

pub use channel::{
    ChannelError, HeartbeatChannel, HeartbeatRegion, InMemoryHeartbeatChannel,
    SharedHeartbeatChannel, DEFAULT_SHM_NAME, MAX_DP_THREADS, REGION_SIZE,
};
pub use publisher::HeartbeatPublisher;
pub use sampler::{HeartbeatSampler, SampleReport, SlotObservation};
