//! Worker side of the heartbeat channel

use crate::heartbeat::channel::{
    ChannelError, HeartbeatChannel, SharedHeartbeatChannel, MAX_DP_THREADS,
};

/// Typed writer for data-plane threads
///
/// Each thread owns one slot index: it calls `set_active(idx, true)` when it
/// starts real work, `beat(idx)` once per cycle that proves it is alive, and
/// `set_active(idx, false)` when it stops.
pub struct HeartbeatPublisher<H: HeartbeatChannel = SharedHeartbeatChannel> {
    channel: H,
}

impl HeartbeatPublisher<SharedHeartbeatChannel> {
    /// Map a channel the supervisor already created
    pub fn attach(name: &str) -> Result<Self, ChannelError> {
        Ok(Self {
            channel: SharedHeartbeatChannel::open(name)?,
        })
    }
}

impl<H: HeartbeatChannel> HeartbeatPublisher<H> {
    pub fn new(channel: H) -> Self {
        Self { channel }
    }

    fn check(idx: usize) -> Result<(), ChannelError> {
        if idx < MAX_DP_THREADS {
            Ok(())
        } else {
            Err(ChannelError::SlotOutOfRange(idx))
        }
    }

    /// Advance slot `idx`, returning the new counter value
    pub fn beat(&self, idx: usize) -> Result<u32, ChannelError> {
        Self::check(idx)?;
        let region = self.channel.region().ok_or(ChannelError::NotMapped)?;
        Ok(region.beat(idx))
    }

    pub fn set_active(&self, idx: usize, active: bool) -> Result<(), ChannelError> {
        Self::check(idx)?;
        let region = self.channel.region().ok_or(ChannelError::NotMapped)?;
        region.set_active(idx, active);
        Ok(())
    }

    pub fn channel(&self) -> &H {
        &self.channel
    }

    /// Unmap the channel; later calls fail with `NotMapped`
    pub fn detach(&mut self) -> Result<(), ChannelError> {
        self.channel.release()
    }
}
