//! Heartbeat sampler
//!
//! Compares each active slot's counter with the value seen on the previous
//! tick. Counters are only ever compared for inequality, so wraparound is
//! harmless.

use tracing::{error, warn};

use crate::heartbeat::channel::{HeartbeatRegion, MAX_DP_THREADS};

/// Default streak above which a miss is logged
pub const DEFAULT_MISS_LOG_THRESHOLD: u32 = 1;

/// Default streak above which the worker is declared wedged
pub const DEFAULT_MISS_KILL_THRESHOLD: u32 = 60;

/// What the sampler concluded about one thread slot on one tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotObservation {
    /// Slot not published as active; shadow state untouched
    Inactive,
    /// Counter moved since the last tick
    Alive { counter: u32 },
    /// Counter unchanged; `streak` consecutive ticks so far
    Missed { counter: u32, streak: u32 },
    /// Streak crossed the kill threshold; the streak was reset
    Wedged { counter: u32 },
}

/// Result of one sampling pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleReport {
    pub slots: [SlotObservation; MAX_DP_THREADS],
}

impl SampleReport {
    /// True if any slot was declared wedged on this tick
    pub fn wedged(&self) -> bool {
        self.slots
            .iter()
            .any(|o| matches!(o, SlotObservation::Wedged { .. }))
    }

    /// Indices of wedged slots
    pub fn wedged_slots(&self) -> impl Iterator<Item = usize> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, o)| matches!(o, SlotObservation::Wedged { .. }))
            .map(|(i, _)| i)
    }
}

/// Supervisor-private shadow state over a heartbeat region
#[derive(Debug, Clone)]
pub struct HeartbeatSampler {
    last_seen: [u32; MAX_DP_THREADS],
    miss_streak: [u32; MAX_DP_THREADS],
    log_threshold: u32,
    kill_threshold: u32,
}

impl Default for HeartbeatSampler {
    fn default() -> Self {
        Self::new(DEFAULT_MISS_LOG_THRESHOLD, DEFAULT_MISS_KILL_THRESHOLD)
    }
}

impl HeartbeatSampler {
    pub fn new(log_threshold: u32, kill_threshold: u32) -> Self {
        Self {
            last_seen: [0; MAX_DP_THREADS],
            miss_streak: [0; MAX_DP_THREADS],
            log_threshold,
            kill_threshold,
        }
    }

    pub fn last_seen(&self, idx: usize) -> u32 {
        self.last_seen[idx]
    }

    pub fn miss_streak(&self, idx: usize) -> u32 {
        self.miss_streak[idx]
    }

    /// Forget everything observed so far
    pub fn reset(&mut self) {
        self.last_seen = [0; MAX_DP_THREADS];
        self.miss_streak = [0; MAX_DP_THREADS];
    }

    /// Run one tick over `region`
    pub fn sample(&mut self, region: &HeartbeatRegion) -> SampleReport {
        let mut slots = [SlotObservation::Inactive; MAX_DP_THREADS];
        for (idx, observation) in slots.iter_mut().enumerate() {
            if region.is_active(idx) {
                *observation = self.observe(idx, region.counter(idx));
            }
        }
        SampleReport { slots }
    }

    fn observe(&mut self, idx: usize, counter: u32) -> SlotObservation {
        if counter != self.last_seen[idx] {
            self.last_seen[idx] = counter;
            self.miss_streak[idx] = 0;
            return SlotObservation::Alive { counter };
        }

        self.miss_streak[idx] = self.miss_streak[idx].saturating_add(1);
        let streak = self.miss_streak[idx];

        if streak > self.kill_threshold {
            error!(
                slot = idx,
                streak,
                counter,
                "data-plane thread heartbeat lost, declaring worker wedged"
            );
            self.miss_streak[idx] = 0;
            return SlotObservation::Wedged { counter };
        }
        if streak > self.log_threshold {
            warn!(slot = idx, streak, last_seen = counter, "heartbeat missed");
        }
        SlotObservation::Missed { counter, streak }
    }
}
