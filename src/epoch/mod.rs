//! Epoch clock for pseudonym rotation
//!
//! Maps wall-clock time onto monotonically increasing 6-hour epochs counted
//! from the fixed network genesis instant (2025-01-01T00:00:00Z). Both the
//! sender and the recipient derive the same epoch without coordination, which
//! is what lets them agree on pseudonym keys.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::protocol::constants::{EPOCH_DURATION, GENESIS_UNIX_SECS, MAX_EPOCH_LAG};

/// Deterministic wall-time to epoch mapping
#[derive(Debug, Clone)]
pub struct EpochClock {
    genesis: SystemTime,
}

impl Default for EpochClock {
    fn default() -> Self {
        Self::new()
    }
}

impl EpochClock {
    /// Clock anchored at the network genesis instant
    pub fn new() -> Self {
        Self {
            genesis: UNIX_EPOCH + Duration::from_secs(GENESIS_UNIX_SECS),
        }
    }

    /// Clock with a custom genesis, for tests
    pub fn with_genesis(genesis: SystemTime) -> Self {
        Self { genesis }
    }

    /// The epoch containing the current instant
    pub fn current_epoch(&self) -> u64 {
        self.epoch_at(SystemTime::now())
    }

    /// The epoch containing `t`. Times before genesis clamp to epoch 0.
    pub fn epoch_at(&self, t: SystemTime) -> u64 {
        match t.duration_since(self.genesis) {
            Ok(elapsed) => elapsed.as_secs() / EPOCH_DURATION.as_secs(),
            Err(_) => 0,
        }
    }

    /// First instant of epoch `e`
    pub fn epoch_start(&self, e: u64) -> SystemTime {
        self.genesis + Duration::from_secs(e * EPOCH_DURATION.as_secs())
    }

    /// Last instant of epoch `e` (one nanosecond before the next epoch)
    pub fn epoch_end(&self, e: u64) -> SystemTime {
        self.epoch_start(e + 1) - Duration::from_nanos(1)
    }

    /// Whether epoch `e` is inside the acceptance window right now
    pub fn is_valid(&self, e: u64) -> bool {
        self.is_valid_at(e, SystemTime::now())
    }

    /// Whether epoch `e` is inside the acceptance window at time `now`:
    /// not in the future, and at most `MAX_EPOCH_LAG` epochs behind.
    pub fn is_valid_at(&self, e: u64, now: SystemTime) -> bool {
        let current = self.epoch_at(now);
        e <= current && current - e <= MAX_EPOCH_LAG
    }

    /// Epochs a recipient should query, newest first, truncated at epoch 0
    pub fn recent_epochs(&self) -> Vec<u64> {
        self.recent_epochs_at(SystemTime::now())
    }

    /// Recent epochs relative to `now`
    pub fn recent_epochs_at(&self, now: SystemTime) -> Vec<u64> {
        let current = self.epoch_at(now);
        let oldest = current.saturating_sub(MAX_EPOCH_LAG);
        (oldest..=current).rev().collect()
    }
}
