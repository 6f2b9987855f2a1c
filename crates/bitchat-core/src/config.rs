//! Engine configuration.
//!
//! Every field has a default, so a config file only needs to name what it
//! changes. Durations are plain integers (seconds or milliseconds as the
//! field name says) to keep the JSON form readable.

use crate::error::{Error, Result};
use crate::MAX_TTL;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables of one protocol engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Display name sent in announcements and messages.
    pub nickname: String,
    /// TTL of packets we originate. Defaults to and is capped at [`MAX_TTL`].
    pub max_ttl: u8,
    /// Expected distinct packets between bloom filter resets.
    pub bloom_expected_items: usize,
    /// Target false-positive rate of the bloom filter.
    pub bloom_false_positive_rate: f64,
    /// Clear the bloom filter at least this often.
    pub bloom_reset_interval_secs: u64,
    /// Clear the bloom filter after this many insertions.
    pub bloom_reset_after_insertions: usize,
    /// Abort handshakes that do not complete in time.
    pub handshake_timeout_secs: u64,
    /// Mark peers disconnected after this much silence.
    pub peer_stale_after_secs: u64,
    /// Period of the maintenance tick.
    pub maintenance_interval_millis: u64,
    /// Forget partially received fragmented packets after this long.
    pub fragment_timeout_secs: u64,
    /// Sign public broadcast messages.
    pub sign_broadcasts: bool,
    /// Capacity of the event broadcast channel.
    pub event_channel_capacity: usize,
    /// Capacity of the inbound frame queue.
    pub inbound_queue_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            nickname: "anon".to_string(),
            max_ttl: MAX_TTL,
            bloom_expected_items: 1000,
            bloom_false_positive_rate: 0.01,
            bloom_reset_interval_secs: 300,
            bloom_reset_after_insertions: 1000,
            handshake_timeout_secs: 30,
            peer_stale_after_secs: 180,
            maintenance_interval_millis: 10_000,
            fragment_timeout_secs: 30,
            sign_broadcasts: false,
            event_channel_capacity: 256,
            inbound_queue_capacity: 1024,
        }
    }
}

impl EngineConfig {
    /// Default config with a nickname.
    pub fn with_nickname(nickname: impl Into<String>) -> Self {
        Self {
            nickname: nickname.into(),
            ..Self::default()
        }
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_ttl == 0 {
            return Err(Error::Config("max_ttl must be at least 1".into()));
        }
        if !(self.bloom_false_positive_rate > 0.0 && self.bloom_false_positive_rate < 1.0) {
            return Err(Error::Config(
                "bloom_false_positive_rate must be between 0 and 1".into(),
            ));
        }
        if self.bloom_reset_after_insertions == 0 {
            return Err(Error::Config("bloom_reset_after_insertions must be positive".into()));
        }
        if self.maintenance_interval_millis == 0 {
            return Err(Error::Config("maintenance_interval_millis must be positive".into()));
        }
        if self.event_channel_capacity == 0 || self.inbound_queue_capacity == 0 {
            return Err(Error::Config("channel capacities must be positive".into()));
        }
        Ok(())
    }

    /// TTL for originated packets.
    pub fn effective_ttl(&self) -> u8 {
        self.max_ttl.clamp(1, MAX_TTL)
    }

    /// Bloom reset interval.
    pub fn bloom_reset_interval(&self) -> Duration {
        Duration::from_secs(self.bloom_reset_interval_secs)
    }

    /// Handshake timeout.
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    /// Peer staleness threshold.
    pub fn peer_stale_after(&self) -> Duration {
        Duration::from_secs(self.peer_stale_after_secs)
    }

    /// Maintenance tick period.
    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_millis(self.maintenance_interval_millis)
    }

    /// Fragment reassembly timeout.
    pub fn fragment_timeout(&self) -> Duration {
        Duration::from_secs(self.fragment_timeout_secs)
    }
}
