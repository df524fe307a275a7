//! Network tuning knobs. Every field has a default so partial config files work.

use serde::Deserialize;
use std::time::Duration;

use crate::wire::DEFAULT_MAX_FRAME_LEN;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NetworkConfig {
    /// Peers kept before the store starts evicting the oldest (default 10).
    #[serde(default = "default_peer_capacity")]
    pub peer_capacity: usize,
    /// Seconds between capacity sweeps (default 10).
    #[serde(default = "default_eviction_interval_secs")]
    pub eviction_interval_secs: u64,
    /// Bound of each per-peer message queue (default 64).
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Largest frame accepted or sent, in bytes (default 16 MiB).
    #[serde(default = "default_max_frame_len")]
    pub max_frame_len: u32,
    /// Events buffered per subscriber before it lags (default 256).
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_peer_capacity() -> usize {
    10
}
fn default_eviction_interval_secs() -> u64 {
    10
}
fn default_queue_capacity() -> usize {
    64
}
fn default_max_frame_len() -> u32 {
    DEFAULT_MAX_FRAME_LEN
}
fn default_event_capacity() -> usize {
    256
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            peer_capacity: default_peer_capacity(),
            eviction_interval_secs: default_eviction_interval_secs(),
            queue_capacity: default_queue_capacity(),
            max_frame_len: default_max_frame_len(),
            event_capacity: default_event_capacity(),
        }
    }
}

impl NetworkConfig {
    /// Sweep period; never zero.
    pub fn eviction_interval(&self) -> Duration {
        Duration::from_secs(self.eviction_interval_secs.max(1))
    }
}
