//! Client configuration.
//!
//! Loading is the embedder's job; this crate only defines the knobs and
//! their defaults. All durations are in milliseconds to keep the struct
//! trivially serializable.

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Default price preference: how many base units of currency one
    /// millisecond of download latency is worth.
    pub price_per_ms: u64,

    /// Extra piece buffers reserved beyond `data_pieces`, covering the
    /// overdrive workers a struggling chunk is expected to launch.
    pub overdrive_margin: u64,

    /// Ceiling on a worker's probe estimate; workers slower than this are
    /// treated as unavailable for the chunk rather than waited on.
    pub probe_estimate_ceiling_ms: u64,

    /// First cooldown after a job failure. Doubles per consecutive failure.
    pub cooldown_base_ms: u64,

    /// Cap on the cooldown doubling exponent.
    pub cooldown_max_exponent: u32,

    /// Total memory budget for in-flight chunk downloads, in bytes.
    pub memory_budget: u64,

    /// Per-piece multiplier for chunk response channel buffers, so workers
    /// never block sending a response.
    pub response_buffer_multiplier: usize,
}

impl ClientConfig {
    pub fn probe_estimate_ceiling(&self) -> Duration {
        Duration::from_millis(self.probe_estimate_ceiling_ms)
    }

    pub fn cooldown_base(&self) -> Duration {
        Duration::from_millis(self.cooldown_base_ms)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            price_per_ms: 1,
            overdrive_margin: 2,
            probe_estimate_ceiling_ms: 5 * 60 * 1000,
            cooldown_base_ms: 1_000,
            cooldown_max_exponent: 6,
            memory_budget: 256 << 20,
            response_buffer_multiplier: 5,
        }
    }
}
