//! Channel configuration.
//!
//! Resolution order: environment variables → caller-provided values → defaults.
//! Every knob has a working default; `ChannelConfig::default()` is what the
//! protocols run with unless the embedding application says otherwise.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tuning for both protocol channels.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Base request timeout in milliseconds.
    pub request_timeout_base_ms: u64,
    /// Added to the base per call already pending at send time. A loaded
    /// channel times out later, trading fast failure for fewer spurious
    /// timeouts.
    pub request_timeout_increment_ms: u64,
    /// Maximum payload bytes per CHUNK_DATA frame.
    pub chunk_size: usize,
    /// Default queued-bytes threshold handed to in-process raw channels.
    /// The raw channel owns the authoritative threshold.
    pub low_buffer_threshold: usize,
    /// Receiver-side inactivity bound for a partial transfer. An assembly
    /// that receives nothing for this long is discarded and reported as
    /// timed out. 0 = never expire.
    pub transfer_timeout_secs: u64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            request_timeout_base_ms: 1000,
            request_timeout_increment_ms: 500,
            chunk_size: 16 * 1024,
            low_buffer_threshold: 64 * 1024,
            transfer_timeout_secs: 30,
        }
    }
}

impl ChannelConfig {
    /// Defaults with `STRAND_*` env var overrides applied.
    pub fn load() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Timeout for a call registered while `pending` others are in flight.
    pub fn request_timeout(&self, pending: usize) -> Duration {
        Duration::from_millis(
            self.request_timeout_base_ms
                + self.request_timeout_increment_ms * pending as u64,
        )
    }

    /// Receiver-side transfer inactivity bound. `None` = never expire.
    pub fn transfer_timeout(&self) -> Option<Duration> {
        (self.transfer_timeout_secs > 0)
            .then(|| Duration::from_secs(self.transfer_timeout_secs))
    }

    /// Apply STRAND_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Some(v) = env_parse("STRAND_REQUEST_TIMEOUT_BASE_MS") {
            self.request_timeout_base_ms = v;
        }
        if let Some(v) = env_parse("STRAND_REQUEST_TIMEOUT_INCREMENT_MS") {
            self.request_timeout_increment_ms = v;
        }
        if let Some(v) = env_parse("STRAND_CHUNK_SIZE") {
            self.chunk_size = v;
        }
        if let Some(v) = env_parse("STRAND_LOW_BUFFER_THRESHOLD") {
            self.low_buffer_threshold = v;
        }
        if let Some(v) = env_parse("STRAND_TRANSFER_TIMEOUT_SECS") {
            self.transfer_timeout_secs = v;
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}
