//! Aggregate configuration
//!
//! [`MediaConfig`] groups the per-area sections so a host process can load
//! everything from a single document:
//!
//! ```json
//! {
//!   "registry": { "enable_vhost": true, "no_reader_delay_ms": 5000 },
//!   "muxer": { "merge_write_ms": 300, "enable_hls": true }
//! }
//! ```
//!
//! Missing keys fall back to their defaults.

use serde::Deserialize;

use crate::muxer::MuxerConfig;
use crate::registry::RegistryConfig;

/// Top-level configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    /// Registry and source lifecycle
    pub registry: RegistryConfig,
    /// Muxer, sinks and pacing
    pub muxer: MuxerConfig,
}

impl MediaConfig {
    /// Replace the registry section
    pub fn registry(mut self, registry: RegistryConfig) -> Self {
        self.registry = registry;
        self
    }

    /// Replace the muxer section
    pub fn muxer(mut self, muxer: MuxerConfig) -> Self {
        self.muxer = muxer;
        self
    }
}

/// (De)serialize a `Duration` as integer milliseconds
pub(crate) mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
