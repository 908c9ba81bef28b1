//! Registry configuration

use std::time::Duration;

use serde::Deserialize;

use crate::events::DEFAULT_EVENT_CAPACITY;

/// Registry and source lifecycle options
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Keep vhosts distinct; when false every key uses the default vhost
    pub enable_vhost: bool,

    /// How long a source must have zero readers before it is reported
    /// (or closed, for auto-close sources)
    #[serde(rename = "no_reader_delay_ms", with = "crate::config::millis")]
    pub no_reader_delay: Duration,

    /// Default wait for `find_async`
    #[serde(rename = "max_stream_wait_ms", with = "crate::config::millis")]
    pub max_stream_wait: Duration,

    /// App whose sources are on-demand VOD
    pub record_app: String,

    /// Capacity of the event bus channel
    pub event_capacity: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            enable_vhost: false,
            no_reader_delay: Duration::from_secs(20),
            max_stream_wait: Duration::from_secs(15),
            record_app: "record".to_string(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl RegistryConfig {
    /// Enable or disable virtual hosts
    pub fn enable_vhost(mut self, enable: bool) -> Self {
        self.enable_vhost = enable;
        self
    }

    /// Set the zero-reader delay
    pub fn no_reader_delay(mut self, delay: Duration) -> Self {
        self.no_reader_delay = delay;
        self
    }

    /// Set the default `find_async` timeout
    pub fn max_stream_wait(mut self, wait: Duration) -> Self {
        self.max_stream_wait = wait;
        self
    }

    /// Set the on-demand VOD app name
    pub fn record_app(mut self, app: impl Into<String>) -> Self {
        self.record_app = app.into();
        self
    }

    /// Set the event bus capacity
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }
}
