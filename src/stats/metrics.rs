//! Byte-rate counters and per-reader flow reports

use std::time::{Duration, Instant};

use serde::Serialize;

/// Length of the window a speed sample is averaged over
const SPEED_WINDOW: Duration = Duration::from_secs(1);

/// Rolling bytes-per-second counter
///
/// Bytes are accumulated into the current window; once the window is older
/// than one second the sample is published and a new window starts.
#[derive(Debug, Clone)]
pub struct BytesSpeed {
    /// Bytes in the open window
    window_bytes: u64,
    /// Start of the open window
    window_start: Instant,
    /// Last published sample (bytes/sec)
    speed: u64,
    /// Bytes since creation
    total: u64,
}

impl Default for BytesSpeed {
    fn default() -> Self {
        Self::new()
    }
}

impl BytesSpeed {
    pub fn new() -> Self {
        Self {
            window_bytes: 0,
            window_start: Instant::now(),
            speed: 0,
            total: 0,
        }
    }

    /// Account for `bytes` transferred now
    pub fn add(&mut self, bytes: usize) {
        self.add_at(bytes, Instant::now());
    }

    /// Current speed in bytes per second
    pub fn speed(&mut self) -> u64 {
        self.speed_at(Instant::now())
    }

    /// Bytes since the counter was created
    pub fn total(&self) -> u64 {
        self.total
    }

    fn add_at(&mut self, bytes: usize, now: Instant) {
        self.roll(now);
        self.window_bytes += bytes as u64;
        self.total += bytes as u64;
    }

    fn speed_at(&mut self, now: Instant) -> u64 {
        self.roll(now);
        self.speed
    }

    fn roll(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed < SPEED_WINDOW {
            return;
        }
        let millis = elapsed.as_millis().max(1) as u64;
        self.speed = self.window_bytes * 1000 / millis;
        self.window_bytes = 0;
        self.window_start = now;
    }
}

/// Traffic summary emitted when a reader detaches from a source
#[derive(Debug, Clone, Serialize)]
pub struct FlowReport {
    /// Bytes delivered to the reader
    pub total_bytes: u64,
    /// How long the reader was attached
    #[serde(with = "crate::config::millis")]
    pub duration: Duration,
    /// Whether the reader was a player (as opposed to a relay)
    pub is_player: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_speed_published_per_window() {
        let start = Instant::now();
        let mut speed = BytesSpeed {
            window_start: start,
            ..BytesSpeed::new()
        };

        speed.add_at(1000, start);
        speed.add_at(1000, start + Duration::from_millis(500));
        assert_eq!(speed.speed_at(start + Duration::from_millis(900)), 0);

        assert_eq!(speed.speed_at(start + Duration::from_secs(2)), 1000);
        assert_eq!(speed.total(), 2000);
    }

    #[test]
    fn test_flow_report_serializes_millis() {
        let report = FlowReport {
            total_bytes: 4096,
            duration: Duration::from_millis(1500),
            is_player: true,
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["duration"], 1500);
        assert_eq!(json["total_bytes"], 4096);
    }
}
