//! Muxer configuration

use std::time::Duration;

use serde::Deserialize;

use super::sink::SinkKind;

/// Muxer, sink and pacing options
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MuxerConfig {
    /// Merge-write window in ms (0 disables merging)
    pub merge_write_ms: u64,

    /// Maximum tracks per source
    pub max_track_count: usize,

    /// Give up on tracks that produced no frame after this long
    #[serde(rename = "wait_track_ready_ms", with = "crate::config::millis")]
    pub wait_track_ready: Duration,

    /// With a single track, stop waiting for a second one after this long
    #[serde(rename = "wait_add_track_ms", with = "crate::config::millis")]
    pub wait_add_track: Duration,

    /// Frames buffered per track before every track is ready
    pub unready_frame_cache: usize,

    /// Accept audio tracks
    pub enable_audio: bool,

    /// Allow several tracks of the same media type
    pub multi_track: bool,

    /// Entries retained by the look-back rings
    pub ring_capacity: usize,

    /// Smooth bursty input into a steady output cadence
    pub enable_pacing: bool,

    /// Pacer tick and depth increment
    #[serde(rename = "pacing_quantum_ms", with = "crate::config::millis")]
    pub pacing_quantum: Duration,

    /// Queue length that triggers a catch-up flush
    pub pacing_backlog_cap: usize,

    pub enable_rtsp: bool,
    pub enable_rtmp: bool,
    pub enable_ts: bool,
    pub enable_fmp4: bool,
    pub enable_hls: bool,
    pub enable_mp4: bool,

    /// Rebase timestamps onto the first track's timeline
    pub modify_stamp: bool,
}

impl Default for MuxerConfig {
    fn default() -> Self {
        Self {
            merge_write_ms: 0,
            max_track_count: 2,
            wait_track_ready: Duration::from_secs(10),
            wait_add_track: Duration::from_secs(3),
            unready_frame_cache: 100,
            enable_audio: true,
            multi_track: false,
            ring_capacity: 1024,
            enable_pacing: false,
            pacing_quantum: Duration::from_millis(40),
            pacing_backlog_cap: 125,
            enable_rtsp: true,
            enable_rtmp: true,
            enable_ts: true,
            enable_fmp4: true,
            enable_hls: false,
            enable_mp4: false,
            modify_stamp: true,
        }
    }
}

impl MuxerConfig {
    /// Pacer tick period, never shorter than a millisecond
    pub fn pacing_period(&self) -> Duration {
        self.pacing_quantum.max(Duration::from_millis(1))
    }

    /// Whether a sink kind is created up front
    pub fn is_sink_enabled(&self, kind: SinkKind) -> bool {
        match kind {
            SinkKind::Rtsp => self.enable_rtsp,
            SinkKind::Rtmp => self.enable_rtmp,
            SinkKind::Ts => self.enable_ts,
            SinkKind::Fmp4 => self.enable_fmp4,
            SinkKind::Hls => self.enable_hls,
            SinkKind::Mp4 => self.enable_mp4,
        }
    }

    /// Enable or disable one sink kind
    pub fn sink(mut self, kind: SinkKind, enable: bool) -> Self {
        match kind {
            SinkKind::Rtsp => self.enable_rtsp = enable,
            SinkKind::Rtmp => self.enable_rtmp = enable,
            SinkKind::Ts => self.enable_ts = enable,
            SinkKind::Fmp4 => self.enable_fmp4 = enable,
            SinkKind::Hls => self.enable_hls = enable,
            SinkKind::Mp4 => self.enable_mp4 = enable,
        }
        self
    }

    /// Only the given sink kinds
    pub fn only_sinks(self, kinds: &[SinkKind]) -> Self {
        SinkKind::ALL
            .iter()
            .fold(self, |config, kind| config.sink(*kind, kinds.contains(kind)))
    }

    /// Set the merge-write window
    pub fn merge_write_ms(mut self, ms: u64) -> Self {
        self.merge_write_ms = ms;
        self
    }

    /// Set the maximum track count
    pub fn max_track_count(mut self, count: usize) -> Self {
        self.max_track_count = count.max(1);
        self
    }

    /// Accept or ignore audio tracks
    pub fn enable_audio(mut self, enable: bool) -> Self {
        self.enable_audio = enable;
        self
    }

    /// Allow several tracks of one media type
    pub fn multi_track(mut self, enable: bool) -> Self {
        self.multi_track = enable;
        self
    }

    /// Set ring capacity
    pub fn ring_capacity(mut self, capacity: usize) -> Self {
        self.ring_capacity = capacity.max(1);
        self
    }

    /// Enable output pacing
    pub fn pacing(mut self, enable: bool) -> Self {
        self.enable_pacing = enable;
        self
    }

    /// Set track readiness timeouts
    pub fn track_timeouts(mut self, wait_track_ready: Duration, wait_add_track: Duration) -> Self {
        self.wait_track_ready = wait_track_ready;
        self.wait_add_track = wait_add_track;
        self
    }

    /// Keep publisher timestamps untouched
    pub fn modify_stamp(mut self, enable: bool) -> Self {
        self.modify_stamp = enable;
        self
    }

    /// Track count needed before all tracks are ready
    pub(crate) fn track_target(&self) -> usize {
        if self.enable_audio {
            self.max_track_count
        } else {
            1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_sinks() {
        let config = MuxerConfig::default();
        assert!(config.is_sink_enabled(SinkKind::Rtsp));
        assert!(config.is_sink_enabled(SinkKind::Fmp4));
        assert!(!config.is_sink_enabled(SinkKind::Hls));
        assert!(!config.is_sink_enabled(SinkKind::Mp4));
    }

    #[test]
    fn test_only_sinks() {
        let config = MuxerConfig::default().only_sinks(&[SinkKind::Rtmp, SinkKind::Hls]);
        let enabled: Vec<_> = SinkKind::ALL
            .into_iter()
            .filter(|k| config.is_sink_enabled(*k))
            .collect();
        assert_eq!(enabled, vec![SinkKind::Rtmp, SinkKind::Hls]);
    }

    #[test]
    fn test_audio_disabled_targets_one_track() {
        assert_eq!(MuxerConfig::default().track_target(), 2);
        assert_eq!(MuxerConfig::default().enable_audio(false).track_target(), 1);
    }
}
