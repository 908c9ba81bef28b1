//! Track readiness state machine
//!
//! ```text
//!   CollectingTracks ──(all ready | timeouts)──► AllTracksReady ──► Active
//!          ▲                                                          │
//!          └──────────────────────── reset ───────────────────────────┘
//! ```
//!
//! While collecting, tracks may be added (subject to the track limit) and
//! frames of added tracks are buffered. A track is ready once it has
//! produced a frame and its decoder configuration is known. The set becomes
//! ready when every track is ready and either the target count is reached,
//! or a single track has waited `wait_add_track` for company. After
//! `wait_track_ready` the set becomes ready regardless, dropping tracks that
//! never became ready.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde::Serialize;

use super::config::MuxerConfig;
use crate::media::{Frame, MediaType, Track};

/// Muxer lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TrackPhase {
    CollectingTracks,
    AllTracksReady,
    Active,
}

#[derive(Debug)]
struct TrackSlot {
    track: Track,
    got_frame: bool,
    unready: VecDeque<Frame>,
}

impl TrackSlot {
    fn is_ready(&self) -> bool {
        self.got_frame && self.track.is_ready()
    }
}

/// Result of a successful readiness check
#[derive(Debug, Default)]
pub struct Readiness {
    /// Tracks removed because they never became ready
    pub dropped: Vec<Track>,
}

/// Tracks of one muxer and their readiness
#[derive(Debug)]
pub struct TrackSet {
    slots: Vec<TrackSlot>,
    phase: TrackPhase,
    target: usize,
    default_target: usize,
    max_tracks: usize,
    enable_audio: bool,
    multi_track: bool,
    unready_cap: usize,
    wait_track_ready: Duration,
    wait_add_track: Duration,
    /// Time of the most recent add
    since: Instant,
}

impl TrackSet {
    pub fn new(config: &MuxerConfig, now: Instant) -> Self {
        Self {
            slots: Vec::new(),
            phase: TrackPhase::CollectingTracks,
            target: config.track_target(),
            default_target: config.track_target(),
            max_tracks: config.track_target(),
            enable_audio: config.enable_audio,
            multi_track: config.multi_track,
            unready_cap: config.unready_frame_cache,
            wait_track_ready: config.wait_track_ready,
            wait_add_track: config.wait_add_track,
            since: now,
        }
    }

    pub fn phase(&self) -> TrackPhase {
        self.phase
    }

    pub(crate) fn set_phase(&mut self, phase: TrackPhase) {
        self.phase = phase;
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn has_video(&self) -> bool {
        self.slots
            .iter()
            .any(|s| s.track.media_type() == MediaType::Video)
    }

    /// Media type of the first track added
    pub fn first_media_type(&self) -> Option<MediaType> {
        self.slots.first().map(|s| s.track.media_type())
    }

    /// Accept a track unless it violates the limits or arrives too late
    pub fn add(&mut self, track: Track, now: Instant) -> bool {
        if self.phase != TrackPhase::CollectingTracks {
            tracing::warn!(track = %track, "All tracks ready, late track rejected");
            return false;
        }
        if track.media_type() == MediaType::Audio && !self.enable_audio {
            tracing::debug!(track = %track, "Audio disabled, track ignored");
            return false;
        }
        if self.slots.len() >= self.max_tracks {
            tracing::warn!(track = %track, max = self.max_tracks, "Track limit reached");
            return false;
        }
        if !self.multi_track
            && self
                .slots
                .iter()
                .any(|s| s.track.media_type() == track.media_type())
        {
            tracing::warn!(track = %track, "Duplicate media type rejected");
            return false;
        }

        self.slots.push(TrackSlot {
            track,
            got_frame: false,
            unready: VecDeque::new(),
        });
        self.since = now;
        true
    }

    /// The publisher will add no more tracks
    pub fn complete(&mut self) {
        if !self.slots.is_empty() {
            self.target = self.slots.len();
        }
    }

    /// Index of the track a frame belongs to
    pub fn route(&self, frame: &Frame) -> Option<usize> {
        if self.multi_track {
            if let Some(idx) = self.slots.iter().position(|s| s.track.codec() == frame.codec) {
                return Some(idx);
            }
        }
        self.slots
            .iter()
            .position(|s| s.track.media_type() == frame.media_type())
    }

    /// Record that a track produced a frame, learning its decoder
    /// configuration from config frames
    pub fn on_frame(&mut self, idx: usize, frame: &Frame) {
        let Some(slot) = self.slots.get_mut(idx) else {
            return;
        };
        slot.got_frame = true;
        if frame.is_config && slot.track.extra_data().is_none() {
            slot.track.set_extra_data(frame.data.clone());
        }
    }

    /// Hold a frame until every track is ready; overflow discards the
    /// track's buffer
    pub fn buffer(&mut self, idx: usize, frame: Frame) {
        let Some(slot) = self.slots.get_mut(idx) else {
            return;
        };
        if slot.unready.len() >= self.unready_cap {
            tracing::warn!(
                track = %slot.track,
                cached = slot.unready.len(),
                "Too many frames before tracks ready, dropping cache"
            );
            slot.unready.clear();
        }
        slot.unready.push_back(frame);
    }

    /// Decide whether collection is over
    ///
    /// On success the phase moves to `AllTracksReady`.
    pub fn poll_ready(&mut self, now: Instant) -> Option<Readiness> {
        if self.phase != TrackPhase::CollectingTracks || self.slots.is_empty() {
            return None;
        }
        let elapsed = now.saturating_duration_since(self.since);

        if elapsed > self.wait_track_ready {
            let (ready, unready): (Vec<_>, Vec<_>) =
                self.slots.drain(..).partition(TrackSlot::is_ready);
            self.slots = ready;
            let dropped: Vec<Track> = unready.into_iter().map(|s| s.track).collect();
            for track in &dropped {
                tracing::warn!(track = %track, "Track not ready in time, dropped");
            }
            if self.slots.is_empty() {
                return None;
            }
            self.phase = TrackPhase::AllTracksReady;
            return Some(Readiness { dropped });
        }

        if !self.slots.iter().all(TrackSlot::is_ready) {
            return None;
        }
        let enough = self.slots.len() >= self.target
            || (self.slots.len() == 1 && elapsed > self.wait_add_track);
        if !enough {
            return None;
        }
        self.phase = TrackPhase::AllTracksReady;
        Some(Readiness::default())
    }

    /// Drain buffered frames in decode order
    pub fn take_buffered(&mut self) -> Vec<Frame> {
        let mut frames: Vec<Frame> = self
            .slots
            .iter_mut()
            .flat_map(|s| s.unready.drain(..))
            .collect();
        frames.sort_by_key(|f| f.dts);
        frames
    }

    pub fn tracks(&self, ready_only: bool) -> Vec<Track> {
        self.slots
            .iter()
            .filter(|s| !ready_only || s.is_ready())
            .map(|s| s.track.clone())
            .collect()
    }

    /// Describe the tracks for logging
    pub fn describe(&self) -> String {
        self.slots
            .iter()
            .map(|s| s.track.to_string())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Forget every track and start collecting again
    pub fn reset(&mut self, now: Instant) {
        self.slots.clear();
        self.target = self.default_target;
        self.phase = TrackPhase::CollectingTracks;
        self.since = now;
    }
}
