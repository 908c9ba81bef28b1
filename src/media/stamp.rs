//! Cross-track timestamp alignment
//!
//! Publishers frequently start audio and video at unrelated timestamps.
//! [`StampSync`] rebases every track onto a shared zero-based timeline: the
//! reference track (the first one that was added) starts at zero and every
//! other track starts at the reference track's current position. Output
//! timestamps never move backwards within a track; a regression re-anchors
//! the track so it continues from its last output.

use super::frame::Frame;
use super::track::MediaType;

#[derive(Debug, Clone, Copy, Default)]
struct TrackClock {
    /// Added to input dts; `None` until the first frame is seen
    offset: Option<i64>,
    last_out: u64,
}

/// Rebases frame timestamps of several tracks onto a single timeline
#[derive(Debug, Clone, Default)]
pub struct StampSync {
    reference: Option<MediaType>,
    clocks: [TrackClock; 2],
}

impl StampSync {
    pub fn new() -> Self {
        Self::default()
    }

    /// Choose the track every other track aligns to
    pub fn set_reference(&mut self, media: MediaType) {
        self.reference = Some(media);
    }

    pub fn reference(&self) -> Option<MediaType> {
        self.reference
    }

    /// Forget every track's anchor
    pub fn reset(&mut self) {
        self.clocks = Default::default();
    }

    /// Rebase one frame
    pub fn rebase(&mut self, frame: &Frame) -> Frame {
        let media = frame.media_type();
        let reference = *self.reference.get_or_insert(media);
        let start = if media == reference {
            0
        } else {
            self.clocks[reference.index()].last_out
        };

        let clock = &mut self.clocks[media.index()];
        let dts = frame.dts as i64;
        let offset = *clock.offset.get_or_insert(start as i64 - dts);

        let mut out = (dts + offset).max(0) as u64;
        if out < clock.last_out {
            clock.offset = Some(clock.last_out as i64 - dts);
            out = clock.last_out;
        }
        clock.last_out = out;

        let composition = frame.pts as i64 - dts;
        let pts = (out as i64 + composition).max(out as i64) as u64;
        frame.with_stamps(out, pts)
    }
}
