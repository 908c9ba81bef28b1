//! Protocol sink abstraction
//!
//! A sink turns the muxer's track/frame stream into one output format. The
//! muxer owns up to one sink per [`SinkKind`]; a failure inside one sink is
//! local to it and never stops delivery to the others.

use std::sync::{Arc, Weak};

use serde::Serialize;

use crate::media::{Frame, Track};
use crate::registry::{
    MediaSource, MediaSourceEvent, RecordKind, StreamKey, FMP4_SCHEMA, HLS_SCHEMA, MP4_SCHEMA,
    RTMP_SCHEMA, RTSP_SCHEMA, TS_SCHEMA,
};

/// Output kinds a muxer can feed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    Rtsp,
    Rtmp,
    Ts,
    Fmp4,
    Hls,
    Mp4,
}

impl SinkKind {
    pub const ALL: [SinkKind; 6] = [
        SinkKind::Rtsp,
        SinkKind::Rtmp,
        SinkKind::Ts,
        SinkKind::Fmp4,
        SinkKind::Hls,
        SinkKind::Mp4,
    ];

    const fn index(self) -> usize {
        self as usize
    }

    /// Registry schema of the sink's source
    pub const fn schema(self) -> &'static str {
        match self {
            SinkKind::Rtsp => RTSP_SCHEMA,
            SinkKind::Rtmp => RTMP_SCHEMA,
            SinkKind::Ts => TS_SCHEMA,
            SinkKind::Fmp4 => FMP4_SCHEMA,
            SinkKind::Hls => HLS_SCHEMA,
            SinkKind::Mp4 => MP4_SCHEMA,
        }
    }

    /// Recorders keep the muxer enabled without readers
    pub const fn is_recorder(self) -> bool {
        matches!(self, SinkKind::Hls | SinkKind::Mp4)
    }
}

impl From<RecordKind> for SinkKind {
    fn from(kind: RecordKind) -> Self {
        match kind {
            RecordKind::Hls => SinkKind::Hls,
            RecordKind::Mp4 => SinkKind::Mp4,
        }
    }
}

impl std::fmt::Display for SinkKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.schema())
    }
}

/// One output of a muxer
pub trait Sink: Send {
    /// Offer a track; false if the sink cannot carry it
    fn add_track(&mut self, track: &Track) -> bool;

    /// Every track has been added
    fn add_track_completed(&mut self) {}

    /// Feed one frame; false if it was not consumed
    fn input_frame(&mut self, frame: &Frame) -> bool;

    /// Forget all tracks
    fn reset_tracks(&mut self);

    /// Release anything batched
    fn flush(&mut self) {}

    /// Readers attached to this sink's output
    fn reader_count(&self) -> usize {
        0
    }

    /// Route the events of the sink's own source to `listener`
    fn set_listener(&mut self, _listener: Weak<dyn MediaSourceEvent>) {}

    /// The registered source the sink publishes under, if any
    fn source(&self) -> Option<Arc<MediaSource>> {
        None
    }
}

/// Builds sinks for a muxer
pub trait SinkFactory: Send + Sync {
    fn create(&self, kind: SinkKind, key: &StreamKey) -> Option<Box<dyn Sink>>;
}

/// One optional slot per [`SinkKind`]
#[derive(Default)]
pub struct SinkSlots {
    slots: [Option<Box<dyn Sink>>; 6],
}

impl SinkSlots {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, kind: SinkKind) -> Option<&dyn Sink> {
        self.slots[kind.index()].as_deref()
    }

    pub fn get_mut(&mut self, kind: SinkKind) -> Option<&mut Box<dyn Sink>> {
        self.slots[kind.index()].as_mut()
    }

    /// Fill a slot, returning the sink it replaced
    pub fn set(&mut self, kind: SinkKind, sink: Box<dyn Sink>) -> Option<Box<dyn Sink>> {
        self.slots[kind.index()].replace(sink)
    }

    pub fn take(&mut self, kind: SinkKind) -> Option<Box<dyn Sink>> {
        self.slots[kind.index()].take()
    }

    pub fn contains(&self, kind: SinkKind) -> bool {
        self.slots[kind.index()].is_some()
    }

    /// Present sinks with their kind
    pub fn iter(&self) -> impl Iterator<Item = (SinkKind, &dyn Sink)> {
        SinkKind::ALL
            .into_iter()
            .zip(self.slots.iter())
            .filter_map(|(kind, slot)| slot.as_deref().map(|sink| (kind, sink)))
    }

    /// Present sinks, mutably
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Box<dyn Sink>> {
        self.slots.iter_mut().flatten()
    }

    pub fn len(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
