//! Publisher-side muxing
//!
//! A [`MultiMediaSourceMuxer`] collects the tracks of one publisher, waits
//! until they are all ready and then feeds every enabled protocol
//! [`Sink`]. Sinks are built by a [`SinkFactory`] so the muxer stays
//! independent of any wire format.

pub mod config;
pub mod multi;
pub mod pacer;
pub mod sink;
pub mod tracks;

pub use config::MuxerConfig;
pub use multi::{MultiMediaSourceMuxer, MuxerListener};
pub use pacer::FramePacer;
pub use sink::{Sink, SinkFactory, SinkKind, SinkSlots};
pub use tracks::{Readiness, TrackPhase, TrackSet};
