//! Media source registry and multi-sink fan-out engine
//!
//! `mediahub` is the core a streaming server is built around: it names every
//! live stream, arbitrates who may publish it, lets consumers find it (now or
//! once it appears) and fans one publisher's tracks out to every protocol
//! output, with a look-back cache so late joiners start at a keyframe.
//!
//! ```text
//!   publisher ──► MultiMediaSourceMuxer ──┬──► Sink (rtsp) ──► MediaSource ──► readers
//!                                         ├──► Sink (rtmp) ──► MediaSource ──► readers
//!                                         └──► LookbackRing ──► RTP fan-out
//!
//!   MediaRegistry: (schema, vhost, app, stream) → Weak<MediaSource>
//!   EventBus:      Registered / Unregistered / NotFound / NoReader / ...
//! ```
//!
//! Wire protocols, codec parsing and file I/O are left to the host: they
//! plug in through the [`Sink`] and [`MediaSourceEvent`] traits.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use mediahub::{FanoutSinkFactory, MediaRegistry, MultiMediaSourceMuxer, MuxerConfig, StreamKey};
//!
//! # async fn run() {
//! let registry = MediaRegistry::global().clone();
//! let config = MuxerConfig::default();
//! let factory = Arc::new(FanoutSinkFactory::new(registry.clone(), config.clone()));
//! let muxer = MultiMediaSourceMuxer::new(
//!     &registry,
//!     StreamKey::new("", "", "live", "cam1"),
//!     config,
//!     factory,
//! );
//! # let _ = muxer;
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod events;
pub mod media;
pub mod muxer;
pub mod poller;
pub mod registry;
pub mod sink;
pub mod stats;

pub use cache::{FlushPolicy, FrameBatch, LookbackRing, MergeWriteCache, RingReader};
pub use config::MediaConfig;
pub use error::{Error, Result};
pub use events::{EventBus, MediaEvent, NotFoundResponder};
pub use media::{CodecId, Frame, MediaType, StampSync, Track};
pub use muxer::{
    MultiMediaSourceMuxer, MuxerConfig, MuxerListener, Sink, SinkFactory, SinkKind, TrackPhase,
};
pub use poller::{DelayTask, Poller, PollerPool};
pub use registry::{
    MediaRegistry, MediaSource, MediaSourceEvent, OnDemandFactory, OriginType, RecordKind,
    RegistryConfig, RegistryError, SendRtpArgs, SourceReader, StreamKey,
};
pub use sink::{FanoutSink, FanoutSinkFactory};
pub use stats::{BytesSpeed, FlowReport};
