//! Media source registry
//!
//! The registry indexes every live [`MediaSource`] by
//! `(schema, vhost, app, stream)` and lets consumers find them, now or
//! asynchronously once they appear.
//!
//! # Architecture
//!
//! ```text
//!                        Arc<MediaRegistry>
//!                  ┌──────────────────────────────┐
//!                  │ schema → vhost → app → stream │
//!                  │        → Weak<MediaSource>    │
//!                  └──────────────┬───────────────┘
//!                                 │ Registered / Unregistered / NotFound ...
//!                                 ▼
//!                             EventBus ──► listeners, pending find_async
//!
//!   MediaSource ──(weak)──► MediaSourceEvent delegate (session or muxer)
//! ```
//!
//! # Ownership
//!
//! The registry holds weak handles only. Whoever produces the media owns
//! the source; dropping it unregisters it.

pub mod config;
pub mod error;
pub mod event;
pub mod key;
pub mod source;
pub mod store;

pub use config::RegistryConfig;
pub use error::RegistryError;
pub use event::{MediaSourceEvent, NoReaderTimer, OriginType, RecordKind, SendRtpArgs};
pub use key::{
    StreamKey, DEFAULT_VHOST, FMP4_SCHEMA, HLS_SCHEMA, MP4_SCHEMA, RTMP_SCHEMA, RTSP_SCHEMA, TS_SCHEMA,
};
pub use source::{MediaSource, Ownership, SourceReader};
pub use store::{MediaRegistry, OnDemandFactory};
