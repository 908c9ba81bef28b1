//! Source event delegation
//!
//! A [`MediaSource`] does not know how to seek, pause or close the stream it
//! describes; the publisher session (or a muxer standing in front of it)
//! does. Those requests are forwarded to a weakly held
//! [`MediaSourceEvent`] delegate. Every method has a default so delegates
//! only implement what they support.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use super::error::RegistryError;
use super::source::MediaSource;
use crate::cache::RingReader;
use crate::events::MediaEvent;
use crate::media::{Frame, MediaType, Track};
use crate::poller::{DelayTask, Poller};

/// How the media of a source entered the process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OriginType {
    #[default]
    Unknown,
    RtmpPush,
    RtspPush,
    RtpPush,
    Pull,
    FfmpegPull,
    Mp4Vod,
    DeviceChn,
    RtcPush,
    SrtPush,
}

/// Recorder kinds that can be toggled at runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Hls,
    Mp4,
}

/// Parameters of an RTP-proxy fan-out
#[derive(Debug, Clone, Default)]
pub struct SendRtpArgs {
    /// Identifies the fan-out; reusing an SSRC replaces the old reader
    pub ssrc: String,
    pub dst_url: String,
    pub dst_port: u16,
    pub src_port: u16,
    pub is_udp: bool,
    /// Wrap payload in MPEG-PS rather than sending raw ES
    pub use_ps: bool,
    pub only_audio: bool,
    pub payload_type: u8,
}

/// Requests a source forwards to whoever produces its media
///
/// Implementations are held weakly; a source never keeps its delegate
/// alive. `on_registered` runs synchronously in the registering context, so
/// it must not call back into the object that triggered the registration.
pub trait MediaSourceEvent: Send + Sync {
    fn origin_type(&self, _sender: &MediaSource) -> OriginType {
        OriginType::Unknown
    }

    fn origin_url(&self, sender: &MediaSource) -> String {
        sender.key().url()
    }

    fn seek_to(&self, _sender: &MediaSource, _stamp: u64) -> bool {
        false
    }

    fn pause(&self, _sender: &MediaSource, _pause: bool) -> bool {
        false
    }

    fn speed(&self, _sender: &MediaSource, _speed: f32) -> bool {
        false
    }

    /// Tear the stream down
    fn close(&self, _sender: &MediaSource) -> bool {
        false
    }

    /// Readers across every output of the stream; `None` defers to the
    /// source's own count
    fn total_reader_count(&self, _sender: &MediaSource) -> Option<usize> {
        None
    }

    /// Called on the owning poller whenever a source's reader count changes
    fn on_reader_changed(&self, sender: &Arc<MediaSource>, count: usize) {
        sender.no_reader_timer().on_reader_changed(sender, count);
    }

    fn on_registered(&self, _sender: &MediaSource, _registered: bool) {}

    fn loss_rate(&self, _sender: &MediaSource, _media: MediaType) -> Option<f32> {
        None
    }

    /// Poller the delegate runs on
    fn owner_poller(&self) -> Option<Poller> {
        None
    }

    fn setup_record(&self, _sender: &MediaSource, _kind: RecordKind, _start: bool) -> bool {
        false
    }

    fn is_recording(&self, _sender: &MediaSource, _kind: RecordKind) -> bool {
        false
    }

    fn tracks(&self, _sender: &MediaSource, _ready_only: bool) -> Vec<Track> {
        Vec::new()
    }

    fn start_send_rtp(
        &self,
        sender: &MediaSource,
        _args: SendRtpArgs,
    ) -> Result<RingReader<Frame>, RegistryError> {
        Err(RegistryError::Unsupported(sender.key().clone()))
    }

    /// Stop one fan-out, or all of them for an empty `ssrc`
    fn stop_send_rtp(&self, _sender: &MediaSource, _ssrc: &str) -> bool {
        false
    }
}

/// Zero-reader delay timer
///
/// When a reader count drops to zero the timer is armed for the registry's
/// `no_reader_delay`. If the total count is still zero when it fires, an
/// auto-close source is closed and any other source is announced with
/// [`MediaEvent::NoReader`]. A non-zero count disarms it.
#[derive(Debug, Default)]
pub struct NoReaderTimer {
    task: Mutex<Option<DelayTask>>,
}

impl NoReaderTimer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_reader_changed(&self, sender: &Arc<MediaSource>, count: usize) {
        if count > 0 || sender.total_reader_count() > 0 {
            self.cancel();
            return;
        }

        let delay = sender.registry().config().no_reader_delay;
        let weak = Arc::downgrade(sender);
        let task = sender.owner_poller().delay(delay, move || {
            let Some(source) = weak.upgrade() else {
                return;
            };
            let readers = source.total_reader_count();
            if readers > 0 {
                tracing::debug!(stream = %source.key(), readers, "Readers returned before delay");
                return;
            }
            source.on_no_reader();
        });
        *self.task.lock() = Some(task);
    }

    /// Whether a pending zero-reader check has yet to fire
    pub fn is_armed(&self) -> bool {
        self.task.lock().as_ref().is_some_and(DelayTask::is_pending)
    }

    pub fn cancel(&self) {
        self.task.lock().take();
    }
}

impl MediaSource {
    pub(crate) fn on_no_reader(&self) {
        if self.is_auto_close() {
            tracing::warn!(stream = %self.key(), "No readers left, closing auto-close source");
            if !self.close() {
                self.unregister();
            }
            return;
        }

        tracing::info!(stream = %self.key(), "No readers");
        self.registry().bus().emit(MediaEvent::NoReader {
            key: self.key().clone(),
            source: self.downgrade(),
        });
    }
}
