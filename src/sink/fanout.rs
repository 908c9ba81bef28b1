//! Reference protocol sink
//!
//! [`FanoutSink`] stands in for a protocol muxer: instead of packetizing it
//! forwards frames unchanged, batched by a [`MergeWriteCache`], into its own
//! [`LookbackRing`]. Players find its [`MediaSource`] in the registry and
//! attach to the ring through [`MediaSource::attach_reader`].

use std::sync::{Arc, Weak};

use crate::cache::{FlushBatch, FrameBatch, LookbackRing, MergeWriteCache};
use crate::media::{Frame, MediaType, Track};
use crate::muxer::{MuxerConfig, Sink, SinkFactory, SinkKind};
use crate::registry::{MediaRegistry, MediaSource, MediaSourceEvent, StreamKey};

/// Sink publishing frame batches under its own registered source
pub struct FanoutSink {
    source: Arc<MediaSource>,
    cache: MergeWriteCache<Frame>,
    ring: LookbackRing<FrameBatch>,
    tracks: Vec<Track>,
    have_video: bool,
    /// Previous video frame was a keyframe or config frame
    in_key_run: bool,
}

impl FanoutSink {
    pub fn new(registry: &Arc<MediaRegistry>, key: StreamKey, config: &MuxerConfig) -> Self {
        let source = MediaSource::new(registry, key);
        let ring = LookbackRing::new(config.ring_capacity);

        let weak = Arc::downgrade(&source);
        ring.set_reader_hook(move |count| {
            if let Some(source) = weak.upgrade() {
                source.set_reader_count(count);
            }
        });

        Self {
            source,
            cache: MergeWriteCache::new(config.merge_write_ms, false),
            ring,
            tracks: Vec::new(),
            have_video: false,
            in_key_run: false,
        }
    }

    pub fn media_source(&self) -> &Arc<MediaSource> {
        &self.source
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    /// Whether a frame opens a random-access point
    ///
    /// A config frame followed by a keyframe opens one point, not two.
    fn key_pos(&mut self, frame: &Frame) -> bool {
        if !self.have_video {
            return true;
        }
        if !frame.is_video() {
            return false;
        }
        let key = frame.is_key_or_config();
        let start = key && !self.in_key_run;
        self.in_key_run = key;
        start
    }

    fn write(&self, batch: FlushBatch<Frame>) {
        tracing::trace!(
            stream = %self.source.key(),
            frames = batch.items.len(),
            key = batch.key_pos,
            "Batch written"
        );
        self.ring
            .write(Arc::new(batch.items), batch.first_stamp, batch.key_pos);
    }
}

impl Sink for FanoutSink {
    fn add_track(&mut self, track: &Track) -> bool {
        if track.media_type() == MediaType::Video {
            self.have_video = true;
        }
        self.tracks.push(track.clone());
        true
    }

    fn add_track_completed(&mut self) {
        self.source.set_output(self.ring.attacher());
        if let Err(e) = self.source.register() {
            tracing::warn!(stream = %self.source.key(), error = %e, "Sink source not registered");
        }
    }

    fn input_frame(&mut self, frame: &Frame) -> bool {
        self.source.add_bytes(frame.media_type(), frame.size());
        let key_pos = self.key_pos(frame);
        if let Some(batch) = self
            .cache
            .input(frame.dts, frame.is_video(), key_pos, frame.clone())
        {
            self.write(batch);
        }
        true
    }

    fn reset_tracks(&mut self) {
        self.tracks.clear();
        self.cache.clear();
        self.ring.clear();
        self.have_video = false;
        self.in_key_run = false;
    }

    fn flush(&mut self) {
        if let Some(batch) = self.cache.flush() {
            self.write(batch);
        }
    }

    fn reader_count(&self) -> usize {
        self.ring.reader_count()
    }

    fn set_listener(&mut self, listener: Weak<dyn MediaSourceEvent>) {
        self.source.set_listener(listener);
    }

    fn source(&self) -> Option<Arc<MediaSource>> {
        Some(self.source.clone())
    }
}

impl Drop for FanoutSink {
    fn drop(&mut self) {
        self.source.unregister();
    }
}

/// Builds a [`FanoutSink`] for every sink kind
pub struct FanoutSinkFactory {
    registry: Arc<MediaRegistry>,
    config: MuxerConfig,
}

impl FanoutSinkFactory {
    pub fn new(registry: Arc<MediaRegistry>, config: MuxerConfig) -> Self {
        Self { registry, config }
    }
}

impl SinkFactory for FanoutSinkFactory {
    fn create(&self, kind: SinkKind, key: &StreamKey) -> Option<Box<dyn Sink>> {
        tracing::debug!(stream = %key, sink = %kind, "Creating fan-out sink");
        Some(Box::new(FanoutSink::new(&self.registry, key.clone(), &self.config)))
    }
}
