//! Registered media sources
//!
//! A [`MediaSource`] is the registry-visible handle of one stream under one
//! schema. It carries identity, lifecycle bookkeeping and traffic counters;
//! everything that requires touching the actual media is delegated to its
//! [`MediaSourceEvent`] listener.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant, SystemTime};

use parking_lot::{Mutex, RwLock};

use super::error::RegistryError;
use super::event::{MediaSourceEvent, NoReaderTimer, OriginType, RecordKind, SendRtpArgs};
use super::key::StreamKey;
use super::store::MediaRegistry;
use crate::cache::{FrameBatch, RingAttacher, RingReader};
use crate::events::{EventBus, MediaEvent};
use crate::media::{Frame, MediaType, Track};
use crate::poller::Poller;
use crate::stats::{BytesSpeed, FlowReport};

/// Registry-visible handle of one stream under one schema
pub struct MediaSource {
    key: StreamKey,
    registry: Arc<MediaRegistry>,
    self_ref: Weak<MediaSource>,

    created_at: SystemTime,
    started: Instant,
    /// Byte-rate counters indexed by [`MediaType::index`]
    speed: Mutex<[BytesSpeed; 2]>,

    owned: Arc<AtomicBool>,
    listener: RwLock<Option<Weak<dyn MediaSourceEvent>>>,
    default_poller: Poller,

    /// Readers of this source's own output
    readers: AtomicUsize,
    auto_close: AtomicBool,
    no_reader: NoReaderTimer,
    output: RwLock<Option<RingAttacher<FrameBatch>>>,
}

impl MediaSource {
    /// Create an unregistered source
    ///
    /// The vhost is normalized according to the registry configuration and
    /// sources under the VOD app are auto-close.
    pub fn new(registry: &Arc<MediaRegistry>, key: StreamKey) -> Arc<Self> {
        let key = key.normalized(registry.config().enable_vhost);
        let auto_close = key.app == registry.config().record_app;

        Arc::new_cyclic(|self_ref| Self {
            key,
            registry: registry.clone(),
            self_ref: self_ref.clone(),
            created_at: SystemTime::now(),
            started: Instant::now(),
            speed: Mutex::new([BytesSpeed::new(), BytesSpeed::new()]),
            owned: Arc::new(AtomicBool::new(false)),
            listener: RwLock::new(None),
            default_poller: registry.pollers().get(),
            readers: AtomicUsize::new(0),
            auto_close: AtomicBool::new(auto_close),
            no_reader: NoReaderTimer::new(),
            output: RwLock::new(None),
        })
    }

    pub fn key(&self) -> &StreamKey {
        &self.key
    }

    pub fn schema(&self) -> &str {
        &self.key.schema
    }

    pub fn vhost(&self) -> &str {
        &self.key.vhost
    }

    pub fn app(&self) -> &str {
        &self.key.app
    }

    pub fn stream(&self) -> &str {
        &self.key.stream
    }

    pub fn registry(&self) -> &Arc<MediaRegistry> {
        &self.registry
    }

    pub(crate) fn downgrade(&self) -> Weak<MediaSource> {
        self.self_ref.clone()
    }

    /// Insert into the registry
    pub fn register(self: &Arc<Self>) -> Result<(), RegistryError> {
        self.registry.register(self)
    }

    /// Remove from the registry; true if this call removed it
    pub fn unregister(&self) -> bool {
        self.registry.unregister(self)
    }

    /// Wall-clock creation time
    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    /// Time since creation
    pub fn alive(&self) -> Duration {
        self.started.elapsed()
    }

    /// Account for bytes received on one media type
    pub fn add_bytes(&self, media: MediaType, bytes: usize) {
        self.speed.lock()[media.index()].add(bytes);
    }

    /// Current byte rate of one media type
    pub fn bytes_speed(&self, media: MediaType) -> u64 {
        self.speed.lock()[media.index()].speed()
    }

    /// Bytes received on one media type since creation
    pub fn total_bytes(&self, media: MediaType) -> u64 {
        self.speed.lock()[media.index()].total()
    }

    /// Claim exclusive control of the source (e.g. for an API-driven pull)
    ///
    /// Returns `None` while another token is outstanding; dropping the token
    /// releases it.
    pub fn acquire_ownership(&self) -> Option<Ownership> {
        self.owned
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Ownership {
                flag: self.owned.clone(),
            })
    }

    pub fn is_owned(&self) -> bool {
        self.owned.load(Ordering::Acquire)
    }

    pub fn set_auto_close(&self, auto_close: bool) {
        self.auto_close.store(auto_close, Ordering::Release);
    }

    /// Closed automatically once it has had no readers for the delay
    pub fn is_auto_close(&self) -> bool {
        self.auto_close.load(Ordering::Acquire)
    }

    /// Install the event delegate
    pub fn set_listener(&self, listener: Weak<dyn MediaSourceEvent>) {
        *self.listener.write() = Some(listener);
    }

    /// Upgraded event delegate, if still alive
    pub fn listener(&self) -> Option<Arc<dyn MediaSourceEvent>> {
        let listener = self.listener.read().clone();
        listener.and_then(|weak| weak.upgrade())
    }

    /// Poller that owns this source's state
    pub fn owner_poller(&self) -> Poller {
        self.listener()
            .and_then(|l| l.owner_poller())
            .unwrap_or_else(|| self.default_poller.clone())
    }

    /// Readers of this source's own output
    pub fn reader_count(&self) -> usize {
        self.readers.load(Ordering::Acquire)
    }

    /// Readers across every output of the stream
    pub fn total_reader_count(&self) -> usize {
        self.listener()
            .and_then(|l| l.total_reader_count(self))
            .unwrap_or_else(|| self.reader_count())
    }

    /// Store a new reader count and report the change
    pub fn set_reader_count(&self, count: usize) {
        self.readers.store(count, Ordering::Release);
        self.on_reader_changed(count);
    }

    /// Report a reader count change
    ///
    /// Delivery to the delegate is posted to the owning poller, never made
    /// inline.
    pub fn on_reader_changed(&self, count: usize) {
        let weak = self.downgrade();
        self.owner_poller().post(move || {
            let Some(source) = weak.upgrade() else {
                return;
            };
            tracing::debug!(stream = %source.key, readers = count, "Reader count changed");
            source.registry.bus().emit(MediaEvent::ReaderCountChanged {
                key: source.key.clone(),
                count,
            });
            match source.listener() {
                Some(listener) => listener.on_reader_changed(&source, count),
                None => source.no_reader.on_reader_changed(&source, count),
            }
        });
    }

    /// Timer used by the default reader-change handling
    pub fn no_reader_timer(&self) -> &NoReaderTimer {
        &self.no_reader
    }

    pub fn origin_type(&self) -> OriginType {
        self.listener()
            .map(|l| l.origin_type(self))
            .unwrap_or_default()
    }

    pub fn origin_url(&self) -> String {
        self.listener()
            .map(|l| l.origin_url(self))
            .unwrap_or_else(|| self.key.url())
    }

    pub fn seek_to(&self, stamp: u64) -> bool {
        self.listener().is_some_and(|l| l.seek_to(self, stamp))
    }

    pub fn pause(&self, pause: bool) -> bool {
        self.listener().is_some_and(|l| l.pause(self, pause))
    }

    pub fn speed(&self, speed: f32) -> bool {
        self.listener().is_some_and(|l| l.speed(self, speed))
    }

    /// Ask the delegate to tear the stream down
    pub fn close(&self) -> bool {
        match self.listener() {
            Some(listener) => {
                tracing::info!(stream = %self.key, "Closing media source");
                listener.close(self)
            }
            None => false,
        }
    }

    pub fn tracks(&self, ready_only: bool) -> Vec<Track> {
        self.listener()
            .map(|l| l.tracks(self, ready_only))
            .unwrap_or_default()
    }

    pub fn loss_rate(&self, media: MediaType) -> Option<f32> {
        self.listener().and_then(|l| l.loss_rate(self, media))
    }

    pub fn setup_record(&self, kind: RecordKind, start: bool) -> bool {
        self.listener()
            .is_some_and(|l| l.setup_record(self, kind, start))
    }

    pub fn is_recording(&self, kind: RecordKind) -> bool {
        self.listener().is_some_and(|l| l.is_recording(self, kind))
    }

    pub fn start_send_rtp(&self, args: SendRtpArgs) -> Result<RingReader<Frame>, RegistryError> {
        match self.listener() {
            Some(listener) => listener.start_send_rtp(self, args),
            None => Err(RegistryError::Unbound(self.key.clone())),
        }
    }

    pub fn stop_send_rtp(&self, ssrc: &str) -> bool {
        self.listener().is_some_and(|l| l.stop_send_rtp(self, ssrc))
    }

    /// Publish the ring readers of this source attach to
    pub fn set_output(&self, attacher: RingAttacher<FrameBatch>) {
        *self.output.write() = Some(attacher);
    }

    /// Attach a player to the source's output ring
    pub fn attach_reader(&self) -> Option<SourceReader> {
        let attacher = self.output.read().clone()?;
        let reader = attacher.attach()?;
        Some(SourceReader {
            reader,
            key: self.key.clone(),
            bus: self.registry.bus().clone(),
            attached_at: Instant::now(),
            bytes: 0,
            is_player: true,
        })
    }

    pub(crate) fn notify_registered(&self, registered: bool) {
        if let Some(listener) = self.listener() {
            listener.on_registered(self, registered);
        }
    }
}

impl Drop for MediaSource {
    fn drop(&mut self) {
        self.registry.unregister(self);
        tracing::debug!(stream = %self.key, alive_ms = self.alive().as_millis() as u64, "Media source dropped");
    }
}

impl std::fmt::Debug for MediaSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaSource")
            .field("key", &self.key)
            .field("readers", &self.reader_count())
            .field("auto_close", &self.is_auto_close())
            .finish()
    }
}

/// Exclusive-control token returned by [`MediaSource::acquire_ownership`]
#[derive(Debug)]
pub struct Ownership {
    flag: Arc<AtomicBool>,
}

impl Drop for Ownership {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// A player attached to a source's output ring
///
/// A [`MediaEvent::FlowReport`] is published when the reader is dropped.
pub struct SourceReader {
    reader: RingReader<FrameBatch>,
    key: StreamKey,
    bus: EventBus,
    attached_at: Instant,
    bytes: u64,
    is_player: bool,
}

impl SourceReader {
    /// Mark the reader as a relay rather than a player
    pub fn as_relay(mut self) -> Self {
        self.is_player = false;
        self
    }

    /// Wait for the next batch
    pub async fn recv(&mut self) -> Option<FrameBatch> {
        let batch = self.reader.recv().await?;
        self.account(&batch);
        Some(batch)
    }

    /// Next batch if one is available
    pub fn try_next(&mut self) -> Option<FrameBatch> {
        let batch = self.reader.try_next()?;
        self.account(&batch);
        Some(batch)
    }

    /// Bytes delivered so far
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn skipped(&self) -> u64 {
        self.reader.skipped()
    }

    fn account(&mut self, batch: &FrameBatch) {
        self.bytes += batch.iter().map(|f| f.size() as u64).sum::<u64>();
    }
}

impl Drop for SourceReader {
    fn drop(&mut self) {
        let report = FlowReport {
            total_bytes: self.bytes,
            duration: self.attached_at.elapsed(),
            is_player: self.is_player,
        };
        tracing::debug!(
            stream = %self.key,
            bytes = report.total_bytes,
            duration_ms = report.duration.as_millis() as u64,
            "Reader detached"
        );
        self.bus.emit(MediaEvent::FlowReport {
            key: self.key.clone(),
            report,
        });
    }
}
