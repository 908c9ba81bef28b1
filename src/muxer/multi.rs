//! Multi-sink muxer
//!
//! [`MultiMediaSourceMuxer`] sits between one publisher and every protocol
//! sink of a stream. The publisher adds tracks and feeds frames; the muxer
//! waits until the track set is complete, then fans each frame out to the
//! sinks (optionally through the pacer) and to the look-back ring used for
//! RTP-proxy fan-out.
//!
//! ```text
//!   publisher ──► add_track / input_frame
//!                      │
//!                 [TrackSet] ── buffered until all tracks ready
//!                      │
//!                 [StampSync] ──► [FramePacer]? ──┬──► rtsp sink
//!                                                 ├──► rtmp sink
//!                                                 ├──► ...
//!                                                 └──► LookbackRing ──► RTP readers
//! ```
//!
//! The muxer is also the event delegate of every sink's source. It answers
//! reader-count, track and recording queries itself and forwards everything
//! else to its own delegate (the publisher session).

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::{Mutex, RwLock};

use super::config::MuxerConfig;
use super::pacer::FramePacer;
use super::sink::{SinkFactory, SinkKind, SinkSlots};
use super::tracks::{Readiness, TrackPhase, TrackSet};
use crate::cache::{LookbackRing, ReaderHandle, RingReader};
use crate::media::{Frame, MediaType, StampSync, Track};
use crate::poller::{DelayTask, Poller};
use crate::registry::{
    MediaRegistry, MediaSource, MediaSourceEvent, NoReaderTimer, OriginType, RecordKind,
    RegistryError, SendRtpArgs, StreamKey,
};

/// Notified once the track set of a muxer is complete
pub trait MuxerListener: Send + Sync {
    fn on_all_tracks_ready(&self, tracks: &[Track]);
}

struct MuxerState {
    tracks: TrackSet,
    sinks: SinkSlots,
    stamps: StampSync,
    pacer: Option<FramePacer>,
    pacer_timer: Option<DelayTask>,
    ring: Option<LookbackRing<Frame>>,
    rtp_readers: HashMap<String, ReaderHandle<Frame>>,
    /// Previous ring write was a keyframe or config frame
    in_key_run: bool,
    have_video: bool,
    enabled: bool,
    last_enabled_check: Option<Instant>,
}

impl MuxerState {
    /// Whether a ring write starts a new GOP
    ///
    /// Audio-only streams mark every frame so readers join at the live edge.
    fn gop_start(&mut self, frame: &Frame) -> bool {
        if !self.have_video {
            return true;
        }
        if !frame.is_video() {
            return false;
        }
        let key = frame.is_keyframe || frame.is_config;
        let start = key && !self.in_key_run;
        self.in_key_run = key;
        start
    }

    fn reader_count(&self) -> usize {
        let sinks: usize = self.sinks.iter().map(|(_, s)| s.reader_count()).sum();
        let rtp = self.rtp_readers.values().filter(|h| h.is_alive()).count();
        sinks + rtp
    }

    fn any_source(&self) -> Option<Arc<MediaSource>> {
        self.sinks.iter().find_map(|(_, sink)| sink.source())
    }

    /// Hand one frame to every sink and the ring
    fn forward(&mut self, frame: &Frame) -> bool {
        let mut consumed = false;
        for sink in self.sinks.iter_mut() {
            consumed |= sink.input_frame(frame);
        }
        if self.ring.is_some() {
            let gop_start = self.gop_start(frame);
            if let Some(ring) = &self.ring {
                ring.write(frame.clone(), frame.dts, gop_start);
                consumed = true;
            }
        }
        consumed
    }
}

/// Fans one publisher's frames out to every protocol sink
pub struct MultiMediaSourceMuxer {
    /// Stream identity; the schema is filled in per sink
    key: StreamKey,
    config: MuxerConfig,
    registry: Arc<MediaRegistry>,
    factory: Arc<dyn SinkFactory>,
    weak_self: Weak<MultiMediaSourceMuxer>,
    delegate: RwLock<Option<Weak<dyn MediaSourceEvent>>>,
    listener: RwLock<Option<Weak<dyn MuxerListener>>>,
    poller: Mutex<Poller>,
    no_reader: NoReaderTimer,
    state: Mutex<MuxerState>,
}

fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

impl MultiMediaSourceMuxer {
    /// Create a muxer with one sink per kind enabled in `config`
    pub fn new(
        registry: &Arc<MediaRegistry>,
        key: StreamKey,
        config: MuxerConfig,
        factory: Arc<dyn SinkFactory>,
    ) -> Arc<Self> {
        let key = key.normalized(registry.config().enable_vhost);

        Arc::new_cyclic(|weak_self: &Weak<Self>| {
            let listener: Weak<dyn MediaSourceEvent> = weak_self.clone();
            let mut sinks = SinkSlots::new();
            for kind in SinkKind::ALL {
                if !config.is_sink_enabled(kind) {
                    continue;
                }
                match factory.create(kind, &key.with_schema(kind.schema())) {
                    Some(mut sink) => {
                        sink.set_listener(listener.clone());
                        sinks.set(kind, sink);
                    }
                    None => tracing::debug!(stream = %key.short_url(), sink = %kind, "Sink unavailable"),
                }
            }

            Self {
                state: Mutex::new(MuxerState {
                    tracks: TrackSet::new(&config, now()),
                    sinks,
                    stamps: StampSync::new(),
                    pacer: None,
                    pacer_timer: None,
                    ring: None,
                    rtp_readers: HashMap::new(),
                    in_key_run: false,
                    have_video: false,
                    enabled: false,
                    last_enabled_check: None,
                }),
                key,
                config,
                registry: registry.clone(),
                factory,
                weak_self: weak_self.clone(),
                delegate: RwLock::new(None),
                listener: RwLock::new(None),
                poller: Mutex::new(registry.pollers().get()),
                no_reader: NoReaderTimer::new(),
            }
        })
    }

    pub fn key(&self) -> &StreamKey {
        &self.key
    }

    pub fn config(&self) -> &MuxerConfig {
        &self.config
    }

    /// Install the upstream delegate (usually the publisher session)
    ///
    /// The muxer adopts the delegate's poller.
    pub fn set_delegate(&self, delegate: Weak<dyn MediaSourceEvent>) {
        *self.delegate.write() = Some(delegate);
        let mut state = self.state.lock();
        self.rebind_poller(&mut state);
    }

    pub fn delegate(&self) -> Option<Arc<dyn MediaSourceEvent>> {
        let delegate = self.delegate.read().clone();
        delegate.and_then(|weak| weak.upgrade())
    }

    /// Install the track-ready listener
    pub fn set_listener(&self, listener: Weak<dyn MuxerListener>) {
        *self.listener.write() = Some(listener);
    }

    /// Current lifecycle phase
    pub fn phase(&self) -> TrackPhase {
        self.state.lock().tracks.phase()
    }

    /// Add a track while collecting
    ///
    /// Returns whether any sink accepted it (true when there are no sinks
    /// to decline it).
    pub fn add_track(&self, track: Track) -> bool {
        let mut state = self.state.lock();
        if !state.tracks.add(track.clone(), now()) {
            return false;
        }
        if track.media_type() == MediaType::Video {
            state.have_video = true;
        }

        let mut accepted = state.sinks.is_empty();
        for sink in state.sinks.iter_mut() {
            accepted |= sink.add_track(&track);
        }
        tracing::info!(stream = %self.key.short_url(), track = %track, accepted, "Track added");
        accepted
    }

    /// The publisher will add no more tracks
    pub fn add_track_completed(&self) {
        let mut state = self.state.lock();
        state.tracks.complete();
        let ready = self.check_ready(&mut state);
        drop(state);
        if ready {
            self.notify_ready();
        }
    }

    /// Feed one frame from the publisher
    ///
    /// Frames arriving before all tracks are ready are buffered and
    /// replayed; frames of unknown tracks are refused.
    pub fn input_frame(&self, frame: Frame) -> bool {
        let mut state = self.state.lock();
        self.rebind_poller(&mut state);

        let Some(idx) = state.tracks.route(&frame) else {
            tracing::trace!(stream = %self.key.short_url(), codec = %frame.codec, "Frame of unknown track");
            return false;
        };

        if state.tracks.phase() != TrackPhase::CollectingTracks {
            return self.dispatch(&mut state, frame);
        }

        state.tracks.on_frame(idx, &frame);
        state.tracks.buffer(idx, frame);
        let ready = self.check_ready(&mut state);
        drop(state);
        if ready {
            self.notify_ready();
        }
        true
    }

    /// Forget the track set and start collecting again
    pub fn reset_tracks(&self) {
        let mut state = self.state.lock();
        state.tracks.reset(now());
        for sink in state.sinks.iter_mut() {
            sink.reset_tracks();
        }
        if let Some(ring) = state.ring.as_ref() {
            ring.clear();
        }
        state.stamps.reset();
        state.pacer = None;
        state.pacer_timer = None;
        state.in_key_run = false;
        state.have_video = false;
        tracing::info!(stream = %self.key.short_url(), "Tracks reset");
    }

    /// Release anything the sinks batched
    pub fn flush(&self) {
        let mut state = self.state.lock();
        for sink in state.sinks.iter_mut() {
            sink.flush();
        }
    }

    pub fn tracks(&self, ready_only: bool) -> Vec<Track> {
        self.state.lock().tracks.tracks(ready_only)
    }

    /// Readers across every sink plus RTP-proxy readers
    pub fn total_reader_count(&self) -> usize {
        self.state.lock().reader_count()
    }

    /// Whether anything consumes the output
    ///
    /// A positive answer is cached for the zero-reader delay; a negative one
    /// is re-evaluated on every call.
    pub fn is_enabled(&self) -> bool {
        let mut state = self.state.lock();
        let now = now();
        let stale = state
            .last_enabled_check
            .map_or(true, |at| now.saturating_duration_since(at) > self.registry.config().no_reader_delay);
        if !state.enabled || stale {
            state.last_enabled_check = Some(now);
            let recording = state.sinks.iter().any(|(kind, _)| kind.is_recorder());
            state.enabled = recording || state.reader_count() > 0;
        }
        state.enabled
    }

    /// Start or stop a recorder sink
    pub fn setup_record(&self, kind: RecordKind, start: bool) -> bool {
        let kind = SinkKind::from(kind);
        let mut state = self.state.lock();

        if !start {
            if let Some(mut sink) = state.sinks.take(kind) {
                sink.flush();
                tracing::info!(stream = %self.key.short_url(), sink = %kind, "Recording stopped");
            }
            return true;
        }
        if state.sinks.contains(kind) {
            return true;
        }

        let Some(mut sink) = self.factory.create(kind, &self.key.with_schema(kind.schema())) else {
            tracing::warn!(stream = %self.key.short_url(), sink = %kind, "Recorder unavailable");
            return false;
        };
        let listener: Weak<dyn MediaSourceEvent> = self.weak_self.clone();
        sink.set_listener(listener);
        for track in state.tracks.tracks(false) {
            sink.add_track(&track);
        }
        if state.tracks.phase() == TrackPhase::Active {
            sink.add_track_completed();
        }
        state.sinks.set(kind, sink);
        tracing::info!(stream = %self.key.short_url(), sink = %kind, "Recording started");
        true
    }

    pub fn is_recording(&self, kind: RecordKind) -> bool {
        self.state.lock().sinks.contains(SinkKind::from(kind))
    }

    /// Attach an RTP-proxy reader to the look-back ring, creating the ring
    /// if this is the first request
    pub fn start_send_rtp(&self, args: SendRtpArgs) -> Result<RingReader<Frame>, RegistryError> {
        let mut state = self.state.lock();
        if state.ring.is_none() {
            state.ring = Some(self.new_ring());
        }
        let Some(ring) = state.ring.as_ref() else {
            return Err(RegistryError::Unsupported(self.key.clone()));
        };
        let reader = ring.attach();
        state.rtp_readers.retain(|_, handle| handle.is_alive());
        if let Some(old) = state.rtp_readers.insert(args.ssrc.clone(), reader.handle()) {
            old.detach();
        }
        tracing::info!(
            stream = %self.key.short_url(),
            ssrc = %args.ssrc,
            dst = %args.dst_url,
            dst_port = args.dst_port,
            udp = args.is_udp,
            "RTP fan-out started"
        );
        Ok(reader)
    }

    /// Stop one RTP-proxy reader, or all of them for an empty `ssrc`
    pub fn stop_send_rtp(&self, ssrc: &str) -> bool {
        let mut state = self.state.lock();
        let stopped: Vec<_> = if ssrc.is_empty() {
            state.rtp_readers.drain().collect()
        } else {
            state.rtp_readers.remove_entry(ssrc).into_iter().collect()
        };
        drop(state);

        if stopped.is_empty() {
            return false;
        }
        for (ssrc, handle) in &stopped {
            handle.detach();
            tracing::info!(stream = %self.key.short_url(), ssrc = %ssrc, "RTP fan-out stopped");
        }
        self.report_readers();
        true
    }

    /// Poller the muxer's timers run on
    pub fn owner_poller(&self) -> Poller {
        self.delegate()
            .and_then(|d| d.owner_poller())
            .unwrap_or_else(|| self.poller.lock().clone())
    }

    fn new_ring(&self) -> LookbackRing<Frame> {
        let ring = LookbackRing::new(self.config.ring_capacity);
        let weak = self.weak_self.clone();
        // runs under the state lock; report from the poller instead
        ring.set_reader_hook(move |_| {
            let Some(muxer) = weak.upgrade() else {
                return;
            };
            let poller = muxer.owner_poller();
            poller.post(move || muxer.report_readers());
        });
        ring
    }

    fn report_readers(&self) {
        let (source, total) = {
            let state = self.state.lock();
            (state.any_source(), state.reader_count())
        };
        tracing::debug!(stream = %self.key.short_url(), readers = total, "Muxer readers changed");
        if let Some(source) = source {
            source.on_reader_changed(source.reader_count());
        }
    }

    fn check_ready(&self, state: &mut MuxerState) -> bool {
        match state.tracks.poll_ready(now()) {
            Some(readiness) => {
                self.on_all_tracks_ready(state, readiness);
                true
            }
            None => false,
        }
    }

    fn on_all_tracks_ready(&self, state: &mut MuxerState, readiness: Readiness) {
        if !readiness.dropped.is_empty() {
            let tracks = state.tracks.tracks(false);
            for sink in state.sinks.iter_mut() {
                sink.reset_tracks();
                for track in &tracks {
                    sink.add_track(track);
                }
            }
        }

        if let Some(media) = state.tracks.first_media_type() {
            state.stamps.set_reference(media);
        }
        state.have_video = state.tracks.has_video();

        for sink in state.sinks.iter_mut() {
            sink.add_track_completed();
        }

        if self.config.enable_pacing {
            state.pacer = Some(FramePacer::new(
                self.config.pacing_period(),
                self.config.pacing_backlog_cap,
            ));
            let poller = self.poller.lock().clone();
            state.pacer_timer = Some(self.arm_pacer(&poller));
        }

        state.tracks.set_phase(TrackPhase::Active);
        tracing::info!(
            stream = %self.key.short_url(),
            tracks = %state.tracks.describe(),
            sinks = state.sinks.len(),
            "All tracks ready"
        );

        for frame in state.tracks.take_buffered() {
            self.dispatch(state, frame);
        }
    }

    fn dispatch(&self, state: &mut MuxerState, frame: Frame) -> bool {
        let frame = if self.config.modify_stamp {
            state.stamps.rebase(&frame)
        } else {
            frame
        };

        let Some(pacer) = state.pacer.as_mut() else {
            return state.forward(&frame);
        };
        if let Some(burst) = pacer.push(frame, now()) {
            for frame in &burst {
                state.forward(frame);
            }
        }
        true
    }

    fn arm_pacer(&self, poller: &Poller) -> DelayTask {
        let weak = self.weak_self.clone();
        poller.repeat(self.config.pacing_period(), move || match weak.upgrade() {
            Some(muxer) => {
                muxer.on_pacer_tick();
                true
            }
            None => false,
        })
    }

    fn on_pacer_tick(&self) {
        let mut state = self.state.lock();
        let released = match state.pacer.as_mut() {
            Some(pacer) => pacer.tick(now()),
            None => return,
        };
        for frame in &released {
            state.forward(frame);
        }
    }

    /// Adopt the delegate's poller if it moved
    fn rebind_poller(&self, state: &mut MuxerState) {
        let Some(current) = self.delegate().and_then(|d| d.owner_poller()) else {
            return;
        };
        {
            let mut poller = self.poller.lock();
            if *poller == current {
                return;
            }
            *poller = current.clone();
        }
        tracing::info!(stream = %self.key.short_url(), poller = current.id(), "Owner poller changed, rebinding timers");
        if state.pacer.is_some() {
            state.pacer_timer = Some(self.arm_pacer(&current));
        }
    }

    fn notify_ready(&self) {
        let listener = self.listener.read().clone();
        if let Some(listener) = listener.and_then(|weak| weak.upgrade()) {
            listener.on_all_tracks_ready(&self.tracks(true));
        }
    }
}

impl MediaSourceEvent for MultiMediaSourceMuxer {
    fn origin_type(&self, sender: &MediaSource) -> OriginType {
        self.delegate()
            .map(|d| d.origin_type(sender))
            .unwrap_or_default()
    }

    fn origin_url(&self, sender: &MediaSource) -> String {
        match self.delegate() {
            Some(delegate) => delegate.origin_url(sender),
            None => sender.key().url(),
        }
    }

    fn seek_to(&self, sender: &MediaSource, stamp: u64) -> bool {
        self.delegate().is_some_and(|d| d.seek_to(sender, stamp))
    }

    fn pause(&self, sender: &MediaSource, pause: bool) -> bool {
        self.delegate().is_some_and(|d| d.pause(sender, pause))
    }

    fn speed(&self, sender: &MediaSource, speed: f32) -> bool {
        self.delegate().is_some_and(|d| d.speed(sender, speed))
    }

    fn close(&self, sender: &MediaSource) -> bool {
        self.delegate().is_some_and(|d| d.close(sender))
    }

    fn total_reader_count(&self, sender: &MediaSource) -> Option<usize> {
        self.delegate()
            .and_then(|d| d.total_reader_count(sender))
            .or_else(|| Some(MultiMediaSourceMuxer::total_reader_count(self)))
    }

    fn on_reader_changed(&self, sender: &Arc<MediaSource>, count: usize) {
        match self.delegate() {
            Some(delegate) => delegate.on_reader_changed(sender, count),
            None => self.no_reader.on_reader_changed(sender, count),
        }
    }

    fn on_registered(&self, sender: &MediaSource, registered: bool) {
        if let Some(delegate) = self.delegate() {
            delegate.on_registered(sender, registered);
        }
    }

    fn loss_rate(&self, sender: &MediaSource, media: MediaType) -> Option<f32> {
        self.delegate().and_then(|d| d.loss_rate(sender, media))
    }

    fn owner_poller(&self) -> Option<Poller> {
        Some(MultiMediaSourceMuxer::owner_poller(self))
    }

    fn setup_record(&self, _sender: &MediaSource, kind: RecordKind, start: bool) -> bool {
        MultiMediaSourceMuxer::setup_record(self, kind, start)
    }

    fn is_recording(&self, _sender: &MediaSource, kind: RecordKind) -> bool {
        MultiMediaSourceMuxer::is_recording(self, kind)
    }

    fn tracks(&self, _sender: &MediaSource, ready_only: bool) -> Vec<Track> {
        MultiMediaSourceMuxer::tracks(self, ready_only)
    }

    fn start_send_rtp(
        &self,
        _sender: &MediaSource,
        args: SendRtpArgs,
    ) -> Result<RingReader<Frame>, RegistryError> {
        MultiMediaSourceMuxer::start_send_rtp(self, args)
    }

    fn stop_send_rtp(&self, _sender: &MediaSource, ssrc: &str) -> bool {
        MultiMediaSourceMuxer::stop_send_rtp(self, ssrc)
    }
}

impl std::fmt::Debug for MultiMediaSourceMuxer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiMediaSourceMuxer")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use bytes::Bytes;

    use super::*;
    use crate::media::CodecId;
    use crate::muxer::sink::Sink;
    use crate::poller::PollerPool;
    use crate::registry::RegistryConfig;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        AddTrack(CodecId),
        Completed,
        Frame(u64, bool),
        Reset,
    }

    type Log = Arc<Mutex<Vec<(SinkKind, Call)>>>;

    struct Recorder {
        kind: SinkKind,
        log: Log,
    }

    impl Sink for Recorder {
        fn add_track(&mut self, track: &Track) -> bool {
            self.log.lock().push((self.kind, Call::AddTrack(track.codec())));
            true
        }

        fn add_track_completed(&mut self) {
            self.log.lock().push((self.kind, Call::Completed));
        }

        fn input_frame(&mut self, frame: &Frame) -> bool {
            self.log
                .lock()
                .push((self.kind, Call::Frame(frame.dts, frame.is_video())));
            true
        }

        fn reset_tracks(&mut self) {
            self.log.lock().push((self.kind, Call::Reset));
        }
    }

    #[derive(Default)]
    struct RecorderFactory {
        log: Log,
    }

    impl SinkFactory for RecorderFactory {
        fn create(&self, kind: SinkKind, _key: &StreamKey) -> Option<Box<dyn Sink>> {
            Some(Box::new(Recorder {
                kind,
                log: self.log.clone(),
            }))
        }
    }

    fn muxer(config: MuxerConfig) -> (Arc<MultiMediaSourceMuxer>, Log) {
        let registry =
            MediaRegistry::new(RegistryConfig::default(), Arc::new(PollerPool::new(1)));
        let factory = Arc::new(RecorderFactory::default());
        let log = factory.log.clone();
        let key = StreamKey::new("", "", "live", "test");
        let muxer = MultiMediaSourceMuxer::new(&registry, key, config, factory);
        (muxer, log)
    }

    fn rtsp_only() -> MuxerConfig {
        MuxerConfig::default()
            .only_sinks(&[SinkKind::Rtsp])
            .modify_stamp(false)
    }

    fn h264() -> Track {
        Track::new(CodecId::H264).with_extra_data(Bytes::from_static(&[0x67]))
    }

    fn audio(dts: u64) -> Frame {
        Frame::audio(CodecId::Aac, dts, Bytes::from_static(b"a"))
    }

    fn video(dts: u64, key: bool) -> Frame {
        Frame::video(CodecId::H264, dts, dts, Bytes::from_static(b"v"), key)
    }

    fn calls(log: &Log) -> Vec<Call> {
        log.lock().iter().map(|(_, call)| call.clone()).collect()
    }

    fn count(log: &Log, wanted: &Call) -> usize {
        log.lock().iter().filter(|(_, call)| call == wanted).count()
    }

    #[tokio::test]
    async fn test_completed_once_after_both_tracks_ready() {
        let (muxer, log) = muxer(rtsp_only());
        assert!(muxer.add_track(Track::new(CodecId::Aac)));
        assert!(muxer.add_track(h264()));

        assert!(muxer.input_frame(audio(0)));
        assert_eq!(count(&log, &Call::Completed), 0);
        assert_eq!(muxer.phase(), TrackPhase::CollectingTracks);

        assert!(muxer.input_frame(video(20, true)));
        assert_eq!(muxer.phase(), TrackPhase::Active);
        assert!(muxer.input_frame(audio(40)));
        assert!(muxer.input_frame(video(60, false)));

        assert_eq!(
            calls(&log),
            vec![
                Call::AddTrack(CodecId::Aac),
                Call::AddTrack(CodecId::H264),
                Call::Completed,
                Call::Frame(0, false),
                Call::Frame(20, true),
                Call::Frame(40, false),
                Call::Frame(60, true),
            ]
        );
    }

    #[tokio::test]
    async fn test_unknown_track_refused() {
        let (muxer, log) = muxer(rtsp_only());
        muxer.add_track(Track::new(CodecId::Aac));
        muxer.add_track_completed();

        assert!(!muxer.input_frame(video(0, true)));
        assert!(muxer.input_frame(audio(0)));
        assert!(!muxer.add_track(h264()));
        assert_eq!(count(&log, &Call::Frame(0, false)), 1);
    }

    #[tokio::test]
    async fn test_every_sink_sees_every_frame() {
        let (muxer, log) = muxer(MuxerConfig::default().modify_stamp(false));
        muxer.add_track(Track::new(CodecId::Aac));
        muxer.add_track_completed();
        muxer.input_frame(audio(0));

        let kinds: Vec<SinkKind> = log
            .lock()
            .iter()
            .filter(|(_, call)| *call == Call::Frame(0, false))
            .map(|(kind, _)| *kind)
            .collect();
        assert_eq!(
            kinds,
            vec![SinkKind::Rtsp, SinkKind::Rtmp, SinkKind::Ts, SinkKind::Fmp4]
        );
    }

    #[tokio::test]
    async fn test_ring_joins_at_gop_start() {
        let (muxer, _log) = muxer(MuxerConfig::default().only_sinks(&[]).modify_stamp(false));
        muxer.add_track(h264());
        muxer.add_track_completed();

        let mut early = muxer
            .start_send_rtp(SendRtpArgs {
                ssrc: "1".into(),
                ..Default::default()
            })
            .unwrap();

        muxer.input_frame(Frame::video_config(CodecId::H264, 0, Bytes::from_static(&[0x67])));
        muxer.input_frame(video(0, true));
        muxer.input_frame(video(40, false));
        muxer.input_frame(video(80, true));
        muxer.input_frame(video(120, false));

        let mut seen = Vec::new();
        while let Some(frame) = early.try_next() {
            seen.push(frame.dts);
        }
        assert_eq!(seen, vec![0, 0, 40, 80, 120]);

        let mut late = muxer
            .start_send_rtp(SendRtpArgs {
                ssrc: "2".into(),
                ..Default::default()
            })
            .unwrap();
        let first = late.try_next().unwrap();
        assert_eq!(first.dts, 80);
        assert!(first.is_keyframe);
        assert_eq!(muxer.total_reader_count(), 2);
    }

    #[tokio::test]
    async fn test_stop_send_rtp() {
        let (muxer, _log) = muxer(MuxerConfig::default().only_sinks(&[]));
        let args = |ssrc: &str| SendRtpArgs {
            ssrc: ssrc.into(),
            ..Default::default()
        };
        let a = muxer.start_send_rtp(args("a")).unwrap();
        let b = muxer.start_send_rtp(args("b")).unwrap();

        assert!(muxer.stop_send_rtp("a"));
        assert!(a.is_detached());
        assert!(!b.is_detached());
        assert!(!muxer.stop_send_rtp("x"));

        assert!(muxer.stop_send_rtp(""));
        assert!(b.is_detached());
        assert_eq!(muxer.total_reader_count(), 0);
    }

    #[tokio::test]
    async fn test_record_sink_catches_up() {
        let (muxer, log) = muxer(rtsp_only());
        muxer.add_track(Track::new(CodecId::Aac));
        muxer.add_track_completed();
        muxer.input_frame(audio(0));
        assert!(!muxer.is_recording(RecordKind::Hls));

        assert!(muxer.setup_record(RecordKind::Hls, true));
        assert!(muxer.is_recording(RecordKind::Hls));
        muxer.input_frame(audio(20));

        let hls: Vec<Call> = log
            .lock()
            .iter()
            .filter(|(kind, _)| *kind == SinkKind::Hls)
            .map(|(_, call)| call.clone())
            .collect();
        assert_eq!(
            hls,
            vec![
                Call::AddTrack(CodecId::Aac),
                Call::Completed,
                Call::Frame(20, false)
            ]
        );
        assert!(muxer.is_enabled());

        assert!(muxer.setup_record(RecordKind::Hls, false));
        assert!(!muxer.is_recording(RecordKind::Hls));
    }

    #[tokio::test]
    async fn test_reset_tracks_reopens_collection() {
        let (muxer, log) = muxer(rtsp_only());
        muxer.add_track(Track::new(CodecId::Aac));
        muxer.add_track_completed();
        muxer.input_frame(audio(0));
        assert_eq!(muxer.phase(), TrackPhase::Active);

        muxer.reset_tracks();
        assert_eq!(muxer.phase(), TrackPhase::CollectingTracks);
        assert_eq!(count(&log, &Call::Reset), 1);
        assert!(muxer.add_track(h264()));
        assert!(muxer.tracks(false).iter().all(|t| t.codec() == CodecId::H264));
    }

    #[tokio::test]
    async fn test_reset_tracks_forgets_previous_gop() {
        let (muxer, _log) = muxer(MuxerConfig::default().only_sinks(&[]).modify_stamp(false));
        muxer.add_track(h264());
        muxer.add_track_completed();
        let _early = muxer
            .start_send_rtp(SendRtpArgs {
                ssrc: "1".into(),
                ..Default::default()
            })
            .unwrap();
        muxer.input_frame(Frame::video_config(CodecId::H264, 1000, Bytes::from_static(&[0x67])));
        muxer.input_frame(video(1000, true));

        muxer.reset_tracks();
        muxer.add_track(Track::new(CodecId::H265).with_extra_data(Bytes::from_static(&[0x40])));
        muxer.add_track_completed();

        let mut late = muxer
            .start_send_rtp(SendRtpArgs {
                ssrc: "2".into(),
                ..Default::default()
            })
            .unwrap();
        assert!(late.try_next().is_none());
    }

    #[tokio::test]
    async fn test_dropped_rtp_readers_pruned() {
        let (muxer, _log) = muxer(MuxerConfig::default().only_sinks(&[]));
        let args = |ssrc: &str| SendRtpArgs {
            ssrc: ssrc.into(),
            ..Default::default()
        };
        for n in 0..8 {
            drop(muxer.start_send_rtp(args(&n.to_string())).unwrap());
        }
        let _kept = muxer.start_send_rtp(args("kept")).unwrap();

        let state = muxer.state.lock();
        assert_eq!(state.rtp_readers.len(), 1);
        assert!(state.rtp_readers.contains_key("kept"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unready_track_dropped_and_sinks_rebuilt() {
        let (muxer, log) = muxer(rtsp_only());
        muxer.add_track(Track::new(CodecId::Aac));
        muxer.add_track(Track::new(CodecId::H264));

        muxer.input_frame(audio(0));
        tokio::time::sleep(Duration::from_secs(11)).await;
        muxer.input_frame(audio(11_000));

        assert_eq!(muxer.phase(), TrackPhase::Active);
        assert_eq!(muxer.tracks(false).len(), 1);
        assert_eq!(
            calls(&log),
            vec![
                Call::AddTrack(CodecId::Aac),
                Call::AddTrack(CodecId::H264),
                Call::Reset,
                Call::AddTrack(CodecId::Aac),
                Call::Completed,
                Call::Frame(0, false),
                Call::Frame(11_000, false),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_pacing_releases_on_ticks() {
        let (muxer, log) = muxer(rtsp_only().pacing(true));
        muxer.add_track(Track::new(CodecId::Aac));
        muxer.add_track_completed();

        for dts in [0, 40, 80] {
            muxer.input_frame(audio(dts));
        }
        assert_eq!(count(&log, &Call::Completed), 1);
        assert_eq!(count(&log, &Call::Frame(0, false)), 0);

        tokio::time::sleep(Duration::from_millis(200)).await;
        tokio::task::yield_now().await;

        let frames: Vec<Call> = calls(&log)
            .into_iter()
            .filter(|call| matches!(call, Call::Frame(..)))
            .collect();
        assert_eq!(
            frames,
            vec![
                Call::Frame(0, false),
                Call::Frame(40, false),
                Call::Frame(80, false)
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_pacing_quantum_still_releases() {
        let config: MuxerConfig =
            serde_json::from_str(r#"{"enable_pacing":true,"pacing_quantum_ms":0}"#).unwrap();
        let (muxer, log) = muxer(config.only_sinks(&[SinkKind::Rtsp]).modify_stamp(false));
        muxer.add_track(Track::new(CodecId::Aac));
        muxer.add_track_completed();

        for dts in [0, 40, 80] {
            muxer.input_frame(audio(dts));
        }
        tokio::time::sleep(Duration::from_secs(5)).await;
        tokio::task::yield_now().await;

        let frames = calls(&log)
            .into_iter()
            .filter(|call| matches!(call, Call::Frame(..)))
            .count();
        assert_eq!(frames, 3);
    }

    #[derive(Default)]
    struct ReadyCounter(AtomicUsize);

    impl MuxerListener for ReadyCounter {
        fn on_all_tracks_ready(&self, tracks: &[Track]) {
            assert!(!tracks.is_empty());
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_listener_notified_once() {
        let (muxer, _log) = muxer(rtsp_only());
        let counter = Arc::new(ReadyCounter::default());
        let weak: Weak<dyn MuxerListener> = Arc::downgrade(&counter) as Weak<ReadyCounter>;
        muxer.set_listener(weak);

        muxer.add_track(Track::new(CodecId::Aac));
        muxer.add_track_completed();
        muxer.input_frame(audio(0));
        muxer.input_frame(audio(20));
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }

    struct Session {
        poller: Poller,
    }

    impl MediaSourceEvent for Session {
        fn owner_poller(&self) -> Option<Poller> {
            Some(self.poller.clone())
        }
    }

    #[tokio::test]
    async fn test_delegate_poller_adopted() {
        let (muxer, _log) = muxer(rtsp_only());
        let session = Arc::new(Session {
            poller: Poller::spawn(),
        });
        let weak: Weak<dyn MediaSourceEvent> = Arc::downgrade(&session) as Weak<Session>;
        muxer.set_delegate(weak);

        assert_eq!(muxer.owner_poller(), session.poller);
        assert_eq!(*muxer.poller.lock(), session.poller);
    }
}
