use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use mediahub::{
    CodecId, FanoutSinkFactory, Frame, LookbackRing, MediaEvent, MediaRegistry, MergeWriteCache,
    MultiMediaSourceMuxer, MuxerConfig, PollerPool, RegistryConfig, Sink, SinkFactory, SinkKind,
    StreamKey, Track,
};

fn registry() -> Arc<MediaRegistry> {
    MediaRegistry::new(RegistryConfig::default(), Arc::new(PollerPool::new(1)))
}

fn key() -> StreamKey {
    StreamKey::new("", "", "live", "cam1")
}

fn aac(dts: u64) -> Frame {
    Frame::audio(CodecId::Aac, dts, Bytes::from_static(b"aa"))
}

fn h264(dts: u64, key: bool) -> Frame {
    Frame::video(CodecId::H264, dts, dts, Bytes::from_static(b"vvvv"), key)
}

fn video_track() -> Track {
    Track::new(CodecId::H264).with_extra_data(Bytes::from_static(&[0x67, 0x42]))
}

#[derive(Default)]
struct Counts {
    tracks: AtomicUsize,
    completed: AtomicUsize,
}

struct CountingSink(Arc<Counts>);

impl Sink for CountingSink {
    fn add_track(&mut self, _track: &Track) -> bool {
        self.0.tracks.fetch_add(1, Ordering::SeqCst);
        true
    }

    fn add_track_completed(&mut self) {
        assert_eq!(self.0.tracks.load(Ordering::SeqCst) % 2, 0);
        self.0.completed.fetch_add(1, Ordering::SeqCst);
    }

    fn input_frame(&mut self, _frame: &Frame) -> bool {
        true
    }

    fn reset_tracks(&mut self) {}
}

struct CountingFactory(Arc<Counts>);

impl SinkFactory for CountingFactory {
    fn create(&self, _kind: SinkKind, _key: &StreamKey) -> Option<Box<dyn Sink>> {
        Some(Box::new(CountingSink(self.0.clone())))
    }
}

#[tokio::test]
async fn test_completed_once_per_sink_after_both_tracks() {
    let registry = registry();
    let counts = Arc::new(Counts::default());
    let config = MuxerConfig::default();
    let muxer = MultiMediaSourceMuxer::new(
        &registry,
        key(),
        config,
        Arc::new(CountingFactory(counts.clone())),
    );

    assert!(muxer.add_track(Track::new(CodecId::Aac)));
    muxer.input_frame(aac(0));
    assert_eq!(counts.completed.load(Ordering::SeqCst), 0);

    assert!(muxer.add_track(video_track()));
    muxer.input_frame(h264(0, true));
    muxer.input_frame(aac(20));
    muxer.input_frame(h264(40, false));

    // rtsp, rtmp, ts and fmp4 are on by default
    assert_eq!(counts.completed.load(Ordering::SeqCst), 4);
}

#[test]
fn test_late_reader_starts_at_oldest_when_gop_evicted() {
    let ring = LookbackRing::new(1024);
    ring.write(0u64, 0, true);
    for n in 1..=2000u64 {
        ring.write(n, n * 40, false);
    }

    let mut reader = ring.attach();
    assert_eq!(reader.try_next(), Some(2000 - 1023));
}

#[test]
fn test_merge_window_flush_points() {
    let mut cache = MergeWriteCache::new(350, false);
    let mut batches = Vec::new();
    for (stamp, key) in [(0, false), (100, false), (200, false), (400, false), (500, true)] {
        if let Some(batch) = cache.input(stamp, true, key, stamp) {
            batches.push((stamp, batch.items));
        }
    }

    assert_eq!(batches, vec![(400, vec![0, 100, 200]), (500, vec![400])]);
    assert_eq!(cache.flush().unwrap().items, vec![500]);
}

#[tokio::test]
async fn test_publisher_to_player() {
    let registry = registry();
    let config = MuxerConfig::default()
        .only_sinks(&[SinkKind::Rtsp, SinkKind::Rtmp])
        .modify_stamp(false);
    let factory = Arc::new(FanoutSinkFactory::new(registry.clone(), config.clone()));
    let muxer = MultiMediaSourceMuxer::new(&registry, key(), config, factory);

    muxer.add_track(Track::new(CodecId::Aac));
    muxer.add_track(video_track());
    muxer.input_frame(aac(0));
    muxer.input_frame(h264(0, true));

    let rtsp = registry
        .find(&StreamKey::new("rtsp", "", "live", "cam1"), false)
        .unwrap();
    assert!(registry.find_any("", "live", "cam1", false).is_some());
    assert_eq!(rtsp.tracks(true).len(), 2);

    let mut player = rtsp.attach_reader().unwrap();
    muxer.input_frame(aac(20));
    muxer.input_frame(h264(40, false));

    let mut stamps = Vec::new();
    while let Some(batch) = player.try_next() {
        stamps.extend(batch.iter().map(|f| f.dts));
    }
    // the player joined at the keyframe
    assert_eq!(stamps, vec![0, 20, 40]);
    assert_eq!(muxer.total_reader_count(), 1);

    drop(player);
    drop(muxer);
    assert!(registry.snapshot("", "", "live", "cam1").is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_no_reader_event_after_delay() {
    let registry = registry();
    let mut events = registry.bus().subscribe();
    let config = MuxerConfig::default().only_sinks(&[SinkKind::Rtsp]);
    let factory = Arc::new(FanoutSinkFactory::new(registry.clone(), config.clone()));
    let muxer = MultiMediaSourceMuxer::new(&registry, key(), config, factory);

    muxer.add_track(video_track());
    muxer.add_track_completed();
    muxer.input_frame(h264(0, true));

    let source = registry
        .find(&StreamKey::new("rtsp", "", "live", "cam1"), false)
        .unwrap();
    let player = source.attach_reader().unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    drop(player);

    let no_reader = |events: &mut tokio::sync::broadcast::Receiver<MediaEvent>| {
        let mut seen = false;
        while let Ok(event) = events.try_recv() {
            seen |= matches!(event, MediaEvent::NoReader { .. });
        }
        seen
    };

    tokio::time::sleep(Duration::from_millis(19_900)).await;
    assert!(!no_reader(&mut events));

    tokio::time::sleep(Duration::from_millis(200)).await;
    for _ in 0..4 {
        tokio::task::yield_now().await;
    }
    assert!(no_reader(&mut events));
}
