//! Fan-out demo - one synthetic publisher, several players
//!
//! Run with: cargo run --example fanout -- [seconds]
//!
//! This demo shows:
//! - A publisher session acting as the muxer's event delegate
//! - Players waiting for a stream with `find_wait` before it is published
//! - Late joiners starting at the most recent keyframe
//! - Registry events (registration, reader counts, flow reports) on the bus
//!
//! ```text
//!   SyntheticPublisher ──► MultiMediaSourceMuxer ──┬──► rtsp FanoutSink ──► player-1
//!                                                  └──► rtmp FanoutSink ──► player-2
//! ```

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use mediahub::{
    CodecId, FanoutSinkFactory, Frame, MediaEvent, MediaRegistry, MediaSource, MediaSourceEvent,
    MultiMediaSourceMuxer, MuxerConfig, OriginType, Poller, SinkKind, StreamKey, Track,
};

const FRAME_MS: u64 = 40;
const GOP_FRAMES: u64 = 25;

/// Stands in for an RTMP publish session
struct SyntheticPublisher {
    poller: Poller,
}

impl MediaSourceEvent for SyntheticPublisher {
    fn origin_type(&self, _sender: &MediaSource) -> OriginType {
        OriginType::RtmpPush
    }

    fn owner_poller(&self) -> Option<Poller> {
        Some(self.poller.clone())
    }
}

async fn play(registry: Arc<MediaRegistry>, name: &'static str, schema: &'static str) {
    let key = StreamKey::new(schema, "", "live", "demo");
    let Some(source) = registry.find_wait(&key, Duration::from_secs(5)).await else {
        tracing::warn!(player = name, "Stream never appeared");
        return;
    };
    let Some(mut reader) = source.attach_reader() else {
        tracing::warn!(player = name, "Stream has no output");
        return;
    };
    drop(source);

    let mut frames = 0usize;
    while let Some(batch) = reader.recv().await {
        if frames == 0 {
            let first = &batch[0];
            tracing::info!(player = name, dts = first.dts, keyframe = first.is_keyframe, "First frame");
        }
        frames += batch.len();
    }
    tracing::info!(player = name, frames, bytes = reader.bytes(), "Player finished");
}

async fn watch_events(registry: Arc<MediaRegistry>) {
    let mut events = registry.bus().subscribe();
    while let Ok(event) = events.recv().await {
        match event {
            MediaEvent::Registered { key, .. } => tracing::info!(stream = %key, "event: registered"),
            MediaEvent::Unregistered { key } => tracing::info!(stream = %key, "event: unregistered"),
            MediaEvent::ReaderCountChanged { key, count } => {
                tracing::info!(stream = %key, count, "event: readers")
            }
            MediaEvent::FlowReport { key, report } => {
                tracing::info!(stream = %key, bytes = report.total_bytes, "event: flow report")
            }
            MediaEvent::NotFound { key, .. } => tracing::info!(stream = %key, "event: not found"),
            MediaEvent::NoReader { key, .. } => tracing::info!(stream = %key, "event: no reader"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let seconds: u64 = std::env::args()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(5);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("mediahub=debug".parse()?)
                .add_directive("fanout=info".parse()?),
        )
        .init();

    let registry = MediaRegistry::global().clone();
    tokio::spawn(watch_events(registry.clone()));

    let early = tokio::spawn(play(registry.clone(), "player-1", "rtsp"));

    let config = MuxerConfig::default()
        .only_sinks(&[SinkKind::Rtsp, SinkKind::Rtmp])
        .merge_write_ms(120);
    let factory = Arc::new(FanoutSinkFactory::new(registry.clone(), config.clone()));
    let muxer = MultiMediaSourceMuxer::new(
        &registry,
        StreamKey::new("", "", "live", "demo"),
        config,
        factory,
    );

    let publisher: Arc<dyn MediaSourceEvent> = Arc::new(SyntheticPublisher {
        poller: registry.pollers().get(),
    });
    muxer.set_delegate(Arc::downgrade(&publisher));

    muxer.add_track(Track::new(CodecId::Aac));
    let sps = Bytes::from_static(&[0x67, 0x42, 0x00, 0x1f]);
    muxer.add_track(Track::new(CodecId::H264).with_extra_data(sps));
    muxer.add_track_completed();

    let mut late = None;
    let mut ticker = tokio::time::interval(Duration::from_millis(FRAME_MS));
    for n in 0..(seconds * 1000 / FRAME_MS) {
        ticker.tick().await;
        let dts = n * FRAME_MS;
        let key = n % GOP_FRAMES == 0;
        let size = if key { 4096 } else { 512 };
        muxer.input_frame(Frame::video(CodecId::H264, dts, dts, Bytes::from(vec![0u8; size]), key));
        muxer.input_frame(Frame::audio(CodecId::Aac, dts, Bytes::from_static(&[0u8; 64])));

        if n == 60 {
            late = Some(tokio::spawn(play(registry.clone(), "player-2", "rtmp")));
        }
    }

    muxer.flush();
    tracing::info!(readers = muxer.total_reader_count(), "Publisher done");
    drop(muxer);

    early.await?;
    if let Some(late) = late {
        late.await?;
    }
    Ok(())
}
