//! Media frames
//!
//! Frames are the unit fed into a muxer by a publisher and handed to every
//! sink. They are designed to be cheap to clone due to `Bytes` reference
//! counting, so fanning one frame out to many sinks never copies payload.

use bytes::Bytes;

use super::track::{CodecId, MediaType};

/// One encoded media unit
#[derive(Debug, Clone)]
pub struct Frame {
    /// Codec of the owning track
    pub codec: CodecId,
    /// Decode timestamp in milliseconds
    pub dts: u64,
    /// Presentation timestamp in milliseconds
    pub pts: u64,
    /// Encoded payload (zero-copy via reference counting)
    pub data: Bytes,
    /// Random access point (video only)
    pub is_keyframe: bool,
    /// In-band parameter sets / decoder configuration
    pub is_config: bool,
    /// Frame may be discarded without breaking decoding
    pub is_droppable: bool,
}

impl Frame {
    /// Create a video frame
    pub fn video(codec: CodecId, dts: u64, pts: u64, data: Bytes, is_keyframe: bool) -> Self {
        Self {
            codec,
            dts,
            pts,
            data,
            is_keyframe,
            is_config: false,
            is_droppable: false,
        }
    }

    /// Create a video parameter-set frame (SPS/PPS/VPS)
    pub fn video_config(codec: CodecId, dts: u64, data: Bytes) -> Self {
        Self {
            codec,
            dts,
            pts: dts,
            data,
            is_keyframe: false,
            is_config: true,
            is_droppable: false,
        }
    }

    /// Create an audio frame
    pub fn audio(codec: CodecId, dts: u64, data: Bytes) -> Self {
        Self {
            codec,
            dts,
            pts: dts,
            data,
            is_keyframe: false,
            is_config: false,
            is_droppable: false,
        }
    }

    pub fn media_type(&self) -> MediaType {
        self.codec.media_type()
    }

    pub fn is_video(&self) -> bool {
        self.media_type() == MediaType::Video
    }

    /// Keyframe or config frame of a video track
    pub fn is_key_or_config(&self) -> bool {
        self.is_video() && (self.is_keyframe || self.is_config)
    }

    /// Payload size in bytes
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Copy of this frame with rewritten timestamps
    pub fn with_stamps(&self, dts: u64, pts: u64) -> Self {
        Self {
            dts,
            pts,
            ..self.clone()
        }
    }
}
