//! Track descriptions
//!
//! A track is one elementary stream (one video or one audio stream) inside a
//! published source. Tracks are cheap to clone; the optional extra data
//! (parameter sets, decoder config) is reference counted.

use bytes::Bytes;
use serde::Serialize;

/// Elementary stream kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    /// Video track
    Video,
    /// Audio track
    Audio,
}

impl MediaType {
    /// Slot index for per-media-type arrays
    pub const fn index(self) -> usize {
        match self {
            MediaType::Video => 0,
            MediaType::Audio => 1,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            MediaType::Video => "video",
            MediaType::Audio => "audio",
        }
    }
}

impl std::fmt::Display for MediaType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Codec identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum CodecId {
    H264,
    H265,
    Vp8,
    Vp9,
    Av1,
    Jpeg,
    Aac,
    G711A,
    G711U,
    Opus,
    L16,
    Mp3,
}

impl CodecId {
    /// Media type carried by this codec
    pub const fn media_type(self) -> MediaType {
        match self {
            CodecId::H264
            | CodecId::H265
            | CodecId::Vp8
            | CodecId::Vp9
            | CodecId::Av1
            | CodecId::Jpeg => MediaType::Video,
            CodecId::Aac
            | CodecId::G711A
            | CodecId::G711U
            | CodecId::Opus
            | CodecId::L16
            | CodecId::Mp3 => MediaType::Audio,
        }
    }

    /// Whether a decoder needs out-of-band parameter sets before the
    /// first frame can be decoded
    pub const fn needs_parameter_sets(self) -> bool {
        matches!(self, CodecId::H264 | CodecId::H265)
    }

    pub const fn name(self) -> &'static str {
        match self {
            CodecId::H264 => "H264",
            CodecId::H265 => "H265",
            CodecId::Vp8 => "VP8",
            CodecId::Vp9 => "VP9",
            CodecId::Av1 => "AV1",
            CodecId::Jpeg => "JPEG",
            CodecId::Aac => "AAC",
            CodecId::G711A => "G711A",
            CodecId::G711U => "G711U",
            CodecId::Opus => "Opus",
            CodecId::L16 => "L16",
            CodecId::Mp3 => "MP3",
        }
    }
}

impl std::fmt::Display for CodecId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// One elementary stream of a source
#[derive(Debug, Clone, PartialEq)]
pub struct Track {
    codec: CodecId,
    /// Parameter sets / decoder configuration, possibly learned late from
    /// an in-band config frame
    extra_data: Option<Bytes>,
}

impl Track {
    /// Create a track without decoder configuration
    pub fn new(codec: CodecId) -> Self {
        Self {
            codec,
            extra_data: None,
        }
    }

    /// Attach decoder configuration up front
    pub fn with_extra_data(mut self, extra_data: Bytes) -> Self {
        self.extra_data = Some(extra_data);
        self
    }

    pub fn codec(&self) -> CodecId {
        self.codec
    }

    pub fn media_type(&self) -> MediaType {
        self.codec.media_type()
    }

    pub fn extra_data(&self) -> Option<&Bytes> {
        self.extra_data.as_ref()
    }

    /// Attach decoder configuration learned after the track was added
    pub fn set_extra_data(&mut self, extra_data: Bytes) {
        self.extra_data = Some(extra_data);
    }

    /// Whether enough is known about the track to describe it to a muxer
    pub fn is_ready(&self) -> bool {
        !self.codec.needs_parameter_sets() || self.extra_data.is_some()
    }
}

impl std::fmt::Display for Track {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[{}]", self.codec, self.media_type())
    }
}
