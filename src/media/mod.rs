//! Track and frame types shared by the registry, the muxer and every sink

pub mod frame;
pub mod stamp;
pub mod track;

pub use frame::Frame;
pub use stamp::StampSync;
pub use track::{CodecId, MediaType, Track};
