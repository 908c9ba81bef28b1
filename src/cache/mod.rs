//! Write-side batching and the look-back ring readers attach to

pub mod flush;
pub mod ring;

use std::sync::Arc;

use crate::media::Frame;

pub use flush::{FlushBatch, FlushPolicy, MergeWriteCache, MAX_BATCH_LEN, SEEK_REGRESSION_LIMIT};
pub use ring::{LookbackRing, ReaderHandle, RingAttacher, RingReader};

/// One merge-write batch as stored in a sink's ring
pub type FrameBatch = Arc<Vec<Frame>>;
