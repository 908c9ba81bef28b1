//! Merge-write batching
//!
//! Writing every frame to a ring individually wakes every reader once per
//! frame. [`MergeWriteCache`] accumulates consecutive units and releases
//! them as one batch according to a [`FlushPolicy`]:
//!
//! - a timestamp regression of more than [`SEEK_REGRESSION_LIMIT`] (a seek)
//!   always flushes
//! - a video keyframe always flushes, so a batch never straddles a GOP
//!   boundary
//! - with merging disabled, a timestamp change flushes
//! - with merging enabled, exceeding the merge window flushes
//! - [`MAX_BATCH_LEN`] pending units always flush

/// Timestamp regression (ms) treated as a seek
pub const SEEK_REGRESSION_LIMIT: u64 = 500;

/// Upper bound on units held in one batch
pub const MAX_BATCH_LEN: usize = 1024;

/// Decides when pending units are released
#[derive(Debug, Clone, Default)]
pub struct FlushPolicy {
    /// Merge window in ms; 0 disables merging
    merge_ms: u64,
    /// Timestamp of the last flush, per media type (audio, video)
    last_stamp: [u64; 2],
}

impl FlushPolicy {
    pub fn new(merge_ms: u64) -> Self {
        Self {
            merge_ms,
            last_stamp: [0; 2],
        }
    }

    pub fn merge_ms(&self) -> u64 {
        self.merge_ms
    }

    /// Whether the pending batch must be released before a unit stamped
    /// `new_stamp` is added
    pub fn should_flush(
        &mut self,
        is_video: bool,
        is_keyframe: bool,
        new_stamp: u64,
        pending: usize,
    ) -> bool {
        let slot = is_video as usize;
        let last = self.last_stamp[slot];

        let flush = if new_stamp + SEEK_REGRESSION_LIMIT < last {
            true
        } else if is_video && is_keyframe {
            true
        } else if self.merge_ms == 0 {
            last != new_stamp || pending >= MAX_BATCH_LEN
        } else {
            new_stamp > last + self.merge_ms || pending >= MAX_BATCH_LEN
        };

        if flush {
            self.last_stamp[slot] = new_stamp;
        }
        flush
    }
}

/// A released batch
#[derive(Debug, Clone)]
pub struct FlushBatch<T> {
    /// Units in arrival order
    pub items: Vec<T>,
    /// Batch begins at a random-access point
    pub key_pos: bool,
    /// Timestamp of the first unit
    pub first_stamp: u64,
    /// Timestamp of the last unit added
    pub last_stamp: u64,
}

/// Accumulates units and releases them in batches
#[derive(Debug)]
pub struct MergeWriteCache<T> {
    policy: FlushPolicy,
    pending: Vec<T>,
    key_pos: bool,
    first_stamp: u64,
    last_stamp: u64,
    /// Release after every unit instead of waiting for the next one
    flush_immediately: bool,
}

impl<T> MergeWriteCache<T> {
    /// Create a cache
    ///
    /// With `merge_ms == 0` and `coalesce_same_stamp == false` every unit is
    /// released as soon as it is added, which is the lowest latency mode.
    /// Packetized payloads (several packets sharing one timestamp) set
    /// `coalesce_same_stamp` so one frame's packets still travel together.
    pub fn new(merge_ms: u64, coalesce_same_stamp: bool) -> Self {
        Self {
            policy: FlushPolicy::new(merge_ms),
            pending: Vec::new(),
            key_pos: false,
            first_stamp: 0,
            last_stamp: 0,
            flush_immediately: merge_ms == 0 && !coalesce_same_stamp,
        }
    }

    /// Add a unit, returning the batch released by it (if any)
    ///
    /// `key_pos` marks the unit as a random-access point; only the first
    /// unit of a batch decides the batch's `key_pos`.
    pub fn input(&mut self, stamp: u64, is_video: bool, key_pos: bool, item: T) -> Option<FlushBatch<T>> {
        let mut released = None;
        if self.flush_immediately {
            self.push(stamp, key_pos, item);
            released = self.flush();
        } else {
            if self
                .policy
                .should_flush(is_video, key_pos, stamp, self.pending.len())
            {
                released = self.flush();
            }
            self.push(stamp, key_pos, item);
        }
        released
    }

    /// Release whatever is pending
    pub fn flush(&mut self) -> Option<FlushBatch<T>> {
        if self.pending.is_empty() {
            return None;
        }
        let batch = FlushBatch {
            items: std::mem::take(&mut self.pending),
            key_pos: self.key_pos,
            first_stamp: self.first_stamp,
            last_stamp: self.last_stamp,
        };
        self.key_pos = false;
        Some(batch)
    }

    /// Drop pending units
    pub fn clear(&mut self) {
        self.pending.clear();
        self.key_pos = false;
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    fn push(&mut self, stamp: u64, key_pos: bool, item: T) {
        if self.pending.is_empty() {
            self.key_pos = key_pos;
            self.first_stamp = stamp;
        }
        self.last_stamp = stamp;
        self.pending.push(item);
    }
}
