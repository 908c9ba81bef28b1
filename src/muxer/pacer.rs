//! Output pacing
//!
//! Publishers over lossy or buffered links often deliver frames in bursts.
//! The pacer holds frames and releases each one at `dts + depth` on a clock
//! anchored at the first frame, so sinks see a steady cadence.
//!
//! The depth starts at zero and grows by one quantum whenever a tick finds
//! the queue starved (input is arriving later than it is released). If the
//! queue grows past the backlog cap everything is flushed at once and the
//! depth starts over.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::media::Frame;

/// Jitter-smoothing release queue
#[derive(Debug)]
pub struct FramePacer {
    /// Frames ordered by release stamp
    queue: VecDeque<(u64, Frame)>,
    quantum: u64,
    depth: u64,
    max_depth: u64,
    backlog_cap: usize,
    /// Wall clock and stream stamp the release clock started at
    anchor: Option<(Instant, u64)>,
    /// Frames accepted since the last tick
    arrived: usize,
}

impl FramePacer {
    pub fn new(quantum: Duration, backlog_cap: usize) -> Self {
        let quantum = (quantum.as_millis() as u64).max(1);
        let backlog_cap = backlog_cap.max(1);
        Self {
            queue: VecDeque::new(),
            quantum,
            depth: 0,
            max_depth: quantum * backlog_cap as u64,
            backlog_cap,
            anchor: None,
            arrived: 0,
        }
    }

    /// Current smoothing depth
    pub fn depth(&self) -> Duration {
        Duration::from_millis(self.depth)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Queue a frame
    ///
    /// Returns the whole backlog when the queue exceeds the cap.
    pub fn push(&mut self, frame: Frame, now: Instant) -> Option<Vec<Frame>> {
        let (_, base) = *self.anchor.get_or_insert((now, frame.dts));
        let release = frame.dts.saturating_sub(base) + self.depth;
        let pos = self
            .queue
            .partition_point(|(r, f)| (*r, f.dts) <= (release, frame.dts));
        self.queue.insert(pos, (release, frame));
        self.arrived += 1;

        if self.queue.len() <= self.backlog_cap {
            return None;
        }
        tracing::debug!(backlog = self.queue.len(), "Pacer backlog exceeded, catching up");
        self.depth = 0;
        self.anchor = None;
        Some(self.drain_all())
    }

    /// Release every frame due at `now`
    pub fn tick(&mut self, now: Instant) -> Vec<Frame> {
        let Some((start, _)) = self.anchor else {
            return Vec::new();
        };
        let clock = now.saturating_duration_since(start).as_millis() as u64;

        let mut released = Vec::new();
        while self.queue.front().is_some_and(|(r, _)| *r <= clock) {
            if let Some((_, frame)) = self.queue.pop_front() {
                released.push(frame);
            }
        }

        if self.queue.is_empty() && self.arrived > 0 && self.depth < self.max_depth {
            self.depth += self.quantum;
            tracing::trace!(depth_ms = self.depth, "Pacer starved, deepening");
        }
        self.arrived = 0;
        released
    }

    /// Release everything queued
    pub fn drain_all(&mut self) -> Vec<Frame> {
        self.queue.drain(..).map(|(_, f)| f).collect()
    }
}
