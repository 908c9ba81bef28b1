//! Bounded look-back ring with independent readers
//!
//! The ring keeps the most recent `capacity` entries. Every entry carries a
//! timestamp and a GOP-start flag so that a late joiner can be positioned at
//! a random-access point instead of mid-GOP:
//!
//! ```text
//!   seq:    17   18   19   20   21   22   23
//!          [K ] [  ] [  ] [K ] [  ] [  ] [  ]     K = GOP start
//!                          ^ attach() starts here
//! ```
//!
//! Readers hold their own cursor; the writer never waits for them. A reader
//! whose cursor was evicted skips forward to the latest retained GOP start
//! (or the oldest entry if none is retained).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tokio::sync::watch;

type ReaderHook = Arc<dyn Fn(usize) + Send + Sync>;

#[derive(Debug)]
struct Entry<T> {
    seq: u64,
    stamp: u64,
    gop_start: bool,
    item: T,
}

#[derive(Debug)]
struct RingState<T> {
    entries: VecDeque<Entry<T>>,
    /// Sequence number of the next write
    next_seq: u64,
}

impl<T> RingState<T> {
    fn latest_gop_start(&self, at_or_before: u64) -> Option<u64> {
        self.entries
            .iter()
            .rev()
            .find(|e| e.gop_start && e.stamp <= at_or_before)
            .map(|e| e.seq)
    }

    fn start_for(&self, at: u64) -> u64 {
        self.latest_gop_start(at)
            .or_else(|| self.entries.front().map(|e| e.seq))
            .unwrap_or(self.next_seq)
    }
}

struct Shared<T> {
    state: RwLock<RingState<T>>,
    capacity: usize,
    /// Carries `next_seq`; bumped on every write and on close
    wake: watch::Sender<u64>,
    closed: AtomicBool,
    readers: AtomicUsize,
    on_readers_changed: RwLock<Option<ReaderHook>>,
}

impl<T> Shared<T> {
    fn notify_readers(&self, count: usize) {
        let hook = self.on_readers_changed.read().clone();
        if let Some(hook) = hook {
            hook(count);
        }
    }

    fn wake_all(&self) {
        let next = *self.wake.borrow();
        self.wake.send_replace(next);
    }
}

/// Writer side of the ring
///
/// Dropping the ring closes it: readers drain what is retained and then
/// observe the end of the stream.
pub struct LookbackRing<T> {
    shared: Arc<Shared<T>>,
}

impl<T: Clone> LookbackRing<T> {
    /// Create a ring retaining at most `capacity` entries
    pub fn new(capacity: usize) -> Self {
        let (wake, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                state: RwLock::new(RingState {
                    entries: VecDeque::with_capacity(capacity.min(4096)),
                    next_seq: 0,
                }),
                capacity: capacity.max(1),
                wake,
                closed: AtomicBool::new(false),
                readers: AtomicUsize::new(0),
                on_readers_changed: RwLock::new(None),
            }),
        }
    }

    /// Append an entry, evicting the oldest when full
    pub fn write(&self, item: T, stamp: u64, gop_start: bool) {
        let next = {
            let mut state = self.shared.state.write();
            let seq = state.next_seq;
            state.next_seq += 1;
            state.entries.push_back(Entry {
                seq,
                stamp,
                gop_start,
                item,
            });
            while state.entries.len() > self.shared.capacity {
                state.entries.pop_front();
            }
            state.next_seq
        };
        self.shared.wake.send_replace(next);
    }

    /// Attach a reader at the latest GOP start
    pub fn attach(&self) -> RingReader<T> {
        RingReader::attach(&self.shared, u64::MAX)
    }

    /// Attach a reader at the latest GOP start stamped at or before `stamp`
    pub fn attach_at(&self, stamp: u64) -> RingReader<T> {
        RingReader::attach(&self.shared, stamp)
    }

    /// Weak attach handle that can be stored away from the writer
    pub fn attacher(&self) -> RingAttacher<T> {
        RingAttacher {
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Install a callback receiving the reader count after every change
    pub fn set_reader_hook<F>(&self, hook: F)
    where
        F: Fn(usize) + Send + Sync + 'static,
    {
        *self.shared.on_readers_changed.write() = Some(Arc::new(hook));
    }

    pub fn reader_count(&self) -> usize {
        self.shared.readers.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.shared.state.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Drop every retained entry; attached readers continue from the next write
    pub fn clear(&self) {
        self.shared.state.write().entries.clear();
    }
}

impl<T> Drop for LookbackRing<T> {
    fn drop(&mut self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.wake_all();
    }
}

impl<T> std::fmt::Debug for LookbackRing<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LookbackRing")
            .field("capacity", &self.shared.capacity)
            .field("readers", &self.shared.readers.load(Ordering::Relaxed))
            .finish()
    }
}

/// Weak handle that attaches readers while the ring is alive
pub struct RingAttacher<T> {
    shared: Weak<Shared<T>>,
}

impl<T: Clone> RingAttacher<T> {
    /// Attach at the latest GOP start, or `None` once the ring is closed
    pub fn attach(&self) -> Option<RingReader<T>> {
        let shared = self.shared.upgrade()?;
        if shared.closed.load(Ordering::Acquire) {
            return None;
        }
        Some(RingReader::attach(&shared, u64::MAX))
    }
}

impl<T> Clone for RingAttacher<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

#[derive(Debug, Default)]
struct ReaderMark {
    detached: AtomicBool,
}

/// Reader side of the ring with its own cursor
pub struct RingReader<T> {
    shared: Arc<Shared<T>>,
    cursor: u64,
    rx: watch::Receiver<u64>,
    skipped: u64,
    mark: Arc<ReaderMark>,
}

impl<T: Clone> RingReader<T> {
    fn attach(shared: &Arc<Shared<T>>, at: u64) -> Self {
        let cursor = shared.state.read().start_for(at);
        let count = shared.readers.fetch_add(1, Ordering::AcqRel) + 1;
        let reader = Self {
            shared: shared.clone(),
            cursor,
            rx: shared.wake.subscribe(),
            skipped: 0,
            mark: Arc::new(ReaderMark::default()),
        };
        shared.notify_readers(count);
        reader
    }

    /// Next entry if one is available
    pub fn try_next(&mut self) -> Option<T> {
        if self.is_detached() {
            return None;
        }
        let state = self.shared.state.read();
        let head = state.entries.front()?.seq;
        if self.cursor < head {
            let resume = state.latest_gop_start(u64::MAX).unwrap_or(head);
            self.skipped += resume - self.cursor;
            tracing::debug!(
                skipped = resume - self.cursor,
                "Reader fell behind ring, resyncing"
            );
            self.cursor = resume;
        }
        let entry = state.entries.get((self.cursor - head) as usize)?;
        self.cursor += 1;
        Some(entry.item.clone())
    }

    /// Wait for the next entry; `None` once the ring is closed and drained
    /// or the reader was detached
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            self.rx.borrow_and_update();
            if let Some(item) = self.try_next() {
                return Some(item);
            }
            if self.is_detached() || self.shared.closed.load(Ordering::Acquire) {
                return None;
            }
            if self.rx.changed().await.is_err() {
                return None;
            }
        }
    }

    /// Handle that can detach this reader from elsewhere
    pub fn handle(&self) -> ReaderHandle<T> {
        ReaderHandle {
            mark: Arc::downgrade(&self.mark),
            shared: Arc::downgrade(&self.shared),
        }
    }
}

impl<T> RingReader<T> {
    /// Entries skipped because the reader fell behind
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    pub fn is_detached(&self) -> bool {
        self.mark.detached.load(Ordering::Acquire)
    }
}

impl<T> Drop for RingReader<T> {
    fn drop(&mut self) {
        let count = self.shared.readers.fetch_sub(1, Ordering::AcqRel) - 1;
        self.shared.notify_readers(count);
    }
}

/// Remote control for a [`RingReader`]
pub struct ReaderHandle<T> {
    mark: Weak<ReaderMark>,
    shared: Weak<Shared<T>>,
}

impl<T> ReaderHandle<T> {
    /// Whether the reader still exists and has not been detached
    pub fn is_alive(&self) -> bool {
        self.mark
            .upgrade()
            .is_some_and(|mark| !mark.detached.load(Ordering::Acquire))
    }

    /// End the reader's stream; its next `recv` returns `None`
    pub fn detach(&self) {
        if let Some(mark) = self.mark.upgrade() {
            mark.detached.store(true, Ordering::Release);
        }
        if let Some(shared) = self.shared.upgrade() {
            shared.wake_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    fn filled(stamps: &[(u64, bool)]) -> LookbackRing<u64> {
        let ring = LookbackRing::new(16);
        for &(stamp, gop) in stamps {
            ring.write(stamp, stamp, gop);
        }
        ring
    }

    #[test]
    fn test_attach_at_latest_gop_start() {
        let ring = filled(&[(0, true), (40, false), (80, true), (120, false)]);
        let mut reader = ring.attach();
        assert_eq!(reader.try_next(), Some(80));
        assert_eq!(reader.try_next(), Some(120));
        assert_eq!(reader.try_next(), None);
    }

    #[test]
    fn test_attach_before_stamp() {
        let ring = filled(&[(0, true), (40, false), (80, true), (120, false)]);
        let mut reader = ring.attach_at(60);
        assert_eq!(reader.try_next(), Some(0));
    }

    #[test]
    fn test_attach_without_gop_start_uses_oldest() {
        let ring = filled(&[(10, false), (20, false)]);
        let mut reader = ring.attach();
        assert_eq!(reader.try_next(), Some(10));
    }

    #[test]
    fn test_lagging_reader_resyncs() {
        let ring = LookbackRing::new(4);
        ring.write(0, 0, true);
        let mut reader = ring.attach();

        for stamp in 1..=6u64 {
            ring.write(stamp, stamp, stamp == 5);
        }
        assert_eq!(reader.try_next(), Some(5));
        assert_eq!(reader.skipped(), 5);
        assert_eq!(reader.try_next(), Some(6));
    }

    #[test]
    fn test_capacity_bounds_retention() {
        let ring = LookbackRing::new(3);
        for stamp in 0..10u64 {
            ring.write(stamp, stamp, false);
        }
        assert_eq!(ring.len(), 3);
    }

    #[test]
    fn test_reader_hook_counts() {
        let ring = LookbackRing::<u64>::new(4);
        let seen = Arc::new(AtomicUsize::new(usize::MAX));
        let last = seen.clone();
        ring.set_reader_hook(move |count| last.store(count, Ordering::SeqCst));

        let a = ring.attach();
        let b = ring.attacher().attach().unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 2);

        drop(a);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        drop(b);
        assert_eq!(ring.reader_count(), 0);
    }

    #[tokio::test]
    async fn test_recv_wakes_on_write_and_ends_on_close() {
        let ring = LookbackRing::new(8);
        let mut reader = ring.attach();

        let task = tokio::spawn(async move {
            let mut got = Vec::new();
            while let Some(item) = reader.recv().await {
                got.push(item);
            }
            got
        });

        tokio::task::yield_now().await;
        ring.write(1u64, 0, true);
        ring.write(2u64, 40, false);
        drop(ring);

        assert_eq!(task.await.unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_recv_pending_until_write() {
        let ring = LookbackRing::<u64>::new(8);
        let mut reader = ring.attach();
        let mut recv = tokio_test::task::spawn(reader.recv());

        tokio_test::assert_pending!(recv.poll());
        ring.write(7, 0, true);
        assert!(recv.is_woken());
        assert_eq!(tokio_test::assert_ready!(recv.poll()), Some(7));
    }

    #[tokio::test]
    async fn test_detach_ends_reader() {
        let ring = LookbackRing::<u64>::new(8);
        let mut reader = ring.attach();
        let handle = reader.handle();
        assert!(handle.is_alive());

        handle.detach();
        assert!(!handle.is_alive());
        assert_eq!(reader.recv().await, None);
        assert!(ring.attacher().attach().is_some());
    }
}
