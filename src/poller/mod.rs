//! Single-threaded execution contexts
//!
//! A [`Poller`] is a tokio task that drains a queue of closures one at a
//! time. Every source, muxer and session is bound to exactly one poller and
//! mutates its own state only from closures running there, so no two
//! closures of the same poller ever run concurrently.
//!
//! ```text
//!    post(f) ──► mpsc ──► [poller task] ──► f()
//!    delay(d, f) ──► sleep(d) ──► post(f)
//!    repeat(d, f) ──► interval(d) ──► post(f) ...
//! ```

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

type Task = Box<dyn FnOnce() + Send + 'static>;

static NEXT_POLLER_ID: AtomicUsize = AtomicUsize::new(1);

tokio::task_local! {
    static CURRENT_POLLER: usize;
}

/// Handle to a single-threaded execution context
///
/// Cloning the handle is cheap; the poller task stops once every handle is
/// dropped.
#[derive(Clone)]
pub struct Poller {
    id: usize,
    tx: mpsc::UnboundedSender<Task>,
}

impl Poller {
    /// Spawn a new poller on the current tokio runtime
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn spawn() -> Self {
        let id = NEXT_POLLER_ID.fetch_add(1, Ordering::Relaxed);
        let (tx, mut rx) = mpsc::unbounded_channel::<Task>();

        tokio::spawn(CURRENT_POLLER.scope(id, async move {
            while let Some(task) = rx.recv().await {
                if catch_unwind(AssertUnwindSafe(task)).is_err() {
                    tracing::error!(poller = id, "Task panicked on poller");
                }
            }
            tracing::trace!(poller = id, "Poller stopped");
        }));

        Self { id, tx }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Whether the caller is running on this poller
    pub fn is_current(&self) -> bool {
        CURRENT_POLLER
            .try_with(|id| *id == self.id)
            .unwrap_or(false)
    }

    /// Queue a closure; never runs it inline
    ///
    /// Returns false if the poller has stopped.
    pub fn post<F>(&self, f: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.tx.send(Box::new(f)).is_ok()
    }

    /// Run `f` on this poller after `after` elapses
    ///
    /// Dropping or cancelling the returned task prevents `f` from running.
    pub fn delay<F>(&self, after: Duration, f: F) -> DelayTask
    where
        F: FnOnce() + Send + 'static,
    {
        let cancelled = Arc::new(AtomicBool::new(false));
        let finished = Arc::new(AtomicBool::new(false));
        let flag = cancelled.clone();
        let done = finished.clone();
        let poller = self.clone();

        let handle = tokio::spawn(async move {
            time::sleep(after).await;
            poller.post(move || {
                done.store(true, Ordering::Release);
                if !flag.load(Ordering::Acquire) {
                    f();
                }
            });
        });

        DelayTask {
            cancelled,
            finished,
            handle,
        }
    }

    /// Run `f` on this poller every `every` until it returns false or the
    /// task is cancelled
    ///
    /// A zero period is raised to one millisecond.
    pub fn repeat<F>(&self, every: Duration, f: F) -> DelayTask
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let every = every.max(Duration::from_millis(1));
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = cancelled.clone();
        let poller = self.clone();
        let f = Arc::new(Mutex::new(f));

        let handle = tokio::spawn(async move {
            let mut ticker = time::interval_at(time::Instant::now() + every, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                if flag.load(Ordering::Acquire) {
                    break;
                }
                let flag = flag.clone();
                let f = f.clone();
                poller.post(move || {
                    if flag.load(Ordering::Acquire) {
                        return;
                    }
                    if !(f.lock())() {
                        flag.store(true, Ordering::Release);
                    }
                });
            }
        });

        DelayTask {
            cancelled,
            finished: Arc::new(AtomicBool::new(false)),
            handle,
        }
    }
}

impl PartialEq for Poller {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Poller {}

impl std::fmt::Debug for Poller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Poller").field("id", &self.id).finish()
    }
}

/// Handle to a pending [`Poller::delay`] or [`Poller::repeat`] task
///
/// The timer is released when the handle is dropped.
#[derive(Debug)]
pub struct DelayTask {
    cancelled: Arc<AtomicBool>,
    /// Set once a one-shot delay has run its closure
    finished: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl DelayTask {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.handle.abort();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Neither cancelled nor already fired
    pub fn is_pending(&self) -> bool {
        !self.is_cancelled() && !self.finished.load(Ordering::Acquire)
    }
}

impl Drop for DelayTask {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Fixed set of pollers handed out round-robin
pub struct PollerPool {
    pollers: Vec<Poller>,
    next: AtomicUsize,
}

impl PollerPool {
    /// Spawn `size` pollers (at least one) on the current runtime
    pub fn new(size: usize) -> Self {
        let pollers = (0..size.max(1)).map(|_| Poller::spawn()).collect();
        Self {
            pollers,
            next: AtomicUsize::new(0),
        }
    }

    /// Process-wide pool, one poller per available CPU
    ///
    /// Spawned lazily on first use, which must happen inside a runtime.
    pub fn global() -> &'static Arc<PollerPool> {
        static POOL: OnceLock<Arc<PollerPool>> = OnceLock::new();
        POOL.get_or_init(|| {
            let size = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1);
            Arc::new(PollerPool::new(size))
        })
    }

    /// Pick a poller, preferring the caller's own
    pub fn get(&self) -> Poller {
        if let Some(current) = self.pollers.iter().find(|p| p.is_current()) {
            return current.clone();
        }
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.pollers.len();
        self.pollers[idx].clone()
    }

    pub fn len(&self) -> usize {
        self.pollers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pollers.is_empty()
    }
}
