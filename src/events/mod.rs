//! Process-wide media event bus
//!
//! Lifecycle events are published on a `tokio::sync::broadcast` channel.
//! Publishing never blocks and never holds a registry lock; listeners that
//! fall behind observe `RecvError::Lagged` and should re-query the registry.

use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::registry::{MediaSource, StreamKey};
use crate::stats::FlowReport;

/// Default capacity of the event channel
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Events published by the registry and by sources
#[derive(Debug, Clone)]
pub enum MediaEvent {
    /// A source was inserted into the registry
    Registered {
        key: StreamKey,
        source: Weak<MediaSource>,
    },
    /// A source left the registry
    Unregistered { key: StreamKey },
    /// A lookup missed; a listener may start a pull or resolve the waiter
    /// early through the responder
    NotFound {
        key: StreamKey,
        responder: NotFoundResponder,
    },
    /// Total reader count of a source changed
    ReaderCountChanged { key: StreamKey, count: usize },
    /// A source has had zero readers for the configured delay
    NoReader {
        key: StreamKey,
        source: Weak<MediaSource>,
    },
    /// A reader detached
    FlowReport { key: StreamKey, report: FlowReport },
}

impl MediaEvent {
    /// Stream the event refers to
    pub fn key(&self) -> &StreamKey {
        match self {
            MediaEvent::Registered { key, .. }
            | MediaEvent::Unregistered { key }
            | MediaEvent::NotFound { key, .. }
            | MediaEvent::ReaderCountChanged { key, .. }
            | MediaEvent::NoReader { key, .. }
            | MediaEvent::FlowReport { key, .. } => key,
        }
    }
}

type Respond = Box<dyn FnOnce() + Send + 'static>;

/// Lets a `NotFound` listener close a pending lookup immediately
///
/// Only the first call to [`respond_not_found`](Self::respond_not_found)
/// has any effect, however many clones of the event are delivered.
#[derive(Clone)]
pub struct NotFoundResponder {
    respond: Arc<Mutex<Option<Respond>>>,
}

impl NotFoundResponder {
    pub(crate) fn new<F>(respond: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            respond: Arc::new(Mutex::new(Some(Box::new(respond)))),
        }
    }

    /// Resolve the waiting lookup with "no source"
    pub fn respond_not_found(&self) {
        let respond = self.respond.lock().take();
        if let Some(respond) = respond {
            respond();
        }
    }
}

impl std::fmt::Debug for NotFoundResponder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotFoundResponder")
            .field("pending", &self.respond.lock().is_some())
            .finish()
    }
}

/// Broadcast bus for [`MediaEvent`]s
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<MediaEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Process-wide bus
    pub fn global() -> &'static EventBus {
        static BUS: OnceLock<EventBus> = OnceLock::new();
        BUS.get_or_init(|| EventBus::new(DEFAULT_EVENT_CAPACITY))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MediaEvent> {
        self.tx.subscribe()
    }

    /// Publish an event, returning how many listeners received it
    pub fn emit(&self, event: MediaEvent) -> usize {
        // No receivers is not an error
        self.tx.send(event).unwrap_or(0)
    }

    pub fn listener_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn test_responder_fires_once() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let responder = NotFoundResponder::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let copy = responder.clone();
        responder.respond_not_found();
        copy.respond_not_found();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_emit_without_listeners() {
        let bus = EventBus::new(8);
        let key = StreamKey::new("rtmp", "", "live", "cam");
        assert_eq!(bus.emit(MediaEvent::Unregistered { key: key.clone() }), 0);

        let mut rx = bus.subscribe();
        assert_eq!(bus.emit(MediaEvent::Unregistered { key }), 1);
        let event = rx.recv().await.unwrap();
        assert_eq!(event.key().stream, "cam");
    }
}
