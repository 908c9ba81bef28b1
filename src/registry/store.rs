//! Media registry implementation
//!
//! The process-wide index of live sources. Entries are weak: the registry
//! never keeps a source alive, and a dead entry is treated as absent.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, oneshot, Notify};
use tokio::time;

use super::config::RegistryConfig;
use super::error::RegistryError;
use super::key::{StreamKey, HLS_SCHEMA, RTMP_SCHEMA, RTSP_SCHEMA};
use super::source::MediaSource;
use crate::events::{EventBus, MediaEvent, NotFoundResponder};
use crate::poller::{Poller, PollerPool};

type StreamMap = HashMap<String, Weak<MediaSource>>;
type AppMap = HashMap<String, StreamMap>;
type VhostMap = HashMap<String, AppMap>;
type SchemaMap = HashMap<String, VhostMap>;

type FindCallback = Box<dyn FnOnce(Option<Arc<MediaSource>>) + Send + 'static>;

/// Creates sources on demand for lookups under the VOD app
///
/// The factory is expected to build and register the source; the registry
/// marks it auto-close so it disappears once nobody reads it.
pub trait OnDemandFactory: Send + Sync {
    fn create(&self, registry: &Arc<MediaRegistry>, key: &StreamKey) -> Option<Arc<MediaSource>>;
}

/// Central index of live sources keyed by `(schema, vhost, app, stream)`
///
/// The table lock is never held while events are published or delegates
/// are called.
pub struct MediaRegistry {
    sources: Mutex<SchemaMap>,
    config: RegistryConfig,
    bus: EventBus,
    pollers: Arc<PollerPool>,
    on_demand: RwLock<Option<Arc<dyn OnDemandFactory>>>,
}

impl MediaRegistry {
    /// Create a registry with its own event bus
    pub fn new(config: RegistryConfig, pollers: Arc<PollerPool>) -> Arc<Self> {
        let bus = EventBus::new(config.event_capacity);
        Self::with_bus(config, pollers, bus)
    }

    /// Create a registry publishing on an existing bus
    pub fn with_bus(config: RegistryConfig, pollers: Arc<PollerPool>, bus: EventBus) -> Arc<Self> {
        Arc::new(Self {
            sources: Mutex::new(HashMap::new()),
            config,
            bus,
            pollers,
            on_demand: RwLock::new(None),
        })
    }

    /// Process-wide registry with default configuration
    ///
    /// Uses the global poller pool and event bus; first use must happen
    /// inside a runtime.
    pub fn global() -> &'static Arc<MediaRegistry> {
        Self::init_global(RegistryConfig::default())
    }

    /// Process-wide registry; `config` only applies to the first call
    pub fn init_global(config: RegistryConfig) -> &'static Arc<MediaRegistry> {
        static REGISTRY: OnceLock<Arc<MediaRegistry>> = OnceLock::new();
        REGISTRY.get_or_init(|| {
            Self::with_bus(config, PollerPool::global().clone(), EventBus::global().clone())
        })
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn pollers(&self) -> &Arc<PollerPool> {
        &self.pollers
    }

    /// Install the factory consulted by on-demand lookups
    pub fn set_on_demand_factory(&self, factory: Arc<dyn OnDemandFactory>) {
        *self.on_demand.write() = Some(factory);
    }

    /// Insert a source
    ///
    /// Registering the instance already present is a no-op; a different
    /// live instance under the same key is rejected.
    pub fn register(&self, source: &Arc<MediaSource>) -> Result<(), RegistryError> {
        let key = source.key().clone();

        // released after the lock: dropping a last strong ref re-enters unregister
        let existing = {
            let mut sources = self.sources.lock();
            let streams = sources
                .entry(key.schema.clone())
                .or_default()
                .entry(key.vhost.clone())
                .or_default()
                .entry(key.app.clone())
                .or_default();
            match streams.get(&key.stream).and_then(Weak::upgrade) {
                Some(existing) => Some(existing),
                None => {
                    streams.insert(key.stream.clone(), Arc::downgrade(source));
                    None
                }
            }
        };

        if let Some(existing) = existing {
            if Arc::ptr_eq(&existing, source) {
                return Ok(());
            }
            tracing::warn!(stream = %key, "Media source already registered");
            return Err(RegistryError::AlreadyRegistered(key));
        }

        tracing::info!(
            stream = %key,
            origin = ?source.origin_type(),
            "Media registered"
        );
        source.notify_registered(true);
        self.bus.emit(MediaEvent::Registered {
            key,
            source: Arc::downgrade(source),
        });
        Ok(())
    }

    /// Remove a source if the entry is dead or is this very instance
    ///
    /// Idempotent; returns whether an entry was removed.
    pub fn unregister(&self, source: &MediaSource) -> bool {
        let key = source.key();
        let removed = {
            let mut sources = self.sources.lock();
            remove_entry(&mut sources, key, source)
        };
        if !removed {
            return false;
        }

        tracing::info!(stream = %key, alive_secs = source.alive().as_secs(), "Media unregistered");
        source.notify_registered(false);
        self.bus.emit(MediaEvent::Unregistered { key: key.clone() });
        true
    }

    /// Look a source up
    ///
    /// An empty app or stream name never matches. With `allow_on_demand`,
    /// a miss under the VOD app (and any schema but HLS) consults the
    /// on-demand factory.
    pub fn find(self: &Arc<Self>, key: &StreamKey, allow_on_demand: bool) -> Option<Arc<MediaSource>> {
        let key = key.clone().normalized(self.config.enable_vhost);
        if !key.is_complete() {
            return None;
        }
        if let Some(found) = self.lookup(&key) {
            return Some(found);
        }
        if !allow_on_demand || key.schema == HLS_SCHEMA || key.app != self.config.record_app {
            return None;
        }

        let factory = self.on_demand.read().clone()?;
        match factory.create(self, &key) {
            Some(source) => {
                source.set_auto_close(true);
                if let Err(e) = source.register() {
                    tracing::debug!(stream = %key, error = %e, "On-demand source lost registration race");
                    return self.lookup(&key);
                }
                Some(source)
            }
            None => {
                tracing::warn!(stream = %key, "On-demand source could not be created");
                None
            }
        }
    }

    /// Look a stream up under any of rtmp, rtsp or hls, in that order
    pub fn find_any(
        self: &Arc<Self>,
        vhost: &str,
        app: &str,
        stream: &str,
        allow_on_demand: bool,
    ) -> Option<Arc<MediaSource>> {
        [RTMP_SCHEMA, RTSP_SCHEMA, HLS_SCHEMA]
            .into_iter()
            .find_map(|schema| self.find(&StreamKey::new(schema, vhost, app, stream), allow_on_demand))
    }

    /// Wait up to `timeout` for a source to appear
    ///
    /// A hit is delivered inline. Otherwise a [`MediaEvent::NotFound`] is
    /// published once and `on_result` later runs exactly once on `poller`:
    /// with the source when a matching registration is observed, or with
    /// `None` on timeout or when a listener answers through the responder.
    pub fn find_async<F>(self: &Arc<Self>, key: &StreamKey, timeout: Duration, poller: &Poller, on_result: F)
    where
        F: FnOnce(Option<Arc<MediaSource>>) + Send + 'static,
    {
        let key = key.clone().normalized(self.config.enable_vhost);
        if let Some(source) = self.find(&key, true) {
            on_result(Some(source));
            return;
        }
        if !key.is_complete() {
            on_result(None);
            return;
        }

        let mut events = self.bus.subscribe();
        // registration may have landed between the miss and the subscribe
        if let Some(source) = self.find(&key, false) {
            on_result(Some(source));
            return;
        }

        let pending = Arc::new(PendingFind::new(Box::new(on_result)));
        let responder = {
            let pending = pending.clone();
            let poller = poller.clone();
            NotFoundResponder::new(move || {
                poller.post(move || {
                    pending.resolve(None);
                });
            })
        };

        tracing::debug!(stream = %key, timeout_ms = timeout.as_millis() as u64, "Media not found, waiting");
        self.bus.emit(MediaEvent::NotFound {
            key: key.clone(),
            responder,
        });

        let registry = Arc::downgrade(self);
        let poller = poller.clone();
        tokio::spawn(async move {
            let registered = tokio::select! {
                _ = time::sleep(timeout) => false,
                _ = pending.done.notified() => return,
                registered = wait_registered(&mut events, &key, &registry) => registered,
            };

            poller.post(move || {
                let found = if registered {
                    registry.upgrade().and_then(|r| r.find(&key, false))
                } else {
                    None
                };
                tracing::debug!(stream = %key, found = found.is_some(), "Pending lookup resolved");
                pending.resolve(found);
            });
        });
    }

    /// `find_async` as a future, resolved on a pool poller
    pub async fn find_wait(self: &Arc<Self>, key: &StreamKey, timeout: Duration) -> Option<Arc<MediaSource>> {
        let (tx, rx) = oneshot::channel();
        let poller = self.pollers.get();
        self.find_async(key, timeout, &poller, move |found| {
            let _ = tx.send(found);
        });
        rx.await.ok().flatten()
    }

    /// Snapshot of live sources matching a filter; empty fields match
    /// everything
    pub fn snapshot(&self, schema: &str, vhost: &str, app: &str, stream: &str) -> Vec<Arc<MediaSource>> {
        let vhost = match vhost {
            "" => "",
            _ if !self.config.enable_vhost => super::key::DEFAULT_VHOST,
            v => v,
        };

        let sources = self.sources.lock();
        let mut found = Vec::new();
        for (_, vhosts) in sources.iter().filter(|(s, _)| filter_matches(schema, s)) {
            for (_, apps) in vhosts.iter().filter(|(v, _)| filter_matches(vhost, v)) {
                for (_, streams) in apps.iter().filter(|(a, _)| filter_matches(app, a)) {
                    found.extend(
                        streams
                            .iter()
                            .filter(|(n, _)| filter_matches(stream, n))
                            .filter_map(|(_, weak)| weak.upgrade()),
                    );
                }
            }
        }
        found
    }

    /// Visit a snapshot of matching sources without holding the table lock
    pub fn for_each<F>(&self, schema: &str, vhost: &str, app: &str, stream: &str, mut f: F)
    where
        F: FnMut(&Arc<MediaSource>),
    {
        for source in self.snapshot(schema, vhost, app, stream) {
            f(&source);
        }
    }

    /// Number of live registered sources
    pub fn len(&self) -> usize {
        self.snapshot("", "", "", "").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lookup(&self, key: &StreamKey) -> Option<Arc<MediaSource>> {
        let sources = self.sources.lock();
        sources
            .get(&key.schema)?
            .get(&key.vhost)?
            .get(&key.app)?
            .get(&key.stream)?
            .upgrade()
    }
}

impl std::fmt::Debug for MediaRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaRegistry")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn filter_matches(filter: &str, value: &str) -> bool {
    filter.is_empty() || filter == value
}

fn remove_entry(sources: &mut SchemaMap, key: &StreamKey, source: &MediaSource) -> bool {
    let Some(vhosts) = sources.get_mut(&key.schema) else {
        return false;
    };
    let Some(apps) = vhosts.get_mut(&key.vhost) else {
        return false;
    };
    let Some(streams) = apps.get_mut(&key.app) else {
        return false;
    };
    let Some(weak) = streams.get(&key.stream) else {
        return false;
    };
    if weak.strong_count() != 0 && !std::ptr::eq(weak.as_ptr(), source) {
        return false;
    }

    streams.remove(&key.stream);
    if streams.is_empty() {
        apps.remove(&key.app);
    }
    if apps.is_empty() {
        vhosts.remove(&key.vhost);
    }
    if vhosts.is_empty() {
        sources.remove(&key.schema);
    }
    true
}

async fn wait_registered(
    events: &mut broadcast::Receiver<MediaEvent>,
    key: &StreamKey,
    registry: &Weak<MediaRegistry>,
) -> bool {
    loop {
        match events.recv().await {
            Ok(MediaEvent::Registered { key: registered, .. }) if registered == *key => return true,
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(_)) => {
                if registry.upgrade().and_then(|r| r.lookup(key)).is_some() {
                    return true;
                }
            }
            Err(broadcast::error::RecvError::Closed) => std::future::pending::<()>().await,
        }
    }
}

struct PendingFind {
    callback: Mutex<Option<FindCallback>>,
    done: Notify,
}

impl PendingFind {
    fn new(callback: FindCallback) -> Self {
        Self {
            callback: Mutex::new(Some(callback)),
            done: Notify::new(),
        }
    }

    /// Run the callback if nothing has yet
    fn resolve(&self, found: Option<Arc<MediaSource>>) {
        let callback = self.callback.lock().take();
        if let Some(callback) = callback {
            self.done.notify_one();
            callback(found);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::registry::key::DEFAULT_VHOST;

    fn registry() -> Arc<MediaRegistry> {
        MediaRegistry::new(RegistryConfig::default(), Arc::new(PollerPool::new(1)))
    }

    fn key(schema: &str, stream: &str) -> StreamKey {
        StreamKey::new(schema, "", "live", stream)
    }

    #[tokio::test]
    async fn test_register_and_find() {
        let registry = registry();
        let source = MediaSource::new(&registry, key("rtsp", "cam1"));
        source.register().unwrap();

        let found = registry.find(&key("rtsp", "cam1"), false).unwrap();
        assert!(Arc::ptr_eq(&found, &source));
        assert!(registry.find(&key("rtmp", "cam1"), false).is_none());
    }

    #[tokio::test]
    async fn test_duplicate_register_rejected() {
        let registry = registry();
        let first = MediaSource::new(&registry, key("rtsp", "cam1"));
        let second = MediaSource::new(&registry, key("rtsp", "cam1"));

        first.register().unwrap();
        first.register().unwrap();
        assert!(matches!(
            second.register(),
            Err(RegistryError::AlreadyRegistered(_))
        ));

        // a stranger's unregister leaves the owner in place
        assert!(!second.unregister());
        let found = registry.find(&key("rtsp", "cam1"), false).unwrap();
        assert!(Arc::ptr_eq(&found, &first));
    }

    #[tokio::test]
    async fn test_unregister_idempotent() {
        let registry = registry();
        let source = MediaSource::new(&registry, key("rtmp", "a"));
        source.register().unwrap();

        assert!(source.unregister());
        assert!(!source.unregister());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_dropped_source_disappears() {
        let registry = registry();
        let source = MediaSource::new(&registry, key("rtmp", "a"));
        source.register().unwrap();
        drop(source);

        assert!(registry.find(&key("rtmp", "a"), false).is_none());
        assert!(registry.sources.lock().is_empty());
    }

    #[tokio::test]
    async fn test_incomplete_key_never_matches() {
        let registry = registry();
        assert!(registry.find(&StreamKey::new("rtsp", "", "live", ""), true).is_none());
        assert!(registry.find(&StreamKey::new("rtsp", "", "", "cam"), true).is_none());
    }

    #[tokio::test]
    async fn test_find_any_prefers_rtmp() {
        let registry = registry();
        let rtsp = MediaSource::new(&registry, key("rtsp", "cam"));
        let rtmp = MediaSource::new(&registry, key("rtmp", "cam"));
        rtsp.register().unwrap();
        rtmp.register().unwrap();

        let found = registry.find_any("", "live", "cam", false).unwrap();
        assert_eq!(found.schema(), "rtmp");
    }

    #[tokio::test]
    async fn test_snapshot_filters() {
        let registry = registry();
        let sources: Vec<_> = ["a", "b"]
            .iter()
            .flat_map(|s| [key("rtsp", s), key("rtmp", s)])
            .map(|k| MediaSource::new(&registry, k))
            .collect();
        for source in &sources {
            source.register().unwrap();
        }

        assert_eq!(registry.snapshot("", "", "", "").len(), 4);
        assert_eq!(registry.snapshot("rtsp", "", "", "").len(), 2);
        assert_eq!(registry.snapshot("", DEFAULT_VHOST, "live", "b").len(), 2);
        assert_eq!(registry.snapshot("", "", "vod", "").len(), 0);
    }

    struct Vod {
        created: AtomicUsize,
        keep: Mutex<Vec<Arc<MediaSource>>>,
    }

    impl OnDemandFactory for Vod {
        fn create(&self, registry: &Arc<MediaRegistry>, key: &StreamKey) -> Option<Arc<MediaSource>> {
            self.created.fetch_add(1, Ordering::SeqCst);
            let source = MediaSource::new(registry, key.clone());
            self.keep.lock().push(source.clone());
            Some(source)
        }
    }

    #[tokio::test]
    async fn test_on_demand_only_for_record_app() {
        let registry = registry();
        let vod = Arc::new(Vod {
            created: AtomicUsize::new(0),
            keep: Mutex::new(Vec::new()),
        });
        registry.set_on_demand_factory(vod.clone());

        assert!(registry.find(&key("rtsp", "x"), true).is_none());
        assert!(registry
            .find(&StreamKey::new("hls", "", "record", "x.mp4"), true)
            .is_none());
        assert_eq!(vod.created.load(Ordering::SeqCst), 0);

        let vod_key = StreamKey::new("rtsp", "", "record", "x.mp4");
        assert!(registry.find(&vod_key, false).is_none());
        let source = registry.find(&vod_key, true).unwrap();
        assert!(source.is_auto_close());
        assert_eq!(vod.created.load(Ordering::SeqCst), 1);

        // second lookup hits the registered source
        registry.find(&vod_key, true).unwrap();
        assert_eq!(vod.created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_find_async_resolves_on_registration() {
        let registry = registry();
        let poller = registry.pollers().get();
        let (tx, rx) = oneshot::channel();

        registry.find_async(&key("rtsp", "late"), Duration::from_secs(2), &poller, move |found| {
            let _ = tx.send(found.map(|s| s.key().clone()));
        });

        time::sleep(Duration::from_millis(500)).await;
        let source = MediaSource::new(&registry, key("rtsp", "late"));
        source.register().unwrap();

        let found = rx.await.unwrap();
        assert_eq!(found, Some(key("rtsp", "late").normalized(false)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_find_async_times_out() {
        let registry = registry();
        let started = time::Instant::now();

        let found = registry
            .find_wait(&key("rtsp", "never"), Duration::from_secs(2))
            .await;
        assert!(found.is_none());
        assert!(started.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_found_responder_short_circuits() {
        let registry = registry();
        let mut events = registry.bus().subscribe();

        let listener = tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                if let MediaEvent::NotFound { responder, .. } = event {
                    responder.respond_not_found();
                    break;
                }
            }
        });

        let started = time::Instant::now();
        let found = registry
            .find_wait(&key("rtsp", "pull"), Duration::from_secs(10))
            .await;
        assert!(found.is_none());
        assert!(started.elapsed() < Duration::from_secs(10));
        listener.await.unwrap();
    }
}
