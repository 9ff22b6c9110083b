#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use arc_swap::ArcSwap;
use kestrel_core::WatchQuery;
use rustc_hash::FxHashMap;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::builder::{StoreBuilder, StoreSnapshot};
use crate::config::StoreConfig;
use crate::ingest::{Command, Ingest, Lease};
use crate::source::{CancelHandle, WatchSource, WatchStream};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store must be started from within a tokio runtime")]
    NoRuntime,
    #[error("subscribing to {query} failed: {reason}")]
    Subscribe { query: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

type Listener = Arc<dyn Fn(&Arc<StoreSnapshot>) + Send + Sync>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Publication side shared with the ingest task.
pub(crate) struct Shared {
    snap: ArcSwap<StoreSnapshot>,
    epoch_tx: watch::Sender<u64>,
    listeners: Mutex<Vec<(ListenerId, Listener)>>,
    /// Bumped on every start/stop; publishes from older runs are refused.
    generation: Mutex<u64>,
}

impl Shared {
    fn new() -> Self {
        let (epoch_tx, _) = watch::channel(0u64);
        Self {
            snap: ArcSwap::from_pointee(StoreSnapshot::default()),
            epoch_tx,
            listeners: Mutex::new(Vec::new()),
            generation: Mutex::new(0),
        }
    }

    fn advance(&self) -> u64 {
        let mut g = lock(&self.generation);
        *g += 1;
        *g
    }

    fn snapshot(&self) -> Arc<StoreSnapshot> {
        self.snap.load_full()
    }

    /// Swap in `snap` and notify listeners. Returns false for a stale run.
    pub(crate) fn publish(&self, generation: u64, snap: Arc<StoreSnapshot>) -> bool {
        {
            let current = lock(&self.generation);
            if *current != generation {
                debug!(generation, current = *current, "stale publish dropped");
                return false;
            }
            self.snap.store(Arc::clone(&snap));
            self.epoch_tx.send_replace(snap.epoch);
        }
        let listeners: Vec<Listener> = lock(&self.listeners).iter().map(|(_, l)| Arc::clone(l)).collect();
        for listener in listeners {
            listener(&snap);
        }
        true
    }
}

struct Feed {
    lease: Lease,
    forward: JoinHandle<()>,
    cancel: CancelHandle,
}

impl Feed {
    fn close(self) {
        self.forward.abort();
        self.cancel.cancel();
    }
}

struct Running {
    handle: Handle,
    tx: mpsc::Sender<Command>,
    actor: JoinHandle<()>,
    feeds: BTreeMap<WatchQuery, Feed>,
}

impl Running {
    fn shutdown(self) {
        for feed in self.feeds.into_values() {
            feed.close();
        }
        self.actor.abort();
    }
}

struct Inner {
    source: Arc<dyn WatchSource>,
    config: StoreConfig,
    shared: Arc<Shared>,
    queries: Mutex<BTreeSet<WatchQuery>>,
    runtime: Mutex<Option<Running>>,
    next_lease: AtomicU64,
    next_listener: AtomicU64,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let running = self.runtime.get_mut().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(running) = running {
            running.shutdown();
        }
    }
}

/// Client-side cache for a set of watch queries.
///
/// Reads are lock-free snapshot loads. Writes happen on one ingest task per
/// running store; sources feed it through a bounded channel. The store runs
/// between [`start`](Self::start) and [`stop`](Self::stop), or between the
/// first [`subscribe`](Self::subscribe) and the last
/// [`unsubscribe`](Self::unsubscribe).
#[derive(Clone)]
pub struct ResourceStore {
    inner: Arc<Inner>,
}

impl ResourceStore {
    pub fn new(
        source: Arc<dyn WatchSource>,
        queries: impl IntoIterator<Item = WatchQuery>,
        config: StoreConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                source,
                config,
                shared: Arc::new(Shared::new()),
                queries: Mutex::new(queries.into_iter().collect()),
                runtime: Mutex::new(None),
                next_lease: AtomicU64::new(1),
                next_listener: AtomicU64::new(1),
            }),
        }
    }

    pub fn snapshot(&self) -> Arc<StoreSnapshot> {
        self.inner.shared.snapshot()
    }

    /// Epoch of every published snapshot.
    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> {
        self.inner.shared.epoch_tx.subscribe()
    }

    pub fn queries(&self) -> Vec<WatchQuery> {
        lock(&self.inner.queries).iter().cloned().collect()
    }

    pub fn is_running(&self) -> bool {
        lock(&self.inner.runtime).is_some()
    }

    /// Subscribe to every query and move to `Loading`. Idempotent.
    ///
    /// Must be called from within a tokio runtime; all tasks are spawned on it.
    pub fn start(&self) -> Result<(), StoreError> {
        let mut runtime = lock(&self.inner.runtime);
        if runtime.is_some() {
            return Ok(());
        }
        let handle = Handle::try_current().map_err(|_| StoreError::NoRuntime)?;
        let queries = self.queries();

        let (tx, rx) = mpsc::channel(self.inner.config.queue_cap.max(1));
        let mut feeds = BTreeMap::new();
        for query in queries {
            match self.open_feed(&handle, &tx, query.clone()) {
                Ok(feed) => {
                    feeds.insert(query, feed);
                }
                Err(err) => {
                    for feed in feeds.into_values() {
                        feed.close();
                    }
                    return Err(err);
                }
            }
        }

        let shared = &self.inner.shared;
        let generation = shared.advance();
        let mut builder = StoreBuilder::new_at(shared.snapshot().epoch);
        let mut leases = FxHashMap::default();
        for (query, feed) in feeds.iter() {
            builder.register(query.clone());
            leases.insert(query.clone(), feed.lease);
        }
        shared.publish(generation, builder.activate());

        let ingest = Ingest {
            builder,
            leases,
            interval: self.inner.config.effective_interval(),
            shared: Arc::clone(shared),
            generation,
        };
        let actor = handle.spawn(ingest.run(rx));
        info!(queries = feeds.len(), interval_ms = self.inner.config.effective_interval().as_millis() as u64, "store started");
        *runtime = Some(Running { handle, tx, actor, feeds });
        Ok(())
    }

    /// Cancel all subscriptions and drop back to `Uninitialized`.
    pub fn stop(&self) {
        let Some(running) = lock(&self.inner.runtime).take() else { return };
        running.shutdown();
        let shared = &self.inner.shared;
        let generation = shared.advance();
        let epoch = shared.snapshot().epoch + 1;
        shared.publish(generation, Arc::new(StoreSnapshot::uninitialized(epoch)));
        info!("store stopped");
    }

    /// Register a change listener; the first listener starts the store.
    ///
    /// Listeners run on the publishing task right after each swap and must
    /// not call back into `start`, `stop`, `subscribe` or `unsubscribe`.
    pub fn subscribe<F>(&self, listener: F) -> Result<ListenerId, StoreError>
    where
        F: Fn(&Arc<StoreSnapshot>) + Send + Sync + 'static,
    {
        let id = ListenerId(self.inner.next_listener.fetch_add(1, Ordering::Relaxed));
        let first = {
            let mut listeners = lock(&self.inner.shared.listeners);
            listeners.push((id, Arc::new(listener)));
            listeners.len() == 1
        };
        if first {
            if let Err(err) = self.start() {
                lock(&self.inner.shared.listeners).retain(|(l, _)| *l != id);
                return Err(err);
            }
        }
        Ok(id)
    }

    /// Remove a listener; removing the last one stops the store.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let (found, empty) = {
            let mut listeners = lock(&self.inner.shared.listeners);
            let before = listeners.len();
            listeners.retain(|(l, _)| *l != id);
            (listeners.len() != before, listeners.is_empty())
        };
        if found && empty {
            self.stop();
        }
        found
    }

    /// Watch one more query. Returns false if it was already watched.
    pub fn add_query(&self, query: WatchQuery) -> Result<bool, StoreError> {
        if !lock(&self.inner.queries).insert(query.clone()) {
            return Ok(false);
        }
        let mut runtime = lock(&self.inner.runtime);
        if let Some(running) = runtime.as_mut() {
            match self.open_feed(&running.handle, &running.tx, query.clone()) {
                Ok(feed) => {
                    running.feeds.insert(query, feed);
                }
                Err(err) => {
                    lock(&self.inner.queries).remove(&query);
                    return Err(err);
                }
            }
        }
        Ok(true)
    }

    /// Stop watching `query`, drop its buffered events and the resources
    /// only it contributed.
    pub fn remove_query(&self, query: &WatchQuery) -> bool {
        let removed = lock(&self.inner.queries).remove(query);
        let mut runtime = lock(&self.inner.runtime);
        if let Some(running) = runtime.as_mut() {
            if let Some(feed) = running.feeds.remove(query) {
                let lease = feed.lease;
                feed.close();
                let tx = running.tx.clone();
                let query = query.clone();
                running.handle.spawn(async move {
                    if tx.send(Command::Release { query, lease }).await.is_err() {
                        debug!("ingest gone before release");
                    }
                });
            }
        }
        removed
    }

    fn open_feed(&self, handle: &Handle, tx: &mpsc::Sender<Command>, query: WatchQuery) -> Result<Feed, StoreError> {
        let _guard = handle.enter();
        let WatchStream { mut rx, cancel } = self.inner.source.subscribe(&query).map_err(|e| {
            warn!(query = %query, error = %e, "watch subscribe failed");
            StoreError::Subscribe { query: query.to_string(), reason: format!("{:#}", e) }
        })?;
        let lease = self.inner.next_lease.fetch_add(1, Ordering::Relaxed);
        let tx = tx.clone();
        let forward = handle.spawn(async move {
            if tx.send(Command::Register { query: query.clone(), lease }).await.is_err() {
                return;
            }
            while let Some(msg) = rx.recv().await {
                if tx.send(Command::Message { query: query.clone(), lease, msg }).await.is_err() {
                    return;
                }
            }
            debug!(query = %query, "watch stream ended");
        });
        Ok(Feed { lease, forward, cancel })
    }
}
