//! Folds batches of watch messages into immutable snapshots.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use kestrel_core::{ResourceId, Value, WatchError, WatchEvent, WatchMessage, WatchQuery};
use metrics::counter;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreState {
    Uninitialized,
    /// At least one active query has not delivered its initial listing.
    Loading,
    Ready,
}

/// Immutable view of the store at one epoch.
#[derive(Debug, Clone)]
pub struct StoreSnapshot {
    pub epoch: u64,
    pub state: StoreState,
    pub ids: Arc<BTreeSet<ResourceId>>,
    pub resources: Arc<FxHashMap<ResourceId, Value>>,
    /// Most recent unresolved watch error across queries.
    pub error: Option<WatchError>,
}

impl Default for StoreSnapshot {
    fn default() -> Self {
        Self::uninitialized(0)
    }
}

impl StoreSnapshot {
    pub fn uninitialized(epoch: u64) -> Self {
        Self {
            epoch,
            state: StoreState::Uninitialized,
            ids: Arc::default(),
            resources: Arc::default(),
            error: None,
        }
    }

    pub fn get(&self, id: &ResourceId) -> Option<&Value> {
        self.resources.get(id)
    }

    pub fn contains(&self, id: &ResourceId) -> bool {
        self.ids.contains(id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn is_ready(&self) -> bool {
        self.state == StoreState::Ready
    }

    /// Resources in identifier order.
    pub fn iter(&self) -> impl Iterator<Item = (&ResourceId, &Value)> + '_ {
        self.ids.iter().filter_map(|id| self.resources.get(id).map(|v| (id, v)))
    }
}

#[derive(Debug, Default)]
struct QueryState {
    loaded: bool,
    error: Option<WatchError>,
    /// Identifiers this query contributed.
    owned: FxHashSet<ResourceId>,
}

struct Table {
    ids: Arc<BTreeSet<ResourceId>>,
    resources: Arc<FxHashMap<ResourceId, Value>>,
    changed: bool,
}

impl Table {
    fn upsert(&mut self, id: ResourceId, item: Value) {
        if let Some(prev) = self.resources.get(&id) {
            if prev.same(&item) || *prev == item {
                return;
            }
        }
        if !self.ids.contains(&id) {
            Arc::make_mut(&mut self.ids).insert(id.clone());
        }
        Arc::make_mut(&mut self.resources).insert(id, item);
        self.changed = true;
    }

    fn remove(&mut self, id: &ResourceId) {
        if self.ids.contains(id) {
            Arc::make_mut(&mut self.ids).remove(id);
            Arc::make_mut(&mut self.resources).remove(id);
            self.changed = true;
        }
    }
}

/// Single-writer state behind a store. Not shared; the ingest task owns it.
pub struct StoreBuilder {
    active: bool,
    queries: BTreeMap<WatchQuery, QueryState>,
    current: Arc<StoreSnapshot>,
}

impl Default for StoreBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl StoreBuilder {
    pub fn new() -> Self {
        Self::new_at(0)
    }

    /// Start numbering after `epoch`, so restarts never reuse an epoch.
    pub fn new_at(epoch: u64) -> Self {
        Self { active: false, queries: BTreeMap::new(), current: Arc::new(StoreSnapshot::uninitialized(epoch)) }
    }

    pub fn snapshot(&self) -> Arc<StoreSnapshot> {
        Arc::clone(&self.current)
    }

    pub fn is_registered(&self, query: &WatchQuery) -> bool {
        self.queries.contains_key(query)
    }

    /// Move out of `Uninitialized`.
    pub fn activate(&mut self) -> Arc<StoreSnapshot> {
        self.active = true;
        let table = self.table();
        self.commit(table).unwrap_or_else(|| self.snapshot())
    }

    /// Track a query. Registering twice is a no-op.
    pub fn register(&mut self, query: WatchQuery) -> Option<Arc<StoreSnapshot>> {
        if self.queries.contains_key(&query) {
            return None;
        }
        debug!(query = %query, "query registered");
        self.queries.insert(query, QueryState::default());
        let table = self.table();
        self.commit(table)
    }

    /// Forget a query and drop the resources no other query contributed.
    pub fn release(&mut self, query: &WatchQuery) -> Option<Arc<StoreSnapshot>> {
        let state = self.queries.remove(query)?;
        let mut table = self.table();
        let mut purged = 0usize;
        for id in state.owned.iter() {
            if !self.queries.values().any(|q| q.owned.contains(id)) {
                table.remove(id);
                purged += 1;
            }
        }
        debug!(query = %query, purged, "query released");
        self.commit(table)
    }

    /// Fold `batch` in arrival order. Returns the new snapshot only when
    /// something observable changed.
    pub fn apply(&mut self, batch: Vec<(WatchQuery, WatchMessage)>) -> Option<Arc<StoreSnapshot>> {
        let mut table = self.table();
        for (query, msg) in batch {
            let Some(state) = self.queries.get_mut(&query) else {
                trace!(query = %query, "message for unregistered query ignored");
                continue;
            };
            match msg {
                WatchMessage::Error(err) => {
                    counter!("watch_errors_total", 1u64);
                    warn!(query = %query, error = %err, "watch error");
                    state.error = Some(err);
                }
                WatchMessage::Event(event) => {
                    state.error = None;
                    match event {
                        WatchEvent::InitialList(items) => {
                            state.loaded = true;
                            for item in items {
                                upsert(state, &mut table, &query, item);
                            }
                        }
                        WatchEvent::Add(item) | WatchEvent::Update(item) => {
                            upsert(state, &mut table, &query, item);
                        }
                        WatchEvent::Remove(id) => {
                            for q in self.queries.values_mut() {
                                q.owned.remove(&id);
                            }
                            table.remove(&id);
                        }
                    }
                }
            }
        }
        self.commit(table)
    }

    /// Back to `Uninitialized` with no queries and no data.
    pub fn reset(&mut self) -> Arc<StoreSnapshot> {
        self.active = false;
        self.queries.clear();
        let next = Arc::new(StoreSnapshot::uninitialized(self.current.epoch + 1));
        self.current = Arc::clone(&next);
        next
    }

    fn table(&self) -> Table {
        Table { ids: Arc::clone(&self.current.ids), resources: Arc::clone(&self.current.resources), changed: false }
    }

    fn state(&self) -> StoreState {
        if !self.active {
            StoreState::Uninitialized
        } else if self.queries.values().all(|q| q.loaded) {
            StoreState::Ready
        } else {
            StoreState::Loading
        }
    }

    fn last_error(&self) -> Option<WatchError> {
        self.queries.values().filter_map(|q| q.error.as_ref()).max_by_key(|e| e.at).cloned()
    }

    fn commit(&mut self, table: Table) -> Option<Arc<StoreSnapshot>> {
        let state = self.state();
        let error = self.last_error();
        if !table.changed && state == self.current.state && error == self.current.error {
            return None;
        }
        let next = Arc::new(StoreSnapshot {
            epoch: self.current.epoch + 1,
            state,
            ids: table.ids,
            resources: table.resources,
            error,
        });
        self.current = Arc::clone(&next);
        Some(next)
    }
}

fn upsert(state: &mut QueryState, table: &mut Table, query: &WatchQuery, item: Value) {
    let Some(id) = ResourceId::from_value(&item) else {
        warn!(query = %query, "skipping resource without apiVersion/kind/metadata.name");
        return;
    };
    state.owned.insert(id.clone());
    table.upsert(id, item);
}
