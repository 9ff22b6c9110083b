//! Ingest task: the single writer behind a store.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use kestrel_core::{WatchMessage, WatchQuery};
use metrics::{counter, histogram};
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, trace};

use crate::builder::StoreBuilder;
use crate::coalesce::Coalescer;
use crate::store::Shared;

/// Feed serial: distinguishes successive subscriptions of one query.
pub(crate) type Lease = u64;

#[derive(Debug)]
pub(crate) enum Command {
    Register { query: WatchQuery, lease: Lease },
    Message { query: WatchQuery, lease: Lease, msg: WatchMessage },
    Release { query: WatchQuery, lease: Lease },
}

pub(crate) struct Ingest {
    pub builder: StoreBuilder,
    pub leases: FxHashMap<WatchQuery, Lease>,
    pub interval: Duration,
    pub shared: Arc<Shared>,
    pub generation: u64,
}

impl Ingest {
    pub(crate) async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        let mut coalescer = Coalescer::new();
        let mut deadline: Option<Instant> = None;
        loop {
            tokio::select! {
                maybe = rx.recv() => {
                    match maybe {
                        Some(cmd) => {
                            if self.handle(cmd, &mut coalescer) && deadline.is_none() {
                                deadline = Some(Instant::now() + self.interval);
                            }
                        }
                        None => {
                            debug!("command channel closed; draining and exiting ingest loop");
                            self.flush(&mut coalescer);
                            break;
                        }
                    }
                }
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    deadline = None;
                    self.flush(&mut coalescer);
                }
            }
        }
        info!("ingest loop stopped");
    }

    /// Returns true when a message was buffered.
    fn handle(&mut self, cmd: Command, coalescer: &mut Coalescer) -> bool {
        match cmd {
            Command::Message { query, lease, msg } => {
                if self.leases.get(&query) != Some(&lease) {
                    trace!(query = %query, lease, "message from stale feed dropped");
                    return false;
                }
                coalescer.push(query, msg);
                true
            }
            Command::Register { query, lease } => {
                if let Some(prev) = self.leases.insert(query.clone(), lease) {
                    if prev != lease {
                        // Re-added before the old feed's release arrived.
                        coalescer.discard_query(&query);
                        if let Some(snap) = self.builder.release(&query) {
                            self.shared.publish(self.generation, snap);
                        }
                    }
                }
                if let Some(snap) = self.builder.register(query) {
                    self.shared.publish(self.generation, snap);
                }
                false
            }
            Command::Release { query, lease } => {
                if self.leases.get(&query) != Some(&lease) {
                    return false;
                }
                self.leases.remove(&query);
                let dropped = coalescer.discard_query(&query);
                debug!(query = %query, dropped, "released query");
                if let Some(snap) = self.builder.release(&query) {
                    self.shared.publish(self.generation, snap);
                }
                false
            }
        }
    }

    fn flush(&mut self, coalescer: &mut Coalescer) {
        if coalescer.is_empty() {
            return;
        }
        let started = std::time::Instant::now();
        let batch = coalescer.drain_ready();
        let events = batch.len();
        let next = self.builder.apply(batch);
        histogram!("store_flush_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("store_flush_events", events as u64);
        if let Some(snap) = next {
            counter!("store_flush_total", 1u64);
            debug!(epoch = snap.epoch, events, items = snap.len(), state = ?snap.state, "snapshot published");
            self.shared.publish(self.generation, snap);
        }
    }
}
