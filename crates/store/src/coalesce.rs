#![forbid(unsafe_code)]

use std::collections::VecDeque;

use kestrel_core::{WatchMessage, WatchQuery};

/// Messages waiting for the next flush, in arrival order across all queries.
#[derive(Debug, Default)]
pub struct Coalescer {
    pending: VecDeque<(WatchQuery, WatchMessage)>,
}

impl Coalescer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn push(&mut self, query: WatchQuery, msg: WatchMessage) {
        self.pending.push_back((query, msg));
    }

    /// Drop everything buffered for `query`; returns how many messages went.
    pub fn discard_query(&mut self, query: &WatchQuery) -> usize {
        let before = self.pending.len();
        self.pending.retain(|(q, _)| q != query);
        before - self.pending.len()
    }

    /// Take the whole buffer, oldest first.
    pub fn drain_ready(&mut self) -> Vec<(WatchQuery, WatchMessage)> {
        self.pending.drain(..).collect()
    }
}
