//! Watch source seam: where events come from.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use kestrel_core::{WatchMessage, WatchQuery};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

/// Stops delivery for one subscription.
#[derive(Debug)]
pub struct CancelHandle {
    tx: Option<oneshot::Sender<()>>,
}

impl CancelHandle {
    /// A handle plus the receiver the producer listens on.
    pub fn pair() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx: Some(tx) }, rx)
    }

    pub fn noop() -> Self {
        Self { tx: None }
    }

    pub fn cancel(mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(());
        }
    }
}

/// One live subscription.
#[derive(Debug)]
pub struct WatchStream {
    pub rx: mpsc::Receiver<WatchMessage>,
    pub cancel: CancelHandle,
}

/// Anything that can stream watch messages for a query.
///
/// `subscribe` is called from within a tokio runtime and must not block.
pub trait WatchSource: Send + Sync {
    fn subscribe(&self, query: &WatchQuery) -> anyhow::Result<WatchStream>;
}

struct Subscription {
    tx: mpsc::Sender<WatchMessage>,
    cancelled: oneshot::Receiver<()>,
}

impl Subscription {
    fn is_live(&mut self) -> bool {
        !self.tx.is_closed() && matches!(self.cancelled.try_recv(), Err(oneshot::error::TryRecvError::Empty))
    }
}

#[derive(Default)]
struct MemoryInner {
    subs: BTreeMap<WatchQuery, Subscription>,
    rejected: BTreeMap<WatchQuery, String>,
}

/// In-process source driven by hand; used for replay and tests.
#[derive(Clone, Default)]
pub struct MemorySource {
    inner: Arc<Mutex<MemoryInner>>,
    cap: Option<usize>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(cap: usize) -> Self {
        Self { cap: Some(cap.max(1)), ..Self::default() }
    }

    /// Deliver `msg` to the live subscriber of `query`. Returns false when
    /// nobody is listening.
    pub async fn send(&self, query: &WatchQuery, msg: impl Into<WatchMessage>) -> bool {
        let tx = {
            let mut inner = self.lock();
            let Some(sub) = inner.subs.get_mut(query) else {
                return false;
            };
            if !sub.is_live() {
                inner.subs.remove(query);
                return false;
            }
            sub.tx.clone()
        };
        tx.send(msg.into()).await.is_ok()
    }

    pub fn is_subscribed(&self, query: &WatchQuery) -> bool {
        self.lock().subs.get_mut(query).is_some_and(Subscription::is_live)
    }

    /// End the stream for `query` from the producer side.
    pub fn close(&self, query: &WatchQuery) {
        self.lock().subs.remove(query);
    }

    /// Make the next subscriptions to `query` fail with `reason`.
    pub fn reject(&self, query: &WatchQuery, reason: impl Into<String>) {
        self.lock().rejected.insert(query.clone(), reason.into());
    }

    fn lock(&self) -> MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl WatchSource for MemorySource {
    fn subscribe(&self, query: &WatchQuery) -> anyhow::Result<WatchStream> {
        let mut inner = self.lock();
        if let Some(reason) = inner.rejected.get(query) {
            anyhow::bail!("{}", reason);
        }
        let (tx, rx) = mpsc::channel(self.cap.unwrap_or(crate::config::DEFAULT_QUEUE_CAP));
        let (cancel, cancelled) = CancelHandle::pair();
        inner.subs.insert(query.clone(), Subscription { tx, cancelled });
        debug!(query = %query, "memory source subscribed");
        Ok(WatchStream { rx, cancel })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_core::WatchEvent;

    #[tokio::test]
    async fn cancel_stops_delivery() {
        let source = MemorySource::new();
        let q = WatchQuery::new("v1", "Pod", None);
        assert!(!source.send(&q, WatchEvent::InitialList(vec![])).await);

        let WatchStream { mut rx, cancel } = source.subscribe(&q).unwrap();
        assert!(source.send(&q, WatchEvent::InitialList(vec![])).await);
        assert_eq!(rx.recv().await, Some(WatchEvent::InitialList(vec![]).into()));

        cancel.cancel();
        assert!(!source.is_subscribed(&q));
        assert!(!source.send(&q, WatchEvent::InitialList(vec![])).await);
    }

    #[tokio::test]
    async fn dropped_receiver_ends_subscription() {
        let source = MemorySource::new();
        let q = WatchQuery::new("v1", "ConfigMap", Some("default"));
        let stream = source.subscribe(&q).unwrap();
        assert!(source.is_subscribed(&q));
        drop(stream.rx);
        assert!(!source.send(&q, WatchEvent::InitialList(vec![])).await);
        assert!(!source.is_subscribed(&q));
        drop(stream.cancel);
    }

    #[test]
    fn rejected_queries_fail_to_subscribe() {
        let source = MemorySource::new();
        let q = WatchQuery::new("v1", "Secret", Some("x"));
        source.reject(&q, "forbidden");
        let err = source.subscribe(&q).unwrap_err();
        assert_eq!(err.to_string(), "forbidden");
    }
}
