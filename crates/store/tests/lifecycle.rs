#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use kestrel_core::{ResourceId, Value, WatchError, WatchEvent, WatchQuery};
use kestrel_store::{MemorySource, ResourceStore, StoreConfig, StoreError, StoreState};
use tokio::time::sleep;

const SETTLE: Duration = Duration::from_millis(150);

fn pods() -> WatchQuery {
    WatchQuery::new("v1", "Pod", Some("default"))
}

fn config_maps() -> WatchQuery {
    WatchQuery::new("v1", "ConfigMap", Some("default"))
}

fn doc(kind: &str, name: &str) -> Value {
    Value::from(serde_json::json!({
        "apiVersion": "v1",
        "kind": kind,
        "metadata": {"name": name, "namespace": "default"},
    }))
}

fn id(kind: &str, name: &str) -> ResourceId {
    ResourceId::new("v1", kind, Some("default"), name)
}

fn store_with(source: &MemorySource, queries: Vec<WatchQuery>) -> ResourceStore {
    ResourceStore::new(Arc::new(source.clone()), queries, StoreConfig::default())
}

#[tokio::test(start_paused = true)]
async fn errors_keep_stale_data_until_next_event() {
    let source = MemorySource::new();
    let store = store_with(&source, vec![pods()]);
    store.start().unwrap();

    source.send(&pods(), WatchEvent::InitialList(vec![doc("Pod", "a")])).await;
    sleep(SETTLE).await;
    source.send(&pods(), WatchError::new("connection reset")).await;
    sleep(SETTLE).await;

    let snap = store.snapshot();
    assert_eq!(snap.state, StoreState::Ready);
    assert!(snap.contains(&id("Pod", "a")));
    assert_eq!(snap.error.as_ref().map(|e| e.message.as_str()), Some("connection reset"));

    source.send(&pods(), WatchEvent::Add(doc("Pod", "b"))).await;
    sleep(SETTLE).await;
    let snap = store.snapshot();
    assert!(snap.error.is_none());
    assert_eq!(snap.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn loading_until_every_query_has_listed() {
    let source = MemorySource::new();
    let store = store_with(&source, vec![pods(), config_maps()]);
    store.start().unwrap();

    source.send(&pods(), WatchEvent::InitialList(vec![doc("Pod", "a")])).await;
    sleep(SETTLE).await;
    assert_eq!(store.snapshot().state, StoreState::Loading);
    assert_eq!(store.snapshot().len(), 1);

    source.send(&config_maps(), WatchEvent::InitialList(vec![])).await;
    sleep(SETTLE).await;
    assert_eq!(store.snapshot().state, StoreState::Ready);
}

#[tokio::test(start_paused = true)]
async fn initial_list_leaves_other_queries_alone() {
    let source = MemorySource::new();
    let store = store_with(&source, vec![pods(), config_maps()]);
    store.start().unwrap();

    source.send(&pods(), WatchEvent::InitialList(vec![doc("Pod", "a")])).await;
    source.send(&config_maps(), WatchEvent::InitialList(vec![doc("ConfigMap", "c")])).await;
    sleep(SETTLE).await;
    source.send(&pods(), WatchEvent::InitialList(vec![doc("Pod", "b")])).await;
    sleep(SETTLE).await;

    let snap = store.snapshot();
    assert!(snap.contains(&id("ConfigMap", "c")));
    assert!(snap.contains(&id("Pod", "b")));
}

#[tokio::test(start_paused = true)]
async fn removing_a_query_purges_its_items_and_buffered_events() {
    let source = MemorySource::new();
    let store = store_with(&source, vec![pods(), config_maps()]);
    store.start().unwrap();

    source.send(&pods(), WatchEvent::InitialList(vec![doc("Pod", "a")])).await;
    source.send(&config_maps(), WatchEvent::InitialList(vec![doc("ConfigMap", "c")])).await;
    sleep(SETTLE).await;

    source.send(&config_maps(), WatchEvent::Add(doc("ConfigMap", "late"))).await;
    source.send(&pods(), WatchEvent::Add(doc("Pod", "b"))).await;
    assert!(store.remove_query(&config_maps()));
    sleep(SETTLE).await;

    let snap = store.snapshot();
    assert!(!snap.contains(&id("ConfigMap", "c")));
    assert!(!snap.contains(&id("ConfigMap", "late")));
    assert!(snap.contains(&id("Pod", "a")));
    assert!(snap.contains(&id("Pod", "b")));
    assert_eq!(snap.state, StoreState::Ready);
    assert!(!source.is_subscribed(&config_maps()));
    assert!(!source.send(&config_maps(), WatchEvent::Add(doc("ConfigMap", "ghost"))).await);
    assert_eq!(store.queries(), vec![pods()]);
}

#[tokio::test(start_paused = true)]
async fn adding_a_query_while_running_goes_back_to_loading() {
    let source = MemorySource::new();
    let store = store_with(&source, vec![pods()]);
    store.start().unwrap();
    source.send(&pods(), WatchEvent::InitialList(vec![])).await;
    sleep(SETTLE).await;
    assert_eq!(store.snapshot().state, StoreState::Ready);

    assert!(store.add_query(config_maps()).unwrap());
    assert!(!store.add_query(config_maps()).unwrap());
    sleep(Duration::from_millis(1)).await;
    assert_eq!(store.snapshot().state, StoreState::Loading);

    source.send(&config_maps(), WatchEvent::InitialList(vec![doc("ConfigMap", "c")])).await;
    sleep(SETTLE).await;
    let snap = store.snapshot();
    assert_eq!(snap.state, StoreState::Ready);
    assert!(snap.contains(&id("ConfigMap", "c")));
}

#[tokio::test(start_paused = true)]
async fn last_unsubscribe_tears_down() {
    let source = MemorySource::new();
    let store = store_with(&source, vec![pods()]);
    let first = store.subscribe(|_| {}).unwrap();
    let second = store.subscribe(|_| {}).unwrap();
    assert!(store.is_running());

    source.send(&pods(), WatchEvent::InitialList(vec![doc("Pod", "a")])).await;
    sleep(SETTLE).await;
    let ready_epoch = store.snapshot().epoch;

    assert!(store.unsubscribe(first));
    assert!(store.is_running());
    assert!(!store.unsubscribe(first));
    assert!(store.unsubscribe(second));

    let snap = store.snapshot();
    assert!(!store.is_running());
    assert_eq!(snap.state, StoreState::Uninitialized);
    assert!(snap.is_empty());
    assert!(snap.epoch > ready_epoch);
    assert!(!source.is_subscribed(&pods()));

    store.subscribe(|_| {}).unwrap();
    assert_eq!(store.snapshot().state, StoreState::Loading);
    assert!(store.snapshot().epoch > snap.epoch);
    assert!(source.is_subscribed(&pods()));
}

#[tokio::test]
async fn subscription_failure_leaves_store_stopped() {
    let source = MemorySource::new();
    source.reject(&config_maps(), "forbidden");
    let store = store_with(&source, vec![pods(), config_maps()]);
    let err = store.start().unwrap_err();
    assert!(matches!(err, StoreError::Subscribe { ref reason, .. } if reason == "forbidden"));
    assert!(!store.is_running());
    assert_eq!(store.snapshot().state, StoreState::Uninitialized);
}

#[test]
fn starting_outside_a_runtime_fails() {
    let source = MemorySource::new();
    let store = store_with(&source, vec![pods()]);
    assert!(matches!(store.subscribe(|_| {}), Err(StoreError::NoRuntime)));
    assert!(!store.is_running());
}
