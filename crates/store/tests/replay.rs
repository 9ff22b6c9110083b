#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use kestrel_core::{ResourceId, Value, WatchEvent, WatchMessage, WatchQuery};
use kestrel_store::{StoreBuilder, StoreState};

fn obj(kind: &str, name: &str, ns: Option<&str>, rev: u32) -> Value {
    let mut meta = serde_json::json!({ "name": name, "resourceVersion": rev.to_string() });
    if let Some(ns) = ns {
        meta["namespace"] = serde_json::Value::String(ns.to_string());
    }
    Value::from(serde_json::json!({ "apiVersion": "v1", "kind": kind, "metadata": meta }))
}

fn id(kind: &str, name: &str, ns: Option<&str>) -> ResourceId {
    ResourceId::new("v1", kind, ns, name)
}

#[test]
fn replay_basic_sequence() {
    let cms = WatchQuery::new("v1", "ConfigMap", Some("ns"));
    let mut b = StoreBuilder::new();
    b.register(cms.clone());
    b.activate();

    let batch = |events: Vec<WatchEvent>| -> Vec<(WatchQuery, WatchMessage)> {
        events.into_iter().map(|e| (cms.clone(), e.into())).collect()
    };

    let snap1 = b
        .apply(batch(vec![
            WatchEvent::InitialList(vec![obj("ConfigMap", "a", Some("ns"), 1)]),
            WatchEvent::Add(obj("ConfigMap", "a", Some("ns"), 1)),
        ]))
        .unwrap();
    assert_eq!(snap1.state, StoreState::Ready);
    assert_eq!(snap1.len(), 1);

    let snap2 = b
        .apply(batch(vec![
            WatchEvent::Add(obj("ConfigMap", "b", Some("ns"), 2)),
            WatchEvent::Update(obj("ConfigMap", "a", Some("ns"), 3)),
            WatchEvent::Remove(id("ConfigMap", "b", Some("ns"))),
        ]))
        .unwrap();
    assert_eq!(snap2.epoch, snap1.epoch + 1);
    let names: Vec<&str> = snap2.ids.iter().map(ResourceId::name).collect();
    assert_eq!(names, vec!["a"]);
    let rev = snap2.get(&id("ConfigMap", "a", Some("ns"))).and_then(|v| v.get_path(&["metadata", "resourceVersion"]));
    assert_eq!(rev.and_then(Value::as_str), Some("3"));

    // Earlier snapshots are never touched by later batches.
    let old_rev = snap1.get(&id("ConfigMap", "a", Some("ns"))).and_then(|v| v.get_path(&["metadata", "resourceVersion"]));
    assert_eq!(old_rev.and_then(Value::as_str), Some("1"));
}

#[test]
fn initial_list_then_remove_then_add_in_one_batch() {
    let pods = WatchQuery::new("v1", "Pod", Some("default"));
    let mut b = StoreBuilder::new();
    b.register(pods.clone());
    b.activate();
    let snap = b
        .apply(vec![
            (pods.clone(), WatchEvent::InitialList(vec![obj("Pod", "p1", Some("default"), 1), obj("Pod", "p2", Some("default"), 1)]).into()),
            (pods.clone(), WatchEvent::Remove(id("Pod", "p1", Some("default"))).into()),
            (pods.clone(), WatchEvent::Add(obj("Pod", "p3", Some("default"), 1)).into()),
        ])
        .unwrap();
    let names: Vec<&str> = snap.ids.iter().map(ResourceId::name).collect();
    assert_eq!(names, vec!["p2", "p3"]);
}

fn run_stream(query: &WatchQuery, seq: &[WatchEvent]) -> BTreeMap<String, Value> {
    let mut b = StoreBuilder::new();
    b.register(query.clone());
    b.activate();
    for chunk in seq.chunks(2) {
        b.apply(chunk.iter().cloned().map(|e| (query.clone(), e.into())).collect());
    }
    b.snapshot().iter().map(|(id, v)| (id.canonical().to_string(), v.clone())).collect()
}

#[test]
fn independent_queries_replay_deterministically() {
    let cms = WatchQuery::new("v1", "ConfigMap", None);
    let secrets = WatchQuery::new("v1", "Secret", Some("prod"));
    let a_seq = vec![
        WatchEvent::InitialList(vec![obj("ConfigMap", "cm-a", Some("ns1"), 1)]),
        WatchEvent::Add(obj("ConfigMap", "cm-b", Some("ns2"), 2)),
        WatchEvent::Update(obj("ConfigMap", "cm-a", Some("ns1"), 3)),
    ];
    let b_seq = vec![
        WatchEvent::InitialList(vec![]),
        WatchEvent::Add(obj("Secret", "s-x", Some("prod"), 10)),
        WatchEvent::Add(obj("Secret", "s-y", Some("prod"), 11)),
        WatchEvent::Remove(id("Secret", "s-y", Some("prod"))),
    ];

    let compose = || {
        let mut all = run_stream(&cms, &a_seq);
        all.extend(run_stream(&secrets, &b_seq));
        all
    };
    let first = compose();
    assert_eq!(first, compose());
    assert_eq!(first.len(), 3);
}
