//! Kestrel kubehub: Kubernetes-backed watch source.
//!
//! Each subscription runs a kube-rs `watcher` (list + watch, with the
//! default backoff) and translates its events into watch messages.

#![forbid(unsafe_code)]

use std::collections::HashSet;

use anyhow::{anyhow, Context, Result};
use futures::StreamExt;
use kestrel_core::{ResourceId, Value, WatchError, WatchEvent, WatchMessage, WatchQuery};
use kestrel_store::{CancelHandle, StoreConfig, WatchSource, WatchStream};
use kube::{
    api::Api,
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    runtime::watcher::{self, Event},
    runtime::WatchStreamExt,
    Client,
};
use metrics::counter;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Parse a `v1/Kind` or `group/v1/Kind` key.
pub fn parse_gvk_key(key: &str) -> Result<GroupVersionKind> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] => Ok(GroupVersionKind { group: String::new(), version: version.to_string(), kind: kind.to_string() }),
        [group, version, kind] => Ok(GroupVersionKind { group: (*group).to_string(), version: (*version).to_string(), kind: (*kind).to_string() }),
        _ => Err(anyhow!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key)),
    }
}

async fn find_api_resource(client: Client, gvk: &GroupVersionKind) -> Result<(ApiResource, bool)> {
    let discovery = Discovery::new(client).run().await.context("running API discovery")?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                return Ok((ar.clone(), namespaced));
            }
        }
    }
    Err(anyhow!("GVK not found: {}/{}/{}", gvk.group, gvk.version, gvk.kind))
}

fn strip_managed_fields(v: &mut serde_json::Value) {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
        }
    }
}

/// List items often arrive without `apiVersion`/`kind`; fill them from the resource.
fn ensure_type_meta(v: &mut serde_json::Value, ar: &ApiResource) {
    if let Some(obj) = v.as_object_mut() {
        obj.entry("apiVersion").or_insert_with(|| serde_json::Value::String(ar.api_version.clone()));
        obj.entry("kind").or_insert_with(|| serde_json::Value::String(ar.kind.clone()));
    }
}

fn to_value(obj: &DynamicObject, ar: &ApiResource) -> Result<Value> {
    let mut raw = serde_json::to_value(obj).context("serializing DynamicObject")?;
    strip_managed_fields(&mut raw);
    ensure_type_meta(&mut raw, ar);
    Ok(Value::from(raw))
}

/// Turns watcher events into watch messages, telling adds from updates.
///
/// A relist does not prune the store, so objects that vanished while the
/// watch was down are reported as removals ahead of the new list.
#[derive(Debug, Default)]
struct Translator {
    seen: HashSet<ResourceId>,
}

impl Translator {
    fn translate(&mut self, event: Event<DynamicObject>, ar: &ApiResource) -> Vec<WatchMessage> {
        match event {
            Event::Restarted(list) => {
                let mut listed = HashSet::with_capacity(list.len());
                let mut items = Vec::with_capacity(list.len());
                for obj in list.iter() {
                    match to_value(obj, ar) {
                        Ok(v) => {
                            if let Some(id) = ResourceId::from_value(&v) {
                                listed.insert(id);
                            }
                            items.push(v);
                        }
                        Err(e) => warn!(error = %e, "dropping unserializable object"),
                    }
                }
                let mut gone: Vec<ResourceId> = self.seen.difference(&listed).cloned().collect();
                gone.sort();
                debug!(count = items.len(), gone = gone.len(), "watch restart");
                self.seen = listed;
                let mut out: Vec<WatchMessage> = gone.into_iter().map(|id| WatchEvent::Remove(id).into()).collect();
                out.push(WatchEvent::InitialList(items).into());
                out
            }
            Event::Applied(obj) => {
                let Some(v) = to_value(&obj, ar).map_err(|e| warn!(error = %e, "dropping unserializable object")).ok() else {
                    return Vec::new();
                };
                let Some(id) = ResourceId::from_value(&v) else {
                    return vec![WatchEvent::Add(v).into()];
                };
                if self.seen.insert(id) {
                    vec![WatchEvent::Add(v).into()]
                } else {
                    vec![WatchEvent::Update(v).into()]
                }
            }
            Event::Deleted(obj) => {
                let Some(v) = to_value(&obj, ar).map_err(|e| warn!(error = %e, "dropping unserializable object")).ok() else {
                    return Vec::new();
                };
                let Some(id) = ResourceId::from_value(&v) else {
                    warn!("deleted object without identity");
                    return Vec::new();
                };
                self.seen.remove(&id);
                vec![WatchEvent::Remove(id).into()]
            }
        }
    }
}

async fn run_watch(client: Client, query: &WatchQuery, tx: &mpsc::Sender<WatchMessage>) -> Result<()> {
    let gvk = parse_gvk_key(&query.gvk_key())?;
    let (ar, namespaced) = find_api_resource(client.clone(), &gvk).await?;
    let api: Api<DynamicObject> = if namespaced {
        match query.namespace.as_deref() {
            Some(ns) => Api::namespaced_with(client, ns, &ar),
            None => Api::all_with(client, &ar),
        }
    } else {
        Api::all_with(client, &ar)
    };

    let stream = watcher::watcher(api, watcher::Config::default()).default_backoff();
    futures::pin_mut!(stream);
    info!(query = %query, "watcher started");
    let mut translator = Translator::default();
    while let Some(item) = stream.next().await {
        let msgs = match item {
            Ok(event) => {
                if matches!(event, Event::Restarted(_)) {
                    counter!("kube_watch_restarts_total", 1u64);
                }
                translator.translate(event, &ar)
            }
            Err(e) => {
                warn!(query = %query, error = %e, "watch error; backing off");
                vec![WatchError::new(e.to_string()).into()]
            }
        };
        for msg in msgs {
            if tx.send(msg).await.is_err() {
                debug!(query = %query, "receiver dropped");
                return Ok(());
            }
        }
    }
    warn!(query = %query, "watcher stream ended");
    Ok(())
}

/// [`WatchSource`] over a live cluster.
#[derive(Clone)]
pub struct KubeSource {
    client: Client,
    queue_cap: usize,
}

impl KubeSource {
    pub fn new(client: Client) -> Self {
        Self { client, queue_cap: StoreConfig::from_env().queue_cap }
    }

    /// Client from the ambient kubeconfig or in-cluster environment.
    pub async fn try_default() -> Result<Self> {
        let client = Client::try_default().await.context("creating kube client")?;
        Ok(Self::new(client))
    }

    pub fn with_queue_cap(mut self, cap: usize) -> Self {
        self.queue_cap = cap.max(1);
        self
    }
}

impl WatchSource for KubeSource {
    fn subscribe(&self, query: &WatchQuery) -> Result<WatchStream> {
        parse_gvk_key(&query.gvk_key())?;
        let (tx, rx) = mpsc::channel(self.queue_cap);
        let (cancel, cancelled) = CancelHandle::pair();
        let client = self.client.clone();
        let query = query.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancelled => debug!(query = %query, "watch cancelled"),
                res = run_watch(client, &query, &tx) => {
                    if let Err(e) = res {
                        let message = format!("{:#}", e);
                        warn!(query = %query, error = %message, "watch failed");
                        let _ = tx.send(WatchError::new(message).into()).await;
                    }
                }
            }
        });
        Ok(WatchStream { rx, cancel })
    }
}
