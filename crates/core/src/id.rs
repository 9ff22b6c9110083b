//! Resource identity and watch query scopes.

#![forbid(unsafe_code)]

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde::Serialize;

use crate::tree::Value;
use crate::CoreError;

/// Canonical address of one remote resource: (apiVersion, kind, namespace?, name).
///
/// Equality, ordering and hashing all go through the canonical encoding
/// `kind|apiVersion|namespace|name`, computed once at construction.
#[derive(Clone, Serialize)]
pub struct ResourceId {
    api_version: String,
    kind: String,
    namespace: Option<String>,
    name: String,
    #[serde(skip)]
    canonical: Arc<str>,
}

impl ResourceId {
    pub fn new(
        api_version: impl Into<String>,
        kind: impl Into<String>,
        namespace: Option<&str>,
        name: impl Into<String>,
    ) -> Self {
        let api_version = api_version.into();
        let kind = kind.into();
        let namespace = namespace.filter(|ns| !ns.is_empty()).map(str::to_string);
        let name = name.into();
        let canonical = format!(
            "{}|{}|{}|{}",
            kind,
            api_version,
            namespace.as_deref().unwrap_or(""),
            name
        );
        Self { api_version, kind, namespace, name, canonical: Arc::from(canonical) }
    }

    /// Read the identifier out of a resource document
    /// (`apiVersion`, `kind`, `metadata.namespace`, `metadata.name`).
    pub fn from_value(v: &Value) -> Option<Self> {
        let api_version = v.get("apiVersion").and_then(Value::as_str).filter(|s| !s.is_empty())?;
        let kind = v.get("kind").and_then(Value::as_str).filter(|s| !s.is_empty())?;
        let name = v.get_path(&["metadata", "name"]).and_then(Value::as_str).filter(|s| !s.is_empty())?;
        let namespace = v.get_path(&["metadata", "namespace"]).and_then(Value::as_str);
        Some(Self::new(api_version, kind, namespace, name))
    }

    pub fn api_version(&self) -> &str {
        &self.api_version
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn canonical(&self) -> &str {
        &self.canonical
    }
}

impl PartialEq for ResourceId {
    fn eq(&self, other: &Self) -> bool {
        self.canonical == other.canonical
    }
}

impl Eq for ResourceId {}

impl Hash for ResourceId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.canonical.hash(state);
    }
}

impl PartialOrd for ResourceId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ResourceId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.canonical.cmp(&other.canonical)
    }
}

impl fmt::Debug for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ResourceId").field(&self.canonical).finish()
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}", self.kind, ns, self.name),
            None => write!(f, "{}/{}", self.kind, self.name),
        }
    }
}

/// Scope of one watch: a resource kind, optionally narrowed to a namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct WatchQuery {
    pub api_version: String,
    pub kind: String,
    pub namespace: Option<String>,
}

impl WatchQuery {
    pub fn new(api_version: impl Into<String>, kind: impl Into<String>, namespace: Option<&str>) -> Self {
        Self {
            api_version: api_version.into(),
            kind: kind.into(),
            namespace: namespace.filter(|ns| !ns.is_empty()).map(str::to_string),
        }
    }

    /// Parse a `v1/Kind` or `group/v1/Kind` key.
    pub fn parse(gvk_key: &str, namespace: Option<&str>) -> Result<Self, CoreError> {
        let parts: Vec<_> = gvk_key.split('/').collect();
        match parts.as_slice() {
            [version, kind] if !version.is_empty() && !kind.is_empty() => {
                Ok(Self::new(*version, *kind, namespace))
            }
            [group, version, kind] if !group.is_empty() && !version.is_empty() && !kind.is_empty() => {
                Ok(Self::new(format!("{}/{}", group, version), *kind, namespace))
            }
            _ => Err(CoreError::InvalidGvkKey(gvk_key.to_string())),
        }
    }

    /// `(group, version)`; the core group is empty.
    pub fn group_version(&self) -> (&str, &str) {
        match self.api_version.split_once('/') {
            Some((g, v)) => (g, v),
            None => ("", self.api_version.as_str()),
        }
    }

    pub fn gvk_key(&self) -> String {
        format!("{}/{}", self.api_version, self.kind)
    }
}

impl fmt::Display for WatchQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.gvk_key(), self.namespace.as_deref().unwrap_or(""))
    }
}

/// Group identifiers by namespace; cluster-scoped ids land under `None`.
pub fn group_by_namespace<'a, I>(ids: I) -> BTreeMap<Option<&'a str>, Vec<&'a ResourceId>>
where
    I: IntoIterator<Item = &'a ResourceId>,
{
    let mut out: BTreeMap<Option<&'a str>, Vec<&'a ResourceId>> = BTreeMap::new();
    for id in ids {
        out.entry(id.namespace()).or_default().push(id);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn from_value_reads_metadata() {
        let v = Value::from(json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": "web", "namespace": "prod"}
        }));
        let id = ResourceId::from_value(&v).unwrap();
        assert_eq!(id.kind(), "Deployment");
        assert_eq!(id.namespace(), Some("prod"));
        assert_eq!(id.canonical(), "Deployment|apps/v1|prod|web");
        assert_eq!(id.to_string(), "Deployment/prod/web");
    }

    #[test]
    fn from_value_requires_identity_fields() {
        let no_name = Value::from(json!({"apiVersion": "v1", "kind": "Pod", "metadata": {}}));
        assert!(ResourceId::from_value(&no_name).is_none());
        let no_kind = Value::from(json!({"apiVersion": "v1", "metadata": {"name": "x"}}));
        assert!(ResourceId::from_value(&no_kind).is_none());
    }

    #[test]
    fn empty_namespace_is_cluster_scoped() {
        let a = ResourceId::new("v1", "Node", Some(""), "n1");
        let b = ResourceId::new("v1", "Node", None, "n1");
        assert_eq!(a, b);
        assert_eq!(a.namespace(), None);
    }

    #[test]
    fn parse_gvk_keys() {
        let q = WatchQuery::parse("v1/ConfigMap", Some("ns")).unwrap();
        assert_eq!(q.group_version(), ("", "v1"));
        assert_eq!(q.to_string(), "v1/ConfigMap|ns");
        let q = WatchQuery::parse("cert-manager.io/v1/Certificate", None).unwrap();
        assert_eq!(q.api_version, "cert-manager.io/v1");
        assert_eq!(q.group_version(), ("cert-manager.io", "v1"));
        assert!(WatchQuery::parse("Certificate", None).is_err());
        assert!(WatchQuery::parse("a/b/c/d", None).is_err());
    }

    #[test]
    fn grouping_is_ordered() {
        let ids = [
            ResourceId::new("v1", "Pod", Some("b"), "p2"),
            ResourceId::new("v1", "Pod", Some("a"), "p1"),
            ResourceId::new("v1", "Node", None, "n1"),
            ResourceId::new("apps/v1", "Deployment", Some("a"), "d1"),
        ];
        let by_ns = group_by_namespace(ids.iter());
        let keys: Vec<_> = by_ns.keys().copied().collect();
        assert_eq!(keys, vec![None, Some("a"), Some("b")]);
        assert_eq!(by_ns[&Some("a")].len(), 2);
    }
}
