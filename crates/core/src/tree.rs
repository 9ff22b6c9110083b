//! Tree values: the recursive scalar / list / map type shared by diffing,
//! patching and the resource store.
//!
//! Containers sit behind `Arc`, so cloning a `Value` never copies a subtree.
//! Two values can therefore be compared two ways:
//! - `==` is deep, structural equality (map key order does not matter)
//! - [`Value::same`] is referential identity for containers and plain
//!   equality for scalars; it is what change detection upstream relies on

#![forbid(unsafe_code)]

use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Number;

#[derive(Clone, Debug, Default, PartialEq)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Number(Number),
    String(Arc<str>),
    List(Arc<Vec<Value>>),
    Map(Arc<Map>),
}

/// Variant tag of a [`Value`], used in error messages.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    Null,
    Bool,
    Number,
    String,
    List,
    Map,
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Kind::Null => "null",
            Kind::Bool => "bool",
            Kind::Number => "number",
            Kind::String => "string",
            Kind::List => "list",
            Kind::Map => "map",
        };
        f.write_str(s)
    }
}

impl Value {
    pub fn list(items: Vec<Value>) -> Self {
        Value::List(Arc::new(items))
    }

    pub fn map(map: Map) -> Self {
        Value::Map(Arc::new(map))
    }

    pub fn kind(&self) -> Kind {
        match self {
            Value::Null => Kind::Null,
            Value::Bool(_) => Kind::Bool,
            Value::Number(_) => Kind::Number,
            Value::String(_) => Kind::String,
            Value::List(_) => Kind::List,
            Value::Map(_) => Kind::Map,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn is_scalar(&self) -> bool {
        !matches!(self, Value::List(_) | Value::Map(_))
    }

    /// Referential identity: containers must share the same allocation,
    /// scalars must be equal.
    pub fn same(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::List(a), Value::List(b)) => Arc::ptr_eq(a, b),
            (Value::Map(a), Value::Map(b)) => Arc::ptr_eq(a, b),
            (Value::List(_) | Value::Map(_), _) | (_, Value::List(_) | Value::Map(_)) => false,
            (a, b) => a == b,
        }
    }

    pub fn as_map(&self) -> Option<&Map> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<&Number> {
        match self {
            Value::Number(n) => Some(n),
            _ => None,
        }
    }

    /// Field lookup on a map; `None` for any other variant.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_map().and_then(|m| m.get(key))
    }

    /// Follow a chain of map fields, e.g. `["metadata", "name"]`.
    pub fn get_path(&self, path: &[&str]) -> Option<&Value> {
        path.iter().try_fold(self, |cur, key| cur.get(key))
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::from(self)
    }
}

/// Insertion-ordered string map.
///
/// Hash lookups with stable iteration order: diff output and document
/// round-trips follow the order keys were written in.
#[derive(Clone, Debug, Default)]
pub struct Map {
    entries: IndexMap<String, Value>,
}

impl Map {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(cap: usize) -> Self {
        Self { entries: IndexMap::with_capacity(cap) }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Insert or overwrite. An existing key keeps its position.
    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.entries.insert(key.into(), value)
    }

    /// Remove a key, keeping the relative order of the remaining entries.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.entries.shift_remove(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> + '_ {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> + '_ {
        self.entries.keys().map(String::as_str)
    }
}

impl PartialEq for Map {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len()
            && self
                .entries
                .iter()
                .all(|(k, v)| other.get(k).is_some_and(|ov| ov.same(v) || ov == v))
    }
}

impl<K: Into<String>> FromIterator<(K, Value)> for Map {
    fn from_iter<T: IntoIterator<Item = (K, Value)>>(iter: T) -> Self {
        Self { entries: iter.into_iter().map(|(k, v)| (k.into(), v)).collect() }
    }
}

// ---- conversions ----

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Number(v.into())
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::Number(v.into())
    }
}

impl From<f64> for Value {
    /// Non-finite floats have no JSON form and become `Null`.
    fn from(v: f64) -> Self {
        Number::from_f64(v).map(Value::Number).unwrap_or(Value::Null)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(Arc::from(v))
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(Arc::from(v))
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::list(v)
    }
}

impl From<Map> for Value {
    fn from(m: Map) -> Self {
        Value::map(m)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        use serde_json::Value as J;
        match v {
            J::Null => Value::Null,
            J::Bool(b) => Value::Bool(b),
            J::Number(n) => Value::Number(n),
            J::String(s) => Value::from(s),
            J::Array(items) => Value::list(items.into_iter().map(Value::from).collect()),
            J::Object(obj) => Value::map(obj.into_iter().map(|(k, v)| (k, Value::from(v))).collect()),
        }
    }
}

impl From<&serde_json::Value> for Value {
    fn from(v: &serde_json::Value) -> Self {
        Value::from(v.clone())
    }
}

impl From<&Value> for serde_json::Value {
    fn from(v: &Value) -> Self {
        use serde_json::Value as J;
        match v {
            Value::Null => J::Null,
            Value::Bool(b) => J::Bool(*b),
            Value::Number(n) => J::Number(n.clone()),
            Value::String(s) => J::String(s.to_string()),
            Value::List(items) => J::Array(items.iter().map(J::from).collect()),
            Value::Map(m) => J::Object(m.iter().map(|(k, v)| (k.to_string(), J::from(v))).collect()),
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::{SerializeMap, SerializeSeq};
        match self {
            Value::Null => serializer.serialize_unit(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Number(n) => n.serialize(serializer),
            Value::String(s) => serializer.serialize_str(s),
            Value::List(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items.iter() {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Value::Map(m) => {
                let mut out = serializer.serialize_map(Some(m.len()))?;
                for (k, v) in m.iter() {
                    out.serialize_entry(k, v)?;
                }
                out.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        serde_json::Value::deserialize(deserializer).map(Value::from)
    }
}

impl fmt::Display for Value {
    /// Compact JSON.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn map_equality_ignores_key_order() {
        let a = Value::from(json!({"x": 1, "y": {"z": [1, 2]}}));
        let b = Value::from(json!({"y": {"z": [1, 2]}, "x": 1}));
        assert_eq!(a, b);
        assert!(!a.same(&b));
    }

    #[test]
    fn numbers_are_not_coerced() {
        assert_ne!(Value::from(json!(1)), Value::from(json!(1.0)));
        assert_ne!(Value::from(json!("1")), Value::from(json!(1)));
    }

    #[test]
    fn same_is_identity_for_containers() {
        let a = Value::from(json!({"k": [1]}));
        let b = a.clone();
        assert!(a.same(&b));
        assert!(Value::from(3i64).same(&Value::from(3i64)));
        assert!(!Value::from(json!([])).same(&Value::from(json!([]))));
    }

    #[test]
    fn json_round_trip_preserves_key_order() {
        let src = json!({"zeta": 1, "alpha": {"b": 2, "a": 1}, "mid": [true, null]});
        let v = Value::from(&src);
        let keys: Vec<&str> = v.as_map().unwrap().keys().collect();
        assert_eq!(keys, vec!["zeta", "alpha", "mid"]);
        assert_eq!(serde_json::to_string(&v).unwrap(), src.to_string());
        let back: Value = serde_json::from_str(&src.to_string()).unwrap();
        assert_eq!(back, v);
    }

    #[test]
    fn map_insert_keeps_position_and_remove_keeps_order() {
        let mut m: Map = [("a", Value::from(1i64)), ("b", Value::from(2i64)), ("c", Value::from(3i64))]
            .into_iter()
            .collect();
        assert_eq!(m.insert("b", Value::from(9i64)), Some(Value::from(2i64)));
        assert_eq!(m.remove("a"), Some(Value::from(1i64)));
        let keys: Vec<&str> = m.keys().collect();
        assert_eq!(keys, vec!["b", "c"]);
        assert_eq!(m.get("b"), Some(&Value::from(9i64)));
    }

    #[test]
    fn wide_maps_compare_and_shrink_in_order() {
        let n = 20_000;
        let a: Map = (0..n).map(|i| (format!("k{i}"), Value::from(i as i64))).collect();
        let b: Map = (0..n).rev().map(|i| (format!("k{i}"), Value::from(i as i64))).collect();
        assert_eq!(a, b);

        let mut c = a.clone();
        for i in (0..n).step_by(2) {
            assert!(c.remove(&format!("k{i}")).is_some());
        }
        assert_eq!(c.len(), n / 2);
        let first: Vec<&str> = c.keys().take(3).collect();
        assert_eq!(first, vec!["k1", "k3", "k5"]);
        assert_ne!(a, c);
    }

    #[test]
    fn get_path_walks_maps() {
        let v = Value::from(json!({"metadata": {"name": "web"}}));
        assert_eq!(v.get_path(&["metadata", "name"]).and_then(Value::as_str), Some("web"));
        assert!(v.get_path(&["metadata", "missing"]).is_none());
    }
}
