#![forbid(unsafe_code)]

use std::sync::Arc;

use kestrel_core::{Kind, Value};
use metrics::counter;
use tracing::debug;

use crate::{Diff, Key, Op, Path};

/// A script that does not fit the value it is applied to.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PatchError {
    #[error("cannot {op} inside a {kind} at {path}")]
    Unsupported { op: &'static str, kind: Kind, path: Path },
    #[error("key {key} does not address a {kind} at {path}")]
    KeyMismatch { key: Key, kind: Kind, path: Path },
    #[error("index {index} out of bounds for list of length {len} at {path}")]
    OutOfBounds { index: usize, len: usize, path: Path },
    #[error("no field {field:?} to delete at {path}")]
    MissingField { field: String, path: Path },
}

/// Replay `diff` against `value`.
///
/// The input is never modified. Containers are copied only along the paths
/// the script touches; every other subtree in the result is the very same
/// allocation as in `value`, and an empty script returns `value` itself.
pub fn apply(value: &Value, diff: &Diff) -> Result<Value, PatchError> {
    let mut path = Path::root();
    apply_at(value, diff, &mut path).map_err(|e| {
        counter!("patch_apply_err_total", 1u64);
        debug!(error = %e, "patch rejected");
        e
    })
}

fn apply_at(value: &Value, diff: &Diff, path: &mut Path) -> Result<Value, PatchError> {
    let mut current = value.clone();
    for op in diff.iter() {
        current = match op {
            Op::Replace(v) => return Ok(v.clone()),
            Op::Insert { index, value } => insert(current, *index, value, path)?,
            Op::Delete(key) => delete(current, key, path)?,
            Op::Descend { key, diff } => descend(current, key, diff, path)?,
        };
    }
    Ok(current)
}

fn insert(mut current: Value, index: usize, item: &Value, path: &Path) -> Result<Value, PatchError> {
    match &mut current {
        Value::List(items) => {
            if index > items.len() {
                return Err(PatchError::OutOfBounds { index, len: items.len(), path: path.clone() });
            }
            Arc::make_mut(items).insert(index, item.clone());
        }
        other => {
            return Err(PatchError::Unsupported { op: "insert", kind: other.kind(), path: path.clone() });
        }
    }
    Ok(current)
}

fn delete(mut current: Value, key: &Key, path: &Path) -> Result<Value, PatchError> {
    let kind = current.kind();
    match (&mut current, key) {
        (Value::List(items), Key::Index(index)) => {
            if *index >= items.len() {
                return Err(PatchError::OutOfBounds { index: *index, len: items.len(), path: path.clone() });
            }
            Arc::make_mut(items).remove(*index);
        }
        (Value::Map(map), Key::Field(field)) => {
            if !map.contains_key(field) {
                return Err(PatchError::MissingField { field: field.clone(), path: path.clone() });
            }
            Arc::make_mut(map).remove(field);
        }
        (Value::List(_), _) | (Value::Map(_), _) => {
            return Err(PatchError::KeyMismatch { key: key.clone(), kind, path: path.clone() });
        }
        (_, _) => {
            return Err(PatchError::Unsupported { op: "delete", kind, path: path.clone() });
        }
    }
    Ok(current)
}

fn descend(mut current: Value, key: &Key, sub: &Diff, path: &mut Path) -> Result<Value, PatchError> {
    let kind = current.kind();
    match (&mut current, key) {
        (Value::Map(map), Key::Field(field)) => {
            // A missing field reads as null, so `Descend(k, [Replace(v)])` adds it.
            let existing = map.get(field).cloned();
            let child = existing.clone().unwrap_or_default();
            path.push(key.clone());
            let next = apply_at(&child, sub, path)?;
            path.pop();
            let unchanged = existing.is_some_and(|e| e.same(&next));
            if !unchanged {
                Arc::make_mut(map).insert(field.clone(), next);
            }
        }
        (Value::List(items), Key::Index(index)) => {
            let Some(child) = items.get(*index).cloned() else {
                return Err(PatchError::OutOfBounds { index: *index, len: items.len(), path: path.clone() });
            };
            path.push(key.clone());
            let next = apply_at(&child, sub, path)?;
            path.pop();
            if !child.same(&next) {
                Arc::make_mut(items)[*index] = next;
            }
        }
        (Value::List(_), _) | (Value::Map(_), _) => {
            return Err(PatchError::KeyMismatch { key: key.clone(), kind, path: path.clone() });
        }
        (_, _) => {
            return Err(PatchError::Unsupported { op: "descend", kind, path: path.clone() });
        }
    }
    Ok(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff;
    use serde_json::json;

    fn v(j: serde_json::Value) -> Value {
        Value::from(j)
    }

    #[test]
    fn empty_script_returns_same_value() {
        let a = v(json!({"a": [1, 2]}));
        let out = apply(&a, &Diff::new()).unwrap();
        assert!(out.same(&a));
    }

    #[test]
    fn replace_short_circuits_remaining_ops() {
        let a = v(json!({"a": 1}));
        let d = Diff::from(vec![Op::Replace(v(json!([1]))), Op::delete("a")]);
        assert_eq!(apply(&a, &d).unwrap(), v(json!([1])));
    }

    #[test]
    fn untouched_children_are_shared() {
        let a = v(json!({"spec": {"replicas": 1}, "metadata": {"labels": {"app": "web"}}}));
        let b = v(json!({"spec": {"replicas": 2}, "metadata": {"labels": {"app": "web"}}}));
        let out = apply(&a, &diff(&a, &b)).unwrap();
        assert_eq!(out, b);
        assert!(out.get("metadata").unwrap().same(a.get("metadata").unwrap()));
        assert!(!out.get("spec").unwrap().same(a.get("spec").unwrap()));
    }

    #[test]
    fn input_is_left_untouched() {
        let a = v(json!({"items": [1, 2, 3]}));
        let before = a.to_json();
        let d = Diff::from(vec![Op::descend("items", Diff::from(vec![Op::delete(0), Op::insert(2, 7i64)]))]);
        let out = apply(&a, &d).unwrap();
        assert_eq!(out, v(json!({"items": [2, 3, 7]})));
        assert_eq!(a.to_json(), before);
    }

    #[test]
    fn descend_into_missing_field_adds_it() {
        let a = v(json!({}));
        let d = Diff::from(vec![Op::descend("x", Diff::replace(1i64))]);
        assert_eq!(apply(&a, &d).unwrap(), v(json!({"x": 1})));
    }

    #[test]
    fn descend_into_scalar_fails_with_path() {
        let a = v(json!({"spec": {"replicas": 1}}));
        let d = Diff::from(vec![Op::descend(
            "spec",
            Diff::from(vec![Op::descend("replicas", Diff::from(vec![Op::descend("x", Diff::replace(1i64))]))]),
        )]);
        let err = apply(&a, &d).unwrap_err();
        assert_eq!(
            err,
            PatchError::Unsupported { op: "descend", kind: Kind::Number, path: Path::root().child("spec".into()).child("replicas".into()) }
        );
        assert_eq!(err.to_string(), "cannot descend inside a number at /spec/replicas");
    }

    #[test]
    fn malformed_scripts_fail_fast() {
        let list = v(json!([1]));
        assert!(matches!(apply(&list, &Diff::from(vec![Op::insert(5, 1i64)])), Err(PatchError::OutOfBounds { .. })));
        assert!(matches!(apply(&list, &Diff::from(vec![Op::delete("x")])), Err(PatchError::KeyMismatch { .. })));
        let map = v(json!({"a": 1}));
        assert!(matches!(apply(&map, &Diff::from(vec![Op::insert(0, 1i64)])), Err(PatchError::Unsupported { .. })));
        assert!(matches!(apply(&map, &Diff::from(vec![Op::delete("b")])), Err(PatchError::MissingField { .. })));
        assert!(matches!(apply(&v(json!("s")), &Diff::from(vec![Op::delete(0)])), Err(PatchError::Unsupported { .. })));
    }
}
