#![forbid(unsafe_code)]

use kestrel_core::{Map, Value};
use rustc_hash::{FxHashMap, FxHashSet};

use crate::{list, Diff, DiffOptions, Key, Op};

/// Edit script turning `a` into `b`, with default options.
pub fn diff(a: &Value, b: &Value) -> Diff {
    diff_with(a, b, &DiffOptions::default())
}

pub fn diff_with(a: &Value, b: &Value, opts: &DiffOptions) -> Diff {
    if a.same(b) {
        return Diff::new();
    }
    match (a, b) {
        (Value::Map(ma), Value::Map(mb)) => diff_maps(ma, mb, opts),
        (Value::List(la), Value::List(lb)) => list::diff_lists(la, lb, opts),
        _ => Diff::replace(b.clone()),
    }
}

// Descends in `b` order, then deletes in `a` order.
fn diff_maps(a: &Map, b: &Map, opts: &DiffOptions) -> Diff {
    let a_index: FxHashMap<&str, &Value> = a.iter().collect();
    let b_keys: FxHashSet<&str> = b.keys().collect();

    let mut out = Diff::new();
    for (key, bv) in b.iter() {
        let sub = match a_index.get(key) {
            Some(av) => diff_with(av, bv, opts),
            None => Diff::replace(bv.clone()),
        };
        if !sub.is_empty() {
            out.push(Op::Descend { key: Key::Field(key.to_string()), diff: sub });
        }
    }
    for key in a.keys() {
        if !b_keys.contains(key) {
            out.push(Op::Delete(Key::Field(key.to_string())));
        }
    }
    out
}
