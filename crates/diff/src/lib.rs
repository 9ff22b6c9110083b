//! Kestrel diff: edit scripts over tree values.
//!
//! - [`diff`] computes an edit script between two values
//! - [`apply`] replays a script, sharing every untouched subtree with its input
//! - [`merge_diffs`] combines two scripts taken against the same base
//! - [`EditSession`] rebases a locally edited document onto new remote state

#![forbid(unsafe_code)]

use std::fmt;

use kestrel_core::Value;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

mod diff;
pub mod edit;
mod list;
pub mod merge;
mod patch;

pub use diff::{diff, diff_with};
pub use edit::{EditSession, Rebased};
pub use merge::{merge_diffs, ConflictReport, MergeConflict, MergeOutcome, Resolution};
pub use patch::{apply, PatchError};

/// Position inside a container: a list index or a map field.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Key {
    Index(usize),
    Field(String),
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Index(i) => write!(f, "{}", i),
            Key::Field(name) => f.write_str(name),
        }
    }
}

impl From<usize> for Key {
    fn from(i: usize) -> Self {
        Key::Index(i)
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Key::Field(s.to_string())
    }
}

/// One step of an edit script.
///
/// List positions (`Insert::index`, `Key::Index`) are write positions: they
/// refer to the list as it stands after every earlier op of the same script.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Op {
    Replace(Value),
    Insert { index: usize, value: Value },
    Delete(Key),
    Descend { key: Key, diff: Diff },
}

impl Op {
    pub fn descend(key: impl Into<Key>, diff: Diff) -> Self {
        Op::Descend { key: key.into(), diff }
    }

    pub fn delete(key: impl Into<Key>) -> Self {
        Op::Delete(key.into())
    }

    pub fn insert(index: usize, value: impl Into<Value>) -> Self {
        Op::Insert { index, value: value.into() }
    }

    /// Container key the op addresses; `None` for `Replace` and `Insert`.
    pub fn key(&self) -> Option<&Key> {
        match self {
            Op::Delete(k) | Op::Descend { key: k, .. } => Some(k),
            Op::Replace(_) | Op::Insert { .. } => None,
        }
    }
}

/// Ordered edit script. Empty means "no change", which is not the same
/// thing as `[Replace(Null)]`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Diff(Vec<Op>);

impl Diff {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replace(value: impl Into<Value>) -> Self {
        Self(vec![Op::Replace(value.into())])
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn ops(&self) -> &[Op] {
        &self.0
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Op> {
        self.0.iter()
    }

    pub fn push(&mut self, op: Op) {
        self.0.push(op);
    }

    pub fn into_ops(self) -> Vec<Op> {
        self.0
    }
}

impl From<Vec<Op>> for Diff {
    fn from(ops: Vec<Op>) -> Self {
        Self(ops)
    }
}

impl FromIterator<Op> for Diff {
    fn from_iter<T: IntoIterator<Item = Op>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl Extend<Op> for Diff {
    fn extend<T: IntoIterator<Item = Op>>(&mut self, iter: T) {
        self.0.extend(iter);
    }
}

impl<'a> IntoIterator for &'a Diff {
    type Item = &'a Op;
    type IntoIter = std::slice::Iter<'a, Op>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl IntoIterator for Diff {
    type Item = Op;
    type IntoIter = std::vec::IntoIter<Op>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// Location inside a tree value, rendered as a JSON pointer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Path(SmallVec<[Key; 8]>);

impl Path {
    pub fn root() -> Self {
        Self::default()
    }

    pub fn push(&mut self, key: Key) {
        self.0.push(key);
    }

    pub fn pop(&mut self) -> Option<Key> {
        self.0.pop()
    }

    pub fn keys(&self) -> &[Key] {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn child(&self, key: Key) -> Self {
        let mut p = self.clone();
        p.push(key);
        p
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("/");
        }
        for key in self.0.iter() {
            match key {
                Key::Index(i) => write!(f, "/{}", i)?,
                Key::Field(name) => write!(f, "/{}", name.replace('~', "~0").replace('/', "~1"))?,
            }
        }
        Ok(())
    }
}

/// Keys tried, in order, when looking for a record identity inside lists.
pub const DEFAULT_LIST_KEYS: &[&str] = &["name", "key", "id"];

/// Cursor divergence beyond which list alignment stops exploring both moves.
pub const DEFAULT_LIST_SPAN: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffOptions {
    /// Performance knob for list alignment; larger values find shorter scripts
    /// on heavily shuffled lists at quadratic cost.
    pub span: usize,
    pub list_keys: Vec<String>,
}

impl Default for DiffOptions {
    fn default() -> Self {
        Self {
            span: DEFAULT_LIST_SPAN,
            list_keys: DEFAULT_LIST_KEYS.iter().map(|k| k.to_string()).collect(),
        }
    }
}

impl DiffOptions {
    /// Defaults, with `KESTREL_LIST_SPAN` overriding the alignment span.
    pub fn from_env() -> Self {
        let span = std::env::var("KESTREL_LIST_SPAN")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(DEFAULT_LIST_SPAN);
        Self { span, ..Self::default() }
    }
}
