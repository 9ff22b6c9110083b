//! Three-way merge of edit scripts.
//!
//! Both scripts are taken against the same base. Edits to different paths
//! combine; overlapping edits that disagree become a [`MergeConflict`] and the
//! caller's policy picks a side. List scripts are first rebased onto base
//! positions so that independent edits at different indices line up.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use kestrel_core::Value;
use serde::Serialize;
use tracing::debug;

use crate::{Diff, Key, Op, Path};

/// Two scripts disagreeing at one location.
///
/// `left` and `right` are the ops each side runs at `path`. When `key` is
/// set, the dispute is about that single entry of the container at `path`
/// (for lists, `key` is an index into the base list).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergeConflict {
    pub path: Path,
    pub key: Option<Key>,
    pub left: Diff,
    pub right: Diff,
}

impl MergeConflict {
    /// Full location of the disputed entry.
    pub fn location(&self) -> Path {
        match &self.key {
            Some(k) => self.path.child(k.clone()),
            None => self.path.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    TakeLeft,
    TakeRight,
    /// Neither side is kept; the outcome is not finalized.
    Unresolved,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConflictReport {
    pub conflict: MergeConflict,
    pub resolution: Resolution,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MergeOutcome {
    pub diff: Diff,
    pub conflicts: Vec<ConflictReport>,
}

impl MergeOutcome {
    /// No overlapping edits at all.
    pub fn is_clean(&self) -> bool {
        self.conflicts.is_empty()
    }

    /// Every conflict was settled by the policy.
    pub fn is_finalized(&self) -> bool {
        self.conflicts.iter().all(|c| c.resolution != Resolution::Unresolved)
    }

    pub fn unresolved(&self) -> impl Iterator<Item = &MergeConflict> + '_ {
        self.conflicts
            .iter()
            .filter(|c| c.resolution == Resolution::Unresolved)
            .map(|c| &c.conflict)
    }
}

/// Keep the left (local) side.
pub fn prefer_left(_: &MergeConflict) -> Resolution {
    Resolution::TakeLeft
}

/// Keep the right (remote) side.
pub fn prefer_right(_: &MergeConflict) -> Resolution {
    Resolution::TakeRight
}

/// Leave every conflict open.
pub fn unresolved(_: &MergeConflict) -> Resolution {
    Resolution::Unresolved
}

/// Merge `left` and `right`, both computed against one base.
pub fn merge_diffs<F>(left: &Diff, right: &Diff, resolve: F) -> MergeOutcome
where
    F: FnMut(&MergeConflict) -> Resolution,
{
    let mut merger = Merger { resolve, path: Path::root(), conflicts: Vec::new() };
    let diff = merger.merge(left, right);
    MergeOutcome { diff, conflicts: merger.conflicts }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shape {
    Fields,
    Positions,
    /// Contains a `Replace`, or mixes field and index keys.
    Whole,
}

impl Shape {
    fn of(diff: &Diff) -> Shape {
        let mut shape = None;
        for op in diff.iter() {
            let this = match op {
                Op::Replace(_) => return Shape::Whole,
                Op::Insert { .. } => Shape::Positions,
                Op::Delete(Key::Index(_)) | Op::Descend { key: Key::Index(_), .. } => Shape::Positions,
                Op::Delete(Key::Field(_)) | Op::Descend { key: Key::Field(_), .. } => Shape::Fields,
            };
            match shape {
                None => shape = Some(this),
                Some(s) if s != this => return Shape::Whole,
                Some(_) => {}
            }
        }
        shape.unwrap_or(Shape::Whole)
    }
}

struct Merger<F> {
    resolve: F,
    path: Path,
    conflicts: Vec<ConflictReport>,
}

impl<F> Merger<F>
where
    F: FnMut(&MergeConflict) -> Resolution,
{
    fn merge(&mut self, left: &Diff, right: &Diff) -> Diff {
        if right.is_empty() || left == right {
            return left.clone();
        }
        if left.is_empty() {
            return right.clone();
        }
        match (Shape::of(left), Shape::of(right)) {
            (Shape::Fields, Shape::Fields) => self.merge_fields(left, right),
            (Shape::Positions, Shape::Positions) => match (Anchored::from_diff(left), Anchored::from_diff(right)) {
                (Some(l), Some(r)) => self.merge_positions(l, r),
                _ => self.pick(None, left.clone(), right.clone()),
            },
            _ => self.pick(None, left.clone(), right.clone()),
        }
    }

    /// Ask the policy, record the report, return the chosen ops.
    fn pick(&mut self, key: Option<Key>, left: Diff, right: Diff) -> Diff {
        match self.decide(key, left, right) {
            (Resolution::TakeLeft, c) => c.left,
            (Resolution::TakeRight, c) => c.right,
            (Resolution::Unresolved, _) => Diff::new(),
        }
    }

    fn decide(&mut self, key: Option<Key>, left: Diff, right: Diff) -> (Resolution, MergeConflict) {
        let conflict = MergeConflict { path: self.path.clone(), key, left, right };
        let resolution = (self.resolve)(&conflict);
        debug!(path = %conflict.location(), ?resolution, "merge conflict");
        self.conflicts.push(ConflictReport { conflict: conflict.clone(), resolution });
        (resolution, conflict)
    }

    fn merge_fields(&mut self, left: &Diff, right: &Diff) -> Diff {
        let left_groups = group_fields(left);
        let mut right_groups = group_fields(right);

        let mut out = Diff::new();
        for (field, l_ops) in left_groups {
            let Some(pos) = right_groups.iter().position(|(f, _)| *f == field) else {
                out.extend(l_ops.into_iter().cloned());
                continue;
            };
            let (_, r_ops) = right_groups.remove(pos);
            if l_ops == r_ops {
                out.extend(l_ops.into_iter().cloned());
                continue;
            }
            let key = Key::Field(field.to_string());
            match (l_ops.as_slice(), r_ops.as_slice()) {
                ([Op::Descend { diff: l, .. }], [Op::Descend { diff: r, .. }]) => {
                    self.path.push(key.clone());
                    let sub = self.merge(l, r);
                    self.path.pop();
                    if !sub.is_empty() {
                        out.push(Op::Descend { key, diff: sub });
                    }
                }
                _ => {
                    let l: Diff = l_ops.into_iter().cloned().collect();
                    let r: Diff = r_ops.into_iter().cloned().collect();
                    out.extend(self.pick(Some(key), l, r));
                }
            }
        }
        for (_, r_ops) in right_groups {
            out.extend(r_ops.into_iter().cloned());
        }
        out
    }

    fn merge_positions(&mut self, left: Anchored, right: Anchored) -> Diff {
        let mut l_slots = left.slots;
        let mut r_slots = right.slots;
        let mut anchors: Vec<usize> = l_slots.keys().chain(r_slots.keys()).copied().collect();
        anchors.sort_unstable();
        anchors.dedup();

        let mut merged = BTreeMap::new();
        for anchor in anchors {
            let l = l_slots.remove(&anchor).unwrap_or_default();
            let r = r_slots.remove(&anchor).unwrap_or_default();
            let slot = self.merge_slot(anchor, l, r);
            if !slot.is_empty() {
                merged.insert(anchor, slot);
            }
        }
        Anchored { slots: merged }.into_diff()
    }

    fn merge_slot(&mut self, anchor: usize, l: Slot, r: Slot) -> Slot {
        let key = Some(Key::Index(anchor));
        let inserts = if r.inserts.is_empty() || l.inserts == r.inserts {
            l.inserts
        } else if l.inserts.is_empty() {
            r.inserts
        } else {
            let as_diff = |items: &[Value]| -> Diff {
                items.iter().enumerate().map(|(i, v)| Op::Insert { index: anchor + i, value: v.clone() }).collect()
            };
            match self.decide(key.clone(), as_diff(&l.inserts), as_diff(&r.inserts)).0 {
                Resolution::TakeLeft => l.inserts,
                Resolution::TakeRight => r.inserts,
                Resolution::Unresolved => Vec::new(),
            }
        };

        let edit = match (l.edit, r.edit) {
            (None, e) | (e, None) => e,
            (Some(Edit::Delete), Some(Edit::Delete)) => Some(Edit::Delete),
            (Some(Edit::Descend(a)), Some(Edit::Descend(b))) => {
                self.path.push(Key::Index(anchor));
                let sub = self.merge(&a, &b);
                self.path.pop();
                Some(Edit::Descend(sub))
            }
            (Some(a), Some(b)) => {
                let (resolution, _) = self.decide(key, a.as_diff(anchor), b.as_diff(anchor));
                match resolution {
                    Resolution::TakeLeft => Some(a),
                    Resolution::TakeRight => Some(b),
                    Resolution::Unresolved => None,
                }
            }
        };
        Slot { inserts, edit }
    }
}

/// Ops grouped per field, in first-appearance order.
fn group_fields(diff: &Diff) -> Vec<(&str, Vec<&Op>)> {
    let mut groups: Vec<(&str, Vec<&Op>)> = Vec::new();
    for op in diff.iter() {
        let Some(Key::Field(field)) = op.key() else { continue };
        match groups.iter_mut().find(|(f, _)| *f == field.as_str()) {
            Some((_, ops)) => ops.push(op),
            None => groups.push((field.as_str(), vec![op])),
        }
    }
    groups
}

#[derive(Debug, Clone, PartialEq)]
enum Edit {
    Delete,
    Descend(Diff),
}

impl Edit {
    fn as_diff(&self, anchor: usize) -> Diff {
        match self {
            Edit::Delete => Diff::from(vec![Op::Delete(Key::Index(anchor))]),
            Edit::Descend(d) => Diff::from(vec![Op::Descend { key: Key::Index(anchor), diff: d.clone() }]),
        }
    }
}

/// Edits anchored at one base index: values inserted before the element,
/// then what happens to the element itself.
#[derive(Debug, Clone, Default, PartialEq)]
struct Slot {
    inserts: Vec<Value>,
    edit: Option<Edit>,
}

impl Slot {
    fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.edit.is_none()
    }
}

/// A list script re-expressed against base indices.
#[derive(Debug, Default)]
struct Anchored {
    slots: BTreeMap<usize, Slot>,
}

impl Anchored {
    /// `None` when the script is not a left-to-right positional script.
    fn from_diff(diff: &Diff) -> Option<Self> {
        let mut slots: BTreeMap<usize, Slot> = BTreeMap::new();
        let (mut write, mut base) = (0usize, 0usize);
        for op in diff.iter() {
            let at = match op {
                Op::Insert { index, .. } => *index,
                Op::Delete(Key::Index(i)) | Op::Descend { key: Key::Index(i), .. } => *i,
                _ => return None,
            };
            if at < write {
                return None;
            }
            base += at - write;
            write = at;
            let slot = slots.entry(base).or_default();
            match op {
                Op::Insert { value, .. } => {
                    slot.inserts.push(value.clone());
                    write += 1;
                }
                Op::Delete(_) => {
                    slot.edit = Some(Edit::Delete);
                    base += 1;
                }
                Op::Descend { diff, .. } => {
                    slot.edit = Some(Edit::Descend(diff.clone()));
                    base += 1;
                    write += 1;
                }
                Op::Replace(_) => return None,
            }
        }
        Some(Self { slots })
    }

    fn into_diff(self) -> Diff {
        let mut out = Diff::new();
        let (mut write, mut base) = (0usize, 0usize);
        for (anchor, slot) in self.slots {
            write += anchor - base;
            base = anchor;
            for value in slot.inserts {
                out.push(Op::Insert { index: write, value });
                write += 1;
            }
            match slot.edit {
                Some(Edit::Delete) => {
                    out.push(Op::Delete(Key::Index(write)));
                    base += 1;
                }
                Some(Edit::Descend(sub)) => {
                    if !sub.is_empty() {
                        out.push(Op::Descend { key: Key::Index(write), diff: sub });
                    }
                    write += 1;
                    base += 1;
                }
                None => {}
            }
        }
        out
    }
}
