//! List alignment.
//!
//! Elements are matched either by a shared record key (`name`, `key`, `id`
//! by default) or by deep equality. The alignment is a memoized
//! longest-common-subsequence style program over the cursor pair
//! `(i, j)`; once the cursors drift more than `span` apart, the move is
//! forced from the remaining lengths instead of exploring both branches.

#![forbid(unsafe_code)]

use kestrel_core::Value;
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::{smallvec, SmallVec};

use crate::{diff_with, Diff, DiffOptions, Key, Op};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    /// Elements correspond; recurse for in-place changes.
    Merge,
    Insert,
    Delete,
}

type Cell = (usize, usize);

pub(crate) fn diff_lists(a: &[Value], b: &[Value], opts: &DiffOptions) -> Diff {
    let key = record_key(a, b, &opts.list_keys);
    let mut aligner = Aligner { a, b, key, span: opts.span, memo: FxHashMap::default() };
    let steps = aligner.align();

    let mut out = Diff::new();
    let (mut i, mut j, mut write) = (0usize, 0usize, 0usize);
    for step in steps {
        match step {
            Step::Merge => {
                let sub = diff_with(&a[i], &b[j], opts);
                if !sub.is_empty() {
                    out.push(Op::Descend { key: Key::Index(write), diff: sub });
                }
                i += 1;
                j += 1;
                write += 1;
            }
            Step::Insert => {
                out.push(Op::Insert { index: write, value: b[j].clone() });
                j += 1;
                write += 1;
            }
            Step::Delete => {
                out.push(Op::Delete(Key::Index(write)));
                i += 1;
            }
        }
    }
    out
}

/// First candidate key usable as a record identity in both lists.
fn record_key<'k>(a: &[Value], b: &[Value], candidates: &'k [String]) -> Option<&'k str> {
    candidates
        .iter()
        .map(String::as_str)
        .find(|key| keyed_by(a, key) && keyed_by(b, key))
}

/// Every element is a map holding `key` with a unique scalar value.
fn keyed_by(list: &[Value], key: &str) -> bool {
    let mut seen: FxHashSet<String> = FxHashSet::default();
    list.iter().all(|item| match item.get(key) {
        Some(k) if k.is_scalar() && !k.is_null() => seen.insert(k.to_string()),
        _ => false,
    })
}

struct Aligner<'a> {
    a: &'a [Value],
    b: &'a [Value],
    key: Option<&'a str>,
    span: usize,
    memo: FxHashMap<Cell, (usize, Step)>,
}

impl<'a> Aligner<'a> {
    fn matches(&self, i: usize, j: usize) -> bool {
        let (x, y) = (&self.a[i], &self.b[j]);
        match self.key {
            Some(key) => x.get(key) == y.get(key),
            None => x.same(y) || x == y,
        }
    }

    fn align(&mut self) -> Vec<Step> {
        let (n, m) = (self.a.len(), self.b.len());
        let mut steps = Vec::with_capacity(n.max(m));
        let (mut i, mut j) = (0, 0);
        while i < n || j < m {
            let step = self.solve((i, j));
            match step {
                Step::Merge => {
                    i += 1;
                    j += 1;
                }
                Step::Insert => j += 1,
                Step::Delete => i += 1,
            }
            steps.push(step);
        }
        steps
    }

    /// Evaluate a cell with an explicit work stack and return its best move.
    fn solve(&mut self, start: Cell) -> Step {
        let mut stack: Vec<Cell> = vec![start];
        while let Some(&cell) = stack.last() {
            if self.memo.contains_key(&cell) {
                stack.pop();
                continue;
            }
            match self.resolve(cell) {
                Ok(entry) => {
                    self.memo.insert(cell, entry);
                    stack.pop();
                }
                Err(pending) => stack.extend(pending),
            }
        }
        self.memo.get(&start).map(|&(_, step)| step).unwrap_or(Step::Merge)
    }

    fn cost(&self, cell: Cell) -> Result<usize, SmallVec<[Cell; 2]>> {
        self.memo.get(&cell).map(|&(c, _)| c).ok_or_else(|| smallvec![cell])
    }

    /// Cost and move for `(i, j)`, or the successor cells that must be
    /// evaluated first. Only called with `i < n || j < m`.
    fn resolve(&self, (i, j): Cell) -> Result<(usize, Step), SmallVec<[Cell; 2]>> {
        let (n, m) = (self.a.len(), self.b.len());
        if i == n {
            return Ok((m - j, Step::Insert));
        }
        if j == m {
            return Ok((n - i, Step::Delete));
        }
        if self.matches(i, j) {
            return self.cost((i + 1, j + 1)).map(|c| (c, Step::Merge));
        }

        let insert = (i, j + 1);
        let delete = (i + 1, j);
        if i.abs_diff(j) > self.span {
            let (cell, step) = if n - i > m - j { (delete, Step::Delete) } else { (insert, Step::Insert) };
            return self.cost(cell).map(|c| (c + 1, step));
        }
        match (self.cost(insert), self.cost(delete)) {
            (Ok(ci), Ok(cd)) if ci <= cd => Ok((ci + 1, Step::Insert)),
            (Ok(_), Ok(cd)) => Ok((cd + 1, Step::Delete)),
            (ins, del) => {
                let mut pending = SmallVec::new();
                pending.extend(ins.err().into_iter().flatten());
                pending.extend(del.err().into_iter().flatten());
                Err(pending)
            }
        }
    }
}
