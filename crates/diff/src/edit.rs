//! Local edits against a live resource.
//!
//! An [`EditSession`] remembers the remote value the user started from
//! (`synced`) and the user's working copy (`edited`). When a newer remote
//! value arrives, [`EditSession::rebase`] merges both change sets against
//! `synced` and reports what applying the result would do to the live
//! object.

#![forbid(unsafe_code)]

use kestrel_core::Value;
use serde::Serialize;

use crate::merge::{merge_diffs, ConflictReport, MergeConflict, Resolution};
use crate::{apply, diff_with, Diff, DiffOptions, PatchError};

#[derive(Debug, Clone)]
pub struct EditSession {
    synced: Value,
    edited: Value,
    options: DiffOptions,
}

/// Result of rebasing local edits onto a remote value.
#[derive(Debug, Clone, Serialize)]
pub struct Rebased {
    /// Remote value with the merged edits applied.
    pub target: Value,
    /// Merged script, relative to the value the session was synced to.
    pub merged: Diff,
    /// The remote value laid out in the user's key order.
    pub live_view: Value,
    /// Script from `live_view` to `target`: what submitting would change.
    pub review: Diff,
    pub conflicts: Vec<ConflictReport>,
}

impl Rebased {
    pub fn is_finalized(&self) -> bool {
        self.conflicts.iter().all(|c| c.resolution != Resolution::Unresolved)
    }
}

impl EditSession {
    pub fn new(synced: Value) -> Self {
        Self::with_options(synced, DiffOptions::default())
    }

    pub fn with_options(synced: Value, options: DiffOptions) -> Self {
        Self { edited: synced.clone(), synced, options }
    }

    pub fn synced(&self) -> &Value {
        &self.synced
    }

    pub fn edited(&self) -> &Value {
        &self.edited
    }

    pub fn set_edited(&mut self, edited: Value) {
        self.edited = edited;
    }

    /// The user's pending changes.
    pub fn local_diff(&self) -> Diff {
        diff_with(&self.synced, &self.edited, &self.options)
    }

    pub fn is_dirty(&self) -> bool {
        !self.local_diff().is_empty()
    }

    /// Merge local edits with the change from `synced` to `remote`.
    ///
    /// The session itself is not modified; see [`EditSession::accept_remote`].
    pub fn rebase<F>(&self, remote: &Value, resolve: F) -> Result<Rebased, PatchError>
    where
        F: FnMut(&MergeConflict) -> Resolution,
    {
        let left = self.local_diff();
        let right = diff_with(&self.synced, remote, &self.options);
        let outcome = merge_diffs(&left, &right, resolve);
        let target = apply(&self.synced, &outcome.diff)?;
        let live_view = apply(&self.edited, &diff_with(&self.edited, remote, &self.options))?;
        let review = diff_with(&live_view, &target, &self.options);
        Ok(Rebased { target, merged: outcome.diff, live_view, review, conflicts: outcome.conflicts })
    }

    /// Rebase onto `remote` and keep the result as the new working copy.
    pub fn accept_remote<F>(&mut self, remote: Value, resolve: F) -> Result<Rebased, PatchError>
    where
        F: FnMut(&MergeConflict) -> Resolution,
    {
        let rebased = self.rebase(&remote, resolve)?;
        self.synced = remote;
        self.edited = rebased.target.clone();
        Ok(rebased)
    }
}
