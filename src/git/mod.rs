// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Git-backed reference store.
//!
//! We drive the `git` CLI rather than a library binding: worktree handling,
//! sparse and safe-directory semantics then match what a user sees when they
//! run git by hand inside `refs/<refId>`.

mod parse;
mod refs;

pub use parse::{
    conflict_snippet, parse_log, parse_ls_tree, parse_worktree_list, CommitSummary, EntryKind,
    TreeEntry, WorktreeEntry,
};
pub use refs::{
    AuditSink, ConflictSnippet, FileContent, MergeOutcome, RefStore, WorktreeInfo, DEFAULT_BRANCH,
};
