// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Parsers for git plumbing output.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Object type of a tree entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Blob,
    Tree,
    /// A submodule gitlink.
    Commit,
}

/// One line of `git ls-tree -l`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeEntry {
    /// Base name within the listed directory.
    pub name: String,
    /// Path relative to the repository root.
    pub path: String,
    pub kind: EntryKind,
    pub mode: String,
    /// Blob size in bytes; `None` for trees and gitlinks.
    pub size: Option<u64>,
    pub hash: String,
}

/// One record of `git worktree list --porcelain`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorktreeEntry {
    pub path: PathBuf,
    pub head: String,
    pub branch: Option<String>,
    pub is_bare: bool,
    pub is_detached: bool,
}

/// One line of `git log --format=%H%x09%ct%x09%s`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitSummary {
    pub hash: String,
    pub timestamp: i64,
    pub subject: String,
}

/// Parse NUL-terminated `ls-tree -l -z` output.
pub fn parse_ls_tree(output: &str) -> Vec<TreeEntry> {
    output
        .split('\0')
        .filter(|record| !record.is_empty())
        .filter_map(parse_ls_tree_record)
        .collect()
}

fn parse_ls_tree_record(record: &str) -> Option<TreeEntry> {
    // <mode> SP <type> SP <object> SP+ <size> TAB <path>
    let (meta, path) = record.split_once('\t')?;
    let mut fields = meta.split_whitespace();
    let mode = fields.next()?.to_string();
    let kind = match fields.next()? {
        "blob" => EntryKind::Blob,
        "tree" => EntryKind::Tree,
        "commit" => EntryKind::Commit,
        _ => return None,
    };
    let hash = fields.next()?.to_string();
    let size = fields.next().and_then(|s| s.parse().ok());
    let name = path.rsplit('/').next().unwrap_or(path).to_string();

    Some(TreeEntry {
        name,
        path: path.to_string(),
        kind,
        mode,
        size,
        hash,
    })
}

/// Parse `git worktree list --porcelain`.
pub fn parse_worktree_list(output: &str) -> Vec<WorktreeEntry> {
    let mut worktrees = Vec::new();
    let mut current = WorktreeEntry::default();

    for line in output.lines() {
        if let Some(path) = line.strip_prefix("worktree ") {
            if !current.path.as_os_str().is_empty() {
                worktrees.push(std::mem::take(&mut current));
            }
            current.path = PathBuf::from(path);
        } else if let Some(head) = line.strip_prefix("HEAD ") {
            current.head = head.to_string();
        } else if let Some(branch) = line.strip_prefix("branch refs/heads/") {
            current.branch = Some(branch.to_string());
        } else if line == "bare" {
            current.is_bare = true;
        } else if line == "detached" {
            current.is_detached = true;
        }
    }

    if !current.path.as_os_str().is_empty() {
        worktrees.push(current);
    }
    worktrees
}

/// Parse tab-separated `hash, commit time, subject` log lines.
pub fn parse_log(output: &str) -> Vec<CommitSummary> {
    output
        .lines()
        .filter_map(|line| {
            let mut parts = line.splitn(3, '\t');
            let hash = parts.next()?.to_string();
            let timestamp = parts.next()?.parse().ok()?;
            let subject = parts.next().unwrap_or("").to_string();
            Some(CommitSummary {
                hash,
                timestamp,
                subject,
            })
        })
        .collect()
}

/// Paths from `status --porcelain`, one per changed entry.
pub fn parse_status_paths(output: &str) -> Vec<String> {
    output
        .lines()
        .filter(|line| line.len() > 3)
        .map(|line| {
            let path = &line[3..];
            // Renames are reported as "old -> new".
            match path.split_once(" -> ") {
                Some((_, new)) => new.to_string(),
                None => path.to_string(),
            }
        })
        .collect()
}

/// Extract the first conflict region (`<<<<<<<` to `>>>>>>>`) from a file,
/// capped at `max_lines`.
pub fn conflict_snippet(content: &str, max_lines: usize) -> Option<String> {
    let lines: Vec<&str> = content.lines().collect();
    let start = lines.iter().position(|l| l.starts_with("<<<<<<<"))?;
    let end = lines[start..]
        .iter()
        .position(|l| l.starts_with(">>>>>>>"))
        .map(|offset| start + offset)
        .unwrap_or(lines.len() - 1);

    let region = &lines[start..=end];
    let mut snippet = region
        .iter()
        .take(max_lines)
        .copied()
        .collect::<Vec<_>>()
        .join("\n");
    if region.len() > max_lines {
        snippet.push_str(&format!("\n... ({} more lines)", region.len() - max_lines));
    }
    Some(snippet)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ls_tree() {
        let output = "100644 blob e69de29bb2d1d6434b8b29ae775ad8c2e48c5391       0\tsrc/lib.rs\0\
                      040000 tree 4b825dc642cb6eb9a060e54bf8d69288fbee4904       -\tsrc/nested\0\
                      160000 commit 1234567890abcdef1234567890abcdef12345678       -\tvendor\0";
        let entries = parse_ls_tree(output);
        assert_eq!(entries.len(), 3);

        assert_eq!(entries[0].name, "lib.rs");
        assert_eq!(entries[0].path, "src/lib.rs");
        assert_eq!(entries[0].kind, EntryKind::Blob);
        assert_eq!(entries[0].size, Some(0));

        assert_eq!(entries[1].kind, EntryKind::Tree);
        assert_eq!(entries[1].size, None);
        assert_eq!(entries[2].kind, EntryKind::Commit);
    }

    #[test]
    fn test_parse_ls_tree_name_with_spaces() {
        let output = "100644 blob abc      12\tdocs/read me.md\0";
        let entries = parse_ls_tree(output);
        assert_eq!(entries[0].name, "read me.md");
        assert_eq!(entries[0].size, Some(12));
    }

    #[test]
    fn test_parse_worktree_list() {
        let output = "worktree /ws/refs/app\nHEAD aaa\nbranch refs/heads/main\n\n\
                      worktree /ws/.execution/exec-E1/mutate/app\nHEAD bbb\nbranch refs/heads/exec-E1\n\n\
                      worktree /tmp/detached\nHEAD ccc\ndetached\n";
        let worktrees = parse_worktree_list(output);
        assert_eq!(worktrees.len(), 3);
        assert_eq!(worktrees[1].branch.as_deref(), Some("exec-E1"));
        assert_eq!(
            worktrees[1].path,
            PathBuf::from("/ws/.execution/exec-E1/mutate/app")
        );
        assert!(worktrees[2].is_detached);
        assert!(worktrees[2].branch.is_none());
    }

    #[test]
    fn test_parse_log() {
        let commits = parse_log("abc\t1700000000\tInitial commit\ndef\t1700000100\tFix: a\tb\n");
        assert_eq!(commits.len(), 2);
        assert_eq!(commits[0].subject, "Initial commit");
        assert_eq!(commits[1].subject, "Fix: a\tb");
        assert_eq!(commits[1].timestamp, 1_700_000_100);
    }

    #[test]
    fn test_parse_status_paths() {
        let paths = parse_status_paths(" M src/a.rs\n?? new.txt\nR  old.rs -> renamed.rs\n");
        assert_eq!(paths, vec!["src/a.rs", "new.txt", "renamed.rs"]);
    }

    #[test]
    fn test_conflict_snippet() {
        let content = "line 1\n<<<<<<< HEAD\nours\n=======\ntheirs\n>>>>>>> exec-E1\nline 2\n";
        let snippet = conflict_snippet(content, 20).unwrap();
        assert!(snippet.starts_with("<<<<<<< HEAD"));
        assert!(snippet.ends_with(">>>>>>> exec-E1"));
        assert!(!snippet.contains("line 2"));

        let truncated = conflict_snippet(content, 2).unwrap();
        assert!(truncated.contains("(3 more lines)"));

        assert!(conflict_snippet("no markers", 10).is_none());
    }
}
