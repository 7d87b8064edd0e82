// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Version-control reference store.
//!
//! Every reference is a plain git repository under `refs/<refId>`. All
//! operations shell out to the `git` CLI with arguments passed as a vector,
//! never through a shell, so branch names, paths and commit messages are
//! always single atomic arguments.

use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, info, warn};

#[cfg(feature = "telemetry")]
use tracing::instrument;

#[cfg(feature = "telemetry")]
use crate::telemetry::metrics::GLOBAL_METRICS;

use crate::error::GitError;
use crate::types::GitOperationRecord;
use crate::workspace::layout::{execution_branch, validate_ref_id, WorkspaceLayout};

use super::parse::{
    conflict_snippet, parse_log, parse_ls_tree, parse_status_paths, parse_worktree_list,
    CommitSummary, TreeEntry, WorktreeEntry,
};

/// Branch name given to freshly initialized references.
pub const DEFAULT_BRANCH: &str = "main";

/// Identity used when a repository has none configured.
const FALLBACK_USER_NAME: &str = "workbench";
const FALLBACK_USER_EMAIL: &str = "workbench@localhost";

/// Lines of each conflict region reported back to the caller.
const CONFLICT_SNIPPET_LINES: usize = 40;

/// Receives one record per git invocation.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record_git_operation(&self, record: GitOperationRecord);
}

/// Result of a binary-safe file read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileContent {
    Found(Vec<u8>),
    NotFound,
}

impl FileContent {
    pub fn is_found(&self) -> bool {
        matches!(self, Self::Found(_))
    }

    /// Contents as UTF-8, replacing invalid sequences.
    pub fn text(&self) -> Option<String> {
        match self {
            Self::Found(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
            Self::NotFound => None,
        }
    }
}

/// A worktree created for an execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorktreeInfo {
    pub path: PathBuf,
    pub branch: String,
}

/// Outcome of merging an execution branch into main.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MergeOutcome {
    Merged {
        commit: String,
    },
    /// The merge was aborted; main is unchanged.
    Conflicted {
        files: Vec<String>,
        snippets: Vec<ConflictSnippet>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictSnippet {
    pub file: String,
    pub snippet: String,
}

/// Git-backed store of named references.
#[derive(Clone)]
pub struct RefStore {
    layout: WorkspaceLayout,
    audit: Option<Arc<dyn AuditSink>>,
}

impl RefStore {
    pub fn new(layout: WorkspaceLayout) -> Self {
        Self {
            layout,
            audit: None,
        }
    }

    /// Report every git call to `sink`.
    pub fn with_audit(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(sink);
        self
    }

    pub fn layout(&self) -> &WorkspaceLayout {
        &self.layout
    }

    /// Whether a usable `git` binary is on the PATH.
    pub async fn is_available() -> bool {
        Command::new("git")
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }

    // ========================================================================
    // Invocation
    // ========================================================================

    /// Run git in `cwd`, recording timing and outcome under `git.<op>`.
    async fn run<I, S>(
        &self,
        op: &str,
        ref_id: Option<&str>,
        cwd: &Path,
        args: I,
    ) -> Result<Output, GitError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let args: Vec<OsString> = args.into_iter().map(|a| a.as_ref().to_os_string()).collect();
        debug!(op, cwd = %cwd.display(), "git {:?}", args);

        let start = Instant::now();
        let result = Command::new("git")
            .args(&args)
            .current_dir(cwd)
            .env("GIT_TERMINAL_PROMPT", "0")
            .env("LC_ALL", "C")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await;
        let elapsed = start.elapsed();

        let (success, error) = match &result {
            Ok(output) if output.status.success() => (true, None),
            Ok(output) => (
                false,
                Some(String::from_utf8_lossy(&output.stderr).trim().to_string()),
            ),
            Err(e) => (false, Some(e.to_string())),
        };

        #[cfg(feature = "telemetry")]
        GLOBAL_METRICS.record_operation(&format!("git.{}", op), elapsed, success);

        if let Some(sink) = &self.audit {
            sink.record_git_operation(GitOperationRecord {
                operation: op.to_string(),
                ref_id: ref_id.map(str::to_string),
                duration_ms: elapsed.as_millis() as u64,
                success,
                error,
            })
            .await;
        }

        result.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => GitError::NotAvailable(e.to_string()),
            _ => GitError::Io(e),
        })
    }

    /// Run git and return trimmed stdout, or fail on a non-zero exit.
    async fn git<I, S>(
        &self,
        op: &str,
        ref_id: Option<&str>,
        cwd: &Path,
        args: I,
    ) -> Result<String, GitError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let output = self.run(op, ref_id, cwd, args).await?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            Err(GitError::command(
                op.replace('_', " "),
                String::from_utf8_lossy(&output.stderr).trim(),
            ))
        }
    }

    /// Path of an existing reference, or `RefNotFound`.
    pub fn require_ref(&self, ref_id: &str) -> Result<PathBuf, GitError> {
        validate_ref_id(ref_id)?;
        let path = self.layout.ref_path(ref_id);
        if path.join(".git").exists() {
            Ok(path)
        } else {
            Err(GitError::RefNotFound(ref_id.to_string()))
        }
    }

    // ========================================================================
    // References
    // ========================================================================

    pub fn ref_exists(&self, ref_id: &str) -> bool {
        self.require_ref(ref_id).is_ok()
    }

    /// All references under `refs/`, sorted.
    pub fn list_refs(&self) -> Result<Vec<String>, GitError> {
        let dir = self.layout.refs_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut refs = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                if self.ref_exists(name) {
                    refs.push(name.to_string());
                }
            }
        }
        refs.sort();
        Ok(refs)
    }

    /// Create `refs/<refId>` as an empty repository on [`DEFAULT_BRANCH`].
    #[cfg_attr(feature = "telemetry", instrument(skip(self)))]
    pub async fn initialize_repo(&self, ref_id: &str) -> Result<PathBuf, GitError> {
        validate_ref_id(ref_id)?;
        let path = self.layout.ref_path(ref_id);
        if path.join(".git").exists() {
            return Err(GitError::RefExists(ref_id.to_string()));
        }
        tokio::fs::create_dir_all(&path).await?;

        self.git("init", Some(ref_id), &path, ["init", "--quiet"])
            .await?;
        self.git(
            "symbolic_ref",
            Some(ref_id),
            &path,
            ["symbolic-ref", "HEAD", &format!("refs/heads/{}", DEFAULT_BRANCH)],
        )
        .await?;
        self.ensure_identity(ref_id, &path).await?;

        info!("Initialized reference {} at {:?}", ref_id, path);
        Ok(path)
    }

    /// The branch the reference's main checkout is on.
    pub async fn default_branch(&self, ref_id: &str) -> Result<String, GitError> {
        let path = self.require_ref(ref_id)?;
        match self
            .git("symbolic_ref", Some(ref_id), &path, ["symbolic-ref", "--short", "HEAD"])
            .await
        {
            Ok(branch) if !branch.is_empty() => Ok(branch),
            _ => Ok(DEFAULT_BRANCH.to_string()),
        }
    }

    /// Set a repo-local author identity if none is configured.
    async fn ensure_identity(&self, ref_id: &str, cwd: &Path) -> Result<(), GitError> {
        let output = self
            .run("config", Some(ref_id), cwd, ["config", "--get", "user.email"])
            .await?;
        if output.status.success() {
            return Ok(());
        }
        self.git("config", Some(ref_id), cwd, ["config", "user.email", FALLBACK_USER_EMAIL])
            .await?;
        self.git("config", Some(ref_id), cwd, ["config", "user.name", FALLBACK_USER_NAME])
            .await?;
        Ok(())
    }

    // ========================================================================
    // Reading
    // ========================================================================

    /// Resolve `rev` (default: the reference's main branch) to a commit, or
    /// `None` if the repository has no such commit.
    async fn resolve_commit(
        &self,
        ref_id: &str,
        path: &Path,
        rev: &str,
    ) -> Result<Option<String>, GitError> {
        let output = self
            .run(
                "rev_parse",
                Some(ref_id),
                path,
                ["rev-parse", "--verify", "--quiet", &format!("{}^{{commit}}", rev)],
            )
            .await?;
        if output.status.success() {
            Ok(Some(String::from_utf8_lossy(&output.stdout).trim().to_string()))
        } else {
            Ok(None)
        }
    }

    /// Every tracked file path at `rev`.
    pub async fn list_files(
        &self,
        ref_id: &str,
        rev: Option<&str>,
    ) -> Result<Vec<String>, GitError> {
        let path = self.require_ref(ref_id)?;
        let rev = match rev {
            Some(r) => r.to_string(),
            None => self.default_branch(ref_id).await?,
        };
        if self.resolve_commit(ref_id, &path, &rev).await?.is_none() {
            // An empty repository has no files yet.
            return Ok(Vec::new());
        }
        let output = self
            .git("ls_tree", Some(ref_id), &path, ["ls-tree", "-r", "--name-only", "-z", &rev])
            .await?;
        Ok(output
            .split('\0')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Read a file's bytes at `rev`. Missing paths are not an error.
    pub async fn read_file(
        &self,
        ref_id: &str,
        file: &str,
        rev: Option<&str>,
    ) -> Result<FileContent, GitError> {
        let path = self.require_ref(ref_id)?;
        let rev = match rev {
            Some(r) => r.to_string(),
            None => self.default_branch(ref_id).await?,
        };
        let spec = format!("{}:{}", rev, file.trim_start_matches('/'));

        let kind = self
            .run("cat_file", Some(ref_id), &path, ["cat-file", "-t", &spec])
            .await?;
        if !kind.status.success() || String::from_utf8_lossy(&kind.stdout).trim() != "blob" {
            return Ok(FileContent::NotFound);
        }

        let output = self
            .run("cat_file", Some(ref_id), &path, ["cat-file", "blob", &spec])
            .await?;
        if output.status.success() {
            Ok(FileContent::Found(output.stdout))
        } else {
            Ok(FileContent::NotFound)
        }
    }

    /// Entries directly inside `dir` (repository root when empty) at `rev`.
    pub async fn list_directory(
        &self,
        ref_id: &str,
        dir: &str,
        rev: Option<&str>,
    ) -> Result<Vec<TreeEntry>, GitError> {
        let path = self.require_ref(ref_id)?;
        let rev = match rev {
            Some(r) => r.to_string(),
            None => self.default_branch(ref_id).await?,
        };
        if self.resolve_commit(ref_id, &path, &rev).await?.is_none() {
            return Ok(Vec::new());
        }

        let dir = dir.trim_matches('/');
        let mut args = vec!["ls-tree".to_string(), "-l".to_string(), "-z".to_string(), rev];
        if !dir.is_empty() {
            args.push("--".to_string());
            args.push(format!("{}/", dir));
        }
        let output = self.run("ls_tree", Some(ref_id), &path, &args).await?;
        if !output.status.success() {
            return Err(GitError::command(
                "ls-tree",
                String::from_utf8_lossy(&output.stderr).trim(),
            ));
        }
        Ok(parse_ls_tree(&String::from_utf8_lossy(&output.stdout)))
    }

    /// Recent commits reachable from `rev`, newest first.
    pub async fn log(
        &self,
        ref_id: &str,
        rev: Option<&str>,
        limit: usize,
    ) -> Result<Vec<CommitSummary>, GitError> {
        let path = self.require_ref(ref_id)?;
        let rev = match rev {
            Some(r) => r.to_string(),
            None => self.default_branch(ref_id).await?,
        };
        if self.resolve_commit(ref_id, &path, &rev).await?.is_none() {
            return Ok(Vec::new());
        }
        let output = self
            .git(
                "log",
                Some(ref_id),
                &path,
                [
                    "log".to_string(),
                    "--format=%H%x09%ct%x09%s".to_string(),
                    "-n".to_string(),
                    limit.to_string(),
                    rev,
                ],
            )
            .await?;
        Ok(parse_log(&output))
    }

    pub async fn rev_parse(&self, ref_id: &str, rev: &str) -> Result<String, GitError> {
        let path = self.require_ref(ref_id)?;
        self.resolve_commit(ref_id, &path, rev)
            .await?
            .ok_or_else(|| GitError::BranchNotFound(rev.to_string()))
    }

    // ========================================================================
    // Branches
    // ========================================================================

    pub async fn list_branches(&self, ref_id: &str) -> Result<Vec<String>, GitError> {
        let path = self.require_ref(ref_id)?;
        let output = self
            .git(
                "branch_list",
                Some(ref_id),
                &path,
                ["branch", "--list", "--format=%(refname:short)"],
            )
            .await?;
        Ok(output.lines().map(|l| l.trim().to_string()).filter(|l| !l.is_empty()).collect())
    }

    pub async fn branch_exists(&self, ref_id: &str, branch: &str) -> Result<bool, GitError> {
        let path = self.require_ref(ref_id)?;
        let output = self
            .run(
                "rev_parse",
                Some(ref_id),
                &path,
                ["rev-parse", "--verify", "--quiet", &format!("refs/heads/{}", branch)],
            )
            .await?;
        Ok(output.status.success())
    }

    /// Create `branch` at `base` (default: main) without checking it out.
    pub async fn create_branch(
        &self,
        ref_id: &str,
        branch: &str,
        base: Option<&str>,
    ) -> Result<(), GitError> {
        let path = self.require_ref(ref_id)?;
        if branch.starts_with('-') {
            return Err(GitError::invalid_ref(branch, "branch must not start with '-'"));
        }
        let base = match base {
            Some(b) => b.to_string(),
            None => self.default_branch(ref_id).await?,
        };
        self.git("branch_create", Some(ref_id), &path, ["branch", branch, &base])
            .await?;
        Ok(())
    }

    pub async fn delete_branch(
        &self,
        ref_id: &str,
        branch: &str,
        force: bool,
    ) -> Result<(), GitError> {
        let path = self.require_ref(ref_id)?;
        if !self.branch_exists(ref_id, branch).await? {
            return Err(GitError::BranchNotFound(branch.to_string()));
        }
        let flag = if force { "-D" } else { "-d" };
        self.git("branch_delete", Some(ref_id), &path, ["branch", flag, "--", branch])
            .await?;
        debug!("Deleted branch {} in {}", branch, ref_id);
        Ok(())
    }

    /// Check out `branch` in the reference's main checkout.
    pub async fn checkout(&self, ref_id: &str, branch: &str) -> Result<(), GitError> {
        let path = self.require_ref(ref_id)?;
        let current = self.current_branch(ref_id, &path).await.unwrap_or_default();
        if current == branch {
            return Ok(());
        }
        self.git("checkout", Some(ref_id), &path, ["checkout", "--quiet", branch])
            .await?;
        Ok(())
    }

    // ========================================================================
    // Worktrees
    // ========================================================================

    /// Check out a new branch `exec-<executionId>` from main at `target`.
    #[cfg_attr(
        feature = "telemetry",
        instrument(skip(self, target), fields(target = %target.display()))
    )]
    pub async fn create_worktree(
        &self,
        ref_id: &str,
        execution_id: &str,
        target: &Path,
    ) -> Result<WorktreeInfo, GitError> {
        let path = self.require_ref(ref_id)?;
        validate_ref_id(execution_id)?;
        let branch = execution_branch(execution_id);

        if self.branch_exists(ref_id, &branch).await? {
            let existing = self
                .list_worktrees(ref_id)
                .await?
                .into_iter()
                .find(|w| w.branch.as_deref() == Some(branch.as_str()))
                .map(|w| w.path.display().to_string())
                .unwrap_or_else(|| "(branch only)".to_string());
            return Err(GitError::WorktreeExists {
                branch,
                path: existing,
            });
        }
        if target.exists() {
            return Err(GitError::WorktreeExists {
                branch,
                path: target.display().to_string(),
            });
        }

        let base = self.default_branch(ref_id).await?;
        info!("Creating worktree for {} at {:?}", branch, target);
        self.git(
            "worktree_add",
            Some(ref_id),
            &path,
            [
                OsStr::new("worktree"),
                OsStr::new("add"),
                OsStr::new("-b"),
                OsStr::new(&branch),
                target.as_os_str(),
                OsStr::new(&base),
            ],
        )
        .await?;

        Ok(WorktreeInfo {
            path: target.to_path_buf(),
            branch,
        })
    }

    /// Remove a worktree, falling back to deleting the directory and pruning.
    pub async fn remove_worktree(&self, ref_id: &str, target: &Path) -> Result<(), GitError> {
        let path = self.require_ref(ref_id)?;
        info!("Removing worktree {:?} from {}", target, ref_id);

        let result = self
            .git(
                "worktree_remove",
                Some(ref_id),
                &path,
                [
                    OsStr::new("worktree"),
                    OsStr::new("remove"),
                    OsStr::new("--force"),
                    target.as_os_str(),
                ],
            )
            .await;

        if let Err(e) = result {
            warn!("Failed to remove worktree via git: {}", e);
            if target.exists() {
                tokio::fs::remove_dir_all(target).await?;
            }
            self.prune_worktrees(ref_id).await?;
        }
        Ok(())
    }

    pub async fn prune_worktrees(&self, ref_id: &str) -> Result<(), GitError> {
        let path = self.require_ref(ref_id)?;
        self.git("worktree_prune", Some(ref_id), &path, ["worktree", "prune"])
            .await?;
        Ok(())
    }

    pub async fn list_worktrees(&self, ref_id: &str) -> Result<Vec<WorktreeEntry>, GitError> {
        let path = self.require_ref(ref_id)?;
        let output = self
            .git("worktree_list", Some(ref_id), &path, ["worktree", "list", "--porcelain"])
            .await?;
        Ok(parse_worktree_list(&output))
    }

    // ========================================================================
    // Working-tree state
    // ========================================================================

    /// Branch checked out at `worktree`.
    pub async fn current_branch(&self, ref_id: &str, worktree: &Path) -> Result<String, GitError> {
        self.git("branch_current", Some(ref_id), worktree, ["branch", "--show-current"])
            .await
    }

    /// Changed paths in `worktree`; empty when clean.
    pub async fn status(&self, ref_id: &str, worktree: &Path) -> Result<Vec<String>, GitError> {
        let output = self
            .run(
                "status",
                Some(ref_id),
                worktree,
                ["status", "--porcelain", "--untracked-files=all"],
            )
            .await?;
        if !output.status.success() {
            return Err(GitError::command(
                "status",
                String::from_utf8_lossy(&output.stderr).trim(),
            ));
        }
        // Not trimmed: the leading status column is significant.
        Ok(parse_status_paths(&String::from_utf8_lossy(&output.stdout)))
    }

    pub async fn is_dirty(&self, ref_id: &str, worktree: &Path) -> Result<bool, GitError> {
        Ok(!self.status(ref_id, worktree).await?.is_empty())
    }

    pub async fn stage_all(&self, ref_id: &str, worktree: &Path) -> Result<(), GitError> {
        self.git("add", Some(ref_id), worktree, ["add", "-A"]).await?;
        Ok(())
    }

    /// Commit what is staged and return the new commit hash.
    pub async fn commit(
        &self,
        ref_id: &str,
        worktree: &Path,
        message: &str,
    ) -> Result<String, GitError> {
        self.ensure_identity(ref_id, worktree).await?;
        self.git("commit", Some(ref_id), worktree, ["commit", "--quiet", "-m", message])
            .await?;
        self.git("rev_parse", Some(ref_id), worktree, ["rev-parse", "HEAD"])
            .await
    }

    // ========================================================================
    // Diffs and merges
    // ========================================================================

    /// Unified diff of `to` against its merge base with `from`.
    pub async fn diff(&self, ref_id: &str, from: &str, to: &str) -> Result<String, GitError> {
        let path = self.require_ref(ref_id)?;
        self.git("diff", Some(ref_id), &path, ["diff", &format!("{}...{}", from, to)])
            .await
    }

    pub async fn diff_stat(&self, ref_id: &str, from: &str, to: &str) -> Result<String, GitError> {
        let path = self.require_ref(ref_id)?;
        self.git("diff", Some(ref_id), &path, ["diff", "--stat", &format!("{}...{}", from, to)])
            .await
    }

    pub async fn changed_files(
        &self,
        ref_id: &str,
        from: &str,
        to: &str,
    ) -> Result<Vec<String>, GitError> {
        let path = self.require_ref(ref_id)?;
        let output = self
            .git(
                "diff",
                Some(ref_id),
                &path,
                ["diff", "--name-only", &format!("{}...{}", from, to)],
            )
            .await?;
        Ok(output.lines().map(str::to_string).collect())
    }

    /// Merge `branch` into main with `--no-ff`.
    ///
    /// On conflict the merge is aborted and main is left checked out and
    /// unchanged.
    #[cfg_attr(feature = "telemetry", instrument(skip(self, message)))]
    pub async fn merge_branch(
        &self,
        ref_id: &str,
        branch: &str,
        message: &str,
    ) -> Result<MergeOutcome, GitError> {
        let path = self.require_ref(ref_id)?;
        if !self.branch_exists(ref_id, branch).await? {
            return Err(GitError::BranchNotFound(branch.to_string()));
        }
        let main = self.default_branch(ref_id).await?;
        self.checkout(ref_id, &main).await?;
        self.ensure_identity(ref_id, &path).await?;

        let output = self
            .run(
                "merge",
                Some(ref_id),
                &path,
                ["merge", "--no-ff", "--no-edit", "-m", message, branch],
            )
            .await?;

        if output.status.success() {
            let commit = self
                .git("rev_parse", Some(ref_id), &path, ["rev-parse", "HEAD"])
                .await?;
            info!("Merged {} into {} in {} at {}", branch, main, ref_id, commit);
            return Ok(MergeOutcome::Merged { commit });
        }

        let conflicted = self
            .git(
                "diff",
                Some(ref_id),
                &path,
                ["diff", "--name-only", "--diff-filter=U"],
            )
            .await
            .unwrap_or_default();
        let files: Vec<String> = conflicted.lines().map(str::to_string).collect();

        let mut snippets = Vec::new();
        for file in &files {
            if let Ok(content) = tokio::fs::read_to_string(path.join(file)).await {
                if let Some(snippet) = conflict_snippet(&content, CONFLICT_SNIPPET_LINES) {
                    snippets.push(ConflictSnippet {
                        file: file.clone(),
                        snippet,
                    });
                }
            }
        }

        if let Err(e) = self.git("merge_abort", Some(ref_id), &path, ["merge", "--abort"]).await {
            warn!("merge --abort failed in {}: {}", ref_id, e);
        }

        if files.is_empty() {
            return Err(GitError::command(
                "merge",
                String::from_utf8_lossy(&output.stderr).trim(),
            ));
        }
        warn!("Merge of {} into {} conflicted on {} files", branch, ref_id, files.len());
        Ok(MergeOutcome::Conflicted { files, snippets })
    }

    /// Revert a merge commit on main, keeping its first parent.
    pub async fn revert_merge(&self, ref_id: &str, commit: &str) -> Result<String, GitError> {
        let path = self.require_ref(ref_id)?;
        let main = self.default_branch(ref_id).await?;
        self.checkout(ref_id, &main).await?;
        self.ensure_identity(ref_id, &path).await?;
        self.git(
            "revert",
            Some(ref_id),
            &path,
            ["revert", "--no-edit", "-m", "1", commit],
        )
        .await?;
        self.git("rev_parse", Some(ref_id), &path, ["rev-parse", "HEAD"])
            .await
    }
}
