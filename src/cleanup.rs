// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Workspace cleanup and execution rollback.
//!
//! Cleanup reclaims disk: worktrees, the execution directory and optionally
//! the execution branches. Rollback additionally undoes what the execution
//! published (promotion merges and created references). Stopping the agent
//! and any previews is the caller's job and must happen first.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[cfg(feature = "telemetry")]
use tracing::instrument;

use crate::error::{GitError, WorkspaceError};
use crate::git::RefStore;
use crate::store::Store;
use crate::types::{ChangeKind, ExecutionStatus};
use crate::workspace::{execution_branch, ExecutionManifest};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    pub execution_id: String,
    pub removed_worktrees: Vec<String>,
    pub deleted_branches: Vec<String>,
    pub removed_dir: bool,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackReport {
    pub execution_id: String,
    /// `(refId, revert commit)` for every promotion that was undone.
    pub reverted: Vec<(String, String)>,
    pub removed_refs: Vec<String>,
    pub cleanup: CleanupReport,
    pub errors: Vec<String>,
}

#[derive(Clone)]
pub struct CleanupCoordinator {
    refs: RefStore,
    store: Store,
}

impl CleanupCoordinator {
    pub fn new(refs: RefStore, store: Store) -> Self {
        Self { refs, store }
    }

    /// Remove an execution's worktrees and scratch directory.
    ///
    /// With `keep_branches` the `exec-<id>` branches survive for audit.
    #[cfg_attr(feature = "telemetry", instrument(skip(self)))]
    pub async fn cleanup_execution(
        &self,
        execution_id: &str,
        keep_branches: bool,
    ) -> Result<CleanupReport, WorkspaceError> {
        let layout = self.refs.layout();
        let root = layout.execution_dir(execution_id);
        let mut report = CleanupReport {
            execution_id: execution_id.to_string(),
            ..Default::default()
        };

        let manifest = match ExecutionManifest::load_for(layout, execution_id) {
            Ok(manifest) => Some(manifest),
            Err(WorkspaceError::ManifestNotFound(_)) if root.exists() => {
                warn!(execution_id, "No manifest; removing the directory only");
                None
            }
            Err(e) => return Err(e),
        };

        if let Some(manifest) = &manifest {
            let branch = execution_branch(execution_id);
            for (ref_id, worktree) in &manifest.worktrees {
                match self.refs.remove_worktree(ref_id, &worktree.path).await {
                    Ok(()) => report.removed_worktrees.push(ref_id.clone()),
                    Err(e) => report.errors.push(format!("{}: {}", ref_id, e)),
                }
                if keep_branches {
                    continue;
                }
                match self.refs.delete_branch(ref_id, &branch, true).await {
                    Ok(()) => report.deleted_branches.push(ref_id.clone()),
                    Err(GitError::BranchNotFound(_)) => {}
                    Err(e) => report.errors.push(format!("{}: {}", ref_id, e)),
                }
            }
        }

        if root.exists() {
            tokio::fs::remove_dir_all(&root).await?;
            report.removed_dir = true;
        }
        info!(
            execution_id,
            worktrees = report.removed_worktrees.len(),
            branches = report.deleted_branches.len(),
            "Cleaned up execution"
        );
        Ok(report)
    }

    /// Undo an execution: revert promotions, remove created references,
    /// delete its branches and mark it `rolled_back`.
    #[cfg_attr(feature = "telemetry", instrument(skip(self)))]
    pub async fn rollback_execution(
        &self,
        execution_id: &str,
    ) -> Result<RollbackReport, WorkspaceError> {
        let mut report = RollbackReport {
            execution_id: execution_id.to_string(),
            ..Default::default()
        };
        let manifest = ExecutionManifest::load_for(self.refs.layout(), execution_id).ok();
        let changes = self.store.list_changes(execution_id).await?;

        // Newest promotion first so reverts apply cleanly.
        for change in changes.iter().rev().filter(|c| c.kind == ChangeKind::Promote) {
            let Some(commit) = &change.commit_hash else { continue };
            match self.refs.revert_merge(&change.ref_id, commit).await {
                Ok(revert) => {
                    self.record(execution_id, &change.ref_id, Some(&revert), "reverted promotion")
                        .await;
                    report.reverted.push((change.ref_id.clone(), revert));
                }
                Err(e) => report.errors.push(format!("revert {}: {}", change.ref_id, e)),
            }
        }

        let declared_create = |ref_id: &str| {
            manifest
                .as_ref()
                .map(|m| m.permissions.create.iter().any(|id| id == ref_id))
                .unwrap_or(true)
        };
        for change in changes.iter().filter(|c| c.kind == ChangeKind::Create) {
            if !declared_create(&change.ref_id) {
                continue;
            }
            let path = self.refs.layout().ref_path(&change.ref_id);
            match tokio::fs::remove_dir_all(&path).await {
                Ok(()) => {
                    self.record(execution_id, &change.ref_id, None, "removed created reference")
                        .await;
                    report.removed_refs.push(change.ref_id.clone());
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => report.errors.push(format!("remove {}: {}", change.ref_id, e)),
            }
        }

        if manifest.is_some() || self.refs.layout().execution_dir(execution_id).exists() {
            report.cleanup = self.cleanup_execution(execution_id, false).await?;
        }

        self.store
            .update_execution_status(execution_id, ExecutionStatus::RolledBack, None)
            .await?;
        self.store.update_execution_phase(execution_id, "rolled_back").await?;
        info!(
            execution_id,
            reverted = report.reverted.len(),
            removed_refs = report.removed_refs.len(),
            "Rolled back execution"
        );
        Ok(report)
    }

    async fn record(&self, execution_id: &str, ref_id: &str, commit: Option<&str>, detail: &str) {
        if let Err(e) = self
            .store
            .insert_change(execution_id, ref_id, ChangeKind::Rollback, commit, Some(detail))
            .await
        {
            warn!(execution_id, ref_id, "Failed to record rollback: {}", e);
        }
    }
}
