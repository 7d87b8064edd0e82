// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Stages the per-execution filesystem view of each reference.
//!
//! Staging is two-phase: [`WorkspaceBuilder::stage`] builds the directories
//! and returns the previews that *could* be started, and the caller starts
//! them only after the execution's working directory has been persisted.

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

#[cfg(feature = "telemetry")]
use tracing::instrument;

use crate::error::{GitError, WorkspaceError};
use crate::git::{RefStore, WorktreeInfo};
use crate::types::RefType;

use super::layout::{execution_branch, CREATE_MARKER_FILE};
use super::manifest::{ExecutionManifest, ManifestDirectories, RefPermissions};

/// A preview that may be started once the working directory is durable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingPreview {
    pub execution_id: String,
    pub ref_type: RefType,
    pub ref_id: String,
    pub dir: PathBuf,
}

/// Result of a successful [`WorkspaceBuilder::stage`].
#[derive(Debug, Clone)]
pub struct StagedWorkspace {
    pub manifest: ExecutionManifest,
    pub pending_previews: Vec<PendingPreview>,
}

impl StagedWorkspace {
    /// Directory the agent runs in.
    pub fn working_dir(&self) -> &Path {
        &self.manifest.directories.root
    }

    pub fn directories(&self) -> &ManifestDirectories {
        &self.manifest.directories
    }
}

/// Contents of the marker file in every `create/<refId>` directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateMarker {
    pub ref_id: String,
    pub execution_id: String,
    pub created_at: chrono::DateTime<Utc>,
}

/// Builds execution workspaces on top of a [`RefStore`].
#[derive(Clone)]
pub struct WorkspaceBuilder {
    refs: RefStore,
}

impl WorkspaceBuilder {
    pub fn new(refs: RefStore) -> Self {
        Self { refs }
    }

    pub fn refs(&self) -> &RefStore {
        &self.refs
    }

    /// Stage `permissions` for `execution_id`.
    ///
    /// On any failure everything created so far (worktrees, their branches
    /// and the execution directory) is removed before the error is returned.
    #[cfg_attr(feature = "telemetry", instrument(skip(self, permissions)))]
    pub async fn stage(
        &self,
        execution_id: &str,
        permissions: &RefPermissions,
    ) -> Result<StagedWorkspace, WorkspaceError> {
        crate::workspace::layout::validate_ref_id(execution_id)?;
        permissions.validate()?;

        let layout = self.refs.layout();
        let root = layout.execution_dir(execution_id);
        if root.exists() {
            return Err(WorkspaceError::InvalidRequest(format!(
                "execution {} is already staged at {}",
                execution_id,
                root.display()
            )));
        }

        // Existence checks come first so a bad request leaves nothing behind.
        for ref_id in permissions.read.iter().chain(&permissions.mutate) {
            self.refs.require_ref(ref_id)?;
        }
        for ref_id in &permissions.create {
            if self.refs.ref_exists(ref_id) {
                return Err(GitError::RefExists(ref_id.clone()).into());
            }
        }

        let mut manifest = ExecutionManifest::new(layout, execution_id, permissions.clone());
        let mut created: Vec<(String, WorktreeInfo)> = Vec::new();
        let result = self
            .populate(execution_id, permissions, &mut manifest, &mut created)
            .await;

        if let Err(e) = result {
            warn!(execution_id, "Staging failed, rolling back: {}", e);
            self.rollback(execution_id, &created).await;
            return Err(e);
        }

        let pending_previews = permissions
            .mutate
            .iter()
            .map(|id| (RefType::Mutate, id))
            .chain(permissions.create.iter().map(|id| (RefType::Create, id)))
            .map(|(ref_type, ref_id)| PendingPreview {
                execution_id: execution_id.to_string(),
                ref_type,
                ref_id: ref_id.clone(),
                dir: manifest.directories.ref_dir(ref_type, ref_id),
            })
            .collect();

        info!(
            execution_id,
            read = permissions.read.len(),
            mutate = permissions.mutate.len(),
            create = permissions.create.len(),
            "Staged execution workspace"
        );
        Ok(StagedWorkspace {
            manifest,
            pending_previews,
        })
    }

    async fn populate(
        &self,
        execution_id: &str,
        permissions: &RefPermissions,
        manifest: &mut ExecutionManifest,
        created: &mut Vec<(String, WorktreeInfo)>,
    ) -> Result<(), WorkspaceError> {
        let dirs = manifest.directories.clone();
        for dir in [&dirs.read, &dirs.mutate, &dirs.create] {
            tokio::fs::create_dir_all(dir).await?;
        }
        let manifest_path = self.refs.layout().manifest_path(execution_id);
        manifest.save(&manifest_path).await?;

        for ref_id in &permissions.read {
            let source = tokio::fs::canonicalize(self.refs.require_ref(ref_id)?).await?;
            let link = dirs.read.join(ref_id);
            symlink_dir(&source, &link)?;
            debug!(execution_id, "Linked {} -> {:?}", ref_id, source);
        }

        for ref_id in &permissions.mutate {
            let target = dirs.mutate.join(ref_id);
            let worktree = self.refs.create_worktree(ref_id, execution_id, &target).await?;
            created.push((ref_id.clone(), worktree));
        }

        for ref_id in &permissions.create {
            let dir = dirs.create.join(ref_id);
            tokio::fs::create_dir_all(&dir).await?;
            let marker = CreateMarker {
                ref_id: ref_id.clone(),
                execution_id: execution_id.to_string(),
                created_at: Utc::now(),
            };
            tokio::fs::write(dir.join(CREATE_MARKER_FILE), serde_json::to_vec_pretty(&marker)?)
                .await?;
        }

        manifest.worktrees = created.iter().cloned().collect();
        manifest.save(&manifest_path).await?;
        Ok(())
    }

    async fn rollback(&self, execution_id: &str, created: &[(String, WorktreeInfo)]) {
        let branch = execution_branch(execution_id);
        for (ref_id, worktree) in created.iter().rev() {
            if let Err(e) = self.refs.remove_worktree(ref_id, &worktree.path).await {
                warn!(execution_id, "Rollback: failed to remove worktree for {}: {}", ref_id, e);
            }
            if let Err(e) = self.refs.delete_branch(ref_id, &branch, true).await {
                warn!(execution_id, "Rollback: failed to delete {} in {}: {}", branch, ref_id, e);
            }
        }
        let root = self.refs.layout().execution_dir(execution_id);
        if root.exists() {
            if let Err(e) = tokio::fs::remove_dir_all(&root).await {
                warn!(execution_id, "Rollback: failed to remove {:?}: {}", root, e);
            }
        }
    }
}

#[cfg(unix)]
fn symlink_dir(source: &Path, link: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(source, link)
}

#[cfg(windows)]
fn symlink_dir(source: &Path, link: &Path) -> std::io::Result<()> {
    std::os::windows::fs::symlink_dir(source, link)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workspace::layout::WorkspaceLayout;
    use tempfile::TempDir;

    async fn fixture() -> Option<(TempDir, WorkspaceBuilder)> {
        if !RefStore::is_available().await {
            return None;
        }
        let temp = TempDir::new().unwrap();
        let layout = WorkspaceLayout::new(temp.path());
        layout.ensure().unwrap();
        Some((temp, WorkspaceBuilder::new(RefStore::new(layout))))
    }

    async fn seed(refs: &RefStore, ref_id: &str) {
        let path = refs.initialize_repo(ref_id).await.unwrap();
        std::fs::write(path.join("index.js"), "console.log(1)\n").unwrap();
        refs.stage_all(ref_id, &path).await.unwrap();
        refs.commit(ref_id, &path, "seed").await.unwrap();
    }

    #[tokio::test]
    async fn test_stage_all_three_kinds() {
        let Some((_temp, builder)) = fixture().await else { return };
        seed(builder.refs(), "docs").await;
        seed(builder.refs(), "proj-a").await;

        let perms = RefPermissions {
            read: vec!["docs".into()],
            mutate: vec!["proj-a".into()],
            create: vec!["fresh".into()],
        };
        let staged = builder.stage("E1", &perms).await.unwrap();
        let dirs = staged.directories();

        assert!(dirs.read.join("docs").join("index.js").exists());
        let worktree = staged.manifest.worktree("proj-a").unwrap();
        assert_eq!(worktree.branch, "exec-E1");
        assert!(worktree.path.join("index.js").exists());
        assert!(dirs.create.join("fresh").join(CREATE_MARKER_FILE).exists());

        let on_disk = ExecutionManifest::load_for(builder.refs().layout(), "E1").unwrap();
        assert_eq!(on_disk.worktrees, staged.manifest.worktrees);

        let kinds: Vec<_> = staged
            .pending_previews
            .iter()
            .map(|p| (p.ref_type, p.ref_id.as_str()))
            .collect();
        assert_eq!(kinds, vec![(RefType::Mutate, "proj-a"), (RefType::Create, "fresh")]);
    }

    #[tokio::test]
    async fn test_missing_read_ref_leaves_nothing() {
        let Some((_temp, builder)) = fixture().await else { return };
        let perms = RefPermissions {
            read: vec!["ghost".into()],
            ..Default::default()
        };
        let err = builder.stage("E2", &perms).await.unwrap_err();
        assert!(matches!(err, WorkspaceError::Git(GitError::RefNotFound(_))));
        assert!(!builder.refs().layout().execution_dir("E2").exists());
    }

    #[tokio::test]
    async fn test_create_of_existing_ref_rejected() {
        let Some((_temp, builder)) = fixture().await else { return };
        seed(builder.refs(), "taken").await;
        let perms = RefPermissions {
            create: vec!["taken".into()],
            ..Default::default()
        };
        let err = builder.stage("E3", &perms).await.unwrap_err();
        assert!(matches!(err, WorkspaceError::Git(GitError::RefExists(_))));
    }

    #[tokio::test]
    async fn test_mutate_failure_rolls_back_earlier_worktrees() {
        let Some((_temp, builder)) = fixture().await else { return };
        let refs = builder.refs().clone();
        seed(&refs, "a").await;
        seed(&refs, "b").await;
        // A leftover branch in `b` makes its worktree creation fail.
        refs.create_branch("b", "exec-E4", None).await.unwrap();

        let perms = RefPermissions {
            mutate: vec!["a".into(), "b".into()],
            ..Default::default()
        };
        let err = builder.stage("E4", &perms).await.unwrap_err();
        assert!(matches!(
            err,
            WorkspaceError::Git(GitError::WorktreeExists { .. })
        ));
        assert!(!refs.branch_exists("a", "exec-E4").await.unwrap());
        assert!(!refs.layout().execution_dir("E4").exists());
    }

    #[tokio::test]
    async fn test_restaging_same_execution_rejected() {
        let Some((_temp, builder)) = fixture().await else { return };
        seed(builder.refs(), "proj-a").await;
        let perms = RefPermissions {
            mutate: vec!["proj-a".into()],
            ..Default::default()
        };
        builder.stage("E5", &perms).await.unwrap();
        assert!(matches!(
            builder.stage("E5", &perms).await.unwrap_err(),
            WorkspaceError::InvalidRequest(_)
        ));
        // The first worktree is untouched.
        assert!(builder
            .refs()
            .layout()
            .mutate_dir("E5")
            .join("proj-a/index.js")
            .exists());
    }
}
