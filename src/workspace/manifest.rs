// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Execution manifest: the durable record of what was staged.
//!
//! Cleanup and integration consult nothing else to learn which worktrees,
//! branches and create directories belong to an execution. The file is only
//! ever replaced whole (write to a sibling temp file, then rename).

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::WorkspaceError;
use crate::git::WorktreeInfo;
use crate::types::{Permission, RefType};

use super::layout::{validate_ref_id, WorkspaceLayout};

/// Reference ids requested for an execution, by permission.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefPermissions {
    pub read: Vec<String>,
    pub mutate: Vec<String>,
    pub create: Vec<String>,
}

impl RefPermissions {
    pub fn is_empty(&self) -> bool {
        self.read.is_empty() && self.mutate.is_empty() && self.create.is_empty()
    }

    /// Reject malformed ids and any id listed twice, across all three lists.
    pub fn validate(&self) -> Result<(), WorkspaceError> {
        let mut seen = HashSet::new();
        for (ref_id, permission) in self.grants() {
            validate_ref_id(&ref_id)?;
            if !seen.insert(ref_id.clone()) {
                return Err(WorkspaceError::InvalidRequest(format!(
                    "reference '{}' is requested more than once (last as {})",
                    ref_id, permission
                )));
            }
        }
        Ok(())
    }

    /// Flattened `(refId, permission)` pairs.
    pub fn grants(&self) -> Vec<(String, Permission)> {
        let tag = |ids: &[String], permission: Permission| {
            ids.iter()
                .map(move |id| (id.clone(), permission))
                .collect::<Vec<_>>()
        };
        let mut grants = tag(&self.read, Permission::Read);
        grants.extend(tag(&self.mutate, Permission::Mutate));
        grants.extend(tag(&self.create, Permission::Create));
        grants
    }

    pub fn allows(&self, ref_id: &str, permission: Permission) -> bool {
        let list = match permission {
            Permission::Read => &self.read,
            Permission::Mutate => &self.mutate,
            Permission::Create => &self.create,
        };
        list.iter().any(|id| id == ref_id)
    }
}

/// Directories assigned to an execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestDirectories {
    pub root: PathBuf,
    pub read: PathBuf,
    pub mutate: PathBuf,
    pub create: PathBuf,
}

impl ManifestDirectories {
    pub fn for_execution(layout: &WorkspaceLayout, execution_id: &str) -> Self {
        Self {
            root: layout.execution_dir(execution_id),
            read: layout.read_dir(execution_id),
            mutate: layout.mutate_dir(execution_id),
            create: layout.create_dir(execution_id),
        }
    }

    /// Where a mutate or create reference lives inside the execution.
    pub fn ref_dir(&self, ref_type: RefType, ref_id: &str) -> PathBuf {
        match ref_type {
            RefType::Mutate => self.mutate.join(ref_id),
            RefType::Create => self.create.join(ref_id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionManifest {
    pub execution_id: String,
    pub permissions: RefPermissions,
    pub directories: ManifestDirectories,
    /// Worktree per mutate reference, filled once staging succeeds.
    #[serde(default)]
    pub worktrees: BTreeMap<String, WorktreeInfo>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ExecutionManifest {
    pub fn new(layout: &WorkspaceLayout, execution_id: &str, permissions: RefPermissions) -> Self {
        let now = Utc::now();
        Self {
            execution_id: execution_id.to_string(),
            permissions,
            directories: ManifestDirectories::for_execution(layout, execution_id),
            worktrees: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn worktree(&self, ref_id: &str) -> Option<&WorktreeInfo> {
        self.worktrees.get(ref_id)
    }

    /// Require `ref_id` to be declared with `permission`.
    pub fn require(&self, ref_id: &str, permission: Permission) -> Result<(), WorkspaceError> {
        if self.permissions.allows(ref_id, permission) {
            Ok(())
        } else {
            Err(WorkspaceError::not_declared(ref_id, permission))
        }
    }

    /// Replace the manifest on disk in one step.
    pub async fn save(&mut self, path: &Path) -> Result<(), WorkspaceError> {
        self.updated_at = Utc::now();
        let json = serde_json::to_vec_pretty(self)?;
        let tmp = path.with_extension("json.tmp");
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, path).await?;
        debug!(execution_id = %self.execution_id, "Wrote manifest {:?}", path);
        Ok(())
    }

    pub fn load(path: &Path, execution_id: &str) -> Result<Self, WorkspaceError> {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(WorkspaceError::ManifestNotFound(execution_id.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Load the manifest of `execution_id` from its standard location.
    pub fn load_for(layout: &WorkspaceLayout, execution_id: &str) -> Result<Self, WorkspaceError> {
        Self::load(&layout.manifest_path(execution_id), execution_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn permissions() -> RefPermissions {
        RefPermissions {
            read: vec!["docs".into()],
            mutate: vec!["proj-a".into()],
            create: vec!["new-app".into()],
        }
    }

    #[test]
    fn test_validate_rejects_duplicates_and_bad_ids() {
        assert!(permissions().validate().is_ok());

        let dup = RefPermissions {
            read: vec!["proj-a".into()],
            mutate: vec!["proj-a".into()],
            ..Default::default()
        };
        assert!(matches!(
            dup.validate().unwrap_err(),
            WorkspaceError::InvalidRequest(_)
        ));

        let bad = RefPermissions {
            create: vec!["../escape".into()],
            ..Default::default()
        };
        assert!(matches!(bad.validate().unwrap_err(), WorkspaceError::Git(_)));
    }

    #[test]
    fn test_grants_and_allows() {
        let perms = permissions();
        assert_eq!(perms.grants().len(), 3);
        assert!(perms.allows("proj-a", Permission::Mutate));
        assert!(!perms.allows("proj-a", Permission::Create));
    }

    #[tokio::test]
    async fn test_save_and_load_camel_case() {
        let temp = TempDir::new().unwrap();
        let layout = WorkspaceLayout::new(temp.path());
        let mut manifest = ExecutionManifest::new(&layout, "E1", permissions());
        manifest.worktrees.insert(
            "proj-a".into(),
            WorktreeInfo {
                path: layout.mutate_dir("E1").join("proj-a"),
                branch: "exec-E1".into(),
            },
        );

        let path = layout.manifest_path("E1");
        manifest.save(&path).await.unwrap();
        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"executionId\""));
        assert!(!path.with_extension("json.tmp").exists());

        let loaded = ExecutionManifest::load_for(&layout, "E1").unwrap();
        assert_eq!(loaded.worktree("proj-a").unwrap().branch, "exec-E1");
        assert!(loaded.require("new-app", Permission::Create).is_ok());
        assert!(matches!(
            loaded.require("docs", Permission::Mutate).unwrap_err(),
            WorkspaceError::RefNotDeclared { .. }
        ));
    }

    #[tokio::test]
    async fn test_save_replaces_existing_manifest() {
        let temp = TempDir::new().unwrap();
        let layout = WorkspaceLayout::new(temp.path());
        let path = layout.manifest_path("E1");
        let mut manifest = ExecutionManifest::new(&layout, "E1", permissions());
        manifest.save(&path).await.unwrap();
        let first = ExecutionManifest::load(&path, "E1").unwrap();
        assert!(first.worktrees.is_empty());

        manifest.worktrees.insert(
            "proj-a".into(),
            WorktreeInfo {
                path: layout.mutate_dir("E1").join("proj-a"),
                branch: "exec-E1".into(),
            },
        );
        manifest.save(&path).await.unwrap();
        let second = ExecutionManifest::load(&path, "E1").unwrap();
        assert_eq!(second.worktrees.len(), 1);
        assert!(second.updated_at >= first.updated_at);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn test_missing_manifest() {
        let temp = TempDir::new().unwrap();
        let layout = WorkspaceLayout::new(temp.path());
        assert!(matches!(
            ExecutionManifest::load_for(&layout, "nope").unwrap_err(),
            WorkspaceError::ManifestNotFound(_)
        ));
    }
}
