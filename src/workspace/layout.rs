// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! On-disk layout of the workspace root.
//!
//! ```text
//! workspace/
//! ├── refs/
//! │   └── <refId>/                 # one git repository per reference
//! └── .execution/
//!     └── exec-<executionId>/
//!         ├── manifest.json
//!         ├── read/<refId>   -> ../../refs/<refId>
//!         ├── mutate/<refId>       # worktree on branch exec-<executionId>
//!         └── create/<refId>       # seeds a new reference
//! ```

use std::path::{Path, PathBuf};

use crate::error::GitError;

pub const REFS_DIR: &str = "refs";
pub const EXECUTIONS_DIR: &str = ".execution";
pub const MANIFEST_FILE: &str = "manifest.json";
pub const READ_DIR: &str = "read";
pub const MUTATE_DIR: &str = "mutate";
pub const CREATE_DIR: &str = "create";

/// Marker written into every `create/<refId>` directory.
pub const CREATE_MARKER_FILE: &str = ".workbench-create.json";

/// Prefix of execution scratch directories and branches.
pub const EXECUTION_PREFIX: &str = "exec-";

/// Longest accepted reference or execution id.
const MAX_ID_LEN: usize = 128;

/// Branch name used for an execution's worktrees.
pub fn execution_branch(execution_id: &str) -> String {
    format!("{}{}", EXECUTION_PREFIX, execution_id)
}

/// Validate an id that becomes a single path component.
///
/// Accepts `[A-Za-z0-9._-]`, rejects `.`/`..`, a leading `-` (it would be
/// read as a git option) and anything longer than 128 bytes.
pub fn validate_ref_id(id: &str) -> Result<(), GitError> {
    if id.is_empty() {
        return Err(GitError::invalid_ref(id, "must not be empty"));
    }
    if id.len() > MAX_ID_LEN {
        return Err(GitError::invalid_ref(id, "too long"));
    }
    if id == "." || id == ".." {
        return Err(GitError::invalid_ref(id, "reserved name"));
    }
    if id.starts_with('-') {
        return Err(GitError::invalid_ref(id, "must not start with '-'"));
    }
    if let Some(c) = id
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')))
    {
        return Err(GitError::invalid_ref(
            id,
            format!("invalid character {:?}", c),
        ));
    }
    if id.ends_with(".lock") || id.contains("..") {
        return Err(GitError::invalid_ref(id, "not a valid branch component"));
    }
    Ok(())
}

/// Paths under a workspace root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceLayout {
    root: PathBuf,
}

impl WorkspaceLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn refs_dir(&self) -> PathBuf {
        self.root.join(REFS_DIR)
    }

    /// `refs/<refId>`. The id is not validated here.
    pub fn ref_path(&self, ref_id: &str) -> PathBuf {
        self.refs_dir().join(ref_id)
    }

    pub fn executions_dir(&self) -> PathBuf {
        self.root.join(EXECUTIONS_DIR)
    }

    pub fn execution_dir(&self, execution_id: &str) -> PathBuf {
        self.executions_dir().join(execution_branch(execution_id))
    }

    pub fn manifest_path(&self, execution_id: &str) -> PathBuf {
        self.execution_dir(execution_id).join(MANIFEST_FILE)
    }

    pub fn read_dir(&self, execution_id: &str) -> PathBuf {
        self.execution_dir(execution_id).join(READ_DIR)
    }

    pub fn mutate_dir(&self, execution_id: &str) -> PathBuf {
        self.execution_dir(execution_id).join(MUTATE_DIR)
    }

    pub fn create_dir(&self, execution_id: &str) -> PathBuf {
        self.execution_dir(execution_id).join(CREATE_DIR)
    }

    /// Create `refs/` and `.execution/` if missing.
    pub fn ensure(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.refs_dir())?;
        std::fs::create_dir_all(self.executions_dir())?;
        Ok(())
    }

    /// Execution ids that currently have a scratch directory.
    pub fn list_execution_ids(&self) -> std::io::Result<Vec<String>> {
        let dir = self.executions_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(id) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.strip_prefix(EXECUTION_PREFIX))
            {
                ids.push(id.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execution_paths() {
        let layout = WorkspaceLayout::new("/ws");
        assert_eq!(layout.ref_path("proj-a"), PathBuf::from("/ws/refs/proj-a"));
        assert_eq!(
            layout.mutate_dir("E1"),
            PathBuf::from("/ws/.execution/exec-E1/mutate")
        );
        assert_eq!(
            layout.manifest_path("E1"),
            PathBuf::from("/ws/.execution/exec-E1/manifest.json")
        );
        assert_eq!(execution_branch("E1"), "exec-E1");
    }

    #[test]
    fn test_validate_ref_id() {
        for ok in ["proj-a", "App_2", "v1.0", "a"] {
            assert!(validate_ref_id(ok).is_ok(), "{ok}");
        }
        for bad in ["", ".", "..", "a/b", "a\\b", "-rf", "x y", "a..b", "ref.lock", "ü"] {
            assert!(validate_ref_id(bad).is_err(), "{bad}");
        }
        assert!(validate_ref_id(&"a".repeat(129)).is_err());
    }

    #[test]
    fn test_list_execution_ids() {
        let temp = tempfile::TempDir::new().unwrap();
        let layout = WorkspaceLayout::new(temp.path());
        assert!(layout.list_execution_ids().unwrap().is_empty());

        layout.ensure().unwrap();
        std::fs::create_dir_all(layout.execution_dir("b")).unwrap();
        std::fs::create_dir_all(layout.execution_dir("a")).unwrap();
        std::fs::create_dir_all(layout.executions_dir().join("stray")).unwrap();

        assert_eq!(layout.list_execution_ids().unwrap(), vec!["a", "b"]);
    }
}
