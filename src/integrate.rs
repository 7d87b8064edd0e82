// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Change integration: commit, sync, promote and seed references.
//!
//! Syncing never moves main. An execution branch stays inspectable until
//! someone explicitly promotes it with [`ChangeIntegrator::promote_to_main`].

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

#[cfg(feature = "telemetry")]
use tracing::instrument;

#[cfg(feature = "telemetry")]
use crate::telemetry::metrics::GLOBAL_METRICS;

use crate::error::{GitError, WorkspaceError};
use crate::git::{MergeOutcome, RefStore};
use crate::store::Store;
use crate::types::{ChangeKind, Permission};
use crate::workspace::{execution_branch, ExecutionManifest, CREATE_MARKER_FILE};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitOutcome {
    pub ref_id: String,
    pub committed: bool,
    pub commit: Option<String>,
    pub files: Vec<String>,
}

/// Heads of an execution branch and main after a sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncOutcome {
    pub ref_id: String,
    pub branch: String,
    pub branch_head: String,
    pub main_branch: String,
    pub main_head: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateOutcome {
    pub ref_id: String,
    pub commit: String,
    pub files: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefFailure {
    pub ref_id: String,
    pub stage: String,
    pub error: String,
}

/// Per-reference outcomes of [`ChangeIntegrator::process_execution_changes`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeReport {
    pub commits: Vec<CommitOutcome>,
    pub merges: Vec<SyncOutcome>,
    pub creates: Vec<CreateOutcome>,
    pub errors: Vec<RefFailure>,
}

impl ChangeReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

#[derive(Clone)]
pub struct ChangeIntegrator {
    refs: RefStore,
    store: Store,
}

impl ChangeIntegrator {
    pub fn new(refs: RefStore, store: Store) -> Self {
        Self { refs, store }
    }

    fn manifest(&self, execution_id: &str) -> Result<ExecutionManifest, WorkspaceError> {
        ExecutionManifest::load_for(self.refs.layout(), execution_id)
    }

    /// Commit everything in the execution's worktree for `ref_id`.
    ///
    /// A clean worktree yields `committed: false` and no commit.
    #[cfg_attr(feature = "telemetry", instrument(skip(self, message)))]
    pub async fn commit_changes(
        &self,
        execution_id: &str,
        ref_id: &str,
        message: &str,
    ) -> Result<CommitOutcome, WorkspaceError> {
        let manifest = self.manifest(execution_id)?;
        manifest.require(ref_id, Permission::Mutate)?;
        let worktree = manifest.worktree(ref_id).ok_or_else(|| {
            WorkspaceError::Manifest(format!("no worktree recorded for {}", ref_id))
        })?;

        let files = self.refs.status(ref_id, &worktree.path).await?;
        if files.is_empty() {
            debug!(execution_id, ref_id, "Worktree clean, nothing to commit");
            return Ok(CommitOutcome {
                ref_id: ref_id.to_string(),
                committed: false,
                commit: None,
                files,
            });
        }

        self.refs.stage_all(ref_id, &worktree.path).await?;
        let message = format!("{}\n\nExecution: {}", message.trim(), execution_id);
        let commit = self.refs.commit(ref_id, &worktree.path, &message).await?;
        info!(execution_id, ref_id, %commit, files = files.len(), "Committed execution changes");

        #[cfg(feature = "telemetry")]
        GLOBAL_METRICS.increment("integrate.commits");
        self.record(execution_id, ref_id, ChangeKind::Commit, Some(&commit), Some(files.join("\n")))
            .await;

        Ok(CommitOutcome {
            ref_id: ref_id.to_string(),
            committed: true,
            commit: Some(commit),
            files,
        })
    }

    /// Confirm the execution branch exists and report both heads.
    ///
    /// Main is checked out but not moved.
    pub async fn sync_execution_branch(
        &self,
        execution_id: &str,
        ref_id: &str,
    ) -> Result<SyncOutcome, WorkspaceError> {
        let manifest = self.manifest(execution_id)?;
        manifest.require(ref_id, Permission::Mutate)?;

        let branch = execution_branch(execution_id);
        if !self.refs.branch_exists(ref_id, &branch).await? {
            return Err(GitError::BranchNotFound(branch).into());
        }
        let main_branch = self.refs.default_branch(ref_id).await?;
        self.refs.checkout(ref_id, &main_branch).await?;

        let outcome = SyncOutcome {
            ref_id: ref_id.to_string(),
            branch_head: self.refs.rev_parse(ref_id, &branch).await?,
            main_head: self.refs.rev_parse(ref_id, &main_branch).await?,
            branch,
            main_branch,
        };
        self.record(
            execution_id,
            ref_id,
            ChangeKind::Sync,
            Some(&outcome.branch_head),
            Some(format!("{} kept separate from {}", outcome.branch, outcome.main_branch)),
        )
        .await;
        Ok(outcome)
    }

    /// Merge the execution branch into main (`--no-ff`).
    #[cfg_attr(feature = "telemetry", instrument(skip(self)))]
    pub async fn promote_to_main(
        &self,
        execution_id: &str,
        ref_id: &str,
    ) -> Result<MergeOutcome, WorkspaceError> {
        let manifest = self.manifest(execution_id)?;
        manifest.require(ref_id, Permission::Mutate)?;

        let branch = execution_branch(execution_id);
        let message = format!("Promote {} into main\n\nExecution: {}", branch, execution_id);
        let outcome = self.refs.merge_branch(ref_id, &branch, &message).await?;
        match &outcome {
            MergeOutcome::Merged { commit } => {
                #[cfg(feature = "telemetry")]
                GLOBAL_METRICS.increment("integrate.promotions");
                self.record(execution_id, ref_id, ChangeKind::Promote, Some(commit), None)
                    .await;
            }
            MergeOutcome::Conflicted { files, .. } => {
                #[cfg(feature = "telemetry")]
                GLOBAL_METRICS.increment("integrate.conflicts");
                warn!(execution_id, ref_id, "Promotion conflicted on {:?}", files);
            }
        }
        Ok(outcome)
    }

    /// Turn a create directory into a new reference with one initial commit.
    #[cfg_attr(feature = "telemetry", instrument(skip(self)))]
    pub async fn initialize_new_ref(
        &self,
        execution_id: &str,
        ref_id: &str,
    ) -> Result<CreateOutcome, WorkspaceError> {
        let manifest = self.manifest(execution_id)?;
        manifest.require(ref_id, Permission::Create)?;
        if self.refs.ref_exists(ref_id) {
            return Err(GitError::RefExists(ref_id.to_string()).into());
        }

        let source = manifest.directories.create.join(ref_id);
        let files = collect_files(&source)?;
        if files.is_empty() {
            return Err(WorkspaceError::EmptyCreateDir(ref_id.to_string()));
        }

        let target = self.refs.initialize_repo(ref_id).await?;
        let populated: Result<String, WorkspaceError> = async {
            copy_files(&source, &target, &files).await?;
            self.refs.stage_all(ref_id, &target).await?;
            let message = format!("Initial commit\n\nExecution: {}", execution_id);
            Ok(self.refs.commit(ref_id, &target, &message).await?)
        }
        .await;
        let commit = match populated {
            Ok(commit) => commit,
            Err(e) => {
                // A half-built repo would make every retry fail with RefExists.
                warn!(ref_id, "Populating new reference failed, removing it: {}", e);
                if let Err(cleanup) = tokio::fs::remove_dir_all(&target).await {
                    warn!(ref_id, "Failed to remove {:?}: {}", target, cleanup);
                }
                return Err(e);
            }
        };
        info!(execution_id, ref_id, %commit, files = files.len(), "Created reference");

        self.record(execution_id, ref_id, ChangeKind::Create, Some(&commit), None)
            .await;
        Ok(CreateOutcome {
            ref_id: ref_id.to_string(),
            commit,
            files,
        })
    }

    /// Commit and sync every mutate ref and create every create ref.
    ///
    /// One reference failing does not stop the others.
    #[cfg_attr(feature = "telemetry", instrument(skip(self)))]
    pub async fn process_execution_changes(
        &self,
        execution_id: &str,
    ) -> Result<ChangeReport, WorkspaceError> {
        let manifest = self.manifest(execution_id)?;
        let mut report = ChangeReport::default();
        let message = format!("Changes from execution {}", execution_id);

        for ref_id in &manifest.permissions.mutate {
            match self.commit_changes(execution_id, ref_id, &message).await {
                Ok(outcome) => report.commits.push(outcome),
                Err(e) => {
                    report.errors.push(failure(ref_id, "commit", &e));
                    continue;
                }
            }
            match self.sync_execution_branch(execution_id, ref_id).await {
                Ok(outcome) => report.merges.push(outcome),
                Err(e) => report.errors.push(failure(ref_id, "sync", &e)),
            }
        }

        for ref_id in &manifest.permissions.create {
            match self.initialize_new_ref(execution_id, ref_id).await {
                Ok(outcome) => report.creates.push(outcome),
                Err(e) => report.errors.push(failure(ref_id, "create", &e)),
            }
        }

        if !report.is_clean() {
            warn!(
                execution_id,
                errors = report.errors.len(),
                "Some references failed to integrate"
            );
        }
        Ok(report)
    }

    /// Diff of the execution branch against its merge base with main.
    pub async fn diff_execution(
        &self,
        execution_id: &str,
        ref_id: &str,
    ) -> Result<String, WorkspaceError> {
        let main = self.refs.default_branch(ref_id).await?;
        Ok(self
            .refs
            .diff(ref_id, &main, &execution_branch(execution_id))
            .await?)
    }

    async fn record(
        &self,
        execution_id: &str,
        ref_id: &str,
        kind: ChangeKind,
        commit: Option<&str>,
        detail: Option<String>,
    ) {
        if let Err(e) = self
            .store
            .insert_change(execution_id, ref_id, kind, commit, detail.as_deref())
            .await
        {
            warn!(execution_id, ref_id, "Failed to record {} change: {}", kind.as_str(), e);
        }
    }
}

fn failure(ref_id: &str, stage: &str, error: &WorkspaceError) -> RefFailure {
    RefFailure {
        ref_id: ref_id.to_string(),
        stage: stage.to_string(),
        error: error.to_string(),
    }
}

/// Regular files under `dir` as `/`-separated relative paths, sorted.
///
/// The create marker and any nested `.git` directory are skipped.
fn collect_files(dir: &Path) -> Result<Vec<String>, WorkspaceError> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    let walker = WalkDir::new(dir)
        .min_depth(1)
        .into_iter()
        .filter_entry(|e| e.file_name() != ".git");
    for entry in walker {
        let entry = entry.map_err(|e| WorkspaceError::Io(e.into()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry.path().strip_prefix(dir).unwrap_or(entry.path());
        let relative = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        if relative != CREATE_MARKER_FILE {
            files.push(relative);
        }
    }
    files.sort();
    Ok(files)
}

async fn copy_files(source: &Path, target: &Path, files: &[String]) -> std::io::Result<()> {
    for file in files {
        let from = source.join(file);
        let to: PathBuf = target.join(file);
        if let Some(parent) = to.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(&from, &to).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workspace::{RefPermissions, WorkspaceBuilder, WorkspaceLayout};
    use tempfile::TempDir;

    struct Fixture {
        _temp: TempDir,
        refs: RefStore,
        builder: WorkspaceBuilder,
        integrator: ChangeIntegrator,
        store: Store,
    }

    async fn fixture() -> Option<Fixture> {
        if !RefStore::is_available().await {
            return None;
        }
        let temp = TempDir::new().unwrap();
        let layout = WorkspaceLayout::new(temp.path());
        layout.ensure().unwrap();
        let refs = RefStore::new(layout);
        let store = Store::open_in_memory().unwrap();
        Some(Fixture {
            builder: WorkspaceBuilder::new(refs.clone()),
            integrator: ChangeIntegrator::new(refs.clone(), store.clone()),
            refs,
            store,
            _temp: temp,
        })
    }

    async fn seed(refs: &RefStore, ref_id: &str, file: &str, body: &str) {
        let path = refs.initialize_repo(ref_id).await.unwrap();
        std::fs::write(path.join(file), body).unwrap();
        refs.stage_all(ref_id, &path).await.unwrap();
        refs.commit(ref_id, &path, "seed").await.unwrap();
    }

    fn mutate(ids: &[&str]) -> RefPermissions {
        RefPermissions {
            mutate: ids.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_clean_worktree_commits_nothing() {
        let Some(f) = fixture().await else { return };
        seed(&f.refs, "app", "a.txt", "1\n").await;
        f.builder.stage("E1", &mutate(&["app"])).await.unwrap();

        let before = f.refs.rev_parse("app", "exec-E1").await.unwrap();
        let outcome = f.integrator.commit_changes("E1", "app", "noop").await.unwrap();
        assert!(!outcome.committed);
        assert!(outcome.commit.is_none());
        assert_eq!(f.refs.rev_parse("app", "exec-E1").await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_commit_then_sync_keeps_main() {
        let Some(f) = fixture().await else { return };
        seed(&f.refs, "app", "a.txt", "1\n").await;
        let staged = f.builder.stage("E1", &mutate(&["app"])).await.unwrap();
        let worktree = &staged.manifest.worktree("app").unwrap().path;
        std::fs::write(worktree.join("b.txt"), "new\n").unwrap();

        let main_before = f.refs.rev_parse("app", "main").await.unwrap();
        let outcome = f.integrator.commit_changes("E1", "app", "add b").await.unwrap();
        assert!(outcome.committed);
        assert_eq!(outcome.files, vec!["b.txt"]);

        let log = f.refs.log("app", Some("exec-E1"), 1).await.unwrap();
        assert!(log[0].subject.starts_with("add b"));

        let sync = f.integrator.sync_execution_branch("E1", "app").await.unwrap();
        assert_eq!(sync.main_head, main_before);
        assert_eq!(Some(sync.branch_head.clone()), outcome.commit);

        let diff = f.integrator.diff_execution("E1", "app").await.unwrap();
        assert!(diff.contains("b.txt"));

        let changes = f.store.list_changes("E1").await.unwrap();
        let kinds: Vec<_> = changes.iter().map(|c| c.kind).collect();
        assert_eq!(kinds, vec![ChangeKind::Commit, ChangeKind::Sync]);
    }

    #[tokio::test]
    async fn test_promote_merges_and_reports_conflicts() {
        let Some(f) = fixture().await else { return };
        seed(&f.refs, "app", "a.txt", "base\n").await;
        let staged = f.builder.stage("E1", &mutate(&["app"])).await.unwrap();
        let worktree = staged.manifest.worktree("app").unwrap().path.clone();

        std::fs::write(worktree.join("a.txt"), "from execution\n").unwrap();
        f.integrator.commit_changes("E1", "app", "edit").await.unwrap();

        // Diverge main on the same line.
        let main = f.refs.layout().ref_path("app");
        std::fs::write(main.join("a.txt"), "from main\n").unwrap();
        f.refs.stage_all("app", &main).await.unwrap();
        f.refs.commit("app", &main, "main edit").await.unwrap();

        match f.integrator.promote_to_main("E1", "app").await.unwrap() {
            MergeOutcome::Conflicted { files, snippets } => {
                assert_eq!(files, vec!["a.txt"]);
                assert!(!snippets.is_empty());
            }
            other => panic!("expected conflict, got {:?}", other),
        }
        assert_eq!(f.refs.current_branch("app", &main).await.unwrap(), "main");
        assert!(!f.refs.is_dirty("app", &main).await.unwrap());
    }

    #[tokio::test]
    async fn test_initialize_new_ref_round_trip() {
        let Some(f) = fixture().await else { return };
        let perms = RefPermissions {
            create: vec!["fresh".into()],
            ..Default::default()
        };
        let staged = f.builder.stage("E2", &perms).await.unwrap();
        let dir = staged.directories().create.join("fresh");

        assert!(matches!(
            f.integrator.initialize_new_ref("E2", "fresh").await.unwrap_err(),
            WorkspaceError::EmptyCreateDir(_)
        ));

        std::fs::create_dir_all(dir.join("src")).unwrap();
        std::fs::write(dir.join("package.json"), "{}\n").unwrap();
        std::fs::write(dir.join("src/index.js"), "1\n").unwrap();

        let created = f.integrator.initialize_new_ref("E2", "fresh").await.unwrap();
        assert_eq!(created.files, vec!["package.json", "src/index.js"]);

        let mut listed = f.refs.list_files("fresh", None).await.unwrap();
        listed.sort();
        assert_eq!(listed, created.files);

        assert!(matches!(
            f.integrator.initialize_new_ref("E2", "fresh").await.unwrap_err(),
            WorkspaceError::Git(GitError::RefExists(_))
        ));
    }

    #[tokio::test]
    async fn test_failed_initial_commit_leaves_no_ref_behind() {
        let Some(f) = fixture().await else { return };
        let perms = RefPermissions {
            create: vec!["fresh".into()],
            ..Default::default()
        };
        let staged = f.builder.stage("E4", &perms).await.unwrap();
        let dir = staged.directories().create.join("fresh");
        std::fs::write(dir.join("main.py"), "print(1)\n").unwrap();
        // Ignoring everything leaves the commit with nothing staged.
        std::fs::write(dir.join(".gitignore"), "*\n").unwrap();

        let err = f.integrator.initialize_new_ref("E4", "fresh").await.unwrap_err();
        assert!(matches!(err, WorkspaceError::Git(_)), "{:?}", err);
        assert!(!f.refs.ref_exists("fresh"));
        assert!(!f.refs.layout().ref_path("fresh").exists());

        std::fs::write(dir.join(".gitignore"), "*.pyc\n").unwrap();
        let created = f.integrator.initialize_new_ref("E4", "fresh").await.unwrap();
        assert_eq!(created.files, vec![".gitignore", "main.py"]);
        assert!(f.refs.ref_exists("fresh"));
    }

    #[tokio::test]
    async fn test_undeclared_ref_rejected() {
        let Some(f) = fixture().await else { return };
        seed(&f.refs, "app", "a.txt", "1\n").await;
        f.builder.stage("E3", &mutate(&["app"])).await.unwrap();
        assert!(matches!(
            f.integrator.initialize_new_ref("E3", "app").await.unwrap_err(),
            WorkspaceError::RefNotDeclared { .. }
        ));
    }

    #[tokio::test]
    async fn test_process_collects_per_ref_outcomes() {
        let Some(f) = fixture().await else { return };
        seed(&f.refs, "app", "a.txt", "1\n").await;
        let perms = RefPermissions {
            mutate: vec!["app".into()],
            create: vec!["empty".into()],
            ..Default::default()
        };
        let staged = f.builder.stage("E4", &perms).await.unwrap();
        std::fs::write(staged.manifest.worktree("app").unwrap().path.join("c.txt"), "c\n").unwrap();

        let report = f.integrator.process_execution_changes("E4").await.unwrap();
        assert_eq!(report.commits.len(), 1);
        assert!(report.commits[0].committed);
        assert_eq!(report.merges.len(), 1);
        assert!(report.creates.is_empty());
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].stage, "create");
    }
}
