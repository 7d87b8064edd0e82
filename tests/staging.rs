// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Stage, integrate and clean up an execution against real git repositories.

use tempfile::TempDir;

use workbench::cleanup::CleanupCoordinator;
use workbench::git::RefStore;
use workbench::integrate::ChangeIntegrator;
use workbench::store::Store;
use workbench::types::ChangeKind;
use workbench::workspace::{ExecutionManifest, RefPermissions, WorkspaceBuilder, WorkspaceLayout};

struct Harness {
    _temp: TempDir,
    layout: WorkspaceLayout,
    refs: RefStore,
    store: Store,
}

async fn harness() -> Option<Harness> {
    if !RefStore::is_available().await {
        return None;
    }
    let temp = TempDir::new().unwrap();
    let layout = WorkspaceLayout::new(temp.path());
    layout.ensure().unwrap();
    let store = Store::open_in_memory().unwrap();
    let refs = RefStore::new(layout.clone()).with_audit(std::sync::Arc::new(store.clone()));
    Some(Harness {
        _temp: temp,
        layout,
        refs,
        store,
    })
}

async fn seed(refs: &RefStore, ref_id: &str, file: &str, body: &str) {
    let path = refs.initialize_repo(ref_id).await.unwrap();
    std::fs::write(path.join(file), body).unwrap();
    refs.stage_all(ref_id, &path).await.unwrap();
    refs.commit(ref_id, &path, "seed").await.unwrap();
}

#[tokio::test]
async fn stage_commit_and_cleanup_keeps_branch() {
    let Some(h) = harness().await else { return };
    seed(&h.refs, "app", "index.js", "console.log(1)\n").await;
    seed(&h.refs, "docs", "README.md", "# docs\n").await;

    let permissions = RefPermissions {
        read: vec!["docs".into()],
        mutate: vec!["app".into()],
        create: vec!["widget".into()],
    };
    let builder = WorkspaceBuilder::new(h.refs.clone());
    let staged = builder.stage("E1", &permissions).await.unwrap();

    // Manifest on disk matches what staging returned.
    let manifest = ExecutionManifest::load_for(&h.layout, "E1").unwrap();
    assert_eq!(manifest.permissions, permissions);
    let worktree = manifest.worktree("app").unwrap().path.clone();
    assert!(worktree.join("index.js").exists());
    assert_eq!(staged.pending_previews.len(), 2);

    let main_before = h.refs.rev_parse("app", "main").await.unwrap();
    std::fs::write(worktree.join("feature.js"), "export {}\n").unwrap();
    let create_dir = manifest.directories.create.join("widget");
    std::fs::create_dir_all(&create_dir).unwrap();
    std::fs::write(create_dir.join("package.json"), "{}\n").unwrap();

    let integrator = ChangeIntegrator::new(h.refs.clone(), h.store.clone());
    let report = integrator.process_execution_changes("E1").await.unwrap();
    assert!(report.is_clean(), "{:?}", report.errors);
    assert_eq!(report.commits.len(), 1);
    assert!(report.commits[0].committed);
    assert_eq!(report.commits[0].files, vec!["feature.js"]);
    assert_eq!(report.creates.len(), 1);
    assert!(h.refs.ref_exists("widget"));

    // Sync leaves main alone.
    assert_eq!(h.refs.rev_parse("app", "main").await.unwrap(), main_before);

    let changes = h.store.list_changes("E1").await.unwrap();
    let kinds: Vec<_> = changes.iter().map(|c| c.kind).collect();
    assert!(kinds.contains(&ChangeKind::Commit));
    assert!(kinds.contains(&ChangeKind::Create));

    let cleanup = CleanupCoordinator::new(h.refs.clone(), h.store.clone());
    let report = cleanup.cleanup_execution("E1", true).await.unwrap();
    assert!(report.errors.is_empty(), "{:?}", report.errors);
    assert_eq!(report.removed_worktrees, vec!["app"]);
    assert!(report.deleted_branches.is_empty());
    assert!(report.removed_dir);
    assert!(!h.layout.execution_dir("E1").exists());
    assert!(h.refs.branch_exists("app", "exec-E1").await.unwrap());
}

#[tokio::test]
async fn failed_staging_leaves_nothing_behind() {
    let Some(h) = harness().await else { return };
    seed(&h.refs, "app", "index.js", "1\n").await;

    let permissions = RefPermissions {
        mutate: vec!["app".into(), "missing".into()],
        ..Default::default()
    };
    let builder = WorkspaceBuilder::new(h.refs.clone());
    assert!(builder.stage("E2", &permissions).await.is_err());
    assert!(!h.layout.execution_dir("E2").exists());
    assert!(!h.refs.branch_exists("app", "exec-E2").await.unwrap());
}
