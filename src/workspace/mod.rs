// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Workspace root layout, execution manifests and staging.

mod builder;
pub mod layout;
mod manifest;

pub use builder::{CreateMarker, PendingPreview, StagedWorkspace, WorkspaceBuilder};
pub use layout::{execution_branch, validate_ref_id, WorkspaceLayout, CREATE_MARKER_FILE};
pub use manifest::{ExecutionManifest, ManifestDirectories, RefPermissions};
