// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Workbench - execution orchestration and workspace isolation for coding agents.
//!
//! Each execution gets its own directory of git worktrees (mutate refs),
//! read-only links (read refs) and scratch directories (create refs). The
//! agent runs against that directory as a CLI subprocess or a streamed SDK
//! session; on success its changes are committed to an `exec-<id>` branch
//! per reference, ready to be promoted to main or rolled back.
//!
//! # Architecture
//!
//! - [`types`] - Records and status enums shared by every subsystem
//! - [`error`] - Per-subsystem error enums and the closed [`error::ErrorKind`] taxonomy
//! - [`config`] - Configuration loading and merging
//! - [`telemetry`] - Tracing and metrics
//! - [`store`] - SQLite persistence
//! - [`events`] - Per-execution event topics
//! - [`git`] - Reference store over the `git` CLI
//! - [`workspace`] - Workspace layout, manifests and staging
//! - [`process`] - Agent CLI subprocess supervision
//! - [`session`] - Streamed agent sessions with compact-and-retry
//! - [`integrate`] - Committing, syncing and promoting execution branches
//! - [`cleanup`] - Workspace cleanup and rollback
//! - [`governor`] - Admission checks and periodic sweeps
//! - [`preview`] - Preview dev-server supervision
//! - [`feedback`] - Messages sent back to a running agent
//! - [`engine`] - The façade tying it all together
//!
//! # Example
//!
//! ```rust,ignore
//! use workbench::config::EngineConfig;
//! use workbench::engine::{Engine, StartRequest};
//! use workbench::types::AgentKind;
//! use workbench::workspace::RefPermissions;
//!
//! let engine = Engine::new(EngineConfig::with_root("/srv/workbench"))?;
//! let permissions = RefPermissions {
//!     mutate: vec!["web".into()],
//!     ..Default::default()
//! };
//! let started = engine
//!     .start_execution(StartRequest::new(AgentKind::Claude, "Fix the login form", permissions))
//!     .await?;
//! ```

pub mod cleanup;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod feedback;
pub mod git;
pub mod governor;
pub mod integrate;
pub mod preview;
pub mod process;
pub mod session;
pub mod store;
pub mod telemetry;
pub mod types;
pub mod workspace;

// Re-export commonly used types at crate root
pub use config::EngineConfig;
pub use engine::{Engine, StartRequest};
pub use error::{EngineError, ErrorKind, Result};
pub use types::{AgentKind, Execution, ExecutionStatus, PreviewProcess, PreviewStatus, RefType};

/// Workbench version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
