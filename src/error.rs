// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Error types for the workbench engine.
//!
//! Each subsystem has its own `thiserror` enum. Every enum reports an
//! [`ErrorKind`] so callers can map failures onto a small, stable taxonomy
//! (validation, not-found, conflict, process, system) without matching on
//! individual variants. `anyhow` is reserved for the binary and the config
//! loader's outermost layer.

use serde::Serialize;
use thiserror::Error;

/// Coarse classification shared by every error in the crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed input or a request that violates a declared permission.
    Validation,
    /// A referenced execution, reference, branch or preview does not exist.
    NotFound,
    /// The request collides with existing state.
    Conflict,
    /// A child process failed to start, run or stop.
    Process,
    /// IO, database or environment failure.
    System,
}

/// Errors from the version-control layer.
#[derive(Error, Debug)]
pub enum GitError {
    #[error("git is not available: {0}")]
    NotAvailable(String),

    #[error("Invalid reference id '{id}': {reason}")]
    InvalidRefId { id: String, reason: String },

    #[error("Reference not found: {0}")]
    RefNotFound(String),

    #[error("Reference already exists: {0}")]
    RefExists(String),

    #[error("Branch not found: {0}")]
    BranchNotFound(String),

    #[error("Worktree already exists for branch {branch} at {path}")]
    WorktreeExists { branch: String, path: String },

    #[error("git {command} failed: {stderr}")]
    CommandFailed { command: String, stderr: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl GitError {
    pub fn command(command: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self::CommandFailed {
            command: command.into(),
            stderr: stderr.into(),
        }
    }

    pub fn invalid_ref(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidRefId {
            id: id.into(),
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidRefId { .. } => ErrorKind::Validation,
            Self::RefNotFound(_) | Self::BranchNotFound(_) => ErrorKind::NotFound,
            Self::RefExists(_) | Self::WorktreeExists { .. } => ErrorKind::Conflict,
            Self::CommandFailed { .. } => ErrorKind::Process,
            Self::NotAvailable(_) | Self::Io(_) => ErrorKind::System,
        }
    }
}

/// Errors from the persistent store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Execution not found: {0}")]
    ExecutionNotFound(String),

    #[error("Preview not found: {0}")]
    PreviewNotFound(String),

    #[error("Corrupt row: {0}")]
    Corrupt(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ExecutionNotFound(_) | Self::PreviewNotFound(_) => ErrorKind::NotFound,
            Self::Sqlite(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                ErrorKind::Conflict
            }
            _ => ErrorKind::System,
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<crate::types::ParseLabelError> for StoreError {
    fn from(err: crate::types::ParseLabelError) -> Self {
        Self::Corrupt(err.to_string())
    }
}

/// Errors while staging, reading or tearing down execution workspaces.
#[derive(Error, Debug)]
pub enum WorkspaceError {
    #[error(transparent)]
    Git(#[from] GitError),

    #[error("Invalid workspace request: {0}")]
    InvalidRequest(String),

    #[error("Manifest not found for execution {0}")]
    ManifestNotFound(String),

    #[error("Manifest error: {0}")]
    Manifest(String),

    #[error("Reference {ref_id} is not declared with {permission} access")]
    RefNotDeclared { ref_id: String, permission: String },

    #[error("Create directory for {0} is empty")]
    EmptyCreateDir(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkspaceError {
    pub fn not_declared(ref_id: impl Into<String>, permission: crate::types::Permission) -> Self {
        Self::RefNotDeclared {
            ref_id: ref_id.into(),
            permission: permission.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Git(e) => e.kind(),
            Self::Store(e) => e.kind(),
            Self::InvalidRequest(_) | Self::RefNotDeclared { .. } | Self::EmptyCreateDir(_) => {
                ErrorKind::Validation
            }
            Self::ManifestNotFound(_) => ErrorKind::NotFound,
            Self::Manifest(_) | Self::Io(_) => ErrorKind::System,
        }
    }
}

impl From<serde_json::Error> for WorkspaceError {
    fn from(err: serde_json::Error) -> Self {
        Self::Manifest(err.to_string())
    }
}

/// Errors from the agent process supervisor.
#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("Unknown agent kind: {0}")]
    UnknownAgent(String),

    #[error("No command configured for agent {0}")]
    NotConfigured(String),

    #[error("Invalid working directory: {0}")]
    InvalidWorkingDir(String),

    #[error("Failed to spawn process: {0}")]
    SpawnFailed(String),

    #[error("Process produced no pid within {0}ms")]
    SpawnTimeout(u64),

    #[error("No running process for execution {0}")]
    NotRunning(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProcessError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnknownAgent(_) | Self::NotConfigured(_) | Self::InvalidWorkingDir(_) => {
                ErrorKind::Validation
            }
            Self::NotRunning(_) => ErrorKind::NotFound,
            Self::SpawnFailed(_) | Self::SpawnTimeout(_) => ErrorKind::Process,
            Self::Store(e) => e.kind(),
            Self::Io(_) => ErrorKind::System,
        }
    }
}

/// Errors from the streaming agent session manager.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("No live session for execution {0}")]
    NoSession(String),

    #[error("Execution {0} has no session id to resume")]
    NoResumableSession(String),

    #[error("Session for execution {0} is still running")]
    Busy(String),

    #[error("Agent stream error: {0}")]
    Stream(String),

    #[error("Agent reported failure: {0}")]
    AgentFailed(String),

    #[error("Context compaction failed: {0}")]
    CompactFailed(String),

    #[error("Session cancelled")]
    Cancelled,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NoSession(_) => ErrorKind::NotFound,
            Self::NoResumableSession(_) => ErrorKind::Validation,
            Self::Busy(_) => ErrorKind::Conflict,
            Self::Stream(_) | Self::AgentFailed(_) | Self::CompactFailed(_) | Self::Cancelled => {
                ErrorKind::Process
            }
            Self::Store(e) => e.kind(),
            Self::Io(_) => ErrorKind::System,
        }
    }
}

/// Errors from the preview dev-server supervisor.
#[derive(Error, Debug)]
pub enum PreviewError {
    #[error("No free port in range {start}-{end}")]
    PortRangeExhausted { start: u16, end: u16 },

    #[error("Preview not found: {0}")]
    NotFound(String),

    #[error("No dev command found for {0}")]
    NoCommand(String),

    #[error("Cannot parse dev command `{command}`: {reason}")]
    InvalidCommand { command: String, reason: String },

    #[error("Dependency install failed: {0}")]
    InstallFailed(String),

    #[error("Health check failed for {url} after {attempts} attempts")]
    HealthCheckFailed { url: String, attempts: u32 },

    #[error("Restart limit of {0} reached")]
    RestartLimit(u32),

    #[error("Failed to spawn dev server: {0}")]
    Spawn(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PreviewError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::PortRangeExhausted { .. } => ErrorKind::Conflict,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::NoCommand(_) | Self::InvalidCommand { .. } => ErrorKind::Validation,
            Self::InstallFailed(_)
            | Self::HealthCheckFailed { .. }
            | Self::RestartLimit(_)
            | Self::Spawn(_) => ErrorKind::Process,
            Self::Store(e) => e.kind(),
            Self::Io(_) => ErrorKind::System,
        }
    }
}

/// Errors delivering feedback text to a running agent.
#[derive(Error, Debug)]
pub enum FeedbackError {
    #[error("Feedback endpoint not configured")]
    NotConfigured,

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Feedback rejected with status {0}")]
    Rejected(u16),
}

/// Errors from the resource governor.
#[derive(Error, Debug)]
pub enum GovernorError {
    #[error("{check} limit exceeded: {message}")]
    LimitExceeded { check: String, message: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl GovernorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::LimitExceeded { .. } => ErrorKind::Conflict,
            Self::Store(e) => e.kind(),
            Self::Io(_) => ErrorKind::System,
        }
    }
}

/// Errors that can occur during configuration loading.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("IO error reading config: {0}")]
    IoError(String),

    #[error("YAML parsing error: {0}")]
    YamlError(String),

    #[error("JSON parsing error: {0}")]
    JsonError(String),
}

impl ConfigError {
    pub fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound(err.to_string()),
            _ => Self::IoError(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(err: serde_json::Error) -> Self {
        Self::JsonError(err.to_string())
    }
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::YamlError(err.to_string())
    }
}

/// Top-level error returned by the [`Engine`](crate::engine::Engine) façade.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error(transparent)]
    Git(#[from] GitError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Workspace(#[from] WorkspaceError),

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Preview(#[from] PreviewError),

    #[error(transparent)]
    Governor(#[from] GovernorError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::Git(e) => e.kind(),
            Self::Store(e) => e.kind(),
            Self::Workspace(e) => e.kind(),
            Self::Process(e) => e.kind(),
            Self::Session(e) => e.kind(),
            Self::Preview(e) => e.kind(),
            Self::Governor(e) => e.kind(),
            Self::Config(_) => ErrorKind::Validation,
            Self::Io(_) => ErrorKind::System,
        }
    }
}

/// Result type alias using anyhow for flexible error handling.
pub type Result<T> = anyhow::Result<T>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_git_error_kinds() {
        assert_eq!(GitError::RefNotFound("app".into()).kind(), ErrorKind::NotFound);
        assert_eq!(GitError::RefExists("app".into()).kind(), ErrorKind::Conflict);
        assert_eq!(
            GitError::invalid_ref("../x", "path separator").kind(),
            ErrorKind::Validation
        );
        assert_eq!(
            GitError::command("worktree add", "fatal").kind(),
            ErrorKind::Process
        );
    }

    #[test]
    fn test_engine_error_kind_delegates() {
        let err: EngineError =
            WorkspaceError::from(GitError::BranchNotFound("exec-1".into())).into();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let err: EngineError = GovernorError::LimitExceeded {
            check: "concurrency".into(),
            message: "3/3".into(),
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[test]
    fn test_store_error_constraint_is_conflict() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY);")
            .unwrap();
        conn.execute("INSERT INTO t (id) VALUES (1)", []).unwrap();
        let err = conn.execute("INSERT INTO t (id) VALUES (1)", []).unwrap_err();
        assert_eq!(StoreError::from(err).kind(), ErrorKind::Conflict);
    }

    #[test]
    fn test_config_error_from_json() {
        let result: std::result::Result<serde_json::Value, _> =
            serde_json::from_str("invalid json");
        let config_err: ConfigError = result.unwrap_err().into();
        assert!(matches!(config_err, ConfigError::JsonError(_)));
    }

    #[test]
    fn test_error_display() {
        let err = PreviewError::PortRangeExhausted {
            start: 4100,
            end: 4199,
        };
        let display = err.to_string();
        assert!(display.contains("4100"));
        assert!(display.contains("4199"));
    }
}
