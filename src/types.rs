// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Core domain types shared across the engine.
//!
//! These are the records mirrored into the persistent store: executions,
//! permission grants, preview processes, port allocations, log lines and
//! audit rows. Enumerations round-trip through their `as_str` form so they
//! can be stored as plain TEXT columns.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Error returned when a stored or user-supplied label does not name a variant.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} '{value}'")]
pub struct ParseLabelError {
    pub kind: &'static str,
    pub value: String,
}

impl ParseLabelError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

// ============================================================================
// Executions
// ============================================================================

/// Lifecycle status of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Starting,
    Running,
    Completed,
    Failed,
    Cancelled,
    NeedsReview,
    RolledBack,
}

impl ExecutionStatus {
    pub const ACTIVE: [ExecutionStatus; 2] = [Self::Starting, Self::Running];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::NeedsReview => "needs_review",
            Self::RolledBack => "rolled_back",
        }
    }

    /// Starting or running.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Starting | Self::Running)
    }

    /// Whether the execution will not make further progress on its own.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::RolledBack
        )
    }
}

impl FromStr for ExecutionStatus {
    type Err = ParseLabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "starting" => Ok(Self::Starting),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            "needs_review" => Ok(Self::NeedsReview),
            "rolled_back" => Ok(Self::RolledBack),
            other => Err(ParseLabelError::new("execution status", other)),
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Agents the engine knows how to launch.
///
/// This is the fixed allow-list; anything else is rejected before a
/// process is spawned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    Claude,
    Codex,
    Gemini,
    Aider,
}

impl AgentKind {
    pub const ALL: [AgentKind; 4] = [Self::Claude, Self::Codex, Self::Gemini, Self::Aider];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Claude => "claude",
            Self::Codex => "codex",
            Self::Gemini => "gemini",
            Self::Aider => "aider",
        }
    }
}

impl FromStr for AgentKind {
    type Err = ParseLabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "claude" => Ok(Self::Claude),
            "codex" => Ok(Self::Codex),
            "gemini" => Ok(Self::Gemini),
            "aider" => Ok(Self::Aider),
            _ => Err(ParseLabelError::new("agent kind", s)),
        }
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One agent run, as mirrored in the `executions` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: String,
    pub agent_kind: AgentKind,
    pub status: ExecutionStatus,
    /// Free-form progress label.
    pub phase: String,
    pub prompt: String,
    pub working_dir: Option<PathBuf>,
    pub session_id: Option<String>,
    pub pid: Option<u32>,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
    pub message_count: u64,
    pub turn_count: Option<u32>,
    pub cost_usd: Option<f64>,
    pub duration_ms: Option<u64>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Latest transition into `running`.
    pub run_started_at: Option<DateTime<Utc>>,
}

/// Metrics reported by a terminal agent `result` message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletionMetrics {
    pub turn_count: Option<u32>,
    pub cost_usd: Option<f64>,
    pub duration_ms: Option<u64>,
}

// ============================================================================
// Permissions
// ============================================================================

/// Access an execution holds on a reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    Read,
    Mutate,
    Create,
}

impl Permission {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Mutate => "mutate",
            Self::Create => "create",
        }
    }
}

impl FromStr for Permission {
    type Err = ParseLabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "read" => Ok(Self::Read),
            "mutate" => Ok(Self::Mutate),
            "create" => Ok(Self::Create),
            other => Err(ParseLabelError::new("permission", other)),
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A `(execution, reference, permission)` triple.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionGrant {
    pub execution_id: String,
    pub ref_id: String,
    pub permission: Permission,
}

/// Which staged area a preview runs from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefType {
    Mutate,
    Create,
}

impl RefType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mutate => "mutate",
            Self::Create => "create",
        }
    }
}

impl FromStr for RefType {
    type Err = ParseLabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mutate" => Ok(Self::Mutate),
            "create" => Ok(Self::Create),
            other => Err(ParseLabelError::new("ref type", other)),
        }
    }
}

impl fmt::Display for RefType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Logs
// ============================================================================

/// Classification of a persisted log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
    System,
}

impl LogStream {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
            Self::System => "system",
        }
    }
}

impl FromStr for LogStream {
    type Err = ParseLabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stdout" => Ok(Self::Stdout),
            "stderr" => Ok(Self::Stderr),
            "system" => Ok(Self::System),
            other => Err(ParseLabelError::new("log stream", other)),
        }
    }
}

/// A persisted log line belonging to an execution or a preview.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    pub id: i64,
    pub owner_id: String,
    pub stream: LogStream,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Previews
// ============================================================================

/// Lifecycle of a supervised dev server.
///
/// The forward path is `installing -> starting -> running`; `stopped` and
/// `failed` are reachable from any non-terminal state. A bounded restart
/// re-enters `starting` from `running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PreviewStatus {
    Installing,
    Starting,
    Running,
    Stopped,
    Failed,
}

impl PreviewStatus {
    pub const ACTIVE: [PreviewStatus; 3] = [Self::Installing, Self::Starting, Self::Running];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Installing => "installing",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }

    /// Whether `self -> next` is a legal edge.
    pub fn can_transition(&self, next: PreviewStatus, restarting: bool) -> bool {
        use PreviewStatus::*;
        match (self, next) {
            (Installing, Starting) | (Starting, Running) => true,
            (Running, Starting) => restarting,
            (from, Stopped | Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl FromStr for PreviewStatus {
    type Err = ParseLabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "installing" => Ok(Self::Installing),
            "starting" => Ok(Self::Starting),
            "running" => Ok(Self::Running),
            "stopped" => Ok(Self::Stopped),
            "failed" => Ok(Self::Failed),
            other => Err(ParseLabelError::new("preview status", other)),
        }
    }
}

impl fmt::Display for PreviewStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One supervised dev-server instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreviewProcess {
    pub id: String,
    pub execution_id: String,
    pub ref_type: RefType,
    pub ref_id: String,
    pub status: PreviewStatus,
    pub port: Option<u16>,
    pub pid: Option<u32>,
    pub command: Option<String>,
    pub urls: Vec<String>,
    pub restart_attempts: u32,
    pub error: Option<String>,
    pub last_health_check: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A reservation of a TCP port to a preview.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortAllocation {
    pub port: u16,
    pub preview_id: String,
    pub allocated_at: DateTime<Utc>,
}

// ============================================================================
// Audit
// ============================================================================

/// What happened to a reference as a result of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Commit,
    Sync,
    Promote,
    Create,
    Rollback,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Commit => "commit",
            Self::Sync => "sync",
            Self::Promote => "promote",
            Self::Create => "create",
            Self::Rollback => "rollback",
        }
    }
}

impl FromStr for ChangeKind {
    type Err = ParseLabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "commit" => Ok(Self::Commit),
            "sync" => Ok(Self::Sync),
            "promote" => Ok(Self::Promote),
            "create" => Ok(Self::Create),
            "rollback" => Ok(Self::Rollback),
            other => Err(ParseLabelError::new("change kind", other)),
        }
    }
}

/// A recorded filesystem / version-control mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub id: i64,
    pub execution_id: String,
    pub ref_id: String,
    pub kind: ChangeKind,
    pub commit_hash: Option<String>,
    pub detail: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Timing and outcome of a single version-control invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GitOperationRecord {
    pub operation: String,
    pub ref_id: Option<String>,
    pub duration_ms: u64,
    pub success: bool,
    pub error: Option<String>,
}

/// Aggregate over [`GitOperationRecord`]s sharing an operation name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationSummary {
    pub operation: String,
    pub count: u64,
    pub failures: u64,
    pub avg_duration_ms: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execution_status_roundtrip_labels() {
        for status in [
            ExecutionStatus::Starting,
            ExecutionStatus::Running,
            ExecutionStatus::NeedsReview,
            ExecutionStatus::RolledBack,
        ] {
            assert_eq!(status.as_str().parse::<ExecutionStatus>().unwrap(), status);
        }
        assert!("paused".parse::<ExecutionStatus>().is_err());
    }

    #[test]
    fn test_execution_status_classes() {
        assert!(ExecutionStatus::Running.is_active());
        assert!(!ExecutionStatus::NeedsReview.is_active());
        assert!(!ExecutionStatus::NeedsReview.is_terminal());
        assert!(ExecutionStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_agent_kind_allow_list() {
        assert_eq!("Claude".parse::<AgentKind>().unwrap(), AgentKind::Claude);
        assert_eq!(" aider ".parse::<AgentKind>().unwrap(), AgentKind::Aider);
        let err = "rm -rf".parse::<AgentKind>().unwrap_err();
        assert_eq!(err.kind, "agent kind");
    }

    #[test]
    fn test_preview_transitions() {
        use PreviewStatus::*;
        assert!(Installing.can_transition(Starting, false));
        assert!(Starting.can_transition(Running, false));
        assert!(Running.can_transition(Stopped, false));
        assert!(Installing.can_transition(Failed, false));

        assert!(!Installing.can_transition(Running, false));
        assert!(!Running.can_transition(Installing, false));
        assert!(!Stopped.can_transition(Failed, false));
        assert!(!Failed.can_transition(Starting, true));

        assert!(!Running.can_transition(Starting, false));
        assert!(Running.can_transition(Starting, true));
    }

    #[test]
    fn test_serde_labels_match_as_str() {
        let json = serde_json::to_string(&ExecutionStatus::NeedsReview).unwrap();
        assert_eq!(json, "\"needs_review\"");
        let json = serde_json::to_string(&Permission::Mutate).unwrap();
        assert_eq!(json, "\"mutate\"");
    }
}
