// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration type definitions.
//!
//! Every section carries `#[serde(default)]` so a config file only needs to
//! name the values it changes. The same structs are used for JSON and YAML.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::AgentKind;

/// Resolved engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
    /// Root directory holding `refs/` and `.execution/`.
    pub workspace_root: PathBuf,

    /// SQLite database path. Defaults to `<workspace_root>/workbench.db`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database_path: Option<PathBuf>,

    /// Base URL of the local agent message endpoint used for feedback.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feedback_url: Option<String>,

    /// Per-agent launch configuration.
    pub agents: BTreeMap<AgentKind, AgentCommandConfig>,

    pub limits: LimitsConfig,
    pub process: ProcessConfig,
    pub session: SessionConfig,
    pub preview: PreviewConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workspace_root: PathBuf::from("workspace"),
            database_path: None,
            feedback_url: None,
            agents: AgentCommandConfig::defaults(),
            limits: LimitsConfig::default(),
            process: ProcessConfig::default(),
            session: SessionConfig::default(),
            preview: PreviewConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Create a config rooted at `workspace_root` with default settings.
    pub fn with_root(workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            ..Default::default()
        }
    }

    /// The effective database path.
    pub fn database_path(&self) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| self.workspace_root.join("workbench.db"))
    }

    /// Launch configuration for an agent kind.
    pub fn agent(&self, kind: AgentKind) -> Option<&AgentCommandConfig> {
        self.agents.get(&kind)
    }
}

// ============================================================================
// Agents
// ============================================================================

/// How to launch one agent kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AgentCommandConfig {
    /// Executable name or path.
    pub command: String,

    /// Arguments placed before the prompt.
    pub args: Vec<String>,

    /// Flag that introduces the prompt. When unset the prompt is positional.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_flag: Option<String>,

    /// Extra arguments added when continuing a previous run.
    pub continue_args: Vec<String>,

    /// Drive this agent through the message-stream session path instead of
    /// plain line-oriented output.
    pub sdk: bool,
}

impl Default for AgentCommandConfig {
    fn default() -> Self {
        Self {
            command: String::new(),
            args: Vec::new(),
            prompt_flag: None,
            continue_args: Vec::new(),
            sdk: false,
        }
    }
}

impl AgentCommandConfig {
    fn cli(
        command: &str,
        args: &[&str],
        prompt_flag: Option<&str>,
        continue_args: &[&str],
    ) -> Self {
        Self {
            command: command.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            prompt_flag: prompt_flag.map(str::to_string),
            continue_args: continue_args.iter().map(|s| s.to_string()).collect(),
            sdk: false,
        }
    }

    /// Built-in launch settings for every allowed agent kind.
    pub fn defaults() -> BTreeMap<AgentKind, AgentCommandConfig> {
        let mut agents = BTreeMap::new();
        agents.insert(
            AgentKind::Claude,
            Self {
                sdk: true,
                ..Self::cli(
                    "claude",
                    &["--output-format", "stream-json", "--verbose"],
                    Some("-p"),
                    &["--continue"],
                )
            },
        );
        agents.insert(
            AgentKind::Codex,
            Self::cli("codex", &["exec", "--full-auto"], None, &["resume", "--last"]),
        );
        agents.insert(
            AgentKind::Gemini,
            Self::cli("gemini", &["--yolo"], Some("-p"), &[]),
        );
        agents.insert(
            AgentKind::Aider,
            Self::cli(
                "aider",
                &["--yes-always", "--no-pretty"],
                Some("--message"),
                &["--restore-chat-history"],
            ),
        );
        agents
    }

    /// Build the argv (excluding the program) for a run.
    pub fn build_args(&self, prompt: &str, is_continuation: bool) -> Vec<String> {
        let mut argv = self.args.clone();
        if is_continuation {
            argv.extend(self.continue_args.iter().cloned());
        }
        if let Some(flag) = &self.prompt_flag {
            argv.push(flag.clone());
        }
        argv.push(prompt.to_string());
        argv
    }
}

// ============================================================================
// Limits
// ============================================================================

/// Ceilings enforced by the resource governor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LimitsConfig {
    pub max_concurrent_executions: u64,
    pub max_workspace_mb: u64,
    pub max_memory_mb: u64,
    /// Running longer than this flags an execution for review.
    pub max_execution_minutes: u64,
    /// Terminal execution directories older than this are removed.
    pub retention_hours: u64,
    pub sweep_interval_secs: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_concurrent_executions: 3,
            max_workspace_mb: 10 * 1024,
            max_memory_mb: 2048,
            max_execution_minutes: 120,
            retention_hours: 72,
            sweep_interval_secs: 300,
        }
    }
}

impl LimitsConfig {
    pub fn max_execution_duration(&self) -> Duration {
        Duration::from_secs(self.max_execution_minutes * 60)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_hours * 3600)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

// ============================================================================
// Process supervision
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProcessConfig {
    pub spawn_timeout_ms: u64,
    /// Wait between SIGTERM and SIGKILL.
    pub grace_period_ms: u64,
    /// Cap on buffered, not-yet-split output per stream.
    pub max_buffer_bytes: usize,
    pub max_line_length: usize,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            spawn_timeout_ms: 5_000,
            grace_period_ms: 5_000,
            max_buffer_bytes: 1024 * 1024,
            max_line_length: 10_000,
        }
    }
}

impl ProcessConfig {
    pub fn spawn_timeout(&self) -> Duration {
        Duration::from_millis(self.spawn_timeout_ms)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }
}

// ============================================================================
// Agent sessions
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SessionConfig {
    /// Write a heartbeat after this many messages.
    pub heartbeat_every: u64,
    pub compact_timeout_secs: u64,
    pub compact_poll_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_every: 10,
            compact_timeout_secs: 120,
            compact_poll_ms: 500,
        }
    }
}

impl SessionConfig {
    pub fn compact_timeout(&self) -> Duration {
        Duration::from_secs(self.compact_timeout_secs)
    }

    pub fn compact_poll(&self) -> Duration {
        Duration::from_millis(self.compact_poll_ms.max(1))
    }
}

// ============================================================================
// Previews
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PreviewConfig {
    /// Inclusive `[start, end]` port range handed to dev servers.
    pub port_range: (u16, u16),
    pub health_attempts: u32,
    pub health_initial_delay_ms: u64,
    pub health_max_delay_ms: u64,
    pub max_restarts: u32,
    pub restart_delay_ms: u64,
    pub feedback_debounce_ms: u64,
    pub monitor_interval_secs: u64,
    pub install_timeout_secs: u64,
    /// Time between SIGTERM and SIGKILL when stopping a dev server.
    pub stop_grace_ms: u64,
}

impl Default for PreviewConfig {
    fn default() -> Self {
        Self {
            port_range: (4100, 4199),
            health_attempts: 10,
            health_initial_delay_ms: 500,
            health_max_delay_ms: 5_000,
            max_restarts: 1,
            restart_delay_ms: 2_000,
            feedback_debounce_ms: 2_000,
            monitor_interval_secs: 30,
            install_timeout_secs: 300,
            stop_grace_ms: 5_000,
        }
    }
}

impl PreviewConfig {
    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    pub fn feedback_debounce(&self) -> Duration {
        Duration::from_millis(self.feedback_debounce_ms)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs.max(1))
    }

    pub fn install_timeout(&self) -> Duration {
        Duration::from_secs(self.install_timeout_secs)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_cover_every_agent() {
        let config = EngineConfig::default();
        for kind in AgentKind::ALL {
            assert!(config.agent(kind).is_some(), "missing {kind}");
        }
        assert!(config.agent(AgentKind::Claude).unwrap().sdk);
    }

    #[test]
    fn test_build_args() {
        let agent =
            AgentCommandConfig::cli("aider", &["--yes-always"], Some("--message"), &["--restore"]);
        assert_eq!(
            agent.build_args("fix it", false),
            vec!["--yes-always", "--message", "fix it"]
        );
        assert_eq!(
            agent.build_args("fix it", true),
            vec!["--yes-always", "--restore", "--message", "fix it"]
        );
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config: EngineConfig = serde_json::from_str(
            r#"{"workspaceRoot": "/tmp/ws", "limits": {"maxConcurrentExecutions": 7}}"#,
        )
        .unwrap();
        assert_eq!(config.workspace_root, PathBuf::from("/tmp/ws"));
        assert_eq!(config.limits.max_concurrent_executions, 7);
        assert_eq!(config.limits.retention_hours, 72);
        assert_eq!(config.preview.port_range, (4100, 4199));
        assert_eq!(config.database_path(), PathBuf::from("/tmp/ws/workbench.db"));
    }

    #[test]
    fn test_yaml_agent_override() {
        let yaml = r#"
agents:
  codex:
    command: /opt/codex
    args: ["exec"]
"#;
        let config: EngineConfig = serde_yaml::from_str(yaml).unwrap();
        let codex = config.agent(AgentKind::Codex).unwrap();
        assert_eq!(codex.command, "/opt/codex");
        // A map in the file replaces the default map.
        assert!(config.agent(AgentKind::Claude).is_none());
    }
}
