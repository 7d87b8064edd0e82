// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration merging.
//!
//! Precedence (highest to lowest):
//! 1. CLI options
//! 2. `WORKBENCH_*` environment variables
//! 3. Explicit `--config` file
//! 4. Workspace config (`workbench.json` / `workbench.yaml`)
//! 5. Global config (`~/.workbench/config.json`)
//! 6. Default values

use std::path::PathBuf;

use serde_json::Value;

use crate::error::ConfigError;

use super::types::{AgentCommandConfig, EngineConfig};

/// CLI options that can override configuration.
#[derive(Debug, Clone, Default)]
pub struct CliOptions {
    pub workspace_root: Option<PathBuf>,
    pub database_path: Option<PathBuf>,
    pub feedback_url: Option<String>,
    pub max_concurrent: Option<u64>,
}

/// Deep-merge `overlay` into `base`. Objects merge key by key; anything else
/// in the overlay replaces the base value.
pub fn merge_values(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

/// Merge file layers (lowest precedence first) on top of the defaults.
pub fn merge_layers(layers: Vec<Value>) -> Result<EngineConfig, ConfigError> {
    let mut merged = serde_json::to_value(EngineConfig::default())?;
    for layer in layers {
        merge_values(&mut merged, layer);
    }
    let mut config: EngineConfig = serde_json::from_value(merged)?;
    fill_agent_defaults(&mut config);
    Ok(config)
}

/// Restore built-in agents that a layer did not mention.
pub fn fill_agent_defaults(config: &mut EngineConfig) {
    for (kind, agent) in AgentCommandConfig::defaults() {
        config.agents.entry(kind).or_insert(agent);
    }
}

/// Apply `WORKBENCH_*` overrides read through `var`.
pub fn apply_env_overrides<F>(config: &mut EngineConfig, var: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(root) = var("WORKBENCH_WORKSPACE_ROOT") {
        config.workspace_root = PathBuf::from(root);
    }
    if let Some(db) = var("WORKBENCH_DATABASE_PATH") {
        config.database_path = Some(PathBuf::from(db));
    }
    if let Some(url) = var("WORKBENCH_FEEDBACK_URL") {
        config.feedback_url = Some(url);
    }
    if let Some(raw) = var("WORKBENCH_MAX_CONCURRENT") {
        config.limits.max_concurrent_executions = parse_number("WORKBENCH_MAX_CONCURRENT", &raw)?;
    }
    if let Some(raw) = var("WORKBENCH_MAX_WORKSPACE_MB") {
        config.limits.max_workspace_mb = parse_number("WORKBENCH_MAX_WORKSPACE_MB", &raw)?;
    }
    if let Some(raw) = var("WORKBENCH_MAX_MEMORY_MB") {
        config.limits.max_memory_mb = parse_number("WORKBENCH_MAX_MEMORY_MB", &raw)?;
    }
    if let Some(raw) = var("WORKBENCH_PORT_RANGE") {
        config.preview.port_range = parse_port_range(&raw)?;
    }
    Ok(())
}

/// Apply CLI options (highest precedence).
pub fn apply_cli_options(config: &mut EngineConfig, cli: &CliOptions) {
    if let Some(root) = &cli.workspace_root {
        config.workspace_root = root.clone();
    }
    if cli.database_path.is_some() {
        config.database_path = cli.database_path.clone();
    }
    if cli.feedback_url.is_some() {
        config.feedback_url = cli.feedback_url.clone();
    }
    if let Some(max) = cli.max_concurrent {
        config.limits.max_concurrent_executions = max;
    }
}

/// Reject settings the engine cannot run with.
pub fn validate(config: &EngineConfig) -> Result<(), ConfigError> {
    let (start, end) = config.preview.port_range;
    if start == 0 || start > end {
        return Err(ConfigError::invalid(
            "preview.portRange",
            format!("{}-{} is not a valid range", start, end),
        ));
    }
    if config.session.heartbeat_every == 0 {
        return Err(ConfigError::invalid("session.heartbeatEvery", "must be at least 1"));
    }
    for (kind, agent) in &config.agents {
        if agent.command.trim().is_empty() {
            return Err(ConfigError::invalid(
                format!("agents.{}.command", kind),
                "must not be empty",
            ));
        }
    }
    Ok(())
}

fn parse_number(field: &str, raw: &str) -> Result<u64, ConfigError> {
    raw.trim()
        .parse()
        .map_err(|_| ConfigError::invalid(field, format!("'{}' is not a number", raw)))
}

/// Parse `"4100-4199"`.
pub fn parse_port_range(raw: &str) -> Result<(u16, u16), ConfigError> {
    let invalid =
        || ConfigError::invalid("portRange", format!("expected START-END, got '{}'", raw));
    let (start, end) = raw.split_once('-').ok_or_else(invalid)?;
    let start: u16 = start.trim().parse().map_err(|_| invalid())?;
    let end: u16 = end.trim().parse().map_err(|_| invalid())?;
    Ok((start, end))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AgentKind;
    use serde_json::json;
    use std::collections::HashMap;

    #[test]
    fn test_merge_values_deep() {
        let mut base = json!({"limits": {"a": 1, "b": 2}, "x": "keep"});
        merge_values(&mut base, json!({"limits": {"b": 3}, "y": true}));
        assert_eq!(base, json!({"limits": {"a": 1, "b": 3}, "x": "keep", "y": true}));
    }

    #[test]
    fn test_merge_layers_precedence() {
        let global = json!({"limits": {"maxConcurrentExecutions": 2, "maxMemoryMb": 100}});
        let workspace = json!({"limits": {"maxConcurrentExecutions": 4}});
        let config = merge_layers(vec![global, workspace]).unwrap();
        assert_eq!(config.limits.max_concurrent_executions, 4);
        assert_eq!(config.limits.max_memory_mb, 100);
    }

    #[test]
    fn test_agent_override_keeps_other_defaults() {
        let layer = json!({"agents": {"codex": {"command": "/opt/codex"}}});
        let config = merge_layers(vec![layer]).unwrap();
        assert_eq!(config.agent(AgentKind::Codex).unwrap().command, "/opt/codex");
        assert_eq!(config.agent(AgentKind::Claude).unwrap().command, "claude");
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("WORKBENCH_MAX_CONCURRENT", "9"),
            ("WORKBENCH_PORT_RANGE", "5000-5010"),
            ("WORKBENCH_FEEDBACK_URL", "http://127.0.0.1:3001"),
        ]
        .into_iter()
        .collect();

        let mut config = EngineConfig::default();
        apply_env_overrides(&mut config, |k| vars.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(config.limits.max_concurrent_executions, 9);
        assert_eq!(config.preview.port_range, (5000, 5010));
        assert_eq!(config.feedback_url.as_deref(), Some("http://127.0.0.1:3001"));
    }

    #[test]
    fn test_env_override_rejects_garbage() {
        let mut config = EngineConfig::default();
        let result = apply_env_overrides(&mut config, |k| {
            (k == "WORKBENCH_MAX_MEMORY_MB").then(|| "lots".to_string())
        });
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_cli_wins() {
        let mut config = EngineConfig::default();
        apply_cli_options(
            &mut config,
            &CliOptions {
                max_concurrent: Some(1),
                ..Default::default()
            },
        );
        assert_eq!(config.limits.max_concurrent_executions, 1);
    }

    #[test]
    fn test_validate_port_range() {
        let mut config = EngineConfig::default();
        assert!(validate(&config).is_ok());
        config.preview.port_range = (5000, 4000);
        assert!(validate(&config).is_err());
    }
}
