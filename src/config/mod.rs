// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration module for the workbench engine.
//!
//! Handles loading, merging, and validation of configuration from multiple sources:
//! - Global config: ~/.workbench/config.json
//! - Workspace config: workbench.json or workbench.yaml in the workspace root
//! - An explicit `--config` file
//! - `WORKBENCH_*` environment variables
//! - CLI options

mod loader;
mod merger;
mod types;

pub use loader::{
    get_global_config_dir, get_global_config_path, init_config, load_config_file,
    load_global_config, load_workspace_config, CONFIG_FILES, GLOBAL_CONFIG_DIR, GLOBAL_CONFIG_FILE,
};

pub use merger::{
    apply_cli_options, apply_env_overrides, fill_agent_defaults, merge_layers, merge_values,
    parse_port_range, validate, CliOptions,
};

pub use types::{
    AgentCommandConfig, EngineConfig, LimitsConfig, PreviewConfig, ProcessConfig, SessionConfig,
};

use crate::error::ConfigError;
use std::path::Path;

/// Load and merge all configuration sources.
///
/// `workspace_root` is where workspace config files are searched for; the
/// CLI root wins over it when both are given.
pub fn load_config(
    explicit: Option<&Path>,
    workspace_root: &Path,
    cli: CliOptions,
) -> Result<EngineConfig, ConfigError> {
    let search_root = cli.workspace_root.as_deref().unwrap_or(workspace_root);

    let mut layers = Vec::new();
    if let Some(global) = load_global_config()? {
        layers.push(global);
    }
    if let Some(workspace) = load_workspace_config(search_root)? {
        layers.push(workspace);
    }
    if let Some(path) = explicit {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }
        layers.push(load_config_file(path)?);
    }

    let mut config = merge_layers(layers)?;
    if config.workspace_root.is_relative() && explicit.is_none() {
        config.workspace_root = search_root.to_path_buf();
    }
    apply_env_overrides(&mut config, |key| std::env::var(key).ok())?;
    apply_cli_options(&mut config, &cli);
    validate(&config)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_load_config_with_no_files() {
        let temp = TempDir::new().unwrap();
        let config = load_config(None, temp.path(), CliOptions::default()).unwrap();
        assert!(!config.agents.is_empty());
    }

    #[test]
    fn test_load_config_with_explicit_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("custom.yaml");
        std::fs::write(&path, "preview:\n  maxRestarts: 3\n").unwrap();

        let config = load_config(Some(&path), temp.path(), CliOptions::default()).unwrap();
        assert_eq!(config.preview.max_restarts, 3);
    }

    #[test]
    fn test_load_config_missing_explicit_file() {
        let temp = TempDir::new().unwrap();
        let missing = temp.path().join("nope.json");
        assert!(matches!(
            load_config(Some(&missing), temp.path(), CliOptions::default()),
            Err(ConfigError::NotFound(_))
        ));
    }

    #[test]
    fn test_load_config_cli_override() {
        let temp = TempDir::new().unwrap();
        std::fs::write(
            temp.path().join("workbench.json"),
            r#"{"feedbackUrl": "http://from-file"}"#,
        )
        .unwrap();

        let cli = CliOptions {
            feedback_url: Some("http://from-cli".to_string()),
            ..Default::default()
        };
        let config = load_config(None, temp.path(), cli).unwrap();
        assert_eq!(config.feedback_url.as_deref(), Some("http://from-cli"));
    }
}
