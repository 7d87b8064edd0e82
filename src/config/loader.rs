// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration loading from files.
//!
//! Files are read as untyped JSON values so that several layers can be deep
//! merged before the result is deserialized into [`EngineConfig`](super::EngineConfig).

use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::error::ConfigError;

/// Config file names searched for in the workspace root (in order).
pub const CONFIG_FILES: &[&str] = &["workbench.json", "workbench.yaml", "workbench.yml"];

/// Global config directory name.
pub const GLOBAL_CONFIG_DIR: &str = ".workbench";

/// Global config file name.
pub const GLOBAL_CONFIG_FILE: &str = "config.json";

/// Get the global config directory path.
pub fn get_global_config_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(GLOBAL_CONFIG_DIR))
}

/// Get the global config file path.
pub fn get_global_config_path() -> Option<PathBuf> {
    get_global_config_dir().map(|dir| dir.join(GLOBAL_CONFIG_FILE))
}

/// Load global configuration from ~/.workbench/config.json.
pub fn load_global_config() -> Result<Option<Value>, ConfigError> {
    let path = match get_global_config_path() {
        Some(p) => p,
        None => return Ok(None),
    };

    if !path.exists() {
        return Ok(None);
    }

    load_config_file(&path).map(Some)
}

/// Load the first config file found in the workspace root.
pub fn load_workspace_config(workspace_root: &Path) -> Result<Option<Value>, ConfigError> {
    for filename in CONFIG_FILES {
        let path = workspace_root.join(filename);
        if path.exists() {
            return load_config_file(&path).map(Some);
        }
    }
    Ok(None)
}

/// Load a configuration file (JSON or YAML, chosen by extension).
pub fn load_config_file(path: &Path) -> Result<Value, ConfigError> {
    let content = std::fs::read_to_string(path)?;

    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase();

    let value = match extension.as_str() {
        "yaml" | "yml" => {
            let yaml: serde_yaml::Value = serde_yaml::from_str(&content)?;
            serde_json::to_value(yaml)?
        }
        _ => serde_json::from_str(&content)?,
    };

    match value {
        Value::Object(_) => Ok(value),
        Value::Null => Ok(Value::Object(Default::default())),
        _ => Err(ConfigError::invalid(
            path.display().to_string(),
            "top level must be a mapping",
        )),
    }
}

/// Write a starter config file into the workspace root.
pub fn init_config(workspace_root: &Path) -> Result<PathBuf, ConfigError> {
    let path = workspace_root.join(CONFIG_FILES[0]);
    let config = super::EngineConfig::with_root(workspace_root);
    let content = serde_json::to_string_pretty(&config)?;
    std::fs::create_dir_all(workspace_root)?;
    std::fs::write(&path, content)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_global_config_dir() {
        let dir = get_global_config_dir();
        assert!(dir.is_some());
        assert!(dir.unwrap().ends_with(".workbench"));
    }

    #[test]
    fn test_load_workspace_config_not_found() {
        let temp = TempDir::new().unwrap();
        assert!(load_workspace_config(temp.path()).unwrap().is_none());
    }

    #[test]
    fn test_load_workspace_config_yaml() {
        let temp = TempDir::new().unwrap();
        std::fs::write(
            temp.path().join("workbench.yaml"),
            "limits:\n  maxConcurrentExecutions: 5\n",
        )
        .unwrap();

        let value = load_workspace_config(temp.path()).unwrap().unwrap();
        assert_eq!(value["limits"]["maxConcurrentExecutions"], 5);
    }

    #[test]
    fn test_json_preferred_over_yaml() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("workbench.json"), r#"{"feedbackUrl": "json"}"#).unwrap();
        std::fs::write(temp.path().join("workbench.yaml"), "feedbackUrl: yaml\n").unwrap();

        let value = load_workspace_config(temp.path()).unwrap().unwrap();
        assert_eq!(value["feedbackUrl"], "json");
    }

    #[test]
    fn test_rejects_non_mapping() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("workbench.json");
        std::fs::write(&path, "[1, 2]").unwrap();
        assert!(matches!(
            load_config_file(&path),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_init_config_roundtrips() {
        let temp = TempDir::new().unwrap();
        let path = init_config(temp.path()).unwrap();
        let value = load_config_file(&path).unwrap();
        let config: super::super::EngineConfig = serde_json::from_value(value).unwrap();
        assert_eq!(config.workspace_root, temp.path());
    }
}
