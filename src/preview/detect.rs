// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Project analysis: package manager, framework and runnable scripts.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::PreviewError;

/// Scripts tried, in order, when no command is given.
const DEV_SCRIPTS: &[&str] = &["dev", "start", "serve", "preview"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageManager {
    Npm,
    Pnpm,
    Yarn,
    Bun,
}

impl PackageManager {
    /// Pick by lockfile; npm when there is none.
    pub fn detect(dir: &Path) -> Self {
        if dir.join("pnpm-lock.yaml").exists() {
            Self::Pnpm
        } else if dir.join("yarn.lock").exists() {
            Self::Yarn
        } else if dir.join("bun.lockb").exists() || dir.join("bun.lock").exists() {
            Self::Bun
        } else {
            Self::Npm
        }
    }

    pub fn program(&self) -> &'static str {
        match self {
            Self::Npm => "npm",
            Self::Pnpm => "pnpm",
            Self::Yarn => "yarn",
            Self::Bun => "bun",
        }
    }

    pub fn install_argv(&self) -> Vec<String> {
        vec![self.program().to_string(), "install".to_string()]
    }

    pub fn run_script(&self, script: &str) -> String {
        format!("{} run {}", self.program(), script)
    }
}

impl fmt::Display for PackageManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.program())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Framework {
    Vite,
    Next,
    Astro,
    SvelteKit,
    Nuxt,
    Remix,
    Angular,
    CreateReactApp,
    Unknown,
}

impl Framework {
    /// Identify from `dependencies` and `devDependencies` names.
    fn from_dependencies(deps: &BTreeMap<String, String>) -> Self {
        let has = |name: &str| deps.contains_key(name);
        if has("next") {
            Self::Next
        } else if has("astro") {
            Self::Astro
        } else if has("@sveltejs/kit") {
            Self::SvelteKit
        } else if has("nuxt") {
            Self::Nuxt
        } else if has("@remix-run/dev") {
            Self::Remix
        } else if has("@angular/cli") {
            Self::Angular
        } else if has("react-scripts") {
            Self::CreateReactApp
        } else if has("vite") {
            Self::Vite
        } else {
            Self::Unknown
        }
    }

    /// Command used when the project defines no dev script.
    pub fn default_command(&self) -> Option<&'static str> {
        match self {
            Self::Vite | Self::SvelteKit | Self::Remix => Some("npx vite"),
            Self::Next => Some("npx next dev"),
            Self::Astro => Some("npx astro dev"),
            Self::Nuxt => Some("npx nuxi dev"),
            Self::Angular => Some("npx ng serve"),
            Self::CreateReactApp => Some("npx react-scripts start"),
            Self::Unknown => None,
        }
    }

    /// Flags that pin the listening port, for frameworks that accept them.
    pub fn port_flags(&self, port: u16) -> Vec<String> {
        match self {
            Self::Vite
            | Self::SvelteKit
            | Self::Remix
            | Self::Astro
            | Self::Nuxt
            | Self::Angular => vec!["--port".to_string(), port.to_string()],
            Self::Next => vec!["-p".to_string(), port.to_string()],
            Self::CreateReactApp | Self::Unknown => Vec::new(),
        }
    }
}

/// What a project directory contains.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectInfo {
    pub package_manager: PackageManager,
    pub framework: Framework,
    pub scripts: BTreeMap<String, String>,
    pub has_dependencies: bool,
    pub has_node_modules: bool,
}

impl ProjectInfo {
    /// The first conventional dev script the project defines.
    pub fn dev_script(&self) -> Option<&str> {
        DEV_SCRIPTS
            .iter()
            .copied()
            .find(|name| self.scripts.contains_key(*name))
    }

    pub fn needs_install(&self) -> bool {
        self.has_dependencies && !self.has_node_modules
    }
}

/// Analyze `dir`. `None` when there is no `package.json`.
pub fn detect_project(dir: &Path) -> Result<Option<ProjectInfo>, PreviewError> {
    let manifest = dir.join("package.json");
    let raw = match std::fs::read(&manifest) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let json: Value = serde_json::from_slice(&raw).map_err(|e| {
        PreviewError::NoCommand(format!("{}: invalid package.json: {}", dir.display(), e))
    })?;

    let string_map = |key: &str| -> BTreeMap<String, String> {
        json.get(key)
            .and_then(Value::as_object)
            .map(|obj| {
                obj.iter()
                    .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                    .collect()
            })
            .unwrap_or_default()
    };

    let scripts = string_map("scripts");
    let mut deps = string_map("dependencies");
    deps.extend(string_map("devDependencies"));

    Ok(Some(ProjectInfo {
        package_manager: PackageManager::detect(dir),
        framework: Framework::from_dependencies(&deps),
        scripts,
        has_dependencies: !deps.is_empty(),
        has_node_modules: dir.join("node_modules").is_dir(),
    }))
}

/// Pick the command: explicit, then a dev script, then the framework default.
pub fn resolve_command(explicit: Option<&str>, project: Option<&ProjectInfo>) -> Option<String> {
    if let Some(command) = explicit.map(str::trim).filter(|c| !c.is_empty()) {
        return Some(command.to_string());
    }
    let project = project?;
    if let Some(script) = project.dev_script() {
        return Some(project.package_manager.run_script(script));
    }
    project.framework.default_command().map(str::to_string)
}

/// Split `command` into argv with shell quoting rules and pin `port` where
/// the framework allows it.
///
/// Scripts run through npm need `--` before forwarded flags.
pub fn build_argv(
    command: &str,
    framework: Framework,
    port: Option<u16>,
) -> Result<Vec<String>, PreviewError> {
    let mut argv = shell_words::split(command).map_err(|e| PreviewError::InvalidCommand {
        command: command.to_string(),
        reason: e.to_string(),
    })?;
    if argv.is_empty() {
        return Err(PreviewError::InvalidCommand {
            command: command.to_string(),
            reason: "empty command".to_string(),
        });
    }
    let Some(port) = port else { return Ok(argv) };
    let flags = framework.port_flags(port);
    if flags.is_empty() || argv.iter().any(|a| a == "--port" || a == "-p") {
        return Ok(argv);
    }
    let via_npm_script = argv.first().map(String::as_str) == Some("npm")
        && argv.get(1).map(String::as_str) == Some("run");
    if via_npm_script && !argv.iter().any(|a| a == "--") {
        argv.push("--".to_string());
    }
    argv.extend(flags);
    Ok(argv)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn project(package_json: &str, files: &[&str]) -> TempDir {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("package.json"), package_json).unwrap();
        for file in files {
            std::fs::write(temp.path().join(file), "").unwrap();
        }
        temp
    }

    #[test]
    fn test_detect_vite_with_pnpm() {
        let temp = project(
            r#"{"scripts": {"dev": "vite", "build": "vite build"}, "devDependencies": {"vite": "^5"}}"#,
            &["pnpm-lock.yaml"],
        );
        let info = detect_project(temp.path()).unwrap().unwrap();
        assert_eq!(info.package_manager, PackageManager::Pnpm);
        assert_eq!(info.framework, Framework::Vite);
        assert_eq!(info.dev_script(), Some("dev"));
        assert!(info.needs_install());
        assert_eq!(resolve_command(None, Some(&info)).as_deref(), Some("pnpm run dev"));
    }

    #[test]
    fn test_no_package_json() {
        let temp = TempDir::new().unwrap();
        assert!(detect_project(temp.path()).unwrap().is_none());
        assert_eq!(resolve_command(None, None), None);
        assert_eq!(
            resolve_command(Some("python -m http.server"), None).as_deref(),
            Some("python -m http.server")
        );
    }

    #[test]
    fn test_framework_default_without_scripts() {
        let temp = project(r#"{"dependencies": {"next": "14"}}"#, &[]);
        let info = detect_project(temp.path()).unwrap().unwrap();
        assert_eq!(info.framework, Framework::Next);
        assert_eq!(resolve_command(None, Some(&info)).as_deref(), Some("npx next dev"));
    }

    #[test]
    fn test_invalid_package_json() {
        let temp = project("{not json", &[]);
        assert!(matches!(
            detect_project(temp.path()).unwrap_err(),
            PreviewError::NoCommand(_)
        ));
    }

    #[test]
    fn test_build_argv() {
        assert_eq!(
            build_argv("npm run dev", Framework::Vite, Some(4100)).unwrap(),
            vec!["npm", "run", "dev", "--", "--port", "4100"]
        );
        assert_eq!(
            build_argv("npx next dev", Framework::Next, Some(4101)).unwrap(),
            vec!["npx", "next", "dev", "-p", "4101"]
        );
        assert_eq!(
            build_argv("vite --port 9000", Framework::Vite, Some(4100)).unwrap(),
            vec!["vite", "--port", "9000"]
        );
        assert_eq!(
            build_argv("node server.js", Framework::Unknown, Some(4100)).unwrap(),
            vec!["node", "server.js"]
        );
    }

    #[test]
    fn test_build_argv_keeps_quoted_arguments() {
        assert_eq!(
            build_argv("sh -c 'vite --host'", Framework::Unknown, None).unwrap(),
            vec!["sh", "-c", "vite --host"]
        );
        assert_eq!(
            build_argv(r#"node "my server.js" --title "a b""#, Framework::Unknown, Some(4100))
                .unwrap(),
            vec!["node", "my server.js", "--title", "a b"]
        );
    }

    #[test]
    fn test_build_argv_rejects_unbalanced_quotes() {
        assert!(matches!(
            build_argv("sh -c 'vite", Framework::Unknown, None),
            Err(PreviewError::InvalidCommand { .. })
        ));
        assert!(matches!(
            build_argv("   ", Framework::Unknown, None),
            Err(PreviewError::InvalidCommand { .. })
        ));
    }
}
