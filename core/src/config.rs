//! Ambient configuration loading: reads a TOML policy file into a
//! `policy::Config`, and persists "always allow" retry grants to a
//! project-local JSON sidecar that is overlaid on top of the TOML file on
//! every (re)load.
//!
//! Discovering a config file path is a CLI concern; this module only knows
//! how to parse one once a path is handed to it, and how to round-trip the
//! grants sidecar the retry protocol writes.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, SafeShellError};
use crate::policy::Config;

/// Name of the JSON sidecar file that accumulates "always allow" grants,
/// written under the project directory alongside (not replacing) the TOML
/// policy file so a human-edited `safeshell.toml` is never clobbered by the
/// retry protocol.
pub const GRANTS_FILE_NAME: &str = ".safeshell-grants.json";

/// Accumulated "always allow" grants, persisted independently of the TOML
/// policy file. Mirrors the §4.E requirement that grant (3) "persist[s] the
/// grant to a project-local JSON config file; reload config from disk".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Grants {
    #[serde(default)]
    pub run: Vec<String>,
}

impl Grants {
    fn path(project_dir: &Path) -> PathBuf {
        project_dir.join(GRANTS_FILE_NAME)
    }

    pub fn load(project_dir: &Path) -> Result<Self> {
        let path = Self::path(project_dir);
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Adds `commands` (deduplicated) and writes the sidecar back out.
    pub fn add_and_save(project_dir: &Path, commands: &[String]) -> Result<Self> {
        let mut grants = Self::load(project_dir)?;
        for command in commands {
            if !grants.run.iter().any(|r| r == command) {
                grants.run.push(command.clone());
            }
        }
        let path = Self::path(project_dir);
        let serialized = serde_json::to_string_pretty(&grants)?;
        std::fs::write(&path, serialized)?;
        Ok(grants)
    }

    /// Turns accumulated grants into a `Config` overlay: `permissions.run`
    /// plus a `{allow: true}` entry per command in `external`, so an
    /// "always allow" grant is visible from both the flat permission list
    /// and the per-command policy.
    pub fn as_config_overlay(&self) -> Config {
        let mut overlay = Config::default();
        overlay.permissions.run = self.run.clone();
        for command in &self.run {
            overlay.external.insert(
                command.clone(),
                crate::policy::ExternalPolicy {
                    allow: crate::policy::SubcommandAllow::All(true),
                    deny_flags: Vec::new(),
                    require_flags: Vec::new(),
                    path_args: crate::policy::PathArgsPolicy::default(),
                },
            );
        }
        overlay
    }
}

/// Loads a `Config` from a TOML file at `path`, then overlays any persisted
/// grants found under `config.project_dir` (if set).
pub fn load_config(path: &Path) -> Result<Config> {
    let raw = std::fs::read_to_string(path).map_err(SafeShellError::Io)?;
    let base: Config = toml::from_str(&raw)?;
    Ok(apply_grants(base))
}

/// Re-applies the persisted grants sidecar on top of `config`, used both at
/// initial load and after a grant (3) "always allow" retry writes a new one.
pub fn apply_grants(config: Config) -> Config {
    let Some(project_dir) = config.project_dir.clone() else {
        return config;
    };
    match Grants::load(&project_dir) {
        Ok(grants) if !grants.run.is_empty() => config.merge(&grants.as_config_overlay()),
        _ => config,
    }
}

/// Serializes `config` back to TOML text, used by the CLI binary for
/// round-trip diagnostics and by tests.
pub fn to_toml(config: &Config) -> Result<String> {
    Ok(toml::to_string_pretty(config)?)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn grants_round_trip_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        Grants::add_and_save(dir.path(), &["curl".to_string()]).unwrap();
        let loaded = Grants::load(dir.path()).unwrap();
        assert_eq!(loaded.run, vec!["curl".to_string()]);

        Grants::add_and_save(dir.path(), &["curl".to_string(), "wget".to_string()]).unwrap();
        let loaded = Grants::load(dir.path()).unwrap();
        assert_eq!(loaded.run, vec!["curl".to_string(), "wget".to_string()]);
    }

    #[test]
    fn missing_grants_file_yields_default() {
        let dir = tempfile::tempdir().unwrap();
        let grants = Grants::load(dir.path()).unwrap();
        assert!(grants.run.is_empty());
    }

    #[test]
    fn load_config_overlays_persisted_grants() {
        let dir = tempfile::tempdir().unwrap();
        let toml_path = dir.path().join("safeshell.toml");
        std::fs::write(
            &toml_path,
            format!("projectDir = {:?}\n", dir.path().to_string_lossy()),
        )
        .unwrap();
        Grants::add_and_save(dir.path(), &["curl".to_string()]).unwrap();

        let config = load_config(&toml_path).unwrap();
        assert!(config.permissions.run.contains(&"curl".to_string()));
        assert!(config.external.contains_key("curl"));
    }
}
