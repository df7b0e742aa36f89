//! Environment Registry — names to container image + default init + timeout.
//!
//! Seeded at process start from a built-in set, optionally layered with TOML
//! fragments from a plugin directory. Immutable once built: lookups never
//! take a lock, since the value is built once and shared behind an `Arc`
//! rather than guarding a live map.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;
use tracing::{info, warn};

use crate::container::ContainerManager;
use crate::error::{AppError, Result};

#[derive(Debug, Clone, Deserialize, serde::Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EnvironmentCategory {
    Shell,
    Runtime,
    Vcs,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct EnvironmentConfig {
    pub name: String,
    pub image: String,
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
    #[serde(default)]
    pub default_init_commands: Vec<String>,
    pub category: EnvironmentCategory,
    #[serde(default)]
    pub description: String,
}

fn default_timeout_ms() -> u64 {
    10 * 60 * 1000
}

/// Immutable, process-scoped mapping of environment name to its config.
pub struct EnvironmentRegistry {
    environments: BTreeMap<String, EnvironmentConfig>,
}

impl EnvironmentRegistry {
    /// Build the registry from the built-in set, layering any TOML fragments
    /// found under `plugin_dir` on top (a fragment with the same `name`
    /// overrides the built-in entry).
    pub fn load(plugin_dir: Option<&str>) -> Result<Self> {
        let mut environments = BTreeMap::new();
        for env in builtin_environments() {
            environments.insert(env.name.clone(), env);
        }

        if let Some(dir) = plugin_dir {
            let path = Path::new(dir);
            if path.is_dir() {
                let entries = std::fs::read_dir(path).map_err(|e| {
                    AppError::InvalidConfig(format!("cannot read environments dir {dir}: {e}"))
                })?;
                for entry in entries.flatten() {
                    let p = entry.path();
                    if p.extension().and_then(|e| e.to_str()) != Some("toml") {
                        continue;
                    }
                    let content = std::fs::read_to_string(&p).map_err(|e| {
                        AppError::InvalidConfig(format!("cannot read {}: {e}", p.display()))
                    })?;
                    let env: EnvironmentConfig = toml::from_str(&content).map_err(|e| {
                        AppError::InvalidConfig(format!("invalid environment file {}: {e}", p.display()))
                    })?;
                    info!(environment = %env.name, file = %p.display(), "loaded environment override");
                    environments.insert(env.name.clone(), env);
                }
            } else {
                warn!(dir, "environments dir does not exist, ignoring");
            }
        }

        Ok(Self { environments })
    }

    pub fn get(&self, name: &str) -> Result<EnvironmentConfig> {
        self.environments.get(name).cloned().ok_or_else(|| AppError::UnknownEnvironment {
            name: name.to_string(),
            available: self.environments.keys().cloned().collect(),
        })
    }

    pub fn list(&self) -> Vec<EnvironmentConfig> {
        self.environments.values().cloned().collect()
    }

    /// Confirm every registered image is known to the runtime; aggregate
    /// missing-image errors into a single startup-failing error (fail closed
    /// so a session request never races against an image pull).
    pub async fn validate_all(&self, containers: &ContainerManager) -> Result<()> {
        let mut missing = Vec::new();
        for env in self.environments.values() {
            if !containers.image_known(&env.image).await? {
                missing.push((env.name.clone(), env.image.clone()));
            }
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(AppError::MissingImages(missing))
        }
    }
}

fn builtin_environments() -> Vec<EnvironmentConfig> {
    vec![
        EnvironmentConfig {
            name: "bash".into(),
            image: "docker.io/library/debian:bookworm-slim".into(),
            default_timeout_ms: default_timeout_ms(),
            default_init_commands: vec![],
            category: EnvironmentCategory::Shell,
            description: "Plain Debian shell".into(),
        },
        EnvironmentConfig {
            name: "python".into(),
            image: "docker.io/library/python:3.12-slim".into(),
            default_timeout_ms: default_timeout_ms(),
            default_init_commands: vec![],
            category: EnvironmentCategory::Runtime,
            description: "Python 3 interpreter".into(),
        },
        EnvironmentConfig {
            name: "node".into(),
            image: "docker.io/library/node:22-slim".into(),
            default_timeout_ms: default_timeout_ms(),
            default_init_commands: vec![],
            category: EnvironmentCategory::Runtime,
            description: "Node.js runtime".into(),
        },
        EnvironmentConfig {
            name: "git".into(),
            image: "docker.io/library/alpine/git:latest".into(),
            default_timeout_ms: default_timeout_ms(),
            default_init_commands: vec!["git --version".into()],
            category: EnvironmentCategory::Vcs,
            description: "Git command line".into(),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_set_is_well_formed() {
        let registry = EnvironmentRegistry::load(None).unwrap();
        assert!(registry.get("bash").is_ok());
        assert!(registry.get("does-not-exist").is_err());
        assert_eq!(registry.list().len(), 4);
    }
}
