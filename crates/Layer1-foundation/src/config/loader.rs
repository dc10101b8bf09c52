//! Configuration Loader
//!
//! ## Search order (later files override earlier ones)
//!
//! 1. User-level: `~/.fnjob/settings.json`
//! 2. Project-level: `.fnjob/settings.json`
//! 3. Local (gitignored): `.fnjob/settings.local.json`
//!
//! Files are deep-merged as JSON objects before being deserialized, so a
//! file only needs the keys it wants to change.

use super::server::ServerConfig;
use crate::{Error, Result};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Config directory name
pub const CONFIG_DIR_NAME: &str = ".fnjob";

/// A settings file candidate
#[derive(Debug, Clone)]
struct ConfigPath {
    path: PathBuf,
    priority: u8,
    description: &'static str,
}

/// Settings loader
pub struct ConfigLoader {
    search_paths: Vec<ConfigPath>,
}

impl ConfigLoader {
    /// Loader with the default search paths relative to `working_dir`
    pub fn new(working_dir: &Path) -> Self {
        let mut paths = Vec::new();

        if let Some(home) = dirs::home_dir() {
            paths.push(ConfigPath {
                path: home.join(CONFIG_DIR_NAME).join("settings.json"),
                priority: 10,
                description: "User settings",
            });
        }

        paths.push(ConfigPath {
            path: working_dir.join(CONFIG_DIR_NAME).join("settings.json"),
            priority: 20,
            description: "Project settings",
        });

        paths.push(ConfigPath {
            path: working_dir.join(CONFIG_DIR_NAME).join("settings.local.json"),
            priority: 30,
            description: "Local settings",
        });

        paths.sort_by_key(|p| p.priority);

        Self { search_paths: paths }
    }

    /// Loader with explicit paths, lowest priority first
    pub fn with_paths(paths: Vec<PathBuf>) -> Self {
        let search_paths = paths
            .into_iter()
            .enumerate()
            .map(|(i, path)| ConfigPath {
                path,
                priority: i as u8,
                description: "Custom",
            })
            .collect();

        Self { search_paths }
    }

    /// Add a path that overrides everything already registered
    pub fn add_path(&mut self, path: PathBuf) {
        let priority = self
            .search_paths
            .last()
            .map(|p| p.priority.saturating_add(1))
            .unwrap_or(0);
        self.search_paths.push(ConfigPath {
            path,
            priority,
            description: "Added",
        });
    }

    /// Load and merge every existing file, then validate
    pub fn load_all(&self) -> Result<ServerConfig> {
        let mut merged = Value::Object(Default::default());

        for config_path in &self.search_paths {
            if !config_path.path.exists() {
                continue;
            }
            let value = read_json(&config_path.path)?;
            info!(
                "Loaded {} from: {}",
                config_path.description,
                config_path.path.display()
            );
            merge_json(&mut merged, value);
        }

        let config: ServerConfig = serde_json::from_value(merged)
            .map_err(|e| Error::Config(format!("Invalid settings: {}", e)))?;
        config.validate()?;

        debug!("Effective config: {:?}", config);
        Ok(config)
    }

    /// Existing files among the search paths
    pub fn existing_files(&self) -> Vec<PathBuf> {
        self.search_paths
            .iter()
            .filter(|p| p.path.exists())
            .map(|p| p.path.clone())
            .collect()
    }
}

fn read_json(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Failed to read {}: {}", path.display(), e)))?;
    let value: Value = serde_json::from_str(&content)
        .map_err(|e| Error::Config(format!("Failed to parse {}: {}", path.display(), e)))?;
    if !value.is_object() {
        return Err(Error::Config(format!(
            "{} must contain a JSON object",
            path.display()
        )));
    }
    Ok(value)
}

/// Merge `later` into `earlier`; objects merge key by key, anything else is replaced
pub fn merge_json(earlier: &mut Value, later: Value) {
    match (earlier, later) {
        (Value::Object(base), Value::Object(overrides)) => {
            for (key, value) in overrides {
                match base.get_mut(&key) {
                    Some(existing) => merge_json(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}
