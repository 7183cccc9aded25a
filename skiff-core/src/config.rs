//! Configuration management.

use crate::error::{BuildError, Result};
use crate::paths;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Engine endpoint used when neither the config nor `DOCKER_HOST` name one.
pub const DEFAULT_ENGINE_HOST: &str = "tcp://127.0.0.1:2375";

/// Persistent configuration for skiff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Container engine endpoint (`tcp://host:port` or `http(s)://...`)
    pub engine_host: String,
    /// Pin the engine API version, e.g. `1.43`
    pub api_version: Option<String>,
    pub log_level: String,
    /// Labels attached to every image built
    pub extra_labels: BTreeMap<String, String>,
    /// Serve Prometheus metrics on this port when set
    pub metrics_port: Option<u16>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            engine_host: std::env::var("DOCKER_HOST")
                .ok()
                .filter(|h| !h.is_empty())
                .unwrap_or_else(|| DEFAULT_ENGINE_HOST.to_string()),
            api_version: None,
            log_level: "info".to_string(),
            extra_labels: BTreeMap::new(),
            metrics_port: None,
        }
    }
}

impl Config {
    /// Get the path to the configuration file.
    pub fn config_path() -> PathBuf {
        paths::config_file()
    }

    /// Load configuration from disk, then apply environment overrides.
    pub fn load() -> Result<Self> {
        Ok(Self::load_from(&Self::config_path())?.with_env_overrides())
    }

    /// Load configuration from `path`; a missing file yields the defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|e| BuildError::InvalidConfig {
            reason: format!("Failed to read config {}: {}", path.display(), e),
        })?;
        serde_json::from_str(&content).map_err(|e| BuildError::InvalidConfig {
            reason: format!("Failed to parse config {}: {}", path.display(), e),
        })
    }

    /// `SKIFF_ENGINE_HOST` wins over the file and `DOCKER_HOST`.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(host) = std::env::var("SKIFF_ENGINE_HOST") {
            if !host.is_empty() {
                self.engine_host = host;
            }
        }
        self
    }

    /// Save configuration to disk.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self).map_err(|e| BuildError::InvalidConfig {
            reason: format!("Failed to serialize config: {}", e),
        })?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
