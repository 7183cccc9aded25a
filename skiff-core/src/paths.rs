//! Centralized path configuration for skiff.

use std::path::PathBuf;

/// Get the skiff configuration directory.
///
/// Resolution order:
/// 1. `SKIFF_CONFIG_DIR` environment variable
/// 2. `<platform config dir>/skiff` (e.g. `~/.config/skiff`)
/// 3. `~/.skiff`
pub fn config_dir() -> PathBuf {
    resolve_config_dir(std::env::var("SKIFF_CONFIG_DIR").ok())
}

fn resolve_config_dir(override_dir: Option<String>) -> PathBuf {
    if let Some(dir) = override_dir.filter(|d| !d.is_empty()) {
        return PathBuf::from(dir);
    }

    if let Some(dir) = dirs::config_dir() {
        return dir.join("skiff");
    }

    dirs::home_dir().map(|h| h.join(".skiff")).unwrap_or_else(|| PathBuf::from(".skiff"))
}

/// Get the configuration file path.
pub fn config_file() -> PathBuf {
    config_dir().join("config.json")
}
