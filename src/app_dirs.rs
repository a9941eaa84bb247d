//! Centralized directory paths for the updater.
//!
//! Uses the [`dirs`] crate for platform-appropriate directory resolution.
//!
//! # Directory Layout
//!
//! | Purpose | macOS | Linux |
//! |---------|-------|-------|
//! | Data (backups, logs) | `~/Library/Application Support/updraft/` | `~/.local/share/updraft/` |
//! | Config | `~/Library/Application Support/updraft/` | `~/.config/updraft/` |
//! | Cache (downloads) | `~/Library/Caches/updraft/` | `~/.cache/updraft/` |
//!
//! # Environment Overrides
//!
//! - `UPDRAFT_DATA_DIR` overrides [`data_dir`]
//! - `UPDRAFT_CONFIG_DIR` overrides [`config_dir`]
//! - `UPDRAFT_CACHE_DIR` overrides [`cache_dir`]

use std::path::PathBuf;

/// Application data root directory.
#[must_use]
pub fn data_dir() -> PathBuf {
    if let Some(override_dir) = std::env::var_os("UPDRAFT_DATA_DIR") {
        return PathBuf::from(override_dir);
    }
    dirs::data_dir()
        .map(|d| d.join("updraft"))
        .unwrap_or_else(|| std::env::temp_dir().join("updraft-data"))
}

/// Application config directory.
#[must_use]
pub fn config_dir() -> PathBuf {
    if let Some(override_dir) = std::env::var_os("UPDRAFT_CONFIG_DIR") {
        return PathBuf::from(override_dir);
    }
    dirs::config_dir()
        .map(|d| d.join("updraft"))
        .unwrap_or_else(|| std::env::temp_dir().join("updraft-config"))
}

/// Cache directory for expendable data such as in-flight downloads.
#[must_use]
pub fn cache_dir() -> PathBuf {
    if let Some(override_dir) = std::env::var_os("UPDRAFT_CACHE_DIR") {
        return PathBuf::from(override_dir);
    }
    dirs::cache_dir()
        .map(|d| d.join("updraft"))
        .unwrap_or_else(|| std::env::temp_dir().join("updraft-cache"))
}

/// Log file directory (`data_dir()/logs/`).
#[must_use]
pub fn logs_dir() -> PathBuf {
    data_dir().join("logs")
}

/// Default backup root (`data_dir()/backups/`).
#[must_use]
pub fn backups_dir() -> PathBuf {
    data_dir().join("backups")
}

/// Scratch area for downloads and session work files (`cache_dir()/downloads/`).
#[must_use]
pub fn downloads_dir() -> PathBuf {
    cache_dir().join("downloads")
}

/// Main config file path (`config_dir()/config.toml`).
#[must_use]
pub fn config_file() -> PathBuf {
    config_dir().join("config.toml")
}

/// Trigger preferences file (`config_dir()/update-state.json`).
#[must_use]
pub fn update_state_file() -> PathBuf {
    config_dir().join("update-state.json")
}
