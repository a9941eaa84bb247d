//! Configuration for the updater.
//!
//! Loaded from TOML. Every section is optional; missing keys fall back to
//! the defaults below.
//!
//! ```toml
//! [release]
//! api_url = "https://api.github.com/repos/acme/desktop/releases/latest"
//! platform = "windows"
//!
//! [install]
//! executable = "Desktop.exe"
//! tracked_files = ["Desktop.exe", "version.txt", "app.ico"]
//! ```

use crate::error::{Result, UpdateError};
use crate::update::release::PlatformKey;
use crate::update::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

/// Top-level updater configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdaterConfig {
    /// Remote release index settings.
    pub release: ReleaseConfig,
    /// Retry/backoff applied to metadata fetches and downloads.
    pub retry: RetryPolicy,
    /// Installation layout.
    pub install: InstallConfig,
    /// Running-application control.
    pub process: ProcessConfig,
    /// Backup location, retention and restore retries.
    pub backup: BackupConfig,
    /// Background trigger cadence.
    pub schedule: ScheduleConfig,
}

/// Remote release index settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReleaseConfig {
    /// "Latest release" endpoint of a GitHub-compatible API.
    pub api_url: String,
    /// Which asset naming convention to download.
    pub platform: PlatformKey,
    /// Connect and metadata request timeout in seconds.
    pub request_timeout_secs: u64,
    /// Whole-transfer timeout for a single asset download attempt.
    pub download_timeout_secs: u64,
    /// User-Agent header (GitHub rejects requests without one).
    pub user_agent: String,
}

impl Default for ReleaseConfig {
    fn default() -> Self {
        Self {
            api_url: String::new(),
            platform: PlatformKey::host(),
            request_timeout_secs: 60,
            download_timeout_secs: 600,
            user_agent: format!("updraft/{} (self-update)", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Installation directory layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InstallConfig {
    /// Installation directory (None = directory of the running updater).
    pub dir: Option<PathBuf>,
    /// Application executable, relative to the installation directory.
    pub executable: String,
    /// Version marker file, relative to the installation directory.
    pub version_file: String,
    /// Files the updater backs up and overwrites. Empty means
    /// `[executable, version_file]`.
    pub tracked_files: Vec<String>,
}

impl Default for InstallConfig {
    fn default() -> Self {
        Self {
            dir: None,
            executable: default_executable().to_owned(),
            version_file: "version.txt".to_owned(),
            tracked_files: Vec::new(),
        }
    }
}

fn default_executable() -> &'static str {
    if cfg!(target_os = "windows") {
        "app.exe"
    } else {
        "app"
    }
}

/// Running-application control.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessConfig {
    /// Seconds to wait for graceful shutdown before forcing termination.
    pub stop_timeout_secs: u64,
    /// Process image name to look for (None = executable file name).
    pub process_name: Option<String>,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            stop_timeout_secs: 30,
            process_name: None,
        }
    }
}

/// Backup location and retention.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    /// Backup root (None = `app_dirs::backups_dir()`).
    pub dir: Option<PathBuf>,
    /// Number of successful-update backups to retain.
    pub keep: usize,
    /// Attempts per file when restoring over a possibly locked file.
    pub restore_attempts: u32,
    /// Delay between restore attempts in milliseconds.
    pub restore_delay_ms: u64,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            dir: None,
            keep: 3,
            restore_attempts: 5,
            restore_delay_ms: 500,
        }
    }
}

/// Background trigger cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Minimum hours between automatic checks.
    pub check_interval_hours: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            check_interval_hours: 24,
        }
    }
}

impl UpdaterConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| UpdateError::Config(format!("cannot read {}: {e}", path.display())))?;
        toml::from_str(&content).map_err(|e| UpdateError::Config(e.to_string()))
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot be serialized.
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                UpdateError::Config(format!("cannot create {}: {e}", parent.display()))
            })?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| UpdateError::Config(e.to_string()))?;
        std::fs::write(path, content)
            .map_err(|e| UpdateError::Config(format!("cannot write {}: {e}", path.display())))
    }

    /// Returns the default config file path.
    pub fn default_config_path() -> PathBuf {
        crate::app_dirs::config_file()
    }

    /// Check invariants that serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::Config`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        self.validate_release()?;
        self.validate_install()
    }

    /// Settings needed to reach the release index.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::Config`] if `release.api_url` is empty.
    pub fn validate_release(&self) -> Result<()> {
        if self.release.api_url.trim().is_empty() {
            return Err(UpdateError::Config("release.api_url is not set".to_owned()));
        }
        Ok(())
    }

    /// Settings needed to back up, restore and restart the installation.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::Config`] if a tracked path escapes the
    /// installation directory or the executable or version marker is not
    /// tracked.
    pub fn validate_install(&self) -> Result<()> {
        for entry in self.tracked_files() {
            ensure_relative(&entry)?;
        }
        let tracked = self.tracked_files();
        for required in [&self.install.executable, &self.install.version_file] {
            if !tracked.iter().any(|p| p == Path::new(required)) {
                return Err(UpdateError::Config(format!(
                    "install.tracked_files must include {required:?}"
                )));
            }
        }
        Ok(())
    }

    /// Installation directory, defaulting to the updater's own directory.
    ///
    /// # Errors
    ///
    /// Returns an error if no directory is configured and the running
    /// executable's location cannot be determined.
    pub fn install_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.install.dir {
            return Ok(dir.clone());
        }
        let exe = std::env::current_exe().map_err(|e| {
            UpdateError::Config(format!("cannot determine current executable path: {e}"))
        })?;
        exe.parent().map(Path::to_path_buf).ok_or_else(|| {
            UpdateError::Config(format!("{} has no parent directory", exe.display()))
        })
    }

    /// Tracked files as relative paths.
    pub fn tracked_files(&self) -> Vec<PathBuf> {
        if self.install.tracked_files.is_empty() {
            vec![
                PathBuf::from(&self.install.executable),
                PathBuf::from(&self.install.version_file),
            ]
        } else {
            self.install.tracked_files.iter().map(PathBuf::from).collect()
        }
    }

    /// Process name to stop, defaulting to the executable's file name.
    pub fn process_name(&self) -> String {
        self.process.process_name.clone().unwrap_or_else(|| {
            Path::new(&self.install.executable)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| self.install.executable.clone())
        })
    }

    /// Graceful stop timeout.
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.process.stop_timeout_secs)
    }

    /// Backup root directory.
    pub fn backup_dir(&self) -> PathBuf {
        self.backup
            .dir
            .clone()
            .unwrap_or_else(crate::app_dirs::backups_dir)
    }
}

/// Tracked paths must stay inside the installation directory.
pub(crate) fn ensure_relative(path: &Path) -> Result<()> {
    let ok = !path.as_os_str().is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if ok {
        Ok(())
    } else {
        Err(UpdateError::Config(format!(
            "tracked path {} must be relative and stay inside the installation directory",
            path.display()
        )))
    }
}
