//! Pre-update snapshots of tracked installation files.
//!
//! A snapshot is staged in `<root>/<name>.partial/` and only renamed to its
//! final name once every tracked file has been captured and the manifest has
//! been written, so a half-written backup is never mistaken for a usable one.
//!
//! # Layout
//!
//! ```text
//! <root>/
//!   backup_1.0.0_20260101-120000-000/
//!     backup.json        ← manifest (timestamp, version, file map)
//!     files/
//!       app.exe
//!       version.txt
//! ```

use crate::config::ensure_relative;
use crate::error::{Result, UpdateError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Prefix of every backup directory name.
const BACKUP_PREFIX: &str = "backup_";

/// Suffix of a backup that is still being written.
const STAGING_SUFFIX: &str = ".partial";

/// Manifest file inside each backup directory.
const MANIFEST_FILE: &str = "backup.json";

/// Sub-directory holding the saved file copies.
const FILES_DIR: &str = "files";

/// What a snapshot recorded for one tracked file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "path")]
pub enum SavedFile {
    /// The file existed; this is where its copy lives.
    Copied(PathBuf),
    /// The file did not exist. Restoring means deleting it.
    Absent,
}

/// A completed snapshot. While it exists the installation is in a risky
/// window and must not be discarded until the new install is verified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backup {
    /// When the snapshot was taken.
    pub timestamp: DateTime<Utc>,
    /// Installation directory the files were copied from.
    pub source_dir: PathBuf,
    /// Backup directory on disk.
    pub location: PathBuf,
    /// Relative tracked path → saved copy (or absence marker).
    pub saved_files: BTreeMap<PathBuf, SavedFile>,
    /// Installed version at snapshot time.
    pub saved_version: String,
}

impl Backup {
    /// Load a backup from its directory.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::Backup`] if the manifest is missing or unreadable.
    pub fn load(dir: &Path) -> Result<Self> {
        let manifest = dir.join(MANIFEST_FILE);
        let bytes = std::fs::read(&manifest).map_err(|e| {
            UpdateError::Backup(format!("cannot read {}: {e}", manifest.display()))
        })?;
        serde_json::from_slice(&bytes).map_err(|e| {
            UpdateError::Backup(format!("invalid manifest {}: {e}", manifest.display()))
        })
    }
}

/// Creates, restores and prunes snapshots under one root directory.
#[derive(Debug, Clone)]
pub struct BackupStore {
    root: PathBuf,
    restore_attempts: u32,
    restore_delay: Duration,
}

impl BackupStore {
    /// Store rooted at `root` with default restore retries (5 × 500 ms).
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            restore_attempts: 5,
            restore_delay: Duration::from_millis(500),
        }
    }

    /// Override how often a locked file is retried during restore.
    pub fn with_restore_retries(mut self, attempts: u32, delay: Duration) -> Self {
        self.restore_attempts = attempts.max(1);
        self.restore_delay = delay;
        self
    }

    /// Backup root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Copy every tracked file that exists in `install_dir` into a new
    /// snapshot; record the others as absent.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::Backup`] if any file cannot be captured. No
    /// partial backup directory is left behind in that case.
    pub fn snapshot(
        &self,
        install_dir: &Path,
        tracked: &[PathBuf],
        current_version: &str,
    ) -> Result<Backup> {
        for rel in tracked {
            ensure_relative(rel).map_err(|e| UpdateError::Backup(e.to_string()))?;
        }
        std::fs::create_dir_all(&self.root).map_err(|e| {
            UpdateError::Backup(format!("cannot create {}: {e}", self.root.display()))
        })?;

        let timestamp = Utc::now();
        let location = self.unique_location(current_version, &timestamp);
        let mut staging = location.clone().into_os_string();
        staging.push(STAGING_SUFFIX);
        let staging = PathBuf::from(staging);

        let result = self.write_snapshot(install_dir, tracked, current_version, timestamp, &location, &staging);
        match result {
            Ok(backup) => {
                tracing::info!(
                    location = %backup.location.display(),
                    files = backup.saved_files.len(),
                    version = %backup.saved_version,
                    "backup created"
                );
                Ok(backup)
            }
            Err(e) => {
                if let Err(cleanup) = std::fs::remove_dir_all(&staging) {
                    if cleanup.kind() != io::ErrorKind::NotFound {
                        tracing::warn!(path = %staging.display(), error = %cleanup, "failed to remove partial backup");
                    }
                }
                Err(e)
            }
        }
    }

    fn write_snapshot(
        &self,
        install_dir: &Path,
        tracked: &[PathBuf],
        current_version: &str,
        timestamp: DateTime<Utc>,
        location: &Path,
        staging: &Path,
    ) -> Result<Backup> {
        let backup_err = |what: &str, path: &Path, e: io::Error| {
            UpdateError::Backup(format!("{what} {}: {e}", path.display()))
        };

        std::fs::create_dir_all(staging.join(FILES_DIR))
            .map_err(|e| backup_err("cannot create", staging, e))?;

        let mut saved_files = BTreeMap::new();
        for rel in tracked {
            let source = install_dir.join(rel);
            match std::fs::metadata(&source) {
                Ok(meta) if meta.is_file() => {
                    let staged = staging.join(FILES_DIR).join(rel);
                    if let Some(parent) = staged.parent() {
                        std::fs::create_dir_all(parent)
                            .map_err(|e| backup_err("cannot create", parent, e))?;
                    }
                    std::fs::copy(&source, &staged)
                        .map_err(|e| backup_err("cannot copy", &source, e))?;
                    saved_files.insert(rel.clone(), SavedFile::Copied(location.join(FILES_DIR).join(rel)));
                }
                Ok(_) => {
                    return Err(UpdateError::Backup(format!(
                        "{} is not a regular file",
                        source.display()
                    )));
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    tracing::debug!(file = %rel.display(), "tracked file absent, recording for deletion on restore");
                    saved_files.insert(rel.clone(), SavedFile::Absent);
                }
                Err(e) => return Err(backup_err("cannot stat", &source, e)),
            }
        }

        let backup = Backup {
            timestamp,
            source_dir: install_dir.to_path_buf(),
            location: location.to_path_buf(),
            saved_files,
            saved_version: current_version.to_owned(),
        };

        let manifest = serde_json::to_vec_pretty(&backup)
            .map_err(|e| UpdateError::Backup(format!("cannot serialize manifest: {e}")))?;
        let manifest_path = staging.join(MANIFEST_FILE);
        std::fs::write(&manifest_path, manifest)
            .map_err(|e| backup_err("cannot write", &manifest_path, e))?;

        std::fs::rename(staging, location).map_err(|e| backup_err("cannot finalize", location, e))?;
        Ok(backup)
    }

    fn unique_location(&self, version: &str, timestamp: &DateTime<Utc>) -> PathBuf {
        let safe_version: String = version
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
            .collect();
        let base = format!(
            "{BACKUP_PREFIX}{safe_version}_{}",
            timestamp.format("%Y%m%d-%H%M%S-%3f")
        );
        let mut candidate = self.root.join(&base);
        let mut n = 1;
        while candidate.exists() || staging_exists(&candidate) {
            candidate = self.root.join(format!("{base}-{n}"));
            n += 1;
        }
        candidate
    }

    /// Put every tracked file back the way `backup` recorded it.
    ///
    /// Each file is retried a bounded number of times so a file still held
    /// by a just-killed process gets a chance to be released. All files are
    /// attempted even if one of them fails.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::Rollback`] listing every file that could not
    /// be restored.
    pub async fn restore(&self, backup: &Backup, install_dir: &Path, tracked: &[PathBuf]) -> Result<()> {
        tracing::info!(location = %backup.location.display(), "restoring backup");
        let mut failures = Vec::new();

        for rel in tracked {
            let target = install_dir.join(rel);
            let Some(saved) = backup.saved_files.get(rel) else {
                failures.push(format!("{}: not captured by this backup", rel.display()));
                continue;
            };

            let mut attempt = 1;
            loop {
                let outcome = {
                    let saved = saved.clone();
                    let target = target.clone();
                    tokio::task::spawn_blocking(move || restore_one(&saved, &target))
                        .await
                        .unwrap_or_else(|e| Err(io::Error::other(e)))
                };
                match outcome {
                    Ok(()) => break,
                    Err(e) if attempt < self.restore_attempts => {
                        tracing::warn!(file = %rel.display(), attempt, error = %e, "restore failed, retrying");
                        tokio::time::sleep(self.restore_delay).await;
                        attempt += 1;
                    }
                    Err(e) => {
                        tracing::error!(file = %rel.display(), attempts = attempt, error = %e, "restore failed");
                        failures.push(format!("{}: {e}", rel.display()));
                        break;
                    }
                }
            }
        }

        if failures.is_empty() {
            tracing::info!(version = %backup.saved_version, "backup restored");
            Ok(())
        } else {
            Err(UpdateError::Rollback(failures.join("; ")))
        }
    }

    /// Remove a backup from disk. Failures are logged, never returned.
    pub fn purge(&self, backup: &Backup) {
        match std::fs::remove_dir_all(&backup.location) {
            Ok(()) => tracing::debug!(location = %backup.location.display(), "backup purged"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(location = %backup.location.display(), error = %e, "failed to purge backup");
            }
        }
    }

    /// All completed backups under the root, newest first.
    ///
    /// Directories with unreadable manifests are skipped with a warning.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::Backup`] if the root exists but cannot be read.
    pub fn list(&self) -> Result<Vec<Backup>> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(UpdateError::Backup(format!(
                    "cannot read {}: {e}",
                    self.root.display()
                )));
            }
        };

        let mut backups: Vec<Backup> = entries
            .filter_map(|entry| {
                let entry = entry.ok()?;
                let name = entry.file_name().to_string_lossy().to_string();
                if !name.starts_with(BACKUP_PREFIX) || name.ends_with(STAGING_SUFFIX) {
                    return None;
                }
                match Backup::load(&entry.path()) {
                    Ok(backup) => Some(backup),
                    Err(e) => {
                        tracing::warn!(path = %entry.path().display(), error = %e, "skipping unreadable backup");
                        None
                    }
                }
            })
            .collect();

        backups.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| b.location.cmp(&a.location)));
        Ok(backups)
    }

    /// The most recent completed backup, if any.
    ///
    /// # Errors
    ///
    /// Same as [`Self::list`].
    pub fn latest(&self) -> Result<Option<Backup>> {
        Ok(self.list()?.into_iter().next())
    }

    /// Keep the `keep` newest backups and purge the rest.
    ///
    /// Returns the number of backups purged.
    pub fn rotate(&self, keep: usize) -> usize {
        let backups = match self.list() {
            Ok(backups) => backups,
            Err(e) => {
                tracing::warn!(error = %e, "cannot list backups for rotation");
                return 0;
            }
        };
        let mut purged = 0;
        for old in backups.iter().skip(keep) {
            self.purge(old);
            if !old.location.exists() {
                purged += 1;
            }
        }
        purged
    }
}

fn staging_exists(location: &Path) -> bool {
    let mut staging = location.as_os_str().to_owned();
    staging.push(STAGING_SUFFIX);
    Path::new(&staging).exists()
}

fn restore_one(saved: &SavedFile, target: &Path) -> io::Result<()> {
    match saved {
        SavedFile::Copied(source) => {
            // A file the update never replaced may still be executing, and
            // writing over a running executable fails on most platforms.
            if same_contents(source, target)? {
                tracing::debug!(file = %target.display(), "already matches backup, leaving in place");
                return Ok(());
            }
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(source, target).map(|_| ())
        }
        SavedFile::Absent => match std::fs::remove_file(target) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        },
    }
}

/// Whether `target` exists and is byte-identical to `saved`.
fn same_contents(saved: &Path, target: &Path) -> io::Result<bool> {
    let target_len = match std::fs::metadata(target) {
        Ok(meta) if meta.is_file() => meta.len(),
        Ok(_) => return Ok(false),
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };
    if std::fs::metadata(saved)?.len() != target_len {
        return Ok(false);
    }

    let mut left = io::BufReader::new(std::fs::File::open(saved)?);
    let mut right = io::BufReader::new(std::fs::File::open(target)?);
    let mut a = [0u8; 8192];
    let mut b = [0u8; 8192];
    loop {
        let n = left.read(&mut a)?;
        if n == 0 {
            return Ok(true);
        }
        right.read_exact(&mut b[..n])?;
        if a[..n] != b[..n] {
            return Ok(false);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
