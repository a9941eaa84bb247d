//! Cross-process lock on an installation directory.
//!
//! `<install_dir>/.updraft.lock` is created with `create_new` and removed
//! when the holder drops it. It records the holder's pid so a lock left
//! behind by a crashed updater can be recognised and recovered.

use crate::error::{Result, UpdateError};
use chrono::Utc;
use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
#[cfg(not(unix))]
use std::time::{Duration, SystemTime};

/// Lock file name inside the installation directory.
pub const LOCK_FILE: &str = ".updraft.lock";

/// Where no liveness check exists, a lock this old is considered abandoned.
#[cfg(not(unix))]
const STALE_AFTER: Duration = Duration::from_secs(24 * 3600);

/// Exclusive claim on one installation directory. Released on drop.
#[derive(Debug)]
pub struct InstallLock {
    path: PathBuf,
}

impl InstallLock {
    /// Claim `install_dir` for this process.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::Busy`] if a live process holds the lock, or
    /// [`UpdateError::Config`] if the lock file cannot be created (for
    /// example because the directory does not exist).
    pub fn acquire(install_dir: &Path) -> Result<Self> {
        let path = install_dir.join(LOCK_FILE);

        for attempt in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    let stamp = format!("pid={} started_at={}", std::process::id(), Utc::now().to_rfc3339());
                    if let Err(e) = file.write_all(stamp.as_bytes()) {
                        tracing::debug!(path = %path.display(), error = %e, "cannot record lock holder");
                    }
                    return Ok(Self { path });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if attempt == 0 && is_stale(&path) {
                        tracing::warn!(path = %path.display(), "removing lock left by a process that is gone");
                        let _ = std::fs::remove_file(&path);
                        continue;
                    }
                    let holder = std::fs::read_to_string(&path).unwrap_or_default();
                    tracing::warn!(path = %path.display(), holder = %holder.trim(), "installation is locked by another updater");
                    return Err(UpdateError::Busy(install_dir.display().to_string()));
                }
                Err(e) => {
                    return Err(UpdateError::Config(format!(
                        "cannot lock installation directory {}: {e}",
                        install_dir.display()
                    )));
                }
            }
        }

        Err(UpdateError::Busy(install_dir.display().to_string()))
    }

    /// Path of the lock file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for InstallLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != ErrorKind::NotFound {
                tracing::warn!(path = %self.path.display(), error = %e, "failed to release installation lock");
            }
        }
    }
}

#[cfg_attr(not(unix), allow(dead_code))]
fn holder_pid(path: &Path) -> Option<u32> {
    let raw = std::fs::read_to_string(path).ok()?;
    raw.split_whitespace()
        .find_map(|token| token.strip_prefix("pid="))
        .and_then(|pid| pid.parse().ok())
}

#[cfg(unix)]
fn is_stale(path: &Path) -> bool {
    // An unreadable or half-written lock is only trusted while its writer
    // can still be finishing it.
    let Some(pid) = holder_pid(path) else {
        return lock_age_secs(path).is_some_and(|age| age > 5);
    };
    if pid == std::process::id() {
        return false;
    }
    let Ok(raw) = i32::try_from(pid) else {
        return true;
    };
    if raw <= 0 {
        return true;
    }
    // SAFETY: kill(2) with signal 0 only checks for existence.
    let rc = unsafe { libc::kill(raw, 0) };
    rc != 0 && std::io::Error::last_os_error().raw_os_error() == Some(libc::ESRCH)
}

#[cfg(not(unix))]
fn is_stale(path: &Path) -> bool {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .is_some_and(|age| age > STALE_AFTER)
}

#[cfg(unix)]
fn lock_age_secs(path: &Path) -> Option<u64> {
    let modified = std::fs::metadata(path).ok()?.modified().ok()?;
    std::time::SystemTime::now()
        .duration_since(modified)
        .ok()
        .map(|age| age.as_secs())
}
