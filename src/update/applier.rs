//! Installing validated archives over the tracked installation files.
//!
//! Each tracked file present in the archive is extracted next to its target
//! as `<name>.updraft-new` and then renamed into place, so a single file is
//! never observed half-written. Files are applied one at a time; a failure
//! part-way leaves earlier files replaced, which is what the backup exists
//! to undo.

use crate::error::{Result, UpdateError};
use crate::progress::{EventCallback, UpdateEvent, emit};
use async_trait::async_trait;
use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};

/// Version reported when no marker file exists.
pub const UNKNOWN_VERSION: &str = "0.0.0";

/// Suffix of a file being extracted before it is renamed into place.
const STAGING_SUFFIX: &str = ".updraft-new";

/// Writes the contents of an update archive into an installation directory.
#[async_trait]
pub trait ArchiveApplier: Send + Sync {
    /// Overwrite every tracked file the archive contains.
    ///
    /// Returns the relative paths that were replaced, in application order.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::Install`] on the first file that cannot be
    /// written. Files applied before it stay applied.
    async fn apply(
        &self,
        archive: &Path,
        install_dir: &Path,
        tracked: &[PathBuf],
        events: Option<&EventCallback>,
    ) -> Result<Vec<PathBuf>>;
}

/// Extracts tracked entries from a zip archive.
#[derive(Debug, Clone)]
pub struct ZipApplier {
    executable: PathBuf,
}

impl ZipApplier {
    /// Applier that marks `executable` (relative path) as runnable after
    /// extraction.
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
        }
    }
}

#[async_trait]
impl ArchiveApplier for ZipApplier {
    async fn apply(
        &self,
        archive: &Path,
        install_dir: &Path,
        tracked: &[PathBuf],
        events: Option<&EventCallback>,
    ) -> Result<Vec<PathBuf>> {
        let executable = self.executable.clone();
        let archive = archive.to_path_buf();
        let install_dir = install_dir.to_path_buf();
        let tracked = tracked.to_vec();
        let events = events.cloned();
        tokio::task::spawn_blocking(move || {
            extract_tracked(&executable, &archive, &install_dir, &tracked, events.as_ref())
        })
        .await
        .map_err(|e| UpdateError::Install(format!("apply task failed: {e}")))?
    }
}

/// Blocking body of [`ZipApplier::apply`].
fn extract_tracked(
    executable: &Path,
    archive: &Path,
    install_dir: &Path,
    tracked: &[PathBuf],
    events: Option<&EventCallback>,
) -> Result<Vec<PathBuf>> {
    let file = File::open(archive).map_err(|e| {
        UpdateError::Install(format!("cannot open archive {}: {e}", archive.display()))
    })?;
    let mut zip = zip::ZipArchive::new(BufReader::new(file))
        .map_err(|e| UpdateError::Install(format!("cannot read archive: {e}")))?;

    let mut applied = Vec::new();
    for rel in tracked {
        let entry_name = archive_entry_name(rel);
        let mut entry = match zip.by_name(&entry_name) {
            Ok(entry) => entry,
            Err(zip::result::ZipError::FileNotFound) => {
                tracing::debug!(file = %entry_name, "not in archive, leaving installed copy");
                continue;
            }
            Err(e) => {
                return Err(UpdateError::Install(format!("cannot read {entry_name}: {e}")));
            }
        };

        let target = install_dir.join(rel);
        write_atomically(&mut entry, &target)?;
        drop(entry);

        if rel.as_path() == executable {
            set_executable(&target)?;
            clear_quarantine(&target);
        }

        tracing::info!(file = %target.display(), "file updated");
        emit(
            events,
            UpdateEvent::FileApplied {
                path: rel.to_string_lossy().into_owned(),
            },
        );
        applied.push(rel.clone());
    }

    Ok(applied)
}

/// Zip entries always use forward slashes.
fn archive_entry_name(rel: &Path) -> String {
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn write_atomically(reader: &mut impl io::Read, target: &Path) -> Result<()> {
    let install_err = |what: &str, path: &Path, e: io::Error| {
        UpdateError::Install(format!("{what} {}: {e}", path.display()))
    };

    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent).map_err(|e| install_err("cannot create", parent, e))?;
    }

    let mut staged = target.as_os_str().to_owned();
    staged.push(STAGING_SUFFIX);
    let staged = PathBuf::from(staged);

    let result = File::create(&staged)
        .and_then(|mut out| {
            io::copy(reader, &mut out)?;
            out.sync_all()
        })
        .map_err(|e| install_err("cannot write", &staged, e))
        .and_then(|()| {
            std::fs::rename(&staged, target).map_err(|e| install_err("cannot replace", target, e))
        });

    if result.is_err() {
        let _ = std::fs::remove_file(&staged);
    }
    result
}

/// Set executable permission on Unix platforms.
fn set_executable(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).map_err(|e| {
            UpdateError::Install(format!(
                "cannot set executable permission on {}: {e}",
                path.display()
            ))
        })?;
    }
    let _ = path;
    Ok(())
}

/// Clear the macOS quarantine attribute so Gatekeeper does not block the
/// freshly written binary. No-op elsewhere.
fn clear_quarantine(path: &Path) {
    #[cfg(target_os = "macos")]
    {
        let _ = std::process::Command::new("xattr")
            .args(["-c", &path.to_string_lossy()])
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status();
    }
    let _ = path;
}

/// Read the installed version marker.
///
/// A missing or blank marker yields [`UNKNOWN_VERSION`] so that any real
/// release counts as an upgrade.
///
/// # Errors
///
/// Returns [`UpdateError::Version`] if the marker exists but cannot be read.
pub fn read_installed_version(install_dir: &Path, version_file: &Path) -> Result<String> {
    let path = install_dir.join(version_file);
    match std::fs::read_to_string(&path) {
        Ok(content) => {
            let trimmed = content.trim();
            if trimmed.is_empty() {
                Ok(UNKNOWN_VERSION.to_owned())
            } else {
                Ok(trimmed.to_owned())
            }
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "no version marker, assuming {UNKNOWN_VERSION}");
            Ok(UNKNOWN_VERSION.to_owned())
        }
        Err(e) => Err(UpdateError::Version(format!(
            "cannot read {}: {e}",
            path.display()
        ))),
    }
}

/// Remove stray `*.updraft-new` files left by an interrupted apply.
///
/// Returns how many were removed.
pub fn cleanup_staged_files(install_dir: &Path, tracked: &[PathBuf]) -> usize {
    let mut removed = 0;
    for rel in tracked {
        let mut staged = install_dir.join(rel).into_os_string();
        staged.push(STAGING_SUFFIX);
        match std::fs::remove_file(&staged) {
            Ok(()) => removed += 1,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(path = %Path::new(&staged).display(), error = %e, "cannot remove staged file");
            }
        }
    }
    removed
}
