//! Structural validation of downloaded update archives.
//!
//! An archive is accepted only if it is a readable zip container with at
//! least one entry and it carries both files the update protocol needs: the
//! application executable and the version marker. Required entries are read
//! to the end so their CRCs are checked before anything is installed.

use crate::error::{Result, UpdateError};
use crate::update::release::DownloadedArchive;
use std::fs::File;
use std::io::{self, BufReader};
use std::path::Path;

/// Checks downloaded archives before any installation file is touched.
#[derive(Debug, Clone)]
pub struct ArchiveValidator {
    required: Vec<String>,
}

impl ArchiveValidator {
    /// Validator requiring `executable` and `version_file` entries.
    pub fn new(executable: impl Into<String>, version_file: impl Into<String>) -> Self {
        Self {
            required: vec![executable.into(), version_file.into()],
        }
    }

    /// Entry names an archive must contain.
    pub fn required_entries(&self) -> &[String] {
        &self.required
    }

    /// Validate a downloaded archive.
    ///
    /// Returns `Ok(false)` for anything structurally wrong: not a zip, empty,
    /// missing a required entry, or a required entry that fails to
    /// decompress.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::Download`] only when the archive path itself
    /// cannot be opened (for example because it does not exist).
    pub fn validate(&self, archive: &DownloadedArchive) -> Result<bool> {
        self.validate_path(&archive.path)
    }

    /// Same as [`Self::validate`] for a bare path.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::Download`] if the file cannot be opened.
    pub fn validate_path(&self, path: &Path) -> Result<bool> {
        let file = File::open(path).map_err(|e| {
            UpdateError::Download(format!("cannot open archive {}: {e}", path.display()))
        })?;

        let mut zip = match zip::ZipArchive::new(BufReader::new(file)) {
            Ok(zip) => zip,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "archive is not a readable zip");
                return Ok(false);
            }
        };

        if zip.is_empty() {
            tracing::warn!(path = %path.display(), "archive contains no entries");
            return Ok(false);
        }

        for name in &self.required {
            let mut entry = match zip.by_name(name) {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!(path = %path.display(), entry = %name, error = %e, "required entry missing");
                    return Ok(false);
                }
            };
            if entry.is_dir() {
                tracing::warn!(entry = %name, "required entry is a directory");
                return Ok(false);
            }
            if let Err(e) = io::copy(&mut entry, &mut io::sink()) {
                tracing::warn!(entry = %name, error = %e, "required entry is corrupt");
                return Ok(false);
            }
        }

        tracing::debug!(path = %path.display(), entries = zip.len(), "archive validated");
        Ok(true)
    }
}
