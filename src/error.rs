//! Error types for the update manager.
//!
//! Every failure the updater can report is one variant of [`UpdateError`].
//! Payloads are plain strings so a session can keep its last error around
//! (and hand out clones of it) after the failing operation has returned.

/// Closed set of failures that can end an update session.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UpdateError {
    /// A version string (tag or marker file) could not be parsed.
    #[error("version error: {0}")]
    Version(String),

    /// The release index was unreachable or retries were exhausted.
    #[error("network error: {0}")]
    Network(String),

    /// No release asset matches the configured platform.
    #[error("asset not found: {0}")]
    AssetNotFound(String),

    /// The asset download was incomplete, oversized, or could not be stored.
    #[error("download error: {0}")]
    Download(String),

    /// The pre-update snapshot could not be completed.
    #[error("backup error: {0}")]
    Backup(String),

    /// Restoring the pre-update snapshot failed. The installation may be
    /// unusable.
    #[error("rollback error: {0}")]
    Rollback(String),

    /// Stopping or starting the application failed.
    #[error("process error: {0}")]
    Process(String),

    /// Copying the new files into place or verifying them failed.
    #[error("install error: {0}")]
    Install(String),

    /// Configuration could not be loaded or is invalid.
    #[error("config error: {0}")]
    Config(String),

    /// Another session is already running for this installation.
    #[error("an update session is already in progress for {0}")]
    Busy(String),

    /// The caller cancelled the session before any file was touched.
    #[error("update cancelled: {0}")]
    Cancelled(String),
}

impl UpdateError {
    /// Returns `true` for the one outcome no automated step can recover from.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Rollback(_))
    }

    /// User-facing guidance describing the state the installation was left in.
    pub fn recovery_hint(&self) -> &'static str {
        match self {
            Self::Rollback(_) => {
                "the previous installation could not be restored; manual reinstall required"
            }
            Self::Install(_) => "update failed; the previous installation was restored",
            Self::Process(_) => {
                "the application could not be stopped or restarted; installed files are as they were before"
            }
            Self::Busy(_) => "another update is already running; try again once it finishes",
            Self::Version(_)
            | Self::Network(_)
            | Self::AssetNotFound(_)
            | Self::Download(_)
            | Self::Backup(_)
            | Self::Config(_)
            | Self::Cancelled(_) => "update failed; nothing changed",
        }
    }
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, UpdateError>;
