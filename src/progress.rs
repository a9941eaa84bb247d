//! Progress event types for update sessions.
//!
//! The update manager never renders anything itself. It reports state
//! transitions and download progress through an [`EventCallback`] so the CLI
//! (indicatif) or a host UI can present them however it likes.

use crate::update::session::UpdateState;
use std::sync::Arc;

/// Events emitted while an update session runs.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateEvent {
    /// The session moved from one state to another.
    StateChanged {
        /// Previous state.
        from: UpdateState,
        /// New state.
        to: UpdateState,
    },

    /// A newer release was found.
    UpdateAvailable {
        /// Installed version string.
        current: String,
        /// Version string of the candidate release.
        latest: String,
    },

    /// An asset download has started.
    DownloadStarted {
        /// Asset file name.
        asset: String,
        /// Total size in bytes, if the server reported it.
        total_bytes: Option<u64>,
    },

    /// Download progress update.
    DownloadProgress {
        /// Asset file name.
        asset: String,
        /// Bytes written so far in the current attempt.
        bytes_downloaded: u64,
        /// Total size in bytes, if known.
        total_bytes: Option<u64>,
    },

    /// The asset download finished and was moved into place.
    DownloadComplete {
        /// Asset file name.
        asset: String,
        /// Final size in bytes.
        size_bytes: u64,
    },

    /// One tracked file was written into the installation directory.
    FileApplied {
        /// Path relative to the installation directory.
        path: String,
    },

    /// A cancellation request arrived while files were being mutated and
    /// will be honoured once the session reaches a terminal state.
    CancelDeferred,
}

/// Callback type for receiving update events.
pub type EventCallback = Arc<dyn Fn(UpdateEvent) + Send + Sync>;

/// Emit `event` through an optional callback.
pub(crate) fn emit(callback: Option<&EventCallback>, event: UpdateEvent) {
    if let Some(cb) = callback {
        cb(event);
    }
}

/// Format a byte count for humans (`"1.5 MB"`).
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    if bytes == 0 {
        return "0 B".to_owned();
    }
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    format!("{size:.1} {}", UNITS[unit])
}
