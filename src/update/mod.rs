//! Self-update machinery.
//!
//! Checks a GitHub-style release index for a newer version, downloads the
//! platform archive, snapshots the tracked installation files, stops the
//! application, applies the archive, restarts and verifies. Any failure after
//! the snapshot restores it. One session at a time may hold an installation
//! directory, across processes.

pub mod applier;
pub mod archive;
pub mod backup;
pub mod lock;
pub mod manager;
pub mod preferences;
pub mod process;
pub mod release;
pub mod retry;
pub mod session;
pub mod trigger;
pub mod version;

pub use applier::{ArchiveApplier, ZipApplier, read_installed_version};
pub use archive::ArchiveValidator;
pub use backup::{Backup, BackupStore, SavedFile};
pub use lock::InstallLock;
pub use manager::{
    CheckOutcome, ManagerSettings, UpdateConfirmation, UpdateManager, UpdateManagerBuilder,
};
pub use preferences::{AutoUpdatePreference, UpdatePreferences};
pub use process::{LocalProcessController, ProcessController};
pub use release::{
    AssetRef, DownloadedArchive, GitHubReleaseSource, PlatformKey, ReleaseInfo, ReleaseSource,
    select_asset,
};
pub use retry::RetryPolicy;
pub use session::{UpdateSession, UpdateState};
pub use version::{VersionTag, compare, is_upgrade};
