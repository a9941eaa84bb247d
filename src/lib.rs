//! Updraft: in-place self-update manager for locally installed applications.
//!
//! The crate keeps a desktop application current from a GitHub-style release
//! index without ever leaving the installation half-updated:
//!
//! Release index → Download → Validate → Backup → Stop → Apply → Start → Verify
//!
//! # Architecture
//!
//! - **Version model**: semantic `major.minor.patch[-pre]` ordering
//! - **Release source**: fetches metadata and streams assets with retry/backoff
//! - **Archive validator**: rejects corrupt or incomplete zip archives
//! - **Backup store**: snapshots tracked files and restores them on failure
//! - **Process controller**: stops and relaunches the application
//! - **Update manager**: the state machine tying them together, single-flight

pub mod app_dirs;
pub mod config;
pub mod error;
pub mod progress;
pub mod update;

pub use config::UpdaterConfig;
pub use error::{Result, UpdateError};
pub use progress::{EventCallback, UpdateEvent};
pub use update::{UpdateManager, UpdateSession, UpdateState};
