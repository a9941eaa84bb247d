//! Update lifecycle states and the per-attempt session record.
//!
//! ```text
//! Idle → Checking → NoUpdate
//!                 → UpdateAvailable → Downloading → Validating
//!                   → BackingUp → Stopping → Applying → Starting → Verifying
//!                   → Succeeded | RolledBack | Failed
//! ```
//!
//! `Failed` is reachable from every non-terminal state. `Cancelled` is only
//! reachable before `BackingUp`. `RolledBack` only from the mutating states.

use crate::error::UpdateError;
use crate::update::backup::Backup;
use crate::update::release::ReleaseInfo;
use std::fmt;

/// Where an update attempt currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpdateState {
    Idle,
    Checking,
    NoUpdate,
    UpdateAvailable,
    Downloading,
    Validating,
    BackingUp,
    Stopping,
    Applying,
    Starting,
    Verifying,
    Succeeded,
    RolledBack,
    Failed,
    Cancelled,
}

impl UpdateState {
    /// Returns `true` for states that end a session.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::NoUpdate | Self::Succeeded | Self::RolledBack | Self::Failed | Self::Cancelled
        )
    }

    /// Returns `true` once a backup exists and the installation may be
    /// modified. Failures in these states must go through restore.
    pub fn is_mutating(self) -> bool {
        matches!(
            self,
            Self::BackingUp | Self::Stopping | Self::Applying | Self::Starting | Self::Verifying
        )
    }

    /// Returns `true` while the caller may still cancel outright.
    pub fn is_cancellable(self) -> bool {
        matches!(
            self,
            Self::Idle | Self::Checking | Self::UpdateAvailable | Self::Downloading | Self::Validating
        )
    }

    /// Whether `self → next` is a legal transition.
    pub fn can_transition_to(self, next: Self) -> bool {
        use UpdateState::*;
        match (self, next) {
            (Idle, Checking)
            | (Checking, NoUpdate | UpdateAvailable)
            | (UpdateAvailable, Downloading)
            | (Downloading, Validating)
            | (Validating, BackingUp)
            | (BackingUp, Stopping)
            | (Stopping, Applying)
            | (Applying, Starting)
            | (Starting, Verifying)
            | (Verifying, Succeeded) => true,
            (from, Failed) => !from.is_terminal(),
            (from, Cancelled) => from.is_cancellable(),
            (from, RolledBack) => from.is_mutating(),
            _ => false,
        }
    }
}

impl fmt::Display for UpdateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Checking => "checking",
            Self::NoUpdate => "no update",
            Self::UpdateAvailable => "update available",
            Self::Downloading => "downloading",
            Self::Validating => "validating",
            Self::BackingUp => "backing up",
            Self::Stopping => "stopping",
            Self::Applying => "applying",
            Self::Starting => "starting",
            Self::Verifying => "verifying",
            Self::Succeeded => "succeeded",
            Self::RolledBack => "rolled back",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Reason attached to [`UpdateError::Cancelled`] when the user turns down
/// an update.
pub(crate) const DECLINED_BY_USER: &str = "declined by user";

/// One `check_and_apply` attempt. Not persisted.
#[derive(Debug, Clone)]
pub struct UpdateSession {
    /// Current (or, once returned, terminal) state.
    pub state: UpdateState,
    /// Installed version when the session started.
    pub current_version: String,
    /// Release being installed, once known.
    pub target_release: Option<ReleaseInfo>,
    /// Snapshot taken before mutation, if one was taken.
    pub backup: Option<Backup>,
    /// Error that ended the session, if any.
    pub last_error: Option<UpdateError>,
    /// A cancel request arrived after mutation had begun.
    pub cancel_deferred: bool,
}

impl UpdateSession {
    pub(crate) fn new() -> Self {
        Self {
            state: UpdateState::Idle,
            current_version: String::new(),
            target_release: None,
            backup: None,
            last_error: None,
            cancel_deferred: false,
        }
    }

    /// Returns `true` if the installation ends in a good state: either the
    /// update landed or there was nothing to do.
    pub fn is_success(&self) -> bool {
        matches!(self.state, UpdateState::Succeeded | UpdateState::NoUpdate)
    }

    /// Returns `true` if the user turned the release down, as opposed to the
    /// session being cancelled by its caller.
    pub fn was_declined(&self) -> bool {
        matches!(&self.last_error, Some(UpdateError::Cancelled(reason)) if reason == DECLINED_BY_USER)
    }

    /// One-line outcome suitable for a status message.
    pub fn summary(&self) -> String {
        let target = self
            .target_release
            .as_ref()
            .map(|r| r.version.to_string())
            .unwrap_or_default();
        match self.state {
            UpdateState::Succeeded => format!("updated {} → {target}", self.current_version),
            UpdateState::NoUpdate => format!("{} is up to date", self.current_version),
            UpdateState::Cancelled => "update cancelled; nothing changed".to_owned(),
            UpdateState::RolledBack => match &self.last_error {
                Some(e) => format!(
                    "update to {target} failed ({e}); {} is still installed",
                    self.current_version
                ),
                None => format!("update to {target} rolled back"),
            },
            _ => match &self.last_error {
                Some(e) => format!("{e} ({})", e.recovery_hint()),
                None => self.state.to_string(),
            },
        }
    }
}
