//! Persisted trigger preferences.
//!
//! Tracks the auto-update preference, when the last check ran, which release
//! the user declined, and how the last session ended. Stored as JSON at
//! [`crate::app_dirs::update_state_file`] unless another path is given.

use crate::error::{Result, UpdateError};
use crate::update::session::{UpdateSession, UpdateState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// User preference for automatic updates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutoUpdatePreference {
    /// Ask before installing each update (default).
    #[default]
    Ask,
    /// Install without asking.
    Always,
    /// Never check in the background.
    Never,
}

impl std::fmt::Display for AutoUpdatePreference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ask => write!(f, "ask"),
            Self::Always => write!(f, "always"),
            Self::Never => write!(f, "never"),
        }
    }
}

/// Trigger state that survives restarts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdatePreferences {
    /// Whether background checks install, ask, or do nothing.
    pub auto_update: AutoUpdatePreference,
    /// When the last check ran.
    pub last_check: Option<DateTime<Utc>>,
    /// Release version the user declined; background checks skip it.
    pub dismissed_release: Option<String>,
    /// Terminal state of the last session.
    pub last_outcome: Option<String>,
}

impl UpdatePreferences {
    /// Load preferences. A missing or unreadable file yields the defaults.
    pub fn load(path: &Path) -> Self {
        let bytes = match std::fs::read(path) {
            Ok(b) => b,
            Err(_) => return Self::default(),
        };
        serde_json::from_slice(&bytes).unwrap_or_else(|e| {
            tracing::warn!(path = %path.display(), error = %e, "ignoring corrupt update preferences");
            Self::default()
        })
    }

    /// Persist preferences, creating the parent directory if needed.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::Config`] if the file cannot be written.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                UpdateError::Config(format!("cannot create {}: {e}", parent.display()))
            })?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| UpdateError::Config(format!("cannot serialize preferences: {e}")))?;
        std::fs::write(path, json)
            .map_err(|e| UpdateError::Config(format!("cannot write {}: {e}", path.display())))
    }

    /// Record that a check ran now.
    pub fn mark_checked(&mut self) {
        self.last_check = Some(Utc::now());
    }

    /// Returns `true` if no check ran in the last `hours` hours.
    pub fn check_is_stale(&self, hours: u64) -> bool {
        let Some(last) = self.last_check else {
            return true;
        };
        let elapsed = Utc::now().signed_duration_since(last);
        elapsed.num_hours() >= i64::try_from(hours).unwrap_or(i64::MAX)
    }

    /// Returns `true` if `version` is the release the user declined.
    pub fn is_dismissed(&self, version: &str) -> bool {
        self.dismissed_release.as_deref() == Some(version)
    }

    /// Remember how `session` ended. A declined release is dismissed.
    pub fn record_outcome(&mut self, session: &UpdateSession) {
        self.last_outcome = Some(session.state.to_string());
        if session.was_declined() {
            if let Some(release) = &session.target_release {
                self.dismissed_release = Some(release.version.to_string());
            }
        } else if session.state == UpdateState::Succeeded {
            self.dismissed_release = None;
        }
    }
}
