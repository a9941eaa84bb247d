//! Background update trigger.
//!
//! Checks on a fixed interval, honouring the persisted
//! [`AutoUpdatePreference`]: `never` skips, `always` installs without
//! asking, `ask` goes through the manager's confirmation.

use crate::update::manager::UpdateManager;
use crate::update::preferences::{AutoUpdatePreference, UpdatePreferences};
use crate::update::session::UpdateSession;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Run a single background check if one is due.
///
/// Returns the finished session, or `None` if the check was skipped.
pub async fn run_once(
    manager: &UpdateManager,
    prefs_path: &Path,
    stale_after_hours: u64,
) -> Option<UpdateSession> {
    let mut prefs = UpdatePreferences::load(prefs_path);
    if prefs.auto_update == AutoUpdatePreference::Never {
        tracing::debug!("background updates disabled");
        return None;
    }
    if !prefs.check_is_stale(stale_after_hours) {
        tracing::debug!(last_check = ?prefs.last_check, "update check not due yet");
        return None;
    }

    if prefs.dismissed_release.is_some() {
        match manager.check().await {
            Ok(outcome) if prefs.is_dismissed(&outcome.latest.version.to_string()) => {
                tracing::info!(version = %outcome.latest.version, "latest release was dismissed, skipping");
                prefs.mark_checked();
                save(&prefs, prefs_path);
                return None;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "background update check failed");
                return None;
            }
        }
    }

    let auto_mode = prefs.auto_update == AutoUpdatePreference::Always;
    match manager.check_and_apply(auto_mode).await {
        Ok(session) => {
            prefs.mark_checked();
            prefs.record_outcome(&session);
            save(&prefs, prefs_path);
            Some(session)
        }
        Err(e) => {
            tracing::debug!(error = %e, "background update skipped");
            None
        }
    }
}

fn save(prefs: &UpdatePreferences, path: &Path) {
    if let Err(e) = prefs.save(path) {
        tracing::warn!(error = %e, "cannot persist update preferences");
    }
}

/// Run background checks until `cancel` fires. The first tick is immediate.
///
/// Ticks come every `interval` (at most hourly) and a check runs when the
/// last one is at least `interval` old, rounded down to whole hours, so a
/// restart does not reset the schedule.
///
/// Cancelling while a session is running forwards the cancel to the manager
/// and waits for the session to end; an installation in progress is never
/// abandoned.
///
/// ```rust,ignore
/// let cancel = CancellationToken::new();
/// tokio::spawn(run_periodic(manager, prefs_path, Duration::from_secs(24 * 3600), cancel.child_token()));
/// ```
pub async fn run_periodic(
    manager: Arc<UpdateManager>,
    prefs_path: PathBuf,
    interval: Duration,
    cancel: CancellationToken,
) {
    let stale_after_hours = interval.as_secs() / 3600;
    let tick = interval.clamp(Duration::from_millis(1), Duration::from_secs(3600));
    let mut ticker = tokio::time::interval(tick);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    tracing::info!(interval_secs = interval.as_secs(), "update trigger started");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let check = run_once(&manager, &prefs_path, stale_after_hours);
        tokio::pin!(check);
        tokio::select! {
            session = &mut check => {
                if let Some(session) = session {
                    tracing::info!(state = %session.state, "background update finished");
                }
            }
            _ = cancel.cancelled() => {
                manager.cancel();
                let _ = check.await;
                break;
            }
        }
    }

    tracing::info!("update trigger stopped");
}
