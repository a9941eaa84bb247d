//! Update orchestration.
//!
//! [`UpdateManager`] drives one [`UpdateSession`] at a time through the
//! lifecycle documented in [`crate::update::session`]:
//!
//! - Before `BackingUp` nothing on disk belongs to the installation, so any
//!   failure ends the session `Failed` (or `Cancelled`) with the installation
//!   untouched.
//! - From `BackingUp` on a [`Backup`] exists and every failure goes through
//!   restore. A successful restore ends `RolledBack`; a failed restore ends
//!   `Failed` with [`UpdateError::Rollback`].
//!
//! Single-flight is enforced per installation directory: a second session on
//! the same manager, or on any manager in another process that holds the
//! [`InstallLock`], returns [`UpdateError::Busy`] immediately.

use crate::config::UpdaterConfig;
use crate::error::{Result, UpdateError};
use crate::progress::{EventCallback, UpdateEvent, emit};
use crate::update::applier::{
    ArchiveApplier, ZipApplier, cleanup_staged_files, read_installed_version,
};
use crate::update::archive::ArchiveValidator;
use crate::update::backup::{Backup, BackupStore};
use crate::update::lock::InstallLock;
use crate::update::process::{LocalProcessController, ProcessController};
use crate::update::release::{
    DownloadedArchive, GitHubReleaseSource, PlatformKey, ReleaseInfo, ReleaseSource, select_asset,
};
use crate::update::session::{DECLINED_BY_USER, UpdateSession, UpdateState};
use crate::update::version::{VersionTag, is_upgrade};
use async_trait::async_trait;
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Asks the user whether a found update should be installed.
///
/// Only consulted when `check_and_apply` runs with `auto_mode = false`.
#[async_trait]
pub trait UpdateConfirmation: Send + Sync {
    /// Returns `true` to proceed with the download.
    async fn confirm(&self, current: &str, release: &ReleaseInfo) -> bool;
}

/// Installation layout and policy the manager works with.
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    /// Installation directory.
    pub install_dir: PathBuf,
    /// Files the manager may back up and overwrite, relative to `install_dir`.
    pub tracked_files: Vec<PathBuf>,
    /// Application executable, relative to `install_dir`.
    pub executable: PathBuf,
    /// Version marker, relative to `install_dir`.
    pub version_file: PathBuf,
    /// Asset naming convention to download.
    pub platform: PlatformKey,
    /// Scratch directory for downloads. Each session uses a sub-directory
    /// that is removed when the session ends.
    pub work_dir: PathBuf,
    /// Backup root.
    pub backup_dir: PathBuf,
    /// Graceful stop timeout.
    pub stop_timeout: Duration,
    /// Backups retained after a successful update.
    pub keep_backups: usize,
}

impl ManagerSettings {
    /// Settings with the default layout (`app` + `version.txt`).
    pub fn new(
        install_dir: impl Into<PathBuf>,
        work_dir: impl Into<PathBuf>,
        backup_dir: impl Into<PathBuf>,
    ) -> Self {
        let defaults = UpdaterConfig::default();
        Self {
            install_dir: install_dir.into(),
            tracked_files: defaults.tracked_files(),
            executable: PathBuf::from(&defaults.install.executable),
            version_file: PathBuf::from(&defaults.install.version_file),
            platform: defaults.release.platform,
            work_dir: work_dir.into(),
            backup_dir: backup_dir.into(),
            stop_timeout: defaults.stop_timeout(),
            keep_backups: defaults.backup.keep,
        }
    }

    /// Settings derived from a loaded config file.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::Config`] if the installation section is invalid
    /// or the installation directory cannot be resolved.
    pub fn from_config(config: &UpdaterConfig) -> Result<Self> {
        config.validate_install()?;
        Ok(Self {
            install_dir: config.install_dir()?,
            tracked_files: config.tracked_files(),
            executable: PathBuf::from(&config.install.executable),
            version_file: PathBuf::from(&config.install.version_file),
            platform: config.release.platform,
            work_dir: crate::app_dirs::downloads_dir(),
            backup_dir: config.backup_dir(),
            stop_timeout: config.stop_timeout(),
            keep_backups: config.backup.keep,
        })
    }
}

/// Result of a read-only check.
#[derive(Debug, Clone)]
pub struct CheckOutcome {
    /// Installed version string.
    pub current: String,
    /// Newest published release.
    pub latest: ReleaseInfo,
    /// Whether `latest` is newer than `current`.
    pub update_available: bool,
}

/// Cancellation bookkeeping. Both fields change under one lock so a cancel
/// request is either seen before the point of no return or deferred.
#[derive(Debug, Default)]
struct CancelFlags {
    mutating: bool,
    deferred: bool,
}

/// Control block shared between a running session and [`UpdateManager::cancel`].
#[derive(Debug)]
struct SessionControl {
    cancel: CancellationToken,
    flags: Mutex<CancelFlags>,
    state: Mutex<UpdateState>,
}

impl SessionControl {
    fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            flags: Mutex::new(CancelFlags::default()),
            state: Mutex::new(UpdateState::Idle),
        }
    }

    /// Cancel now, or record the request if mutation has begun.
    /// Returns `true` when the request was deferred.
    fn request_cancel(&self) -> bool {
        let mut flags = self.flags.lock().unwrap_or_else(|e| e.into_inner());
        if flags.mutating {
            flags.deferred = true;
            true
        } else {
            self.cancel.cancel();
            false
        }
    }

    /// Cross the point of no return. Returns `false` if a cancel arrived first.
    fn enter_mutation(&self) -> bool {
        let mut flags = self.flags.lock().unwrap_or_else(|e| e.into_inner());
        if self.cancel.is_cancelled() {
            return false;
        }
        flags.mutating = true;
        true
    }

    fn cancel_deferred(&self) -> bool {
        self.flags.lock().unwrap_or_else(|e| e.into_inner()).deferred
    }
}

/// Clears the live-session slot and releases the installation lock when a
/// session ends, however it ends.
struct LiveGuard<'a> {
    slot: &'a Mutex<Option<Arc<SessionControl>>>,
    _lock: InstallLock,
}

impl Drop for LiveGuard<'_> {
    fn drop(&mut self) {
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        *slot = None;
    }
}

/// Builder for [`UpdateManager`].
pub struct UpdateManagerBuilder {
    settings: ManagerSettings,
    source: Option<Arc<dyn ReleaseSource>>,
    process: Option<Arc<dyn ProcessController>>,
    applier: Option<Arc<dyn ArchiveApplier>>,
    backups: Option<BackupStore>,
    confirmation: Option<Arc<dyn UpdateConfirmation>>,
    events: Option<EventCallback>,
}

impl UpdateManagerBuilder {
    /// Where releases come from.
    pub fn source(mut self, source: Arc<dyn ReleaseSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// How the running application is stopped and started.
    pub fn process(mut self, process: Arc<dyn ProcessController>) -> Self {
        self.process = Some(process);
        self
    }

    /// How archive contents are written (defaults to [`ZipApplier`]).
    pub fn applier(mut self, applier: Arc<dyn ArchiveApplier>) -> Self {
        self.applier = Some(applier);
        self
    }

    /// Backup store (defaults to one rooted at `settings.backup_dir`).
    pub fn backup_store(mut self, backups: BackupStore) -> Self {
        self.backups = Some(backups);
        self
    }

    /// Interactive confirmation for non-auto sessions.
    pub fn confirmation(mut self, confirmation: Arc<dyn UpdateConfirmation>) -> Self {
        self.confirmation = Some(confirmation);
        self
    }

    /// Observer for state changes and progress.
    pub fn events(mut self, events: EventCallback) -> Self {
        self.events = Some(events);
        self
    }

    /// Finish building.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::Config`] if no process controller was supplied.
    /// A manager without a release source can still list and restore
    /// backups; `check` and `check_and_apply` then fail with
    /// [`UpdateError::Config`].
    pub fn build(self) -> Result<UpdateManager> {
        let process = self
            .process
            .ok_or_else(|| UpdateError::Config("no process controller configured".to_owned()))?;
        let applier = self
            .applier
            .unwrap_or_else(|| Arc::new(ZipApplier::new(self.settings.executable.clone())));
        let backups = self
            .backups
            .unwrap_or_else(|| BackupStore::new(self.settings.backup_dir.clone()));
        let validator = ArchiveValidator::new(
            archive_entry(&self.settings.executable),
            archive_entry(&self.settings.version_file),
        );

        Ok(UpdateManager {
            settings: self.settings,
            source: self.source,
            validator,
            backups,
            process,
            applier,
            confirmation: self.confirmation,
            events: self.events,
            live: Mutex::new(None),
        })
    }
}

fn archive_entry(path: &std::path::Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

/// Orchestrates check, download, backup, apply and verify.
pub struct UpdateManager {
    settings: ManagerSettings,
    source: Option<Arc<dyn ReleaseSource>>,
    validator: ArchiveValidator,
    backups: BackupStore,
    process: Arc<dyn ProcessController>,
    applier: Arc<dyn ArchiveApplier>,
    confirmation: Option<Arc<dyn UpdateConfirmation>>,
    events: Option<EventCallback>,
    live: Mutex<Option<Arc<SessionControl>>>,
}

impl UpdateManager {
    /// Start building a manager for `settings`.
    pub fn builder(settings: ManagerSettings) -> UpdateManagerBuilder {
        UpdateManagerBuilder {
            settings,
            source: None,
            process: None,
            applier: None,
            backups: None,
            confirmation: None,
            events: None,
        }
    }

    /// Builder prefilled with the GitHub release source, the local process
    /// controller and the configured backup store.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::Config`] if the config is invalid.
    pub fn builder_from_config(config: &UpdaterConfig) -> Result<UpdateManagerBuilder> {
        config.validate_release()?;
        let source = GitHubReleaseSource::new(&config.release, config.retry.clone())?;
        Ok(Self::local_builder(config)?.source(Arc::new(source)))
    }

    /// Builder for backup maintenance only: local process controller and
    /// backup store, no release source. The release section of the config
    /// is not consulted.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::Config`] if the installation section is invalid.
    pub fn local_builder(config: &UpdaterConfig) -> Result<UpdateManagerBuilder> {
        let settings = ManagerSettings::from_config(config)?;
        let process = LocalProcessController::from_config(config)?;
        let backups = BackupStore::new(settings.backup_dir.clone()).with_restore_retries(
            config.backup.restore_attempts,
            Duration::from_millis(config.backup.restore_delay_ms),
        );
        Ok(Self::builder(settings)
            .process(Arc::new(process))
            .backup_store(backups))
    }

    /// Settings this manager was built with.
    pub fn settings(&self) -> &ManagerSettings {
        &self.settings
    }

    /// Backup store used for snapshots.
    pub fn backups(&self) -> &BackupStore {
        &self.backups
    }

    /// State of the live session, or `None` when idle.
    pub fn current_state(&self) -> Option<UpdateState> {
        let slot = self.live.lock().unwrap_or_else(|e| e.into_inner());
        slot.as_ref()
            .map(|ctrl| *ctrl.state.lock().unwrap_or_else(|e| e.into_inner()))
    }

    /// Returns `true` while a session is live.
    pub fn is_busy(&self) -> bool {
        self.live.lock().unwrap_or_else(|e| e.into_inner()).is_some()
    }

    /// Request cancellation of the live session.
    ///
    /// Before `BackingUp` the session stops at the next step and ends
    /// `Cancelled`. Once mutation has begun the request is only recorded
    /// (`UpdateSession::cancel_deferred`) and the session runs to its
    /// terminal state. Returns `false` if no session is live.
    pub fn cancel(&self) -> bool {
        let ctrl = {
            let slot = self.live.lock().unwrap_or_else(|e| e.into_inner());
            match slot.as_ref() {
                Some(ctrl) => Arc::clone(ctrl),
                None => return false,
            }
        };
        if ctrl.request_cancel() {
            tracing::warn!("cancel requested during installation; deferring until the session ends");
            emit(self.events.as_ref(), UpdateEvent::CancelDeferred);
        } else {
            tracing::info!("cancel requested");
        }
        true
    }

    /// Compare the installed version against the newest release without
    /// changing anything.
    ///
    /// # Errors
    ///
    /// Returns the release source's error, [`UpdateError::Version`] if
    /// either version cannot be parsed, or [`UpdateError::Config`] if the
    /// manager was built without a release source.
    pub async fn check(&self) -> Result<CheckOutcome> {
        let source = self.source()?;
        let current = read_installed_version(&self.settings.install_dir, &self.settings.version_file)?;
        let current_tag = VersionTag::parse(&current)?;
        let latest = source.fetch_latest().await?;
        let update_available = is_upgrade(&current_tag, &latest.version);
        Ok(CheckOutcome {
            current,
            latest,
            update_available,
        })
    }

    /// Run one full update attempt.
    ///
    /// `auto_mode` skips the [`UpdateConfirmation`] step. It has no effect on
    /// rollback behaviour.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::Busy`] if another session holds the
    /// installation, or [`UpdateError::Config`] if the installation directory
    /// cannot be locked or no release source was configured. Every other
    /// outcome is reported through the returned session's `state` and
    /// `last_error`.
    pub async fn check_and_apply(&self, auto_mode: bool) -> Result<UpdateSession> {
        let source = Arc::clone(self.source()?);
        let (ctrl, _guard) = self.begin()?;
        let mut session = UpdateSession::new();

        let session_dir = self.settings.work_dir.join(format!(
            "session-{}-{}",
            std::process::id(),
            chrono::Utc::now().format("%Y%m%d%H%M%S%f")
        ));

        let archive = self
            .run(&mut session, &ctrl, source.as_ref(), auto_mode, &session_dir)
            .await;

        if let Some(archive) = archive {
            archive.discard();
        }
        if let Err(e) = std::fs::remove_dir_all(&session_dir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %session_dir.display(), error = %e, "failed to remove session work dir");
            }
        }

        session.cancel_deferred = ctrl.cancel_deferred();
        match session.state {
            UpdateState::Succeeded | UpdateState::NoUpdate => {
                tracing::info!(outcome = %session.summary(), "update session finished");
            }
            UpdateState::Cancelled => tracing::info!("update session cancelled"),
            _ => tracing::error!(
                state = %session.state,
                outcome = %session.summary(),
                "update session failed"
            ),
        }
        Ok(session)
    }

    /// Restore the newest backup: stop the app, put files back, start it.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::Busy`] while a session holds the installation,
    /// [`UpdateError::Backup`] if no backup exists,
    /// [`UpdateError::Process`] if the app cannot be stopped, or
    /// [`UpdateError::Rollback`] if restore fails.
    pub async fn rollback_latest(&self) -> Result<Backup> {
        let (_ctrl, _guard) = self.begin()?;
        let backup = self
            .backups
            .latest()?
            .ok_or_else(|| UpdateError::Backup("no backups available".to_owned()))?;

        if !self.process.stop(self.settings.stop_timeout).await {
            return Err(UpdateError::Process(
                "could not stop the application before restoring".to_owned(),
            ));
        }
        self.backups
            .restore(&backup, &self.settings.install_dir, &self.settings.tracked_files)
            .await?;
        if !self.process.start().await {
            tracing::warn!("restored application did not start");
        }
        Ok(backup)
    }

    fn source(&self) -> Result<&Arc<dyn ReleaseSource>> {
        self.source
            .as_ref()
            .ok_or_else(|| UpdateError::Config("no release source configured".to_owned()))
    }

    fn begin(&self) -> Result<(Arc<SessionControl>, LiveGuard<'_>)> {
        let mut slot = self.live.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_some() {
            tracing::warn!(install_dir = %self.settings.install_dir.display(), "update already in progress, rejecting");
            return Err(UpdateError::Busy(self.settings.install_dir.display().to_string()));
        }
        let lock = InstallLock::acquire(&self.settings.install_dir)?;
        let ctrl = Arc::new(SessionControl::new());
        *slot = Some(Arc::clone(&ctrl));
        Ok((
            ctrl,
            LiveGuard {
                slot: &self.live,
                _lock: lock,
            },
        ))
    }

    fn transition(&self, session: &mut UpdateSession, ctrl: &SessionControl, to: UpdateState) {
        let from = session.state;
        if !from.can_transition_to(to) {
            tracing::error!(%from, %to, "unexpected state transition");
        }
        session.state = to;
        *ctrl.state.lock().unwrap_or_else(|e| e.into_inner()) = to;
        tracing::info!(%from, %to, "update state changed");
        emit(self.events.as_ref(), UpdateEvent::StateChanged { from, to });
    }

    /// End a session that never touched the installation.
    fn abandon(&self, session: &mut UpdateSession, ctrl: &SessionControl, error: UpdateError) {
        let to = if matches!(error, UpdateError::Cancelled(_)) {
            UpdateState::Cancelled
        } else {
            UpdateState::Failed
        };
        session.last_error = Some(error);
        self.transition(session, ctrl, to);
    }

    /// Race `fut` against the session's cancellation token.
    async fn cancellable<T>(
        ctrl: &SessionControl,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        tokio::select! {
            biased;
            _ = ctrl.cancel.cancelled() => Err(UpdateError::Cancelled("cancelled by caller".to_owned())),
            result = fut => result,
        }
    }

    /// Drive the state machine. Returns the downloaded archive (if any) so
    /// the caller can delete it whatever the outcome.
    async fn run(
        &self,
        session: &mut UpdateSession,
        ctrl: &SessionControl,
        source: &dyn ReleaseSource,
        auto_mode: bool,
        session_dir: &std::path::Path,
    ) -> Option<DownloadedArchive> {
        let settings = &self.settings;

        // Checking
        self.transition(session, ctrl, UpdateState::Checking);
        let current_tag = match read_installed_version(&settings.install_dir, &settings.version_file)
            .and_then(|current| {
                let tag = VersionTag::parse(&current)?;
                Ok((current, tag))
            }) {
            Ok((current, tag)) => {
                session.current_version = current;
                tag
            }
            Err(e) => {
                self.abandon(session, ctrl, e);
                return None;
            }
        };

        let release = match Self::cancellable(ctrl, source.fetch_latest()).await {
            Ok(release) => release,
            Err(e) => {
                self.abandon(session, ctrl, e);
                return None;
            }
        };

        let upgrade = is_upgrade(&current_tag, &release.version);
        session.target_release = Some(release.clone());
        if !upgrade {
            tracing::info!(current = %session.current_version, latest = %release.version, "already up to date");
            self.transition(session, ctrl, UpdateState::NoUpdate);
            return None;
        }

        self.transition(session, ctrl, UpdateState::UpdateAvailable);
        emit(
            self.events.as_ref(),
            UpdateEvent::UpdateAvailable {
                current: session.current_version.clone(),
                latest: release.version.to_string(),
            },
        );

        if !auto_mode {
            if let Some(confirmation) = &self.confirmation {
                let confirmed = Self::cancellable(ctrl, async {
                    Ok(confirmation.confirm(&session.current_version, &release).await)
                })
                .await;
                match confirmed {
                    Ok(true) => {}
                    Ok(false) => {
                        self.abandon(session, ctrl, UpdateError::Cancelled(DECLINED_BY_USER.to_owned()));
                        return None;
                    }
                    Err(e) => {
                        self.abandon(session, ctrl, e);
                        return None;
                    }
                }
            }
        }

        // Downloading
        self.transition(session, ctrl, UpdateState::Downloading);
        let asset = match select_asset(&release, settings.platform) {
            Ok(asset) => asset,
            Err(e) => {
                self.abandon(session, ctrl, e);
                return None;
            }
        };
        if let Err(e) = std::fs::create_dir_all(session_dir) {
            self.abandon(
                session,
                ctrl,
                UpdateError::Download(format!("cannot create {}: {e}", session_dir.display())),
            );
            return None;
        }
        let archive = match Self::cancellable(
            ctrl,
            source.download(&asset, session_dir, self.events.as_ref()),
        )
        .await
        {
            Ok(archive) => archive,
            Err(e) => {
                self.abandon(session, ctrl, e);
                return None;
            }
        };

        // Validating
        self.transition(session, ctrl, UpdateState::Validating);
        let validated = {
            let validator = self.validator.clone();
            let path = archive.path.clone();
            tokio::task::spawn_blocking(move || validator.validate_path(&path))
                .await
                .unwrap_or_else(|e| Err(UpdateError::Download(format!("validation task failed: {e}"))))
        };
        match validated {
            Ok(true) => {}
            Ok(false) => {
                self.abandon(
                    session,
                    ctrl,
                    UpdateError::Download(format!("{} is not a valid update archive", asset.name)),
                );
                return Some(archive);
            }
            Err(e) => {
                self.abandon(session, ctrl, e);
                return Some(archive);
            }
        }

        // Point of no return for cancellation.
        if !ctrl.enter_mutation() {
            self.abandon(session, ctrl, UpdateError::Cancelled("cancelled by caller".to_owned()));
            return Some(archive);
        }

        // BackingUp
        self.transition(session, ctrl, UpdateState::BackingUp);
        let snapshot = {
            let backups = self.backups.clone();
            let install_dir = settings.install_dir.clone();
            let tracked = settings.tracked_files.clone();
            let version = session.current_version.clone();
            tokio::task::spawn_blocking(move || backups.snapshot(&install_dir, &tracked, &version))
                .await
                .unwrap_or_else(|e| Err(UpdateError::Backup(format!("snapshot task failed: {e}"))))
        };
        let backup = match snapshot {
            Ok(backup) => backup,
            Err(e) => {
                // Nothing was modified yet, so there is nothing to restore.
                session.last_error = Some(e);
                self.transition(session, ctrl, UpdateState::Failed);
                return Some(archive);
            }
        };
        session.backup = Some(backup.clone());

        if let Err(e) = self.install(session, ctrl, &archive, &release).await {
            self.roll_back(session, ctrl, &backup, e).await;
            return Some(archive);
        }

        self.transition(session, ctrl, UpdateState::Succeeded);
        let purged = self.backups.rotate(settings.keep_backups);
        if purged > 0 {
            tracing::debug!(purged, keep = settings.keep_backups, "old backups rotated");
        }
        Some(archive)
    }

    /// Stopping → Applying → Starting → Verifying.
    async fn install(
        &self,
        session: &mut UpdateSession,
        ctrl: &SessionControl,
        archive: &DownloadedArchive,
        release: &ReleaseInfo,
    ) -> Result<()> {
        let settings = &self.settings;

        self.transition(session, ctrl, UpdateState::Stopping);
        if !self.process.stop(settings.stop_timeout).await {
            return Err(UpdateError::Process(
                "could not confirm the application stopped".to_owned(),
            ));
        }

        self.transition(session, ctrl, UpdateState::Applying);
        let applied = self
            .applier
            .apply(
                &archive.path,
                &settings.install_dir,
                &settings.tracked_files,
                self.events.as_ref(),
            )
            .await?;
        tracing::info!(files = applied.len(), "update files applied");

        self.transition(session, ctrl, UpdateState::Starting);
        if !self.process.start().await {
            return Err(UpdateError::Process(
                "updated application failed to start".to_owned(),
            ));
        }

        self.transition(session, ctrl, UpdateState::Verifying);
        let marker = read_installed_version(&settings.install_dir, &settings.version_file)
            .map_err(|e| UpdateError::Install(format!("cannot verify installation: {e}")))?;
        let installed = VersionTag::parse(&marker).map_err(|e| {
            UpdateError::Install(format!("installed version marker is invalid: {e}"))
        })?;
        if installed != release.version {
            return Err(UpdateError::Install(format!(
                "version marker reads {installed}, expected {}",
                release.version
            )));
        }
        Ok(())
    }

    /// Stop whatever is running, put the backup back, restart best-effort.
    ///
    /// A failure while still `Stopping` happened before any file was
    /// written, so the installation is left exactly as it is.
    async fn roll_back(
        &self,
        session: &mut UpdateSession,
        ctrl: &SessionControl,
        backup: &Backup,
        cause: UpdateError,
    ) {
        let settings = &self.settings;
        if session.state == UpdateState::Stopping {
            tracing::error!(error = %cause, "update aborted before applying; installation untouched");
            session.last_error = Some(cause);
            self.transition(session, ctrl, UpdateState::RolledBack);
            return;
        }
        tracing::error!(state = %session.state, error = %cause, "update failed, rolling back");

        if !self.process.stop(settings.stop_timeout).await {
            tracing::warn!("application may still be running during restore");
        }
        cleanup_staged_files(&settings.install_dir, &settings.tracked_files);

        match self
            .backups
            .restore(backup, &settings.install_dir, &settings.tracked_files)
            .await
        {
            Ok(()) => {
                if !self.process.start().await {
                    tracing::warn!("restored application did not start");
                }
                session.last_error = Some(cause);
                self.transition(session, ctrl, UpdateState::RolledBack);
            }
            Err(restore_err) => {
                let detail = match restore_err {
                    UpdateError::Rollback(msg) => msg,
                    other => other.to_string(),
                };
                tracing::error!(
                    backup = %backup.location.display(),
                    "rollback failed; manual reinstall required"
                );
                session.last_error = Some(UpdateError::Rollback(format!(
                    "{detail} (while recovering from: {cause})"
                )));
                self.transition(session, ctrl, UpdateState::Failed);
            }
        }
    }
}
