//! CLI binary for updraft.

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncBufReadExt;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use updraft::progress::format_size;
use updraft::update::{ReleaseInfo, UpdateConfirmation, trigger};
use updraft::{EventCallback, UpdateError, UpdateEvent, UpdateManager, UpdaterConfig, app_dirs};

/// How long the confirmation prompt waits before proceeding on its own.
const PROMPT_TIMEOUT: Duration = Duration::from_secs(30);

/// Updraft: keep a locally installed application up to date.
#[derive(Parser)]
#[command(name = "updraft", version, about)]
struct Cli {
    /// Path to TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Subcommand to run.
    #[command(subcommand)]
    command: Command,
}

/// Available commands.
#[derive(Subcommand)]
enum Command {
    /// Report the installed and latest versions without changing anything.
    Check,

    /// Check for an update and install it.
    Apply {
        /// Install without asking for confirmation.
        #[arg(long)]
        auto: bool,
    },

    /// Restore the most recent backup.
    Rollback,

    /// List available backups, newest first.
    Backups,

    /// Check periodically until interrupted.
    Watch,
}

impl Command {
    /// Whether the command talks to the release index. `rollback` and
    /// `backups` work offline with only the installation section set.
    fn needs_release_index(&self) -> bool {
        matches!(self, Self::Check | Self::Apply { .. } | Self::Watch)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let _log_guard = init_tracing();
    let cli = Cli::parse();

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(UpdaterConfig::default_config_path);
    let config = if config_path.exists() {
        UpdaterConfig::from_file(&config_path)?
    } else {
        UpdaterConfig::default()
    };
    let valid = if cli.command.needs_release_index() {
        config.validate()
    } else {
        config.validate_install()
    };
    if let Err(e) = valid {
        eprintln!("{e}");
        eprintln!("Edit {} and try again.", config_path.display());
        return Ok(ExitCode::FAILURE);
    }

    match cli.command {
        Command::Check => run_check(&config).await,
        Command::Apply { auto } => run_apply(&config, auto).await,
        Command::Rollback => run_rollback(&config).await,
        Command::Backups => list_backups(&config),
        Command::Watch => run_watch(&config).await,
    }
}

/// Console output plus a persistent `update.log` in the logs directory.
fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = || {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("updraft=info,reqwest=warn"))
    };
    let console = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);

    let logs_dir = app_dirs::logs_dir();
    if std::fs::create_dir_all(&logs_dir).is_err() {
        tracing_subscriber::registry()
            .with(filter())
            .with(console)
            .init();
        return None;
    }

    let file_appender = tracing_appender::rolling::never(&logs_dir, "update.log");
    let (writer, guard) = tracing_appender::non_blocking(file_appender);
    let file = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(filter())
        .with(console)
        .with(file)
        .init();
    Some(guard)
}

async fn run_check(config: &UpdaterConfig) -> anyhow::Result<ExitCode> {
    let manager = UpdateManager::builder_from_config(config)?.build()?;
    let outcome = manager.check().await?;
    println!("Installed: {}", outcome.current);
    println!("Latest:    {} ({})", outcome.latest.version, outcome.latest.tag);
    if outcome.update_available {
        println!("An update is available. Run `updraft apply` to install it.");
    } else {
        println!("Up to date.");
    }
    Ok(ExitCode::SUCCESS)
}

async fn run_apply(config: &UpdaterConfig, auto: bool) -> anyhow::Result<ExitCode> {
    let manager = Arc::new(
        UpdateManager::builder_from_config(config)?
            .confirmation(Arc::new(StdinConfirmation))
            .events(console_events())
            .build()?,
    );

    let cancel_target = Arc::clone(&manager);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received Ctrl+C, cancelling update");
            cancel_target.cancel();
        }
    });

    let session = match manager.check_and_apply(auto).await {
        Ok(session) => session,
        Err(e @ UpdateError::Busy(_)) => {
            eprintln!("{e}");
            return Ok(ExitCode::FAILURE);
        }
        Err(e) => return Err(e.into()),
    };

    if let Some(err) = &session.last_error {
        if err.is_fatal() {
            eprintln!("\nFATAL: {err}");
            eprintln!("{}", err.recovery_hint());
            if let Some(backup) = &session.backup {
                eprintln!("Backup kept at {}", backup.location.display());
            }
            return Ok(ExitCode::FAILURE);
        }
    }

    println!("{}", session.summary());
    if session.is_success() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}

async fn run_rollback(config: &UpdaterConfig) -> anyhow::Result<ExitCode> {
    let manager = UpdateManager::local_builder(config)?.build()?;
    match manager.rollback_latest().await {
        Ok(backup) => {
            println!(
                "Restored {} from backup taken {}",
                backup.saved_version,
                backup.timestamp.format("%Y-%m-%d %H:%M:%S UTC")
            );
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            eprintln!("{e}");
            eprintln!("{}", e.recovery_hint());
            Ok(ExitCode::FAILURE)
        }
    }
}

fn list_backups(config: &UpdaterConfig) -> anyhow::Result<ExitCode> {
    let manager = UpdateManager::local_builder(config)?.build()?;
    let backups = manager.backups().list()?;
    if backups.is_empty() {
        println!("No backups in {}", manager.backups().root().display());
        return Ok(ExitCode::SUCCESS);
    }
    for backup in backups {
        println!(
            "{}  {:<12} {} file(s)  {}",
            backup.timestamp.format("%Y-%m-%d %H:%M:%S"),
            backup.saved_version,
            backup.saved_files.len(),
            backup.location.display()
        );
    }
    Ok(ExitCode::SUCCESS)
}

async fn run_watch(config: &UpdaterConfig) -> anyhow::Result<ExitCode> {
    let manager = Arc::new(
        UpdateManager::builder_from_config(config)?
            .confirmation(Arc::new(StdinConfirmation))
            .build()?,
    );
    let cancel = CancellationToken::new();

    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received Ctrl+C, shutting down...");
            cancel_clone.cancel();
        }
    });

    let interval = Duration::from_secs(config.schedule.check_interval_hours.max(1) * 3600);
    println!(
        "Checking every {}h. Press Ctrl+C to stop.",
        config.schedule.check_interval_hours.max(1)
    );
    trigger::run_periodic(manager, app_dirs::update_state_file(), interval, cancel).await;
    Ok(ExitCode::SUCCESS)
}

/// Renders session events on the terminal.
fn console_events() -> EventCallback {
    let pb = ProgressBar::hidden();
    if let Ok(style) = ProgressStyle::with_template(
        "  {msg} [{bar:30}] {bytes}/{total_bytes} {bytes_per_sec} ETA {eta}",
    ) {
        pb.set_style(style);
    }

    Arc::new(move |event| match event {
        UpdateEvent::StateChanged { to, .. } => pb.println(format!("→ {to}")),
        UpdateEvent::UpdateAvailable { current, latest } => {
            pb.println(format!("Update available: {current} → {latest}"));
        }
        UpdateEvent::DownloadStarted { asset, total_bytes } => {
            pb.reset();
            pb.set_length(total_bytes.unwrap_or(0));
            pb.set_message(asset);
            pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
        }
        UpdateEvent::DownloadProgress {
            bytes_downloaded, ..
        } => pb.set_position(bytes_downloaded),
        UpdateEvent::DownloadComplete { asset, size_bytes } => {
            pb.finish_and_clear();
            pb.println(format!("Downloaded {asset} ({})", format_size(size_bytes)));
        }
        UpdateEvent::FileApplied { path } => pb.println(format!("  updated {path}")),
        UpdateEvent::CancelDeferred => {
            pb.println("Installation in progress; will stop once it is safe.");
        }
    })
}

/// Y/N prompt on stdin. Proceeds when nobody answers in time.
struct StdinConfirmation;

#[async_trait]
impl UpdateConfirmation for StdinConfirmation {
    async fn confirm(&self, current: &str, release: &ReleaseInfo) -> bool {
        println!(
            "Install {} over {current}? [Y/n] (continuing automatically in {}s)",
            release.version,
            PROMPT_TIMEOUT.as_secs()
        );
        let mut line = String::new();
        let mut stdin = tokio::io::BufReader::new(tokio::io::stdin());
        match tokio::time::timeout(PROMPT_TIMEOUT, stdin.read_line(&mut line)).await {
            Ok(Ok(_)) => answer_is_yes(&line),
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "cannot read confirmation, proceeding");
                true
            }
            Err(_) => {
                println!("No answer, proceeding with the update.");
                true
            }
        }
    }
}

fn answer_is_yes(line: &str) -> bool {
    !matches!(line.trim().to_ascii_lowercase().as_str(), "n" | "no")
}
