//! Stopping and restarting the installed application.
//!
//! The updater never inspects the application beyond its liveness. It finds
//! processes by image name (and on Linux also by the executable they run),
//! asks them to exit, escalates to a forced kill when the graceful window
//! expires and relaunches the executable detached from the updater's own
//! process group.

use crate::config::UpdaterConfig;
use crate::error::Result;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

/// Bound on each helper command (`pgrep`, `tasklist`, `taskkill`).
const HELPER_TIMEOUT: Duration = Duration::from_secs(30);

/// How long a forced kill is given to take effect.
const FORCE_GRACE: Duration = Duration::from_secs(5);

/// A freshly launched process that exits within this window with a failure
/// status counts as a failed start.
const STARTUP_GRACE: Duration = Duration::from_millis(250);

/// Longest process name the kernel keeps, which is all `pgrep -x` can match.
#[cfg(target_os = "linux")]
const COMM_MAX: usize = 15;
#[cfg(target_os = "macos")]
const COMM_MAX: usize = 16;
#[cfg(all(unix, not(any(target_os = "linux", target_os = "macos"))))]
const COMM_MAX: usize = 19;

/// Controls the running application instance.
#[async_trait]
pub trait ProcessController: Send + Sync {
    /// Stop every running instance, escalating to a forced kill after
    /// `timeout`.
    ///
    /// Returns `false` if the application cannot be confirmed stopped.
    /// Returns `true` if it was not running to begin with.
    async fn stop(&self, timeout: Duration) -> bool;

    /// Launch the installed executable detached from the updater.
    ///
    /// Returns `false` if the launch fails.
    async fn start(&self) -> bool;
}

/// [`ProcessController`] for an application on the local machine.
#[derive(Debug, Clone)]
pub struct LocalProcessController {
    executable: PathBuf,
    process_name: String,
    poll_interval: Duration,
}

impl LocalProcessController {
    /// Controller for `executable`, matching running processes by
    /// `process_name`.
    pub fn new(executable: impl Into<PathBuf>, process_name: impl Into<String>) -> Self {
        Self {
            executable: executable.into(),
            process_name: process_name.into(),
            poll_interval: Duration::from_millis(250),
        }
    }

    /// Controller for the configured installation.
    ///
    /// # Errors
    ///
    /// Returns an error if the installation directory cannot be resolved.
    pub fn from_config(config: &UpdaterConfig) -> Result<Self> {
        let executable = config.install_dir()?.join(&config.install.executable);
        Ok(Self::new(executable, config.process_name()))
    }

    /// Executable this controller launches.
    pub fn executable(&self) -> &Path {
        &self.executable
    }

    async fn wait_until_gone(&self, within: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + within;
        loop {
            match self.running_pids().await {
                Ok(pids) if pids.is_empty() => return true,
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "cannot query running processes");
                    return false;
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    #[cfg(unix)]
    async fn running_pids(&self) -> std::result::Result<Vec<u32>, String> {
        let pattern = comm_name(&self.process_name);
        let output = run_helper("pgrep", &["-x", pattern]).await?;
        // pgrep exits 1 when nothing matches.
        let pids = match output.status.code() {
            Some(0) | Some(1) => parse_pids(
                &String::from_utf8_lossy(&output.stdout),
                std::process::id(),
            ),
            other => return Err(format!("pgrep exited with {other:?}")),
        };

        #[cfg(target_os = "linux")]
        let pids = {
            let truncated = pattern.len() < self.process_name.len();
            let name = self.process_name.clone();
            let executable = self.executable.clone();
            tokio::task::spawn_blocking(move || {
                procfs::refine(pids, &name, truncated, &executable)
            })
            .await
            .map_err(|e| format!("process scan failed: {e}"))?
        };

        Ok(pids)
    }

    #[cfg(windows)]
    async fn running_pids(&self) -> std::result::Result<Vec<u32>, String> {
        let filter = format!("IMAGENAME eq {}", self.process_name);
        let output = run_helper("tasklist", &["/FI", &filter, "/FO", "CSV", "/NH"]).await?;
        if !output.status.success() {
            return Err(format!("tasklist exited with {:?}", output.status.code()));
        }
        Ok(parse_tasklist_csv(
            &String::from_utf8_lossy(&output.stdout),
            std::process::id(),
        ))
    }

    #[cfg(unix)]
    async fn signal(&self, pids: &[u32], force: bool) {
        let sig = if force { libc::SIGKILL } else { libc::SIGTERM };
        for &pid in pids {
            let Ok(raw) = i32::try_from(pid) else { continue };
            // SAFETY: kill(2) has no memory-safety preconditions.
            let rc = unsafe { libc::kill(raw, sig) };
            if rc != 0 {
                tracing::debug!(pid, force, "signal not delivered (process may have exited)");
            }
        }
    }

    #[cfg(windows)]
    async fn signal(&self, pids: &[u32], force: bool) {
        for &pid in pids {
            let pid_arg = pid.to_string();
            let mut args = vec!["/PID", pid_arg.as_str(), "/T"];
            if force {
                args.push("/F");
            }
            if let Err(e) = run_helper("taskkill", &args).await {
                tracing::debug!(pid, force, error = %e, "taskkill failed");
            }
        }
    }
}

#[async_trait]
impl ProcessController for LocalProcessController {
    async fn stop(&self, timeout: Duration) -> bool {
        let pids = match self.running_pids().await {
            Ok(pids) => pids,
            Err(e) => {
                tracing::warn!(process = %self.process_name, error = %e, "cannot determine whether the application is running");
                return false;
            }
        };
        if pids.is_empty() {
            tracing::debug!(process = %self.process_name, "application not running");
            return true;
        }

        tracing::info!(process = %self.process_name, ?pids, "stopping application");
        self.signal(&pids, false).await;
        if self.wait_until_gone(timeout).await {
            tracing::info!(process = %self.process_name, "application stopped");
            return true;
        }

        tracing::warn!(
            process = %self.process_name,
            timeout_secs = timeout.as_secs(),
            "graceful stop timed out, forcing termination"
        );
        let remaining = self.running_pids().await.unwrap_or(pids);
        self.signal(&remaining, true).await;
        let stopped = self.wait_until_gone(FORCE_GRACE).await;
        if !stopped {
            tracing::error!(process = %self.process_name, "application still running after forced termination");
        }
        stopped
    }

    async fn start(&self) -> bool {
        if !self.executable.is_file() {
            tracing::error!(path = %self.executable.display(), "executable not found");
            return false;
        }

        let mut cmd = tokio::process::Command::new(&self.executable);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        if let Some(dir) = self.executable.parent() {
            cmd.current_dir(dir);
        }
        #[cfg(unix)]
        {
            cmd.process_group(0);
        }
        #[cfg(windows)]
        {
            const DETACHED_PROCESS: u32 = 0x0000_0008;
            const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
            cmd.creation_flags(DETACHED_PROCESS | CREATE_NEW_PROCESS_GROUP);
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(path = %self.executable.display(), error = %e, "cannot launch application");
                return false;
            }
        };

        tokio::time::sleep(STARTUP_GRACE).await;
        match child.try_wait() {
            Ok(Some(status)) if !status.success() => {
                tracing::error!(path = %self.executable.display(), %status, "application exited immediately");
                false
            }
            _ => {
                tracing::info!(path = %self.executable.display(), pid = ?child.id(), "application started");
                true
            }
        }
    }
}

async fn run_helper(program: &str, args: &[&str]) -> std::result::Result<std::process::Output, String> {
    let fut = tokio::process::Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output();
    match tokio::time::timeout(HELPER_TIMEOUT, fut).await {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(e)) => Err(format!("cannot run {program}: {e}")),
        Err(_) => Err(format!("{program} timed out after {}s", HELPER_TIMEOUT.as_secs())),
    }
}

/// `name` cut to what the kernel records as the process name.
#[cfg(unix)]
fn comm_name(name: &str) -> &str {
    if name.len() <= COMM_MAX {
        return name;
    }
    let mut end = COMM_MAX;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}

/// Process lookups through `/proc`.
#[cfg(target_os = "linux")]
mod procfs {
    use std::path::{Path, PathBuf};

    /// Combine `pgrep` matches with processes running `executable`.
    ///
    /// A match on a truncated name is kept only if the full name agrees.
    /// Zombies are dropped: they hold no files and cannot be signalled away.
    pub(super) fn refine(candidates: Vec<u32>, name: &str, truncated: bool, executable: &Path) -> Vec<u32> {
        let own_pid = std::process::id();
        let mut pids: Vec<u32> = candidates
            .into_iter()
            .filter(|&pid| !truncated || argv0_is(pid, name))
            .collect();
        pids.extend(running_executable(executable));
        pids.sort_unstable();
        pids.dedup();
        pids.retain(|&pid| pid != own_pid && !is_zombie(pid));
        pids
    }

    fn argv0_is(pid: u32, name: &str) -> bool {
        let Ok(cmdline) = std::fs::read(format!("/proc/{pid}/cmdline")) else {
            return false;
        };
        let argv0 = cmdline.split(|&b| b == 0).next().unwrap_or_default();
        let argv0 = String::from_utf8_lossy(argv0);
        Path::new(argv0.as_ref()).file_name().is_some_and(|n| n == name)
    }

    /// Pids whose `/proc/<pid>/exe` is `executable`, including processes
    /// still running a binary that has since been replaced.
    fn running_executable(executable: &Path) -> Vec<u32> {
        let wanted = std::fs::canonicalize(executable).unwrap_or_else(|_| executable.to_path_buf());
        let Ok(entries) = std::fs::read_dir("/proc") else {
            return Vec::new();
        };
        entries
            .filter_map(|entry| entry.ok()?.file_name().to_str()?.parse::<u32>().ok())
            .filter(|pid| {
                std::fs::read_link(format!("/proc/{pid}/exe"))
                    .is_ok_and(|exe| strip_deleted(exe) == wanted)
            })
            .collect()
    }

    fn strip_deleted(exe: PathBuf) -> PathBuf {
        match exe.to_str().and_then(|s| s.strip_suffix(" (deleted)")) {
            Some(live) => PathBuf::from(live),
            None => exe,
        }
    }

    fn is_zombie(pid: u32) -> bool {
        std::fs::read_to_string(format!("/proc/{pid}/stat"))
            .ok()
            .and_then(|stat| stat_state(&stat))
            .is_some_and(|state| state == 'Z')
    }

    /// State letter from `/proc/<pid>/stat`. The name field may itself
    /// contain parentheses, so the state follows the last `)`.
    pub(super) fn stat_state(stat: &str) -> Option<char> {
        let rest = &stat[stat.rfind(')')? + 1..];
        rest.split_whitespace().next()?.chars().next()
    }
}

/// One pid per line; the updater's own pid is never a target.
#[cfg_attr(windows, allow(dead_code))]
fn parse_pids(stdout: &str, own_pid: u32) -> Vec<u32> {
    stdout
        .lines()
        .filter_map(|line| line.trim().parse::<u32>().ok())
        .filter(|&pid| pid != own_pid)
        .collect()
}

/// `"image.exe","1234","Console","1","10,000 K"` per line.
#[cfg_attr(unix, allow(dead_code))]
fn parse_tasklist_csv(stdout: &str, own_pid: u32) -> Vec<u32> {
    stdout
        .lines()
        .filter_map(|line| {
            let mut fields = line.split("\",\"");
            fields.next()?;
            fields.next()?.trim_matches('"').parse::<u32>().ok()
        })
        .filter(|&pid| pid != own_pid)
        .collect()
}
