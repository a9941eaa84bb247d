//! Shared helpers for integration tests.

use async_trait::async_trait;
use serde_json::json;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use updraft::config::ReleaseConfig;
use updraft::progress::EventCallback;
use updraft::update::{
    ArchiveApplier, GitHubReleaseSource, ManagerSettings, PlatformKey, ProcessController,
    RetryPolicy, ZipApplier,
};
use updraft::{Result, UpdateError};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Path of the "latest release" endpoint on the mock server.
pub(crate) const LATEST_PATH: &str = "/repos/acme/app/releases/latest";

/// Build an in-memory zip archive.
pub(crate) fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default();
    for (name, data) in entries {
        writer.start_file(*name, options).expect("start zip entry");
        writer.write_all(data).expect("write zip entry");
    }
    writer.finish().expect("finish zip").into_inner()
}

/// Archive carrying a new `app` binary and a version marker.
pub(crate) fn release_archive(version: &str) -> Vec<u8> {
    let app = format!("app {version}");
    zip_bytes(&[("app", app.as_bytes()), ("version.txt", version.as_bytes())])
}

/// A temporary installation (`app` + `version.txt`) plus scratch space for
/// downloads and backups.
pub(crate) struct InstallFixture {
    pub install: tempfile::TempDir,
    pub scratch: tempfile::TempDir,
}

impl InstallFixture {
    pub(crate) fn new(version: &str) -> Self {
        let install = tempfile::tempdir().expect("create install dir");
        std::fs::write(install.path().join("app"), format!("app {version}")).expect("write app");
        std::fs::write(install.path().join("version.txt"), version).expect("write marker");
        Self {
            install,
            scratch: tempfile::tempdir().expect("create scratch dir"),
        }
    }

    pub(crate) fn settings(&self) -> ManagerSettings {
        let mut settings = ManagerSettings::new(
            self.install.path(),
            self.scratch.path().join("work"),
            self.scratch.path().join("backups"),
        );
        settings.platform = PlatformKey::Linux;
        settings.executable = PathBuf::from("app");
        settings.tracked_files = vec![PathBuf::from("app"), PathBuf::from("version.txt")];
        settings.stop_timeout = Duration::from_secs(1);
        settings
    }

    pub(crate) fn read(&self, rel: &str) -> String {
        std::fs::read_to_string(self.install.path().join(rel)).expect("read installed file")
    }

    pub(crate) fn backup_root(&self) -> PathBuf {
        self.scratch.path().join("backups")
    }
}

/// Retry policy with no delays so retry tests run instantly.
pub(crate) fn instant_retry(attempts: u32) -> RetryPolicy {
    RetryPolicy::new()
        .with_max_attempts(attempts)
        .with_base_delay_ms(0)
        .with_max_delay_ms(0)
}

/// GitHub release source pointed at the mock server.
pub(crate) fn github_source(server: &MockServer, attempts: u32) -> GitHubReleaseSource {
    let config = ReleaseConfig {
        api_url: format!("{}{LATEST_PATH}", server.uri()),
        platform: PlatformKey::Linux,
        request_timeout_secs: 5,
        download_timeout_secs: 5,
        ..ReleaseConfig::default()
    };
    GitHubReleaseSource::new(&config, instant_retry(attempts)).expect("build source")
}

/// Mount a release with one Linux asset served from the same server.
pub(crate) async fn mount_release(server: &MockServer, tag: &str, archive: Vec<u8>) {
    let asset_path = format!("/download/{tag}/app-linux.zip");
    Mock::given(method("GET"))
        .and(path(LATEST_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "tag_name": tag,
            "assets": [
                {
                    "name": "app-windows.zip",
                    "browser_download_url": format!("{}/download/{tag}/app-windows.zip", server.uri()),
                },
                {
                    "name": "app-linux.zip",
                    "browser_download_url": format!("{}{asset_path}", server.uri()),
                    "size": archive.len(),
                }
            ]
        })))
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path(asset_path))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(archive))
        .mount(server)
        .await;
}

/// Process controller that records calls and never touches real processes.
#[derive(Debug)]
pub(crate) struct FakeProcess {
    pub stops: AtomicUsize,
    pub starts: AtomicUsize,
    pub stop_ok: AtomicBool,
    pub start_ok: AtomicBool,
}

impl FakeProcess {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            stops: AtomicUsize::new(0),
            starts: AtomicUsize::new(0),
            stop_ok: AtomicBool::new(true),
            start_ok: AtomicBool::new(true),
        })
    }

    pub(crate) fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub(crate) fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProcessController for FakeProcess {
    async fn stop(&self, _timeout: Duration) -> bool {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.stop_ok.load(Ordering::SeqCst)
    }

    async fn start(&self) -> bool {
        self.starts.fetch_add(1, Ordering::SeqCst);
        self.start_ok.load(Ordering::SeqCst)
    }
}

/// Applies the first `fail_after` tracked files, then fails.
pub(crate) struct FailingApplier {
    pub inner: ZipApplier,
    pub fail_after: usize,
}

#[async_trait]
impl ArchiveApplier for FailingApplier {
    async fn apply(
        &self,
        archive: &Path,
        install_dir: &Path,
        tracked: &[PathBuf],
        events: Option<&EventCallback>,
    ) -> Result<Vec<PathBuf>> {
        let head = &tracked[..self.fail_after.min(tracked.len())];
        self.inner.apply(archive, install_dir, head, events).await?;
        Err(UpdateError::Install("simulated failure while copying".to_owned()))
    }
}

/// Signals `entered` once applying starts, then waits for `release`.
pub(crate) struct GatedApplier {
    pub inner: ZipApplier,
    pub entered: Arc<Notify>,
    pub release: Arc<Notify>,
}

#[async_trait]
impl ArchiveApplier for GatedApplier {
    async fn apply(
        &self,
        archive: &Path,
        install_dir: &Path,
        tracked: &[PathBuf],
        events: Option<&EventCallback>,
    ) -> Result<Vec<PathBuf>> {
        self.entered.notify_one();
        self.release.notified().await;
        self.inner.apply(archive, install_dir, tracked, events).await
    }
}

/// Every file under `dir`, relative, sorted.
pub(crate) fn list_files(dir: &Path) -> Vec<PathBuf> {
    fn walk(root: &Path, dir: &Path, out: &mut Vec<PathBuf>) {
        let Ok(entries) = std::fs::read_dir(dir) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                walk(root, &path, out);
            } else if let Ok(rel) = path.strip_prefix(root) {
                out.push(rel.to_path_buf());
            }
        }
    }
    let mut out = Vec::new();
    walk(dir, dir, &mut out);
    out.sort();
    out
}
