//! Remote release index client.
//!
//! Queries a GitHub-style "latest release" endpoint, picks the asset built
//! for the configured platform, and streams it to disk. Both operations run
//! under the configured [`RetryPolicy`]: connection failures, timeouts, 5xx
//! responses and truncated bodies are retried, 4xx responses and malformed
//! payloads are not.

use crate::config::ReleaseConfig;
use crate::error::{Result, UpdateError};
use crate::progress::{EventCallback, UpdateEvent, emit};
use crate::update::retry::{AttemptError, RetryPolicy};
use crate::update::version::VersionTag;
use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;

/// Suffix appended to an asset name while it is still being streamed.
const PARTIAL_SUFFIX: &str = ".part";

/// Supported target platforms. Selects the asset naming convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlatformKey {
    /// `*windows.zip`
    Windows,
    /// `*linux.zip`
    Linux,
    /// `*macos.zip`
    Macos,
}

impl PlatformKey {
    /// Platform this binary was compiled for.
    pub fn host() -> Self {
        if cfg!(target_os = "windows") {
            Self::Windows
        } else if cfg!(target_os = "macos") {
            Self::Macos
        } else {
            Self::Linux
        }
    }

    /// Lowercase suffix a matching asset name must end with.
    pub fn asset_suffix(self) -> &'static str {
        match self {
            Self::Windows => "windows.zip",
            Self::Linux => "linux.zip",
            Self::Macos => "macos.zip",
        }
    }

    /// Returns `true` if `asset_name` follows this platform's convention.
    pub fn matches(self, asset_name: &str) -> bool {
        asset_name.to_ascii_lowercase().ends_with(self.asset_suffix())
    }
}

impl fmt::Display for PlatformKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Windows => write!(f, "windows"),
            Self::Linux => write!(f, "linux"),
            Self::Macos => write!(f, "macos"),
        }
    }
}

/// One downloadable file attached to a release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetRef {
    /// Asset file name as published.
    pub name: String,
    /// Direct download URL.
    pub download_url: String,
    /// Size advertised by the release index, if any.
    pub size: Option<u64>,
}

/// Release metadata, read-only once parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseInfo {
    /// Raw tag as published (e.g. `v1.2.0`).
    pub tag: String,
    /// Parsed version of [`Self::tag`].
    pub version: VersionTag,
    /// Assets in publication order.
    pub assets: Vec<AssetRef>,
}

/// An asset that has been fully streamed to disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedArchive {
    /// Final location of the downloaded file.
    pub path: PathBuf,
    /// Asset this file was downloaded from.
    pub expected_asset: AssetRef,
    /// Number of bytes on disk.
    pub size_bytes: u64,
}

impl DownloadedArchive {
    /// Delete the downloaded file (best-effort).
    pub fn discard(&self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "failed to delete downloaded archive");
            }
        }
    }
}

/// Pick the asset built for `platform`.
///
/// # Errors
///
/// Returns [`UpdateError::AssetNotFound`] if no asset follows the naming
/// convention.
pub fn select_asset(release: &ReleaseInfo, platform: PlatformKey) -> Result<AssetRef> {
    release
        .assets
        .iter()
        .find(|asset| platform.matches(&asset.name))
        .cloned()
        .ok_or_else(|| {
            UpdateError::AssetNotFound(format!(
                "release {} has no asset ending in {:?} (found: {})",
                release.tag,
                platform.asset_suffix(),
                release
                    .assets
                    .iter()
                    .map(|a| a.name.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            ))
        })
}

/// Source of release metadata and asset bytes.
#[async_trait]
pub trait ReleaseSource: Send + Sync {
    /// Fetch the newest published release.
    async fn fetch_latest(&self) -> Result<ReleaseInfo>;

    /// Stream `asset` into `dest_dir`, returning the completed file.
    async fn download(
        &self,
        asset: &AssetRef,
        dest_dir: &Path,
        events: Option<&EventCallback>,
    ) -> Result<DownloadedArchive>;
}

/// Wire format of a GitHub release.
#[derive(Debug, Deserialize)]
struct GitHubRelease {
    #[serde(default)]
    tag_name: Option<String>,
    #[serde(default)]
    assets: Vec<GitHubAsset>,
}

#[derive(Debug, Deserialize)]
struct GitHubAsset {
    name: String,
    browser_download_url: String,
    #[serde(default)]
    size: Option<u64>,
}

/// Release source backed by the GitHub releases API.
pub struct GitHubReleaseSource {
    client: reqwest::Client,
    api_url: String,
    request_timeout: Duration,
    download_timeout: Duration,
    retry: RetryPolicy,
}

impl GitHubReleaseSource {
    /// Build a source from the `[release]` config section.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::Config`] if the API URL is empty or the HTTP
    /// client cannot be constructed.
    pub fn new(config: &ReleaseConfig, retry: RetryPolicy) -> Result<Self> {
        if config.api_url.trim().is_empty() {
            return Err(UpdateError::Config("release.api_url is not set".to_owned()));
        }

        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .connect_timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| UpdateError::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            api_url: config.api_url.clone(),
            request_timeout: Duration::from_secs(config.request_timeout_secs),
            download_timeout: Duration::from_secs(config.download_timeout_secs),
            retry,
        })
    }

    async fn fetch_once(&self) -> std::result::Result<GitHubRelease, AttemptError> {
        let resp = self
            .client
            .get(&self.api_url)
            .header(reqwest::header::ACCEPT, "application/vnd.github+json")
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| classify_request_error(e, UpdateError::Network))?;

        check_status(resp.status(), &self.api_url, UpdateError::Network)?;

        let body = resp
            .text()
            .await
            .map_err(|e| classify_request_error(e, UpdateError::Network))?;

        serde_json::from_str(&body).map_err(|e| {
            AttemptError::permanent(UpdateError::Network(format!(
                "malformed release response: {e}"
            )))
        })
    }

    async fn download_once(
        &self,
        asset: &AssetRef,
        partial: &Path,
        events: Option<&EventCallback>,
    ) -> std::result::Result<u64, AttemptError> {
        let resp = self
            .client
            .get(&asset.download_url)
            .timeout(self.download_timeout)
            .send()
            .await
            .map_err(|e| classify_request_error(e, UpdateError::Download))?;

        check_status(resp.status(), &asset.download_url, UpdateError::Download)?;

        let expected = resp.content_length();
        emit(
            events,
            UpdateEvent::DownloadStarted {
                asset: asset.name.clone(),
                total_bytes: expected.or(asset.size),
            },
        );

        let mut file = tokio::fs::File::create(partial).await.map_err(|e| {
            AttemptError::permanent(UpdateError::Download(format!(
                "cannot create {}: {e}",
                partial.display()
            )))
        })?;

        let mut downloaded: u64 = 0;
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| classify_request_error(e, UpdateError::Download))?;
            file.write_all(&chunk).await.map_err(|e| write_error(partial, &e))?;
            downloaded += chunk.len() as u64;

            if let Some(total) = expected {
                if downloaded > total {
                    return Err(AttemptError::permanent(UpdateError::Download(format!(
                        "{} is larger than the reported {total} bytes",
                        asset.name
                    ))));
                }
            }

            emit(
                events,
                UpdateEvent::DownloadProgress {
                    asset: asset.name.clone(),
                    bytes_downloaded: downloaded,
                    total_bytes: expected.or(asset.size),
                },
            );
        }

        file.flush().await.map_err(|e| write_error(partial, &e))?;
        file.sync_all().await.map_err(|e| write_error(partial, &e))?;
        drop(file);

        if let Some(total) = expected {
            if downloaded != total {
                return Err(AttemptError::transient(UpdateError::Download(format!(
                    "{} truncated: received {downloaded} of {total} bytes",
                    asset.name
                ))));
            }
        }
        if downloaded == 0 {
            return Err(AttemptError::transient(UpdateError::Download(format!(
                "{} downloaded zero bytes",
                asset.name
            ))));
        }

        Ok(downloaded)
    }
}

#[async_trait]
impl ReleaseSource for GitHubReleaseSource {
    async fn fetch_latest(&self) -> Result<ReleaseInfo> {
        tracing::debug!(url = %self.api_url, "fetching latest release");
        let raw = self.retry.run("fetch_latest", move |_| self.fetch_once()).await?;

        let tag = raw
            .tag_name
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| UpdateError::Network("release response has no tag_name".to_owned()))?;
        let version = VersionTag::parse(&tag)?;
        let assets = raw
            .assets
            .into_iter()
            .map(|a| AssetRef {
                name: a.name,
                download_url: a.browser_download_url,
                size: a.size,
            })
            .collect();

        tracing::info!(%tag, %version, "fetched latest release");
        Ok(ReleaseInfo {
            tag,
            version,
            assets,
        })
    }

    async fn download(
        &self,
        asset: &AssetRef,
        dest_dir: &Path,
        events: Option<&EventCallback>,
    ) -> Result<DownloadedArchive> {
        ensure_plain_file_name(&asset.name)?;
        std::fs::create_dir_all(dest_dir).map_err(|e| {
            UpdateError::Download(format!("cannot create {}: {e}", dest_dir.display()))
        })?;

        let final_path = dest_dir.join(&asset.name);
        let partial = dest_dir.join(format!("{}{PARTIAL_SUFFIX}", asset.name));

        tracing::info!(asset = %asset.name, url = %asset.download_url, "downloading release asset");
        let partial_path = partial.as_path();
        let result = self
            .retry
            .run("download", move |_| async move {
                let outcome = self.download_once(asset, partial_path, events).await;
                if outcome.is_err() {
                    let _ = std::fs::remove_file(partial_path);
                }
                outcome
            })
            .await;
        let size_bytes = result?;

        std::fs::rename(&partial, &final_path).map_err(|e| {
            let _ = std::fs::remove_file(&partial);
            UpdateError::Download(format!(
                "cannot move {} into place: {e}",
                final_path.display()
            ))
        })?;

        emit(
            events,
            UpdateEvent::DownloadComplete {
                asset: asset.name.clone(),
                size_bytes,
            },
        );
        tracing::info!(path = %final_path.display(), size_bytes, "download complete");

        Ok(DownloadedArchive {
            path: final_path,
            expected_asset: asset.clone(),
            size_bytes,
        })
    }
}

/// Asset names come from an untrusted index and become file names on disk.
fn ensure_plain_file_name(name: &str) -> Result<()> {
    let plain = !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\'])
        && Path::new(name)
            .file_name()
            .is_some_and(|f| f == std::ffi::OsStr::new(name));
    if plain {
        Ok(())
    } else {
        Err(UpdateError::Download(format!("refusing unsafe asset name {name:?}")))
    }
}

fn check_status(
    status: reqwest::StatusCode,
    url: &str,
    kind: fn(String) -> UpdateError,
) -> std::result::Result<(), AttemptError> {
    if status.is_success() {
        return Ok(());
    }
    let error = kind(format!("{url} returned HTTP {status}"));
    if status.is_server_error() || status == reqwest::StatusCode::REQUEST_TIMEOUT {
        Err(AttemptError::transient(error))
    } else {
        Err(AttemptError::permanent(error))
    }
}

fn classify_request_error(e: reqwest::Error, kind: fn(String) -> UpdateError) -> AttemptError {
    if e.is_builder() || e.is_decode() {
        AttemptError::permanent(kind(format!("request failed: {e}")))
    } else {
        AttemptError::transient(kind(format!("request failed: {e}")))
    }
}

fn write_error(path: &Path, e: &std::io::Error) -> AttemptError {
    let detail = if e.kind() == std::io::ErrorKind::StorageFull {
        "disk full"
    } else {
        "write failed"
    };
    AttemptError::permanent(UpdateError::Download(format!(
        "{detail} while writing {}: {e}",
        path.display()
    )))
}
