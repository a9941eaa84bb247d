//! GitHub release source against a mock release index.

use crate::helpers::{LATEST_PATH, github_source, mount_release, release_archive};
use serde_json::json;
use std::sync::{Arc, Mutex};
use updraft::UpdateError;
use updraft::progress::{EventCallback, UpdateEvent};
use updraft::update::{AssetRef, PlatformKey, ReleaseSource, VersionTag, select_asset};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn fetch_latest_parses_tag_and_assets() {
    let server = MockServer::start().await;
    mount_release(&server, "v1.2.0", release_archive("1.2.0")).await;

    let release = github_source(&server, 3).fetch_latest().await.unwrap();
    assert_eq!(release.tag, "v1.2.0");
    assert_eq!(release.version, VersionTag::parse("1.2.0").unwrap());
    assert_eq!(release.assets.len(), 2);

    let asset = select_asset(&release, PlatformKey::Linux).unwrap();
    assert_eq!(asset.name, "app-linux.zip");
    assert!(matches!(
        select_asset(&release, PlatformKey::Macos),
        Err(UpdateError::AssetNotFound(_))
    ));
}

#[tokio::test]
async fn fetch_latest_retries_server_errors() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(LATEST_PATH))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(LATEST_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "tag_name": "v2.0.0",
            "assets": []
        })))
        .expect(1)
        .mount(&server)
        .await;

    let release = github_source(&server, 3).fetch_latest().await.unwrap();
    assert_eq!(release.version.triple(), (2, 0, 0));
}

#[tokio::test]
async fn fetch_latest_gives_up_after_budget() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(LATEST_PATH))
        .respond_with(ResponseTemplate::new(502))
        .expect(3)
        .mount(&server)
        .await;

    let err = github_source(&server, 3).fetch_latest().await.unwrap_err();
    assert!(matches!(err, UpdateError::Network(_)), "{err}");
}

#[tokio::test]
async fn client_errors_are_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(LATEST_PATH))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let err = github_source(&server, 3).fetch_latest().await.unwrap_err();
    assert!(matches!(err, UpdateError::Network(ref m) if m.contains("404")), "{err}");
}

#[tokio::test]
async fn malformed_response_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(LATEST_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>rate limited</html>"))
        .expect(1)
        .mount(&server)
        .await;

    let err = github_source(&server, 3).fetch_latest().await.unwrap_err();
    assert!(matches!(err, UpdateError::Network(_)));
}

#[tokio::test]
async fn unparsable_tag_is_a_version_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(LATEST_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "tag_name": "nightly",
            "assets": []
        })))
        .mount(&server)
        .await;

    let err = github_source(&server, 3).fetch_latest().await.unwrap_err();
    assert!(matches!(err, UpdateError::Version(_)));
}

#[tokio::test]
async fn download_streams_to_dest_and_reports_progress() {
    let server = MockServer::start().await;
    let archive = release_archive("1.2.0");
    mount_release(&server, "v1.2.0", archive.clone()).await;
    let source = github_source(&server, 3);
    let release = source.fetch_latest().await.unwrap();
    let asset = select_asset(&release, PlatformKey::Linux).unwrap();

    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let callback: EventCallback = Arc::new(move |event| sink.lock().unwrap().push(event));

    let dest = tempfile::tempdir().unwrap();
    let downloaded = source.download(&asset, dest.path(), Some(&callback)).await.unwrap();

    assert_eq!(downloaded.path, dest.path().join("app-linux.zip"));
    assert_eq!(downloaded.size_bytes, archive.len() as u64);
    assert_eq!(std::fs::read(&downloaded.path).unwrap(), archive);
    assert!(!dest.path().join("app-linux.zip.part").exists());

    let events = events.lock().unwrap();
    assert!(matches!(events.first(), Some(UpdateEvent::DownloadStarted { .. })));
    assert!(matches!(
        events.last(),
        Some(UpdateEvent::DownloadComplete { size_bytes, .. }) if *size_bytes == archive.len() as u64
    ));

    downloaded.discard();
    assert!(!downloaded.path.exists());
}

#[tokio::test]
async fn failed_download_leaves_no_partial_file() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/download/app-linux.zip"))
        .respond_with(ResponseTemplate::new(500))
        .expect(2)
        .mount(&server)
        .await;

    let asset = AssetRef {
        name: "app-linux.zip".into(),
        download_url: format!("{}/download/app-linux.zip", server.uri()),
        size: None,
    };
    let dest = tempfile::tempdir().unwrap();
    let err = github_source(&server, 2)
        .download(&asset, dest.path(), None)
        .await
        .unwrap_err();

    assert!(matches!(err, UpdateError::Download(_)));
    assert_eq!(std::fs::read_dir(dest.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn unsafe_asset_names_never_reach_the_network() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"x".to_vec()))
        .expect(0)
        .mount(&server)
        .await;

    let asset = AssetRef {
        name: "../escape-linux.zip".into(),
        download_url: format!("{}/x", server.uri()),
        size: None,
    };
    let dest = tempfile::tempdir().unwrap();
    let err = github_source(&server, 1)
        .download(&asset, dest.path(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, UpdateError::Download(_)));
}
