//! Background trigger honouring persisted preferences.

use crate::helpers::{
    FakeProcess, InstallFixture, LATEST_PATH, github_source, mount_release, release_archive,
};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use updraft::UpdateState;
use updraft::update::{AutoUpdatePreference, UpdateManager, UpdatePreferences, trigger};
use wiremock::MockServer;

fn manager(fx: &InstallFixture, server: &MockServer) -> UpdateManager {
    UpdateManager::builder(fx.settings())
        .source(Arc::new(github_source(server, 1)))
        .process(FakeProcess::new())
        .build()
        .unwrap()
}

fn write_prefs(fx: &InstallFixture, prefs: &UpdatePreferences) -> std::path::PathBuf {
    let path = fx.scratch.path().join("update-state.json");
    prefs.save(&path).unwrap();
    path
}

#[tokio::test]
async fn never_preference_skips_without_network() {
    let fx = InstallFixture::new("1.0.0");
    let server = MockServer::start().await;
    mount_release(&server, "v1.2.0", release_archive("1.2.0")).await;
    let path = write_prefs(
        &fx,
        &UpdatePreferences {
            auto_update: AutoUpdatePreference::Never,
            ..UpdatePreferences::default()
        },
    );

    assert!(trigger::run_once(&manager(&fx, &server), &path, 24).await.is_none());
    assert!(server.received_requests().await.unwrap().is_empty());
    assert_eq!(fx.read("version.txt"), "1.0.0");
}

#[tokio::test]
async fn always_preference_installs_and_records_outcome() {
    let fx = InstallFixture::new("1.0.0");
    let server = MockServer::start().await;
    mount_release(&server, "v1.2.0", release_archive("1.2.0")).await;
    let path = write_prefs(
        &fx,
        &UpdatePreferences {
            auto_update: AutoUpdatePreference::Always,
            ..UpdatePreferences::default()
        },
    );

    let session = trigger::run_once(&manager(&fx, &server), &path, 24).await.unwrap();
    assert_eq!(session.state, UpdateState::Succeeded);
    assert_eq!(fx.read("version.txt"), "1.2.0");

    let prefs = UpdatePreferences::load(&path);
    assert!(prefs.last_check.is_some());
    assert_eq!(prefs.last_outcome.as_deref(), Some("succeeded"));
}

#[tokio::test]
async fn recent_check_is_not_repeated() {
    let fx = InstallFixture::new("1.0.0");
    let server = MockServer::start().await;
    mount_release(&server, "v1.2.0", release_archive("1.2.0")).await;
    let path = write_prefs(
        &fx,
        &UpdatePreferences {
            auto_update: AutoUpdatePreference::Always,
            last_check: Some(Utc::now()),
            ..UpdatePreferences::default()
        },
    );

    assert!(trigger::run_once(&manager(&fx, &server), &path, 24).await.is_none());
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn dismissed_release_is_skipped() {
    let fx = InstallFixture::new("1.0.0");
    let server = MockServer::start().await;
    mount_release(&server, "v1.2.0", release_archive("1.2.0")).await;
    let path = write_prefs(
        &fx,
        &UpdatePreferences {
            auto_update: AutoUpdatePreference::Always,
            dismissed_release: Some("1.2.0".into()),
            ..UpdatePreferences::default()
        },
    );

    assert!(trigger::run_once(&manager(&fx, &server), &path, 24).await.is_none());
    assert_eq!(fx.read("version.txt"), "1.0.0");
    // Only the metadata was fetched.
    let requests = server.received_requests().await.unwrap();
    assert!(requests.iter().all(|r| r.url.path() == LATEST_PATH));
    assert!(UpdatePreferences::load(&path).last_check.is_some());
}

#[tokio::test]
async fn periodic_trigger_runs_then_stops_on_cancel() {
    let fx = InstallFixture::new("1.0.0");
    let server = MockServer::start().await;
    mount_release(&server, "v1.2.0", release_archive("1.2.0")).await;
    let path = write_prefs(
        &fx,
        &UpdatePreferences {
            auto_update: AutoUpdatePreference::Always,
            ..UpdatePreferences::default()
        },
    );

    let cancel = CancellationToken::new();
    let handle = tokio::spawn(trigger::run_periodic(
        Arc::new(manager(&fx, &server)),
        path.clone(),
        Duration::from_millis(20),
        cancel.clone(),
    ));

    // The first tick fires immediately and installs the update.
    tokio::time::timeout(Duration::from_secs(10), async {
        while UpdatePreferences::load(&path).last_outcome.is_none() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(fx.read("version.txt"), "1.2.0");

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
}
