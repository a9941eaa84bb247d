//! Manual rollback to the newest backup.

use crate::helpers::{
    FakeProcess, InstallFixture, github_source, mount_release, release_archive,
};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use updraft::update::UpdateManager;
use updraft::{UpdateError, UpdateState};
use wiremock::MockServer;

#[tokio::test]
async fn rollback_restores_pre_update_files() {
    let fx = InstallFixture::new("1.0.0");
    let server = MockServer::start().await;
    mount_release(&server, "v1.2.0", release_archive("1.2.0")).await;
    let process = FakeProcess::new();
    let manager = UpdateManager::builder(fx.settings())
        .source(Arc::new(github_source(&server, 1)))
        .process(process.clone())
        .build()
        .unwrap();

    let session = manager.check_and_apply(true).await.unwrap();
    assert_eq!(session.state, UpdateState::Succeeded);
    assert_eq!(fx.read("version.txt"), "1.2.0");

    let restored = manager.rollback_latest().await.unwrap();
    assert_eq!(restored.saved_version, "1.0.0");
    assert_eq!(fx.read("version.txt"), "1.0.0");
    assert_eq!(fx.read("app"), "app 1.0.0");
    assert_eq!(process.stops(), 2);
    assert_eq!(process.starts(), 2);
}

#[tokio::test]
async fn rollback_without_backups_fails_cleanly() {
    let fx = InstallFixture::new("1.0.0");
    let server = MockServer::start().await;
    let process = FakeProcess::new();
    let manager = UpdateManager::builder(fx.settings())
        .source(Arc::new(github_source(&server, 1)))
        .process(process.clone())
        .build()
        .unwrap();

    let err = manager.rollback_latest().await.unwrap_err();
    assert!(matches!(err, UpdateError::Backup(_)));
    assert_eq!(process.stops(), 0);
    assert_eq!(fx.read("app"), "app 1.0.0");
}

#[tokio::test]
async fn rollback_refuses_when_app_will_not_stop() {
    let fx = InstallFixture::new("1.0.0");
    let server = MockServer::start().await;
    mount_release(&server, "v1.2.0", release_archive("1.2.0")).await;
    let process = FakeProcess::new();
    let manager = UpdateManager::builder(fx.settings())
        .source(Arc::new(github_source(&server, 1)))
        .process(process.clone())
        .build()
        .unwrap();
    manager.check_and_apply(true).await.unwrap();

    process.stop_ok.store(false, Ordering::SeqCst);
    let err = manager.rollback_latest().await.unwrap_err();
    assert!(matches!(err, UpdateError::Process(_)));
    assert_eq!(fx.read("version.txt"), "1.2.0");
    // Nothing was restored, and the hint must not say otherwise.
    assert!(!err.recovery_hint().contains("restored"));
}

#[tokio::test]
async fn rollback_works_without_a_release_source() {
    let fx = InstallFixture::new("1.0.0");
    let server = MockServer::start().await;
    mount_release(&server, "v1.2.0", release_archive("1.2.0")).await;
    let updater = UpdateManager::builder(fx.settings())
        .source(Arc::new(github_source(&server, 1)))
        .process(FakeProcess::new())
        .build()
        .unwrap();
    assert_eq!(updater.check_and_apply(true).await.unwrap().state, UpdateState::Succeeded);

    let offline = UpdateManager::builder(fx.settings())
        .process(FakeProcess::new())
        .build()
        .unwrap();
    assert_eq!(offline.backups().list().unwrap().len(), 1);
    offline.rollback_latest().await.unwrap();
    assert_eq!(fx.read("version.txt"), "1.0.0");
}
