//! One live session per installation; cancellation once installation has
//! begun.

use crate::helpers::{
    FakeProcess, GatedApplier, InstallFixture, github_source, mount_release, release_archive,
};
use std::sync::Arc;
use tokio::sync::Notify;
use updraft::update::lock::LOCK_FILE;
use updraft::update::{UpdateManager, ZipApplier};
use updraft::{UpdateError, UpdateState};
use wiremock::MockServer;

struct Gate {
    entered: Arc<Notify>,
    release: Arc<Notify>,
}

fn gated_manager(fx: &InstallFixture, server: &MockServer) -> (Arc<UpdateManager>, Gate) {
    let gate = Gate {
        entered: Arc::new(Notify::new()),
        release: Arc::new(Notify::new()),
    };
    let manager = UpdateManager::builder(fx.settings())
        .source(Arc::new(github_source(server, 1)))
        .process(FakeProcess::new())
        .applier(Arc::new(GatedApplier {
            inner: ZipApplier::new("app"),
            entered: Arc::clone(&gate.entered),
            release: Arc::clone(&gate.release),
        }))
        .build()
        .unwrap();
    (Arc::new(manager), gate)
}

#[tokio::test]
async fn second_session_is_rejected_while_first_is_live() {
    let fx = InstallFixture::new("1.0.0");
    let server = MockServer::start().await;
    mount_release(&server, "v1.2.0", release_archive("1.2.0")).await;
    let (manager, gate) = gated_manager(&fx, &server);

    let first = tokio::spawn({
        let manager = Arc::clone(&manager);
        async move { manager.check_and_apply(true).await }
    });
    gate.entered.notified().await;

    assert!(manager.is_busy());
    assert_eq!(manager.current_state(), Some(UpdateState::Applying));
    let second = manager.check_and_apply(true).await;
    assert!(matches!(second, Err(UpdateError::Busy(_))));
    assert!(matches!(manager.rollback_latest().await, Err(UpdateError::Busy(_))));

    gate.release.notify_one();
    let session = first.await.unwrap().unwrap();
    assert_eq!(session.state, UpdateState::Succeeded);
    assert!(!session.cancel_deferred);

    // The slot is free again once the first session has ended.
    assert!(!manager.is_busy());
    assert_eq!(manager.current_state(), None);
    let again = manager.check_and_apply(true).await.unwrap();
    assert_eq!(again.state, UpdateState::NoUpdate);
}

#[tokio::test]
async fn second_manager_on_same_install_is_rejected() {
    let fx = InstallFixture::new("1.0.0");
    let server = MockServer::start().await;
    mount_release(&server, "v1.2.0", release_archive("1.2.0")).await;
    let (first_manager, gate) = gated_manager(&fx, &server);
    // An independent manager, as another updater process would build.
    let (second_manager, _second_gate) = gated_manager(&fx, &server);

    let first = tokio::spawn({
        let manager = Arc::clone(&first_manager);
        async move { manager.check_and_apply(true).await }
    });
    gate.entered.notified().await;

    assert!(!second_manager.is_busy());
    assert!(fx.install.path().join(LOCK_FILE).exists());
    let second = second_manager.check_and_apply(true).await;
    assert!(matches!(second, Err(UpdateError::Busy(_))));
    assert!(matches!(second_manager.rollback_latest().await, Err(UpdateError::Busy(_))));
    assert_eq!(fx.read("version.txt"), "1.0.0");

    gate.release.notify_one();
    assert_eq!(first.await.unwrap().unwrap().state, UpdateState::Succeeded);
    assert!(!fx.install.path().join(LOCK_FILE).exists());

    // The lock is released with the first session.
    let again = second_manager.check_and_apply(true).await.unwrap();
    assert_eq!(again.state, UpdateState::NoUpdate);
}

#[tokio::test]
async fn cancel_during_install_is_deferred() {
    let fx = InstallFixture::new("1.0.0");
    let server = MockServer::start().await;
    mount_release(&server, "v1.2.0", release_archive("1.2.0")).await;
    let (manager, gate) = gated_manager(&fx, &server);

    let first = tokio::spawn({
        let manager = Arc::clone(&manager);
        async move { manager.check_and_apply(true).await }
    });
    gate.entered.notified().await;

    assert!(manager.cancel());
    gate.release.notify_one();
    let session = first.await.unwrap().unwrap();

    assert_eq!(session.state, UpdateState::Succeeded);
    assert!(session.cancel_deferred);
    assert_eq!(fx.read("version.txt"), "1.2.0");
}

#[tokio::test]
async fn cancel_without_session_is_a_no_op() {
    let fx = InstallFixture::new("1.0.0");
    let server = MockServer::start().await;
    let (manager, _gate) = gated_manager(&fx, &server);
    assert!(!manager.cancel());
}
