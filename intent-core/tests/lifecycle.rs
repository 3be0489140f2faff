//! Submit, withdraw and purge through a single-node engine.

mod common;

use std::time::Duration;

use common::{
    FakeInstaller, InstallMode, fast_config, init_tracing, link, next_event_for, p2p, single,
    wait_for_state, wait_until_gone,
};
use intent_core::{IntentEventKind, IntentKind, IntentOperations, IntentState, Key};

#[tokio::test]
async fn submitted_intent_is_installed_with_one_event() {
    init_tracing();
    let node = single(&fast_config(), &[link("a", "b"), link("b", "c")]);
    let manager = &node.manager;
    let mut events = manager.subscribe();
    let intent = p2p(manager, "web");
    let key = intent.key().clone();

    manager.submit(intent).unwrap();

    assert!(wait_for_state(manager, &key, IntentState::Installed).await);
    assert_eq!(manager.get_installable_intents(&key).len(), 2);
    assert_eq!(node.installer.live(), 2);
    assert!(manager.tracker().is_tracked(&key));
    assert_eq!(next_event_for(&mut events, &key).await, Some(IntentEventKind::InstallReq));
    assert_eq!(next_event_for(&mut events, &key).await, Some(IntentEventKind::Installed));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(events.try_recv().is_err(), "no further events for an idle intent");
    assert_eq!(manager.metrics().installed, 1);
    manager.shutdown().await;
}

#[tokio::test]
async fn withdraw_then_purge_removes_everything() {
    init_tracing();
    let node = single(&fast_config(), &[link("a", "b"), link("b", "c")]);
    let manager = &node.manager;
    let intent = p2p(manager, "video");
    let key = intent.key().clone();
    manager.submit(intent.clone()).unwrap();
    assert!(wait_for_state(manager, &key, IntentState::Installed).await);

    let mut events = manager.subscribe();
    manager.withdraw(intent.clone()).unwrap();
    assert!(wait_for_state(manager, &key, IntentState::Withdrawn).await);
    assert!(manager.get_installable_intents(&key).is_empty());
    assert_eq!(node.installer.live(), 0);
    assert!(!manager.tracker().is_tracked(&key));
    assert_eq!(next_event_for(&mut events, &key).await, Some(IntentEventKind::WithdrawReq));
    assert_eq!(next_event_for(&mut events, &key).await, Some(IntentEventKind::Withdrawn));

    manager.purge(intent).unwrap();
    assert!(wait_until_gone(manager, &key).await);
    assert_eq!(next_event_for(&mut events, &key).await, Some(IntentEventKind::Purged));
    assert_eq!(manager.get_intent_count(), 0);
    assert_eq!(manager.metrics().purges, 1);
    manager.shutdown().await;
}

#[tokio::test]
async fn installed_intent_is_not_purged() {
    init_tracing();
    let node = single(&fast_config(), &[link("a", "b")]);
    let manager = &node.manager;
    let intent = p2p(manager, "voice");
    let key = intent.key().clone();
    manager.submit(intent.clone()).unwrap();
    assert!(wait_for_state(manager, &key, IntentState::Installed).await);

    manager.purge(intent).unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(manager.get_intent_state(&key), Some(IntentState::Installed));
    assert!(manager.get_pending_data(&key).is_none());
    assert!(manager.metrics().rejected_writes >= 1);
    manager.shutdown().await;
}

#[tokio::test]
async fn unreachable_intent_fails_and_can_be_purged() {
    init_tracing();
    let node = single(&fast_config(), &[link("a", "b")]);
    node.compiler.set_reachable(false);
    let manager = &node.manager;
    let mut events = manager.subscribe();
    let intent = p2p(manager, "backup");
    let key = intent.key().clone();

    manager.submit(intent.clone()).unwrap();
    assert!(wait_for_state(manager, &key, IntentState::Failed).await);
    assert_eq!(next_event_for(&mut events, &key).await, Some(IntentEventKind::InstallReq));
    assert_eq!(next_event_for(&mut events, &key).await, Some(IntentEventKind::Failed));
    assert!(manager.get_installable_intents(&key).is_empty());
    assert_eq!(manager.metrics().compile_failures, 1);

    manager.purge(intent).unwrap();
    assert!(wait_until_gone(manager, &key).await);
    manager.shutdown().await;
}

#[tokio::test]
async fn rejected_installation_fails_without_touching_the_environment() {
    init_tracing();
    let node = single(&fast_config(), &[link("a", "b")]);
    node.installer.set_mode(InstallMode::Reject);
    let manager = &node.manager;
    let intent = p2p(manager, "bulk");
    let key = intent.key().clone();

    manager.submit(intent).unwrap();
    assert!(wait_for_state(manager, &key, IntentState::Failed).await);
    let data = manager.get_intent_data(&key).unwrap();
    assert_eq!(data.error_count(), 1);
    assert_eq!(node.installer.live(), 0);
    assert_eq!(manager.metrics().install_failures, 1);
    manager.shutdown().await;
}

#[tokio::test]
async fn resubmission_replaces_installables() {
    init_tracing();
    let node = single(&fast_config(), &[link("a", "b"), link("b", "c")]);
    let manager = &node.manager;
    let intent = p2p(manager, "replace");
    let key = intent.key().clone();
    manager.submit(intent.clone()).unwrap();
    assert!(wait_for_state(manager, &key, IntentState::Installed).await);
    let first = manager.get_intent_data(&key).unwrap().version();

    node.compiler
        .set_route(vec![link("a", "x"), link("x", "y"), link("y", "c")]);
    manager.submit(intent).unwrap();
    let watched = &key;
    assert!(
        common::eventually(Duration::from_secs(5), move || async move {
            manager
                .get_intent_data(watched)
                .is_some_and(|data| data.version() > first && data.state() == IntentState::Installed)
        })
        .await
    );
    assert_eq!(manager.get_installable_intents(&key).len(), 3);
    assert_eq!(node.installer.uninstalls.load(std::sync::atomic::Ordering::SeqCst), 2);
    assert_eq!(node.installer.live(), 3);
    manager.shutdown().await;
}

#[tokio::test]
async fn replace_withdraws_the_old_intent_and_installs_the_new_one() {
    init_tracing();
    let node = single(&fast_config(), &[link("a", "b"), link("b", "c")]);
    let manager = &node.manager;
    let old = p2p(manager, "legacy");
    let new = p2p(manager, "successor");
    manager.submit(old.clone()).unwrap();
    assert!(wait_for_state(manager, old.key(), IntentState::Installed).await);

    let mut events = manager.subscribe();
    manager
        .execute(
            IntentOperations::builder(common::app())
                .replace(old.key().clone(), new.clone())
                .build(),
        )
        .unwrap();

    assert!(wait_for_state(manager, old.key(), IntentState::Withdrawn).await);
    assert!(wait_for_state(manager, new.key(), IntentState::Installed).await);
    assert_eq!(next_event_for(&mut events, old.key()).await, Some(IntentEventKind::WithdrawReq));
    assert_eq!(next_event_for(&mut events, old.key()).await, Some(IntentEventKind::Withdrawn));
    assert!(manager.get_installable_intents(old.key()).is_empty());
    assert_eq!(manager.get_installable_intents(new.key()).len(), 2);
    assert_eq!(node.installer.live(), 2);

    // Nothing stored under the old key: a plain submit.
    let fresh = p2p(manager, "fresh");
    manager.replace(&Key::of("never-installed", &common::app()), fresh.clone()).unwrap();
    assert!(wait_for_state(manager, fresh.key(), IntentState::Installed).await);
    assert_eq!(manager.get_intent_count(), 3);
    manager.shutdown().await;
}

#[tokio::test]
async fn missing_installer_fails_the_intent() {
    init_tracing();
    let node = single(&fast_config(), &[link("a", "b")]);
    let manager = &node.manager;
    assert!(manager.unregister_installer(IntentKind::FlowRule).is_some());
    assert!(manager.installers().is_empty());
    let intent = p2p(manager, "orphan");
    let key = intent.key().clone();

    manager.submit(intent).unwrap();
    assert!(wait_for_state(manager, &key, IntentState::Failed).await);

    manager.register_installer(IntentKind::FlowRule, FakeInstaller::new(InstallMode::Accept));
    assert_eq!(manager.installers(), vec![IntentKind::FlowRule]);
    manager.shutdown().await;
}
