//! Key ownership across a simulated cluster sharing one set of maps.

mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use common::{
    InstallMode, Node, app, cluster, eventually, fast_config, init_tracing, link, next_event_for,
    wait_for_state,
};
use intent_core::{
    ApplicationId, ClusterMembership, IntentEventKind, IntentPayload, IntentState, Key, NodeId,
    PartitionService,
};
use proptest::prelude::*;

/// First `owned-N` key whose partition `owner` leads.
fn key_owned_by(nodes: &[Node], owner: &str) -> Key {
    let owner = NodeId::new(owner);
    (0..10_000)
        .map(|n| Key::of(format!("owned-{n}"), &app()))
        .find(|key| nodes[0].manager.get_leader(key).as_ref() == Some(&owner))
        .unwrap()
}

fn p2p_with_key(node: &Node, key: &Key, selector: &str) -> intent_core::Intent {
    node.manager
        .builder(
            app(),
            IntentPayload::PointToPoint {
                ingress: intent_core::ConnectPoint::new("of:1", 1),
                egress: intent_core::ConnectPoint::new("of:9", 1),
                selector: selector.to_string(),
            },
        )
        .key(key.clone())
        .build()
        .unwrap()
}

async fn shutdown_all(nodes: &[Node]) {
    for node in nodes {
        node.manager.shutdown().await;
    }
}

proptest! {
    #[test]
    fn every_key_has_exactly_one_owner(
        size in 1usize..6,
        keys in prop::collection::vec("[a-z0-9]{1,12}", 1..32),
    ) {
        let names: Vec<String> = (0..size).map(|n| format!("node-{n}")).collect();
        let services: Vec<PartitionService> = names
            .iter()
            .map(|name| {
                let peers = names.iter().filter(|peer| *peer != name).map(NodeId::new);
                let membership = ClusterMembership::with_peers(NodeId::new(name.as_str()), peers);
                PartitionService::new(Arc::new(membership), 14)
            })
            .collect();
        let app = ApplicationId::new(3, "prop");

        for value in keys {
            let key = Key::of(value, &app);
            let leader = services[0].get_leader(&key);
            prop_assert!(leader.is_some());
            prop_assert!(services.iter().all(|service| service.get_leader(&key) == leader));
            let owners = services.iter().filter(|service| service.is_mine(&key)).count();
            prop_assert_eq!(owners, 1);
        }
    }
}

#[tokio::test]
async fn non_owner_submission_is_processed_by_the_owner() {
    init_tracing();
    let nodes = cluster(&["a", "b", "c"], &fast_config(), &[link("x", "y")]);
    let key = key_owned_by(&nodes, "b");
    assert!(!nodes[0].manager.is_mine(&key));
    assert!(nodes[1].manager.is_mine(&key));

    nodes[0].manager.submit(p2p_with_key(&nodes[0], &key, "ipv4")).unwrap();

    for node in &nodes {
        assert!(wait_for_state(&node.manager, &key, IntentState::Installed).await);
    }
    assert_eq!(nodes[1].installer.installs.load(Ordering::SeqCst), 1);
    assert_eq!(nodes[0].installer.installs.load(Ordering::SeqCst), 0);
    assert_eq!(nodes[2].installer.installs.load(Ordering::SeqCst), 0);
    assert_eq!(nodes[1].compiler.calls(), 1);
    assert_eq!(nodes[0].compiler.calls(), 0);
    shutdown_all(&nodes).await;
}

#[tokio::test]
async fn events_are_visible_on_every_node() {
    init_tracing();
    let nodes = cluster(&["a", "b"], &fast_config(), &[link("x", "y")]);
    let key = key_owned_by(&nodes, "a");
    let mut remote = nodes[1].manager.subscribe();

    nodes[0].manager.submit(p2p_with_key(&nodes[0], &key, "ipv4")).unwrap();

    assert_eq!(next_event_for(&mut remote, &key).await, Some(IntentEventKind::InstallReq));
    assert_eq!(next_event_for(&mut remote, &key).await, Some(IntentEventKind::Installed));
    assert_eq!(nodes[1].manager.get_installable_intents(&key).len(), 1);
    shutdown_all(&nodes).await;
}

#[tokio::test]
async fn later_submission_from_another_node_wins() {
    init_tracing();
    let nodes = cluster(&["a", "b"], &fast_config(), &[link("x", "y")]);
    let key = key_owned_by(&nodes, "a");
    let first = p2p_with_key(&nodes[0], &key, "ipv4");
    let second = p2p_with_key(&nodes[1], &key, "ipv6");
    assert_ne!(first.id(), second.id());

    nodes[0].manager.submit(first).unwrap();
    assert!(wait_for_state(&nodes[0].manager, &key, IntentState::Installed).await);
    let installed = nodes[0].manager.get_intent_data(&key).unwrap().version();

    nodes[1].manager.submit(second.clone()).unwrap();
    let manager = &nodes[0].manager;
    let watched = &key;
    assert!(
        eventually(Duration::from_secs(5), move || async move {
            manager.get_intent_data(watched).is_some_and(|data| {
                data.version() > installed && data.state() == IntentState::Installed
            })
        })
        .await
    );
    assert_eq!(manager.get_intent(&key).unwrap().id(), second.id());
    shutdown_all(&nodes).await;
}

#[tokio::test]
async fn pending_work_moves_to_the_next_owner() {
    init_tracing();
    let nodes = cluster(&["a", "b"], &fast_config(), &[link("x", "y")]);
    let key = key_owned_by(&nodes, "a");
    let (gone, survivor) = (&nodes[0], &nodes[1]);

    gone.manager.shutdown().await;
    survivor.manager.submit(p2p_with_key(survivor, &key, "ipv4")).unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(survivor.manager.get_pending_data(&key).is_some());
    assert!(survivor.manager.get_intent(&key).is_none());

    survivor
        .manager
        .membership()
        .remove_member(gone.manager.local_node());

    assert!(wait_for_state(&survivor.manager, &key, IntentState::Installed).await);
    assert!(survivor.manager.is_mine(&key));
    assert_eq!(survivor.installer.live(), 1);
    assert_eq!(gone.installer.installs.load(Ordering::SeqCst), 0);
    survivor.manager.shutdown().await;
}

#[tokio::test]
async fn abandoned_installation_is_recovered_by_the_next_owner() {
    init_tracing();
    let mut config = fast_config();
    config.install.confirmation_timeout = Duration::from_secs(30);
    config.cleanup.transient_timeout = Duration::from_secs(61);
    let nodes = cluster(&["a", "b"], &config, &[link("x", "y")]);
    let key = key_owned_by(&nodes, "a");
    let (gone, survivor) = (&nodes[0], &nodes[1]);
    gone.installer.set_mode(InstallMode::Hold);

    gone.manager.submit(p2p_with_key(gone, &key, "ipv4")).unwrap();
    assert!(wait_for_state(&survivor.manager, &key, IntentState::Installing).await);
    let abandoned = survivor.manager.get_intent_data(&key).unwrap().version();

    survivor
        .manager
        .membership()
        .remove_member(gone.manager.local_node());

    let manager = &survivor.manager;
    let watched = &key;
    assert!(
        eventually(Duration::from_secs(5), move || async move {
            manager.get_intent_data(watched).is_some_and(|data| {
                data.version() > abandoned && data.state() == IntentState::Installed
            })
        })
        .await
    );
    assert!(survivor.manager.metrics().cleanup_recoveries >= 1);
    assert_eq!(survivor.installer.live(), 1);
    assert_eq!(gone.installer.installs.load(Ordering::SeqCst), 0);
    shutdown_all(&nodes).await;
}

#[tokio::test]
async fn queued_submissions_resolve_to_the_newest_after_handoff() {
    init_tracing();
    let nodes = cluster(&["a", "b", "c"], &fast_config(), &[link("x", "y")]);
    let key = key_owned_by(&nodes, "c");
    let gone = &nodes[2];
    gone.manager.shutdown().await;
    let mut events = nodes[0].manager.subscribe();

    let older = p2p_with_key(&nodes[0], &key, "ipv4");
    let newer = p2p_with_key(&nodes[1], &key, "ipv6");
    nodes[0].manager.submit(older).unwrap();
    let queued_first = nodes[0].manager.get_pending_data(&key).unwrap().version();
    nodes[1].manager.submit(newer.clone()).unwrap();
    let queued_last = nodes[1].manager.get_pending_data(&key).unwrap();
    assert!(queued_last.version() > queued_first);
    assert_eq!(queued_last.intent().id(), newer.id());

    assert!(nodes[0].manager.get_intent(&key).is_none());

    for node in &nodes[..2] {
        node.manager.membership().remove_member(gone.manager.local_node());
    }

    assert!(wait_for_state(&nodes[0].manager, &key, IntentState::Installed).await);
    assert_eq!(nodes[0].manager.get_intent(&key).unwrap().id(), newer.id());
    let mut requests = 0;
    while let Some(kind) = next_event_for(&mut events, &key).await {
        if kind == IntentEventKind::InstallReq {
            requests += 1;
        }
        if kind == IntentEventKind::Installed {
            break;
        }
    }
    assert_eq!(requests, 1);
    let installs: usize = nodes
        .iter()
        .map(|node| node.installer.installs.load(Ordering::SeqCst))
        .sum();
    assert_eq!(installs, 1);
    shutdown_all(&nodes[..2]).await;
}
