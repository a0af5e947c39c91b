#[path = "common/mod.rs"]
mod common;

use std::sync::Arc;

use common::{make_info, settle, NetworkRegistry, TestNode};
use futures::future;
use iroh_chord::protocol::LookupRequest;
use iroh_chord::{LookupError, Operation};

#[tokio::test]
async fn single_node_ring_owns_every_key() {
    let registry = Arc::new(NetworkRegistry::default());
    let alone = TestNode::new(registry.clone(), 3).await;

    let owner = alone.node.route(5).await.expect("lookup completes");
    assert_eq!(owner.id, 3);

    // A stabilization round on a lonely node changes nothing.
    alone.node.run_stabilization_round().await;
    let snapshot = alone.node.ring_snapshot().await;
    assert!(snapshot.fingers.iter().all(|f| f.id == 3));
    assert_eq!(snapshot.predecessor.map(|p| p.id), Some(3));
    assert!(snapshot.successors.is_empty());
}

#[tokio::test]
async fn four_node_ring_routes_in_bounded_hops() {
    let registry = Arc::new(NetworkRegistry::default());
    let nodes = [
        TestNode::new(registry.clone(), 1).await,
        TestNode::new(registry.clone(), 3).await,
        TestNode::new(registry.clone(), 5).await,
        TestNode::new(registry.clone(), 7).await,
    ];

    for node in &nodes {
        for peer in &nodes {
            if node.info() != peer.info() {
                node.node.observe(&peer.info()).await;
            }
        }
    }
    for node in &nodes {
        node.node.run_stabilization_round().await;
    }
    settle().await;

    let mut hops_before = 0;
    for node in &nodes {
        hops_before += node.network.sent_count("lookup").await;
    }

    let owner = nodes[0].node.route(6).await.expect("lookup completes");
    assert_eq!(owner.id, 7);
    settle().await;

    let mut hops_after = 0;
    for node in &nodes {
        hops_after += node.network.sent_count("lookup").await;
    }
    assert!(
        hops_after - hops_before <= 3,
        "lookup took {} hops",
        hops_after - hops_before
    );
}

#[tokio::test]
async fn concurrent_lookups_share_one_wire_request() {
    let registry = Arc::new(NetworkRegistry::default());
    let main = TestNode::new(registry.clone(), 1).await;
    let peer = TestNode::new(registry.clone(), 5).await;

    peer.node.bootstrap(&main.info()).await.expect("join");
    for _ in 0..2 {
        main.node.run_stabilization_round().await;
        peer.node.run_stabilization_round().await;
    }
    settle().await;

    let lookups_before = main.network.sent_count("lookup").await;

    let routes = future::join_all((0..10).map(|_| main.node.route(6))).await;
    for outcome in routes {
        assert_eq!(outcome.expect("lookup completes").id, 1);
    }
    settle().await;

    let lookups_after = main.network.sent_count("lookup").await;
    assert_eq!(
        lookups_after - lookups_before,
        1,
        "deduplicated lookups must leave the node exactly once"
    );
}

#[tokio::test]
async fn routed_payloads_reach_the_responsible_node() {
    let registry = Arc::new(NetworkRegistry::default());
    let main = TestNode::new(registry.clone(), 1).await;
    let peer = TestNode::new(registry.clone(), 5).await;

    peer.node.bootstrap(&main.info()).await.expect("join");
    for _ in 0..2 {
        main.node.run_stabilization_round().await;
        peer.node.run_stabilization_round().await;
    }
    settle().await;

    let mut inbox = peer.node.deliveries().await.expect("receiver not yet taken");

    let owner = main.node.route(4).await.expect("lookup completes");
    assert_eq!(owner.id, 5);
    main.node
        .send(&owner, b"backup-bytes".to_vec())
        .await
        .expect("payload accepted");

    let delivery = inbox.recv().await.expect("payload arrives");
    assert_eq!(delivery.from.id, 1);
    assert_eq!(delivery.payload, b"backup-bytes");

    // The receiver can only be taken once.
    assert!(peer.node.deliveries().await.is_none());
}

#[tokio::test]
async fn exhausted_hop_budget_drops_the_walk() {
    let registry = Arc::new(NetworkRegistry::default());
    let main = TestNode::new(registry.clone(), 1).await;
    let peer = TestNode::new(registry.clone(), 5).await;
    main.node.observe(&peer.info()).await;

    let walk = Operation::Lookup(LookupRequest {
        origin: make_info(9),
        key: 6,
        last_node: make_info(9),
        time_to_live: 0,
        reached_destination: false,
    });
    main.node.execute(walk).await;
    settle().await;

    assert!(
        main.network.sent_operations().await.is_empty(),
        "a walk with no hop budget must die silently"
    );
}

#[tokio::test]
async fn unreachable_key_surfaces_key_not_found() {
    let registry = Arc::new(NetworkRegistry::default());
    let main = TestNode::new(registry.clone(), 1).await;
    let peer = TestNode::new(registry.clone(), 5).await;

    main.node.observe(&peer.info()).await;
    // The link to the believed successor goes dark.
    main.network.set_failure(5, true).await;

    let outcome = main.node.route(4).await;
    assert_eq!(outcome.unwrap_err(), LookupError::KeyNotFound);
    settle().await;

    // The failed send evicted the peer from the membership state.
    let snapshot = main.node.ring_snapshot().await;
    assert!(snapshot.successors.iter().all(|s| s.id != 5));
    assert!(snapshot.fingers.iter().all(|f| f.id != 5));
}
