//! Connection locking, graceful disconnects and garbage collection between
//! managers on a simulated network.

mod common;

use common::{descriptor, settle, sim_node, simulator, wait_until};
use overlay_core::protocol::{DisconnectNotice, RpcPayload, UnlockRequest};
use overlay_core::{
    ConnectionError, DisconnectMode, DisconnectionType, LatencyType, PROTOCOL_VERSION,
    RpcCommunicator,
};
use std::time::Duration;

// ==================== Locking ====================

#[tokio::test(start_paused = true)]
async fn test_lock_and_unlock_are_mirrored() {
    let sim = simulator(LatencyType::Fixed(Duration::from_millis(10)));
    let a = sim_node(&sim, 1).await;
    let b = sim_node(&sim, 2).await;

    a.manager
        .lock_connection(&b.descriptor, "dht")
        .await
        .unwrap();
    assert!(a.manager.has_local_locked_connection(&b.descriptor, Some("dht")));
    assert!(b.manager.has_remote_locked_connection(&a.descriptor, Some("dht")));
    assert!(a.manager.has_connection(&b.descriptor));

    a.manager.unlock_connection(&b.descriptor, "dht");
    assert!(!a.manager.has_local_locked_connection(&b.descriptor, None));
    wait_until("remote unlock", || {
        !b.manager.has_remote_locked_connection(&a.descriptor, None)
    })
    .await;

    // Unlocking never closes the connection.
    settle().await;
    assert!(a.manager.has_connection(&b.descriptor));
    assert!(b.manager.has_connection(&a.descriptor));
}

#[tokio::test(start_paused = true)]
async fn test_services_share_one_connection() {
    let sim = simulator(LatencyType::Fixed(Duration::from_millis(10)));
    let a = sim_node(&sim, 1).await;
    let b = sim_node(&sim, 2).await;

    a.manager.lock_connection(&b.descriptor, "dht").await.unwrap();
    a.manager.lock_connection(&b.descriptor, "store").await.unwrap();
    assert_eq!(a.manager.connection_count(), 1);
    assert_eq!(b.manager.connection_count(), 1);
    assert!(b.manager.has_remote_locked_connection(&a.descriptor, Some("dht")));
    assert!(b.manager.has_remote_locked_connection(&a.descriptor, Some("store")));

    a.manager.unlock_connection(&b.descriptor, "dht");
    wait_until("dht unlock", || {
        !b.manager.has_remote_locked_connection(&a.descriptor, Some("dht"))
    })
    .await;
    assert!(b.manager.has_remote_locked_connection(&a.descriptor, Some("store")));
    assert!(a.manager.has_local_locked_connection(&b.descriptor, None));

    a.manager.unlock_connection(&b.descriptor, "store");
    wait_until("store unlock", || {
        !b.manager.has_remote_locked_connection(&a.descriptor, None)
    })
    .await;
    assert_eq!(a.manager.connection_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_repeated_lock_needs_matching_unlocks() {
    let sim = simulator(LatencyType::None);
    let a = sim_node(&sim, 1).await;
    let b = sim_node(&sim, 2).await;

    a.manager.lock_connection(&b.descriptor, "dht").await.unwrap();
    a.manager.lock_connection(&b.descriptor, "dht").await.unwrap();

    a.manager.unlock_connection(&b.descriptor, "dht");
    settle().await;
    assert!(a.manager.has_local_locked_connection(&b.descriptor, Some("dht")));
    assert!(b.manager.has_remote_locked_connection(&a.descriptor, Some("dht")));

    a.manager.unlock_connection(&b.descriptor, "dht");
    wait_until("remote unlock", || {
        !b.manager.has_remote_locked_connection(&a.descriptor, None)
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_lock_to_self_is_rejected() {
    let sim = simulator(LatencyType::None);
    let a = sim_node(&sim, 1).await;
    let result = a.manager.lock_connection(&a.descriptor, "dht").await;
    assert!(matches!(result, Err(ConnectionError::CannotConnectToSelf)));
    assert!(!a.manager.has_local_locked_connection(&a.descriptor, None));
}

#[tokio::test(start_paused = true)]
async fn test_lock_to_unreachable_peer_keeps_local_lock() {
    let sim = simulator(LatencyType::None);
    let a = sim_node(&sim, 1).await;
    let ghost = descriptor(9);

    a.manager.lock_connection(&ghost, "dht").await.unwrap();
    assert!(a.manager.has_local_locked_connection(&ghost, Some("dht")));
}

// ==================== Graceful disconnect ====================

#[tokio::test(start_paused = true)]
async fn test_mutual_locks_survive_garbage_collection() {
    let sim = simulator(LatencyType::Fixed(Duration::from_millis(10)));
    let a = sim_node(&sim, 1).await;
    let b = sim_node(&sim, 2).await;

    a.manager.lock_connection(&b.descriptor, "dht").await.unwrap();
    b.manager.lock_connection(&a.descriptor, "dht").await.unwrap();

    tokio::time::sleep(Duration::from_secs(60)).await;
    a.manager
        .garbage_collect_connections(0, Duration::ZERO)
        .await;
    b.manager
        .garbage_collect_connections(0, Duration::ZERO)
        .await;
    settle().await;

    assert!(a.manager.has_connection(&b.descriptor));
    assert!(b.manager.has_connection(&a.descriptor));
    assert!(a.disconnections(&b.descriptor).is_empty());
    assert!(b.disconnections(&a.descriptor).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_one_sided_unlock_still_survives_garbage_collection() {
    let sim = simulator(LatencyType::Fixed(Duration::from_millis(10)));
    let a = sim_node(&sim, 1).await;
    let b = sim_node(&sim, 2).await;

    a.manager.lock_connection(&b.descriptor, "dht").await.unwrap();
    b.manager.lock_connection(&a.descriptor, "dht").await.unwrap();
    a.manager.unlock_connection(&b.descriptor, "dht");
    wait_until("remote unlock", || {
        !b.manager.has_remote_locked_connection(&a.descriptor, None)
    })
    .await;

    // A still holds B's remote lock and B still holds its own local lock.
    assert!(a.manager.has_remote_locked_connection(&b.descriptor, Some("dht")));
    assert!(b.manager.has_local_locked_connection(&a.descriptor, Some("dht")));

    tokio::time::sleep(Duration::from_secs(60)).await;
    a.manager
        .garbage_collect_connections(0, Duration::ZERO)
        .await;
    b.manager
        .garbage_collect_connections(0, Duration::ZERO)
        .await;
    settle().await;

    assert!(a.manager.has_connection(&b.descriptor));
    assert!(b.manager.has_connection(&a.descriptor));
    assert!(a.disconnections(&b.descriptor).is_empty());
    assert!(b.disconnections(&a.descriptor).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_graceful_disconnect_clears_both_sides() {
    let sim = simulator(LatencyType::Fixed(Duration::from_millis(10)));
    let a = sim_node(&sim, 1).await;
    let b = sim_node(&sim, 2).await;

    a.manager.lock_connection(&b.descriptor, "dht").await.unwrap();
    b.manager.lock_connection(&a.descriptor, "dht").await.unwrap();

    a.manager
        .gracefully_disconnect(&b.descriptor, DisconnectMode::Normal)
        .await;
    assert!(!a.manager.has_connection(&b.descriptor));
    assert!(!a.manager.has_local_locked_connection(&b.descriptor, None));
    assert!(!a.manager.has_remote_locked_connection(&b.descriptor, None));

    wait_until("peer closes", || !b.manager.has_connection(&a.descriptor)).await;
    assert!(!b.manager.has_local_locked_connection(&a.descriptor, None));
    assert!(!b.manager.has_remote_locked_connection(&a.descriptor, None));

    settle().await;
    assert_eq!(
        a.disconnections(&b.descriptor),
        vec![DisconnectionType::Graceful(DisconnectMode::Normal)]
    );
    assert_eq!(
        b.disconnections(&a.descriptor),
        vec![DisconnectionType::Graceful(DisconnectMode::Normal)]
    );
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_unknown_peer_is_noop() {
    let sim = simulator(LatencyType::None);
    let a = sim_node(&sim, 1).await;
    a.manager
        .gracefully_disconnect(&descriptor(7), DisconnectMode::Normal)
        .await;
    assert!(a.events().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_stop_leaves_every_peer() {
    let sim = simulator(LatencyType::Fixed(Duration::from_millis(10)));
    let a = sim_node(&sim, 1).await;
    let b = sim_node(&sim, 2).await;
    let c = sim_node(&sim, 3).await;

    a.send(&b, "app", b"hi b").await;
    a.send(&c, "app", b"hi c").await;
    wait_until("both delivered", || {
        b.payloads("app").len() == 1 && c.payloads("app").len() == 1
    })
    .await;

    a.manager.stop().await;
    assert_eq!(a.manager.connection_count(), 0);
    for peer in [&b, &c] {
        wait_until("peer sees leave", || {
            peer.disconnections(&a.descriptor)
                == vec![DisconnectionType::Graceful(DisconnectMode::Leaving)]
        })
        .await;
        assert!(!peer.manager.has_connection(&a.descriptor));
    }
}

// ==================== Garbage collection ====================

#[tokio::test(start_paused = true)]
async fn test_gc_closes_only_idle_unlocked_connections() {
    let sim = simulator(LatencyType::Fixed(Duration::from_millis(10)));
    let a = sim_node(&sim, 1).await;
    let idle = sim_node(&sim, 2).await;
    let locked = sim_node(&sim, 3).await;
    let busy = sim_node(&sim, 4).await;

    a.send(&idle, "app", b"1").await;
    a.send(&busy, "app", b"1").await;
    a.manager
        .lock_connection(&locked.descriptor, "dht")
        .await
        .unwrap();
    assert_eq!(a.manager.connection_count(), 3);

    tokio::time::sleep(Duration::from_secs(30)).await;
    a.send(&busy, "app", b"2").await;

    a.manager
        .garbage_collect_connections(1, Duration::from_secs(10))
        .await;

    assert!(!a.manager.has_connection(&idle.descriptor));
    assert!(a.manager.has_connection(&locked.descriptor));
    assert!(a.manager.has_connection(&busy.descriptor));
    wait_until("idle peer closes", || {
        !idle.manager.has_connection(&a.descriptor)
    })
    .await;
    assert_eq!(
        idle.disconnections(&a.descriptor),
        vec![DisconnectionType::Graceful(DisconnectMode::Normal)]
    );
}

#[tokio::test(start_paused = true)]
async fn test_gc_under_limit_does_nothing() {
    let sim = simulator(LatencyType::None);
    let a = sim_node(&sim, 1).await;
    let b = sim_node(&sim, 2).await;

    a.send(&b, "app", b"1").await;
    tokio::time::sleep(Duration::from_secs(60)).await;
    a.manager
        .garbage_collect_connections(1, Duration::ZERO)
        .await;
    assert!(a.manager.has_connection(&b.descriptor));
}

// ==================== Message sources ====================

#[tokio::test(start_paused = true)]
async fn test_rpc_source_is_the_connected_peer() {
    let sim = simulator(LatencyType::Fixed(Duration::from_millis(10)));
    let a = sim_node(&sim, 1).await;
    let b = sim_node(&sim, 2).await;
    let c = sim_node(&sim, 3).await;

    a.manager.lock_connection(&b.descriptor, "dht").await.unwrap();
    c.send(&b, "app", b"hi").await;
    wait_until("c connected", || b.payloads("app").len() == 1).await;

    // C writes messages on its own connection that claim to come from A.
    let rpc = RpcCommunicator::new(b.manager.service_id());
    let unlock = rpc.notification(
        &b.descriptor,
        RpcPayload::UnlockRequest(UnlockRequest {
            peer_descriptor: a.descriptor.clone(),
            protocol_version: PROTOCOL_VERSION.to_string(),
            service_id: "dht".to_string(),
        }),
    );
    let notice = rpc.notification(
        &b.descriptor,
        RpcPayload::DisconnectNotice(DisconnectNotice {
            peer_descriptor: a.descriptor.clone(),
            protocol_version: PROTOCOL_VERSION.to_string(),
            disconnect_mode: DisconnectMode::Leaving,
        }),
    );
    let to_b = c.manager.get_connection(&b.descriptor).unwrap();
    for mut message in [unlock, notice] {
        message.source_descriptor = Some(a.descriptor.clone());
        to_b.send(message.encode().unwrap()).await.unwrap();
    }

    // The notice is attributed to C, so B drops C and keeps A.
    wait_until("b drops c", || !b.manager.has_connection(&c.descriptor)).await;
    settle().await;
    assert!(b.manager.has_connection(&a.descriptor));
    assert!(b.manager.has_remote_locked_connection(&a.descriptor, Some("dht")));
    assert!(b.disconnections(&a.descriptor).is_empty());
    assert_eq!(
        b.disconnections(&c.descriptor),
        vec![DisconnectionType::Graceful(DisconnectMode::Leaving)]
    );
}
