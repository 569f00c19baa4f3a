//! Duplicate and simultaneous connection attempts between two managers.

mod common;

use common::{descriptor, settle, sim_node, simulator, wait_until};
use futures::future::join;
use overlay_core::{
    ConnectionError, ConnectionType, HandshakeError, HandshakeOptions, LatencyType,
    ManagedConnection, PROTOCOL_VERSION, SimulatorConnection,
};
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn test_simultaneous_open_converges() {
    let sim = simulator(LatencyType::Fixed(Duration::from_millis(10)));
    let low = sim_node(&sim, 1).await;
    let high = sim_node(&sim, 2).await;

    join(
        low.send(&high, "app", b"from low"),
        high.send(&low, "app", b"from high"),
    )
    .await;

    wait_until("both messages delivered", || {
        low.payloads("app").len() == 1 && high.payloads("app").len() == 1
    })
    .await;
    assert_eq!(low.payloads("app"), vec![b"from high".to_vec()]);
    assert_eq!(high.payloads("app"), vec![b"from low".to_vec()]);

    settle().await;
    assert_eq!(low.manager.connection_count(), 1);
    assert_eq!(high.manager.connection_count(), 1);
    assert_eq!(low.connected_count(&high.descriptor), 1);
    assert_eq!(high.connected_count(&low.descriptor), 1);
    assert!(low.disconnections(&high.descriptor).is_empty());
    assert!(high.disconnections(&low.descriptor).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_simultaneous_open_keeps_working_afterwards() {
    let sim = simulator(LatencyType::Fixed(Duration::from_millis(10)));
    let low = sim_node(&sim, 1).await;
    let high = sim_node(&sim, 2).await;

    join(
        low.send(&high, "app", b"1"),
        high.send(&low, "app", b"1"),
    )
    .await;
    settle().await;

    // Let any rejected attempts finish closing, then use the survivor.
    tokio::time::sleep(Duration::from_secs(5)).await;
    low.send(&high, "app", b"2").await;
    high.send(&low, "app", b"2").await;
    wait_until("second round delivered", || {
        low.payloads("app").len() == 2 && high.payloads("app").len() == 2
    })
    .await;
    assert_eq!(low.manager.connection_count(), 1);
    assert_eq!(high.manager.connection_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_sequential_sends_reuse_connection() {
    let sim = simulator(LatencyType::Fixed(Duration::from_millis(10)));
    let a = sim_node(&sim, 1).await;
    let b = sim_node(&sim, 2).await;

    a.send(&b, "app", b"1").await;
    b.send(&a, "app", b"2").await;
    a.send(&b, "app", b"3").await;
    wait_until("delivered", || {
        a.payloads("app").len() == 1 && b.payloads("app").len() == 2
    })
    .await;
    assert_eq!(b.payloads("app"), vec![b"1".to_vec(), b"3".to_vec()]);
    assert_eq!(a.manager.connection_count(), 1);
    assert_eq!(b.manager.connection_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_connection_is_rejected() {
    let sim = simulator(LatencyType::Fixed(Duration::from_millis(10)));
    let existing_low = sim_node(&sim, 1).await;
    let high = sim_node(&sim, 2).await;

    high.send(&existing_low, "app", b"hello").await;
    wait_until("connected", || existing_low.payloads("app").len() == 1).await;

    // A second, unmanaged attempt from the same peer while the first is up.
    let options = HandshakeOptions {
        local: high.descriptor.clone(),
        protocol_version: PROTOCOL_VERSION.to_string(),
        timeout: Duration::from_secs(15),
    };
    let raw = SimulatorConnection::new(
        high.descriptor.clone(),
        existing_low.descriptor.clone(),
        sim.clone(),
    );
    let duplicate = ManagedConnection::outgoing(
        options,
        existing_low.descriptor.clone(),
        ConnectionType::Simulator,
        raw.clone(),
    );
    raw.connect().unwrap();

    let result = duplicate.send(b"again".to_vec()).await;
    assert!(matches!(
        result,
        Err(ConnectionError::HandshakeRejected(HandshakeError::Duplicate))
    ));

    settle().await;
    assert_eq!(existing_low.manager.connection_count(), 1);
    assert_eq!(existing_low.connected_count(&high.descriptor), 1);
    assert!(existing_low.manager.has_connection(&high.descriptor));
}

#[tokio::test(start_paused = true)]
async fn test_send_to_self_is_rejected() {
    let sim = simulator(LatencyType::None);
    let a = sim_node(&sim, 1).await;
    let result = a
        .manager
        .send(overlay_core::Message::payload(
            "app",
            descriptor(1),
            b"me".to_vec(),
        ))
        .await;
    assert!(matches!(result, Err(ConnectionError::CannotConnectToSelf)));
    assert_eq!(a.manager.connection_count(), 0);
}
