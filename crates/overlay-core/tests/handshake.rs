//! Handshake outcomes seen through the connection manager.

mod common;

use async_trait::async_trait;
use common::{TestNode, descriptor, sim_node, sim_node_with, simulator, wait_until};
use overlay_core::connection::ConnectionEvents;
use overlay_core::{
    Connection, ConnectionError, ConnectionEvent, ConnectionId, ConnectionManagerConfig,
    ConnectionSink, ConnectionState, ConnectionType, Connector, HandshakeError, HandshakeOptions,
    LatencyType, ManagedConnection, Message, PeerDescriptor,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// Raw connection that never connects.
struct SilentConnection {
    id: ConnectionId,
    events: ConnectionEvents,
}

impl Connection for SilentConnection {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    fn connection_type(&self) -> ConnectionType {
        ConnectionType::Simulator
    }

    fn state(&self) -> ConnectionState {
        ConnectionState::Connecting
    }

    fn send(&self, _data: Vec<u8>) {}

    fn close(&self, _graceful: bool) {}

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ConnectionEvent>> {
        self.events.take()
    }
}

#[derive(Default)]
struct SilentConnector {
    options: Mutex<Option<HandshakeOptions>>,
}

#[async_trait]
impl Connector for SilentConnector {
    fn connection_type(&self) -> ConnectionType {
        ConnectionType::Simulator
    }

    fn start(
        self: Arc<Self>,
        options: HandshakeOptions,
        _sink: Arc<dyn ConnectionSink>,
    ) -> overlay_core::Result<()> {
        *self.options.lock().unwrap() = Some(options);
        Ok(())
    }

    fn connect(&self, target: &PeerDescriptor) -> overlay_core::Result<Arc<ManagedConnection>> {
        let options = self
            .options
            .lock()
            .unwrap()
            .clone()
            .ok_or(ConnectionError::NotStarted)?;
        let raw = Arc::new(SilentConnection {
            id: ConnectionId::new(ConnectionType::Simulator),
            events: ConnectionEvents::new(),
        });
        Ok(ManagedConnection::outgoing(
            options,
            target.clone(),
            ConnectionType::Simulator,
            raw,
        ))
    }

    async fn stop(&self) {}
}

// ==================== Versions ====================

#[tokio::test(start_paused = true)]
async fn test_incompatible_major_version_fails_send() {
    let sim = simulator(LatencyType::Fixed(Duration::from_millis(10)));
    let old = sim_node(&sim, 1).await;
    let new = sim_node_with(
        &sim,
        descriptor(2),
        ConnectionManagerConfig::default().with_protocol_version("2.0"),
    )
    .await;

    let result = old
        .manager
        .send(Message::payload("app", new.descriptor.clone(), b"hi".to_vec()))
        .await;
    assert!(matches!(
        result,
        Err(ConnectionError::HandshakeRejected(
            HandshakeError::UnsupportedVersion(ref v)
        )) if v == "1.0"
    ));

    wait_until("error event", || !old.errors().is_empty()).await;
    assert!(!old.manager.has_connection(&new.descriptor));
    assert!(!new.manager.has_connection(&old.descriptor));
    assert_eq!(old.connected_count(&new.descriptor), 0);
}

#[tokio::test(start_paused = true)]
async fn test_minor_version_difference_connects() {
    let sim = simulator(LatencyType::Fixed(Duration::from_millis(10)));
    let a = sim_node(&sim, 1).await;
    let b = sim_node_with(
        &sim,
        descriptor(2),
        ConnectionManagerConfig::default().with_protocol_version("1.4"),
    )
    .await;

    a.send(&b, "app", b"hi").await;
    wait_until("delivered", || b.payloads("app") == vec![b"hi".to_vec()]).await;
    assert_eq!(a.connected_count(&b.descriptor), 1);
}

// ==================== Buffering ====================

#[tokio::test(start_paused = true)]
async fn test_sends_during_handshake_arrive_in_order() {
    let sim = simulator(LatencyType::Fixed(Duration::from_millis(25)));
    let a = sim_node(&sim, 1).await;
    let b = sim_node(&sim, 2).await;

    let sends = (0u8..5).map(|i| {
        a.manager
            .send(Message::payload("app", b.descriptor.clone(), vec![i]))
    });
    for result in futures::future::join_all(sends).await {
        result.unwrap();
    }

    wait_until("all delivered", || b.payloads("app").len() == 5).await;
    assert_eq!(
        b.payloads("app"),
        (0u8..5).map(|i| vec![i]).collect::<Vec<_>>()
    );
    assert_eq!(a.manager.connection_count(), 1);
}

// ==================== Failures ====================

#[tokio::test(start_paused = true)]
async fn test_handshake_timeout_fails_send() {
    let config = ConnectionManagerConfig::default()
        .with_handshake_timeout(Duration::from_secs(5))
        .with_simulator_connector(Arc::new(SilentConnector::default()));
    let a = TestNode::start(descriptor(1), config).await;

    let started = tokio::time::Instant::now();
    let result = a
        .manager
        .send(Message::payload("app", descriptor(2), b"hello?".to_vec()))
        .await;
    assert!(matches!(result, Err(ConnectionError::HandshakeTimeout)));
    assert!(started.elapsed() >= Duration::from_secs(5));

    wait_until("error event", || !a.errors().is_empty()).await;
    assert!(!a.manager.has_connection(&descriptor(2)));
}

#[tokio::test(start_paused = true)]
async fn test_unknown_peer_fails_send() {
    let sim = simulator(LatencyType::Fixed(Duration::from_millis(10)));
    let a = sim_node(&sim, 1).await;

    let result = a
        .manager
        .send(Message::payload("app", descriptor(9), b"anyone?".to_vec()))
        .await;
    assert!(matches!(result, Err(ConnectionError::ConnectionFailed(_))));
    wait_until("entry removed", || !a.manager.has_connection(&descriptor(9))).await;
}

#[tokio::test(start_paused = true)]
async fn test_failed_peer_can_be_retried() {
    let sim = simulator(LatencyType::Fixed(Duration::from_millis(10)));
    let a = sim_node(&sim, 1).await;

    let late = descriptor(2);
    let first = a
        .manager
        .send(Message::payload("app", late.clone(), b"1".to_vec()))
        .await;
    assert!(first.is_err());
    wait_until("entry removed", || !a.manager.has_connection(&late)).await;

    let b = sim_node(&sim, 2).await;
    a.send(&b, "app", b"2").await;
    wait_until("delivered", || b.payloads("app") == vec![b"2".to_vec()]).await;
}
