//! WebRTC connections signaled over a simulated network.
//!
//! Each node runs two managers with the same descriptor: one on the
//! simulator carrying signaling, and one whose only connector is WebRTC.

mod common;

use common::{TestNode, descriptor, sim_node_with, simulator, wait_until};
use overlay_core::webrtc::is_offering;
use overlay_core::{
    ConnectionManagerConfig, ConnectionType, LatencyType, LoopbackWebrtcEngine, PeerDescriptor,
    Simulator, Transport, WebrtcConnector,
};
use std::sync::Arc;
use std::time::Duration;

struct WebrtcNode {
    signaling: TestNode,
    data: TestNode,
    connector: Arc<WebrtcConnector>,
}

async fn webrtc_node(
    sim: &Arc<Simulator>,
    engine: &LoopbackWebrtcEngine,
    descriptor: PeerDescriptor,
) -> WebrtcNode {
    let signaling = sim_node_with(sim, descriptor.clone(), ConnectionManagerConfig::default()).await;
    let transport: Arc<dyn Transport> = Arc::new(signaling.manager.clone());
    let connector = WebrtcConnector::new(Arc::new(engine.clone()), transport);
    let data = TestNode::start(
        descriptor,
        ConnectionManagerConfig::default()
            .with_service_id_prefix("data/")
            .with_webrtc_connector(connector.clone()),
    )
    .await;
    WebrtcNode {
        signaling,
        data,
        connector,
    }
}

/// Two descriptors where the first one makes the offer.
fn offerer_pair() -> (PeerDescriptor, PeerDescriptor) {
    let a = descriptor(1).with_webrtc();
    let b = descriptor(2).with_webrtc();
    if is_offering(&a.peer_id, &b.peer_id) {
        (a, b)
    } else {
        (b, a)
    }
}

async fn exchange(initiator: &WebrtcNode, acceptor: &WebrtcNode) {
    initiator
        .data
        .send(&acceptor.data, "app", b"ping")
        .await;
    wait_until("ping delivered", || {
        acceptor.data.payloads("app") == vec![b"ping".to_vec()]
    })
    .await;

    acceptor
        .data
        .send(&initiator.data, "app", b"pong")
        .await;
    wait_until("pong delivered", || {
        initiator.data.payloads("app") == vec![b"pong".to_vec()]
    })
    .await;

    for (node, peer) in [(initiator, acceptor), (acceptor, initiator)] {
        let connection = node
            .data
            .manager
            .get_connection(&peer.data.descriptor)
            .expect("connection");
        assert_eq!(connection.connection_type(), ConnectionType::Webrtc);
        assert_eq!(node.data.manager.connection_count(), 1);
        assert_eq!(node.data.connected_count(&peer.data.descriptor), 1);
    }
}

#[tokio::test(start_paused = true)]
async fn test_offerer_initiates() {
    let sim = simulator(LatencyType::Fixed(Duration::from_millis(10)));
    let engine = LoopbackWebrtcEngine::new();
    let (offerer, answerer) = offerer_pair();
    let offerer = webrtc_node(&sim, &engine, offerer).await;
    let answerer = webrtc_node(&sim, &engine, answerer).await;

    exchange(&offerer, &answerer).await;
    assert_eq!(engine.open_offers(), 0);
    assert!(offerer.signaling.manager.has_connection(&answerer.signaling.descriptor));
}

#[tokio::test(start_paused = true)]
async fn test_non_offerer_initiates() {
    let sim = simulator(LatencyType::Fixed(Duration::from_millis(10)));
    let engine = LoopbackWebrtcEngine::new();
    let (offerer, answerer) = offerer_pair();
    let offerer = webrtc_node(&sim, &engine, offerer).await;
    let answerer = webrtc_node(&sim, &engine, answerer).await;

    exchange(&answerer, &offerer).await;
    assert_eq!(engine.open_offers(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_closes_data_channel() {
    let sim = simulator(LatencyType::Fixed(Duration::from_millis(10)));
    let engine = LoopbackWebrtcEngine::new();
    let (first, second) = offerer_pair();
    let a = webrtc_node(&sim, &engine, first).await;
    let b = webrtc_node(&sim, &engine, second).await;
    exchange(&a, &b).await;

    a.data
        .manager
        .gracefully_disconnect(&b.data.descriptor, overlay_core::DisconnectMode::Normal)
        .await;
    wait_until("peer closes", || {
        !b.data.manager.has_connection(&a.data.descriptor)
    })
    .await;
    wait_until("attempts cleaned up", || {
        a.connector.attempt_count() == 0 && b.connector.attempt_count() == 0
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_peer_without_webrtc_is_unreachable() {
    let sim = simulator(LatencyType::None);
    let engine = LoopbackWebrtcEngine::new();
    let a = webrtc_node(&sim, &engine, descriptor(1).with_webrtc()).await;

    let result = a
        .data
        .manager
        .send(overlay_core::Message::payload(
            "app",
            descriptor(2),
            b"x".to_vec(),
        ))
        .await;
    assert!(matches!(
        result,
        Err(overlay_core::ConnectionError::NoTransport(_))
    ));
}
