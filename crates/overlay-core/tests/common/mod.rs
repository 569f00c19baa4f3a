//! Shared fixtures for the connection-manager integration tests.

#![allow(dead_code)]

use overlay_core::{
    ConnectionManager, ConnectionManagerConfig, ConnectionManagerEvent, DisconnectionType,
    LatencyType, Message, PeerDescriptor, PeerId, Simulator, SimulatorConnector, Subscription,
    TokioScheduler,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// A started manager plus everything it emitted.
pub struct TestNode {
    pub manager: ConnectionManager,
    pub descriptor: PeerDescriptor,
    events: Arc<Mutex<Vec<ConnectionManagerEvent>>>,
    _subscription: Subscription,
}

impl TestNode {
    pub async fn start(descriptor: PeerDescriptor, config: ConnectionManagerConfig) -> Self {
        let manager =
            ConnectionManager::new(config.with_local_peer_descriptor(descriptor.clone()));
        let events = Arc::new(Mutex::new(Vec::new()));
        let recorder = events.clone();
        let subscription = manager.subscribe(move |event| recorder.lock().unwrap().push(event));
        manager.start().await.expect("start manager");
        Self {
            manager,
            descriptor,
            events,
            _subscription: subscription,
        }
    }

    pub fn events(&self) -> Vec<ConnectionManagerEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Payloads received for `service_id`, in arrival order.
    pub fn payloads(&self, service_id: &str) -> Vec<Vec<u8>> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                ConnectionManagerEvent::Message(message) if message.service_id == service_id => {
                    message.as_payload().map(<[u8]>::to_vec)
                }
                _ => None,
            })
            .collect()
    }

    pub fn connected_count(&self, peer: &PeerDescriptor) -> usize {
        self.events()
            .iter()
            .filter(|event| matches!(event, ConnectionManagerEvent::Connected(p) if p == peer))
            .count()
    }

    pub fn disconnections(&self, peer: &PeerDescriptor) -> Vec<DisconnectionType> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                ConnectionManagerEvent::Disconnected(p, kind) if &p == peer => Some(kind),
                _ => None,
            })
            .collect()
    }

    pub fn errors(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                ConnectionManagerEvent::Error(error) => Some(error),
                _ => None,
            })
            .collect()
    }

    pub async fn send(&self, target: &TestNode, service_id: &str, data: &[u8]) {
        self.manager
            .send(Message::payload(
                service_id,
                target.descriptor.clone(),
                data.to_vec(),
            ))
            .await
            .expect("send");
    }
}

/// Peer ids are 20 repeated bytes, so a larger `id` is a larger peer id.
pub fn descriptor(id: u8) -> PeerDescriptor {
    PeerDescriptor::new(PeerId::from_bytes(vec![id; 20])).with_node_name(format!("node-{}", id))
}

pub fn simulator(latency: LatencyType) -> Arc<Simulator> {
    Simulator::new(latency, Arc::new(TokioScheduler::new()))
}

/// Start a node on `simulator` with an otherwise default config.
pub async fn sim_node(simulator: &Arc<Simulator>, id: u8) -> TestNode {
    sim_node_with(simulator, descriptor(id), ConnectionManagerConfig::default()).await
}

pub async fn sim_node_with(
    simulator: &Arc<Simulator>,
    descriptor: PeerDescriptor,
    config: ConnectionManagerConfig,
) -> TestNode {
    let connector = SimulatorConnector::new(simulator.clone());
    TestNode::start(descriptor, config.with_simulator_connector(connector)).await
}

/// Poll `condition` while letting virtual time run, panicking after 10s.
pub async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    for _ in 0..1000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

/// Let in-flight simulated operations finish.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(500)).await;
}
