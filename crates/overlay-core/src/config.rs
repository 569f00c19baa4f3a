//! Configuration for a `ConnectionManager`.

use crate::connector::Connector;
use crate::duplicate::DEFAULT_DUPLICATE_CAPACITY;
use crate::peer_descriptor::PeerDescriptor;
use crate::protocol::PROTOCOL_VERSION;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Configuration for a connection manager.
#[derive(Clone)]
pub struct ConnectionManagerConfig {
    /// Our descriptor. If unset, `start_with` must provide one.
    pub local_peer_descriptor: Option<PeerDescriptor>,
    /// Prepended to the manager's RPC service id (default: empty)
    pub service_id_prefix: String,
    /// Version sent in handshakes and RPCs (default: "1.0")
    pub protocol_version: String,
    /// How long a connection may take to handshake (default: 15s)
    pub handshake_timeout: Duration,
    /// How long to wait for a lock response (default: 10s)
    pub rpc_timeout: Duration,
    /// Upper bound on a graceful disconnect (default: 2s)
    pub disconnect_notice_timeout: Duration,
    /// Message ids remembered for duplicate detection (default: 10000)
    pub duplicate_detector_capacity: usize,
    pub websocket_connector: Option<Arc<dyn Connector>>,
    pub webrtc_connector: Option<Arc<dyn Connector>>,
    pub simulator_connector: Option<Arc<dyn Connector>>,
}

impl Default for ConnectionManagerConfig {
    fn default() -> Self {
        Self {
            local_peer_descriptor: None,
            service_id_prefix: String::new(),
            protocol_version: PROTOCOL_VERSION.to_string(),
            handshake_timeout: Duration::from_secs(15),
            rpc_timeout: Duration::from_secs(10),
            disconnect_notice_timeout: Duration::from_secs(2),
            duplicate_detector_capacity: DEFAULT_DUPLICATE_CAPACITY,
            websocket_connector: None,
            webrtc_connector: None,
            simulator_connector: None,
        }
    }
}

impl ConnectionManagerConfig {
    pub fn with_local_peer_descriptor(mut self, descriptor: PeerDescriptor) -> Self {
        self.local_peer_descriptor = Some(descriptor);
        self
    }

    pub fn with_service_id_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.service_id_prefix = prefix.into();
        self
    }

    pub fn with_protocol_version(mut self, version: impl Into<String>) -> Self {
        self.protocol_version = version.into();
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = timeout;
        self
    }

    pub fn with_disconnect_notice_timeout(mut self, timeout: Duration) -> Self {
        self.disconnect_notice_timeout = timeout;
        self
    }

    pub fn with_websocket_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.websocket_connector = Some(connector);
        self
    }

    pub fn with_webrtc_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.webrtc_connector = Some(connector);
        self
    }

    pub fn with_simulator_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.simulator_connector = Some(connector);
        self
    }

    /// Configured connectors in selection order.
    pub(crate) fn connectors(&self) -> Vec<Arc<dyn Connector>> {
        [
            &self.websocket_connector,
            &self.webrtc_connector,
            &self.simulator_connector,
        ]
        .into_iter()
        .flatten()
        .cloned()
        .collect()
    }
}

impl fmt::Debug for ConnectionManagerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManagerConfig")
            .field(
                "local_peer_descriptor",
                &self.local_peer_descriptor.as_ref().map(|d| d.label()),
            )
            .field("service_id_prefix", &self.service_id_prefix)
            .field("protocol_version", &self.protocol_version)
            .field("handshake_timeout", &self.handshake_timeout)
            .field("rpc_timeout", &self.rpc_timeout)
            .field("disconnect_notice_timeout", &self.disconnect_notice_timeout)
            .field("websocket", &self.websocket_connector.is_some())
            .field("webrtc", &self.webrtc_connector.is_some())
            .field("simulator", &self.simulator_connector.is_some())
            .finish()
    }
}
