//! WebSocket connector.
//!
//! Peers with a WebSocket server are dialed directly. A peer without one can
//! still be reached if we run a server ourselves: we send it a
//! `WebsocketConnectionRequest` over a signaling transport and wait for it to
//! dial back. The pending connection completes when that incoming socket is
//! adopted by the connection manager.
//!
//! With entry points configured, `listen` asks one of them whether our server
//! is reachable and advertises only the address it verified.

use crate::connection::WebsocketConnection;
use crate::connectivity::{ConnectivityRequest, ConnectivityResponse, send_connectivity_request};
use crate::server::WebsocketServer;
use async_trait::async_trait;
use rand::seq::IndexedRandom;
use overlay_core::protocol::{RpcPayload, WebsocketConnectionRequest, WebsocketConnectionResponse};
use overlay_core::{
    Connection, ConnectionError, ConnectionSink, ConnectionType, Connector, HandshakeOptions,
    LocalConnectivity, ManagedConnection, PeerDescriptor, Result, RpcCommunicator, Subscription,
    Transport, WebsocketAddress,
};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

pub const WEBSOCKET_CONNECTOR_SERVICE: &str = "system/websocket-connector";

/// Connectivity requests tried before `listen` gives up.
const ENTRY_POINT_ATTEMPTS: usize = 5;

#[derive(Debug, Clone)]
pub struct WebsocketConnectorConfig {
    /// Address to run a server on (default: none, outgoing connections only)
    pub listen: Option<String>,
    /// Host put in our descriptor (default: the bound IP)
    pub advertised_host: Option<String>,
    /// Limit for dialing a peer and for connection requests (default: 15s)
    pub connect_timeout: Duration,
    /// Peers asked to verify our server's reachability (default: none)
    pub entry_points: Vec<PeerDescriptor>,
    /// Pause between failed connectivity requests (default: 2s)
    pub connectivity_retry_delay: Duration,
}

impl Default for WebsocketConnectorConfig {
    fn default() -> Self {
        Self {
            listen: None,
            advertised_host: None,
            connect_timeout: Duration::from_secs(15),
            entry_points: Vec::new(),
            connectivity_retry_delay: Duration::from_secs(2),
        }
    }
}

impl WebsocketConnectorConfig {
    pub fn with_listen(mut self, addr: impl Into<String>) -> Self {
        self.listen = Some(addr.into());
        self
    }

    pub fn with_advertised_host(mut self, host: impl Into<String>) -> Self {
        self.advertised_host = Some(host.into());
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_entry_points(mut self, entry_points: Vec<PeerDescriptor>) -> Self {
        self.entry_points = entry_points;
        self
    }

    pub fn with_connectivity_retry_delay(mut self, delay: Duration) -> Self {
        self.connectivity_retry_delay = delay;
        self
    }
}

#[derive(Default)]
struct ConnectorState {
    options: Option<HandshakeOptions>,
    sink: Option<Arc<dyn ConnectionSink>>,
    server: Option<Arc<WebsocketServer>>,
    signaling: Option<Arc<dyn Transport>>,
    subscription: Option<Subscription>,
    /// Raw connections we created, closed on stop if still open.
    connections: Vec<Weak<WebsocketConnection>>,
    stopped: bool,
}

pub struct WebsocketConnector {
    config: WebsocketConnectorConfig,
    rpc: Arc<RpcCommunicator>,
    me: Weak<WebsocketConnector>,
    state: Mutex<ConnectorState>,
}

impl WebsocketConnector {
    pub fn new(config: WebsocketConnectorConfig) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            config,
            rpc: Arc::new(RpcCommunicator::new(WEBSOCKET_CONNECTOR_SERVICE)),
            me: me.clone(),
            state: Mutex::new(ConnectorState::default()),
        })
    }

    /// Transport used to exchange connection requests. Without one, only
    /// peers running a server can be reached.
    pub fn set_signaling(&self, transport: Arc<dyn Transport>) {
        let subscription = self.rpc.listen(&transport);
        let mut state = self.lock();
        state.signaling = Some(transport);
        state.subscription = Some(subscription);
    }

    /// Bound server address, once `listen` has run.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.lock().server.as_ref().map(|server| server.local_addr())
    }

    fn running(&self) -> Result<(HandshakeOptions, Arc<dyn ConnectionSink>)> {
        let state = self.lock();
        if state.stopped {
            return Err(ConnectionError::Stopped);
        }
        match (&state.options, &state.sink) {
            (Some(options), Some(sink)) => Ok((options.clone(), sink.clone())),
            _ => Err(ConnectionError::NotStarted),
        }
    }

    fn remember(&self, connection: &Arc<WebsocketConnection>) {
        let mut state = self.lock();
        state.connections.retain(|c| c.strong_count() > 0);
        state.connections.push(Arc::downgrade(connection));
    }

    fn dial(
        &self,
        options: HandshakeOptions,
        target: &PeerDescriptor,
        address: &WebsocketAddress,
    ) -> Arc<ManagedConnection> {
        debug!("Dialing {} at {}", target.label(), address.url());
        let raw = WebsocketConnection::connect(address.url(), self.config.connect_timeout);
        self.remember(&raw);
        ManagedConnection::outgoing(
            options,
            target.clone(),
            ConnectionType::WebsocketClient,
            raw,
        )
    }

    fn on_accepted(&self, connection: Arc<WebsocketConnection>) {
        let Ok((options, sink)) = self.running() else {
            connection.close(false);
            return;
        };
        self.remember(&connection);
        ManagedConnection::incoming(options, ConnectionType::WebsocketServer, connection, sink);
    }

    /// A peer without a reachable server of ours asks us to dial it.
    fn handle_connection_request(&self, requester: &PeerDescriptor) -> WebsocketConnectionResponse {
        let rejected = |reason: &str| WebsocketConnectionResponse {
            accepted: false,
            reason: Some(reason.to_string()),
        };
        let Ok((options, sink)) = self.running() else {
            return rejected("connector not running");
        };
        let Some(address) = requester.websocket() else {
            return rejected("requester has no websocket server");
        };
        if requester.key() == options.local.key() {
            return rejected("cannot connect to self");
        }

        info!("Connecting back to {} on request", requester.label());
        let managed = self.dial(options, requester, address);
        sink.on_new_connection(managed);
        WebsocketConnectionResponse {
            accepted: true,
            reason: None,
        }
    }

    fn request_connection(
        &self,
        local: PeerDescriptor,
        target: &PeerDescriptor,
        signaling: Arc<dyn Transport>,
        placeholder: &Arc<ManagedConnection>,
    ) {
        let rpc = self.rpc.clone();
        let target = target.clone();
        let placeholder = Arc::downgrade(placeholder);
        let timeout = self.config.connect_timeout;
        tokio::spawn(async move {
            let payload = RpcPayload::WebsocketConnectionRequest(WebsocketConnectionRequest {
                requester: local,
            });
            let failure = match rpc.request(signaling.as_ref(), &target, payload, timeout).await {
                Ok(RpcPayload::WebsocketConnectionResponse(response)) if response.accepted => None,
                Ok(RpcPayload::WebsocketConnectionResponse(response)) => Some(
                    response
                        .reason
                        .unwrap_or_else(|| "connection request rejected".to_string()),
                ),
                Ok(other) => Some(format!("unexpected response {}", other.method())),
                Err(e) => Some(e.to_string()),
            };
            if let Some(reason) = failure {
                warn!("Connection request to {} failed: {}", target.label(), reason);
                if let Some(placeholder) = placeholder.upgrade() {
                    placeholder.abort(ConnectionError::ConnectionFailed(reason));
                }
            }
        });
    }

    /// Ask random entry points how they see our server, retrying on failure.
    async fn check_connectivity(&self, port: u16) -> Result<ConnectivityResponse> {
        let entry_points: Vec<&WebsocketAddress> = self
            .config
            .entry_points
            .iter()
            .filter_map(PeerDescriptor::websocket)
            .collect();
        for attempt in 1..=ENTRY_POINT_ATTEMPTS {
            let Some(entry_point) = entry_points.choose(&mut rand::rng()) else {
                break;
            };
            let request = ConnectivityRequest {
                host: self.config.advertised_host.clone(),
                port,
                tls: false,
            };
            match send_connectivity_request(entry_point, request).await {
                Ok(response) => return Ok(response),
                Err(e) => {
                    warn!(
                        "Connectivity check via {} failed (attempt {}/{}): {}",
                        entry_point.url(),
                        attempt,
                        ENTRY_POINT_ATTEMPTS,
                        e
                    );
                    if attempt < ENTRY_POINT_ATTEMPTS {
                        tokio::time::sleep(self.config.connectivity_retry_delay).await;
                    }
                }
            }
        }
        Err(ConnectionError::ConnectionFailed(format!(
            "Failed to reach the entry points after {} attempts",
            ENTRY_POINT_ATTEMPTS
        )))
    }

    fn lock(&self) -> MutexGuard<'_, ConnectorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Connector for WebsocketConnector {
    fn connection_type(&self) -> ConnectionType {
        ConnectionType::WebsocketClient
    }

    async fn listen(&self) -> Result<LocalConnectivity> {
        let Some(listen) = &self.config.listen else {
            return Ok(LocalConnectivity::default());
        };
        let server = WebsocketServer::bind(listen)
            .await
            .map_err(|e| ConnectionError::Transport(format!("Failed to bind {}: {}", listen, e)))?;
        let addr = server.local_addr();
        let server = Arc::new(server);
        self.lock().server = Some(server.clone());

        // Accept before the check so the entry point's probe gets through.
        // Peer connections are refused until `start`.
        let me = self.me.clone();
        server.start(Arc::new(move |connection| {
            if let Some(connector) = me.upgrade() {
                connector.on_accepted(connection);
            } else {
                connection.close(false);
            }
        }));

        if self.config.entry_points.iter().any(|e| e.websocket().is_some()) {
            let response = match self.check_connectivity(addr.port()).await {
                Ok(response) => response,
                Err(e) => {
                    server.stop();
                    self.lock().server = None;
                    return Err(e);
                }
            };
            if response.open_internet {
                info!("Connectivity check passed, reachable as {}", response.host);
            } else {
                warn!(
                    "Server on port {} is not reachable at {}, advertising no address",
                    addr.port(),
                    response.host
                );
            }
            return Ok(LocalConnectivity {
                websocket: response.websocket,
                observed_host: Some(response.host),
                open_internet: Some(response.open_internet),
            });
        }

        let host = match &self.config.advertised_host {
            Some(host) => host.clone(),
            None if addr.ip().is_unspecified() => {
                warn!("Listening on {} without an advertised host, advertising localhost", addr);
                "127.0.0.1".to_string()
            }
            None => addr.ip().to_string(),
        };
        Ok(LocalConnectivity {
            websocket: Some(WebsocketAddress::new(host, addr.port())),
            ..LocalConnectivity::default()
        })
    }

    fn start(
        self: Arc<Self>,
        options: HandshakeOptions,
        sink: Arc<dyn ConnectionSink>,
    ) -> Result<()> {
        let me = self.me.clone();
        self.rpc.set_handler(Arc::new(
            move |_source: &PeerDescriptor, payload: RpcPayload| {
                let connector = me.upgrade()?;
                match payload {
                    RpcPayload::WebsocketConnectionRequest(request) => Some(
                        RpcPayload::WebsocketConnectionResponse(
                            connector.handle_connection_request(&request.requester),
                        ),
                    ),
                    other => {
                        debug!("Unexpected {} on {}", other.method(), WEBSOCKET_CONNECTOR_SERVICE);
                        None
                    }
                }
            },
        ));

        let mut state = self.lock();
        state.options = Some(options);
        state.sink = Some(sink);
        state.stopped = false;
        Ok(())
    }

    fn connect(&self, target: &PeerDescriptor) -> Result<Arc<ManagedConnection>> {
        let (options, _) = self.running()?;
        if let Some(address) = target.websocket() {
            return Ok(self.dial(options, target, address));
        }

        let signaling = {
            let state = self.lock();
            state.server.is_some().then(|| state.signaling.clone()).flatten()
        };
        match signaling {
            Some(signaling) if options.local.websocket().is_some() => {
                debug!("Requesting a connection from {}", target.label());
                let local = options.local.clone();
                let placeholder = ManagedConnection::pending(
                    options,
                    target.clone(),
                    ConnectionType::WebsocketServer,
                );
                self.request_connection(local, target, signaling, &placeholder);
                Ok(placeholder)
            }
            _ => Err(ConnectionError::NoTransport(target.key())),
        }
    }

    fn can_connect(&self, local: &PeerDescriptor, target: &PeerDescriptor) -> bool {
        if target.websocket().is_some() {
            return true;
        }
        let state = self.lock();
        local.websocket().is_some() && state.server.is_some() && state.signaling.is_some()
    }

    async fn stop(&self) {
        let (server, connections) = {
            let mut state = self.lock();
            state.stopped = true;
            state.sink = None;
            state.subscription = None;
            state.signaling = None;
            (
                state.server.take(),
                std::mem::take(&mut state.connections),
            )
        };
        self.rpc.clear_handler();
        self.rpc.cancel_all();
        if let Some(server) = server {
            server.stop();
        }
        for connection in connections.iter().filter_map(Weak::upgrade) {
            connection.close(false);
        }
    }
}
