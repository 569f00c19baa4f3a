//! Seams between the `ConnectionManager` and its transports.

use crate::connection::{ConnectionSink, ConnectionType, HandshakeOptions, ManagedConnection};
use crate::error::Result;
use crate::events::Subscription;
use crate::peer_descriptor::{PeerDescriptor, WebsocketAddress};
use crate::protocol::Message;
use async_trait::async_trait;
use std::sync::Arc;

/// What a connector learned about local reachability while listening.
#[derive(Debug, Clone, Default)]
pub struct LocalConnectivity {
    /// Server address peers can dial.
    pub websocket: Option<WebsocketAddress>,
    /// Our host as seen by an entry point, if one was asked.
    pub observed_host: Option<String>,
    /// Whether an entry point could reach our server, if one was asked.
    pub open_internet: Option<bool>,
}

impl LocalConnectivity {
    /// Combine with another connector's report. Earlier values win.
    pub fn merge(mut self, other: LocalConnectivity) -> Self {
        self.websocket = self.websocket.or(other.websocket);
        self.observed_host = self.observed_host.or(other.observed_host);
        self.open_internet = self.open_internet.or(other.open_internet);
        self
    }
}

/// A transport able to open and accept `ManagedConnection`s.
#[async_trait]
pub trait Connector: Send + Sync {
    fn connection_type(&self) -> ConnectionType;

    /// Bind local resources before the descriptor is known.
    async fn listen(&self) -> Result<LocalConnectivity> {
        Ok(LocalConnectivity::default())
    }

    /// Begin accepting connections. Incoming connections are reported to `sink`.
    fn start(self: Arc<Self>, options: HandshakeOptions, sink: Arc<dyn ConnectionSink>)
    -> Result<()>;

    /// Open a connection to `target`. Returns before the handshake completes.
    fn connect(&self, target: &PeerDescriptor) -> Result<Arc<ManagedConnection>>;

    /// Whether this connector can reach `target` at all.
    fn can_connect(&self, _local: &PeerDescriptor, _target: &PeerDescriptor) -> bool {
        true
    }

    async fn stop(&self);
}

/// Message transport as seen by services layered on a `ConnectionManager`.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, message: Message) -> Result<()>;

    fn local_peer_descriptor(&self) -> Option<PeerDescriptor>;

    /// Observe every application and RPC message delivered to this node.
    fn subscribe_messages(&self, callback: Box<dyn Fn(Message) + Send + Sync>) -> Subscription;
}
