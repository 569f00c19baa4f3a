//! overlay-core: connection management for a peer-to-peer overlay network.
//!
//! This crate provides:
//! - `ConnectionManager`: one handshake-negotiated connection per peer,
//!   opened on demand over the first connector able to reach it
//! - Per-service connection locks and graceful, notice-based disconnects
//! - `Connection`/`Connector` traits and the WebRTC connector
//! - A deterministic virtual network (`Simulator`) driven by a `Scheduler`

pub mod config;
pub mod connection;
pub mod connector;
pub mod duplicate;
pub mod error;
pub mod events;
pub mod locks;
pub mod manager;
pub mod peer_descriptor;
pub mod protocol;
pub mod rpc;
pub mod scheduler;
pub mod simulator;
pub mod webrtc;

pub use config::ConnectionManagerConfig;
pub use connection::{
    Connection, ConnectionDirection, ConnectionEvent, ConnectionId, ConnectionSink,
    ConnectionState, ConnectionType, HandshakeOptions, ManagedConnection, ManagedConnectionEvent,
};
pub use connector::{Connector, LocalConnectivity, Transport};
pub use error::{ConnectionError, HandshakeError, Result, SimulatorError};
pub use events::{ConnectionManagerEvent, DisconnectionType, EventBus, Subscription};
pub use manager::{CONNECTION_MANAGER_SERVICE, ConnectionManager};
pub use peer_descriptor::{PeerDescriptor, PeerId, PeerIdError, PeerKey, WebsocketAddress};
pub use protocol::{DisconnectMode, Message, MessageBody, PROTOCOL_VERSION};
pub use rpc::RpcCommunicator;
pub use scheduler::{ManualScheduler, Scheduler, TimerHandle, TokioScheduler};
pub use simulator::{LatencyType, Simulator, SimulatorConnection, SimulatorConnector};
pub use webrtc::{LoopbackWebrtcEngine, WebrtcConnector, WebrtcEngine};
