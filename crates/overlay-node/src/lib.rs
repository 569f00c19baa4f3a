//! overlay-node library: WebSocket transport for the connection manager.
//!
//! The binary wires these into an `overlay_core::ConnectionManager`;
//! integration tests use them directly.

pub mod config;
pub mod connection;
pub mod connectivity;
pub mod connector;
pub mod server;

// Re-export key types for convenience
pub use config::{Args, EntryPointError, parse_entry_point};
pub use connection::WebsocketConnection;
pub use connectivity::{
    CONNECTIVITY_CHECKER_SERVICE, ConnectivityError, ConnectivityRequest, ConnectivityResponse,
    send_connectivity_request,
};
pub use connector::{WEBSOCKET_CONNECTOR_SERVICE, WebsocketConnector, WebsocketConnectorConfig};
pub use server::WebsocketServer;
