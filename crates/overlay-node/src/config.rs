//! Command-line configuration for the node binary.

use crate::connector::WebsocketConnectorConfig;
use clap::Parser;
use overlay_core::{PeerDescriptor, PeerId, PeerIdError, WebsocketAddress};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EntryPointError {
    #[error("Expected <peer-id>@ws://host:port, got {0:?}")]
    InvalidFormat(String),
    #[error("Invalid peer ID: {0}")]
    InvalidPeerId(#[from] PeerIdError),
    #[error("Invalid port in {0:?}")]
    InvalidPort(String),
}

#[derive(Parser, Debug)]
#[command(name = "overlay-node")]
#[command(about = "Peer-to-peer overlay node")]
pub struct Args {
    /// Address to listen on for incoming connections
    #[arg(short, long, default_value = "0.0.0.0:8080")]
    pub listen: String,

    /// Host advertised to peers (defaults to the listen IP)
    #[arg(long)]
    pub advertised_host: Option<String>,

    /// Peer ID as hex (generated if not provided)
    #[arg(long)]
    pub peer_id: Option<String>,

    /// Name shown in logs
    #[arg(long)]
    pub node_name: Option<String>,

    /// Region index used for latency simulation
    #[arg(long)]
    pub region: Option<u32>,

    /// Peer to connect to on startup, as <peer-id>@ws://host:port (repeatable)
    #[arg(long = "entry-point", value_parser = parse_entry_point)]
    pub entry_points: Vec<PeerDescriptor>,

    /// Connections kept open before idle ones are garbage collected
    #[arg(long, default_value_t = 50)]
    pub max_connections: usize,

    /// Seconds a connection may sit unused before it can be collected
    #[arg(long, default_value_t = 300)]
    pub idle_timeout: u64,

    /// Enable verbose logging
    #[arg(long)]
    pub verbose: bool,
}

impl Args {
    /// Our own descriptor. The websocket address is filled in once bound.
    pub fn local_descriptor(&self) -> Result<PeerDescriptor, PeerIdError> {
        let peer_id = match &self.peer_id {
            Some(hex) => hex.parse()?,
            None => PeerId::random(),
        };
        let mut descriptor = PeerDescriptor::new(peer_id);
        if let Some(name) = &self.node_name {
            descriptor = descriptor.with_node_name(name.clone());
        }
        if let Some(region) = self.region {
            descriptor = descriptor.with_region(region);
        }
        Ok(descriptor)
    }

    /// Server settings. Entry points also verify that the server is reachable.
    pub fn websocket_config(&self) -> WebsocketConnectorConfig {
        let config = WebsocketConnectorConfig::default()
            .with_listen(self.listen.clone())
            .with_entry_points(self.entry_points.clone());
        match &self.advertised_host {
            Some(host) => config.with_advertised_host(host.clone()),
            None => config,
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout)
    }
}

/// Parse `<peer-id>@ws://host:port` (or `wss://`).
pub fn parse_entry_point(s: &str) -> Result<PeerDescriptor, EntryPointError> {
    let invalid = || EntryPointError::InvalidFormat(s.to_string());
    let (peer_id, url) = s.split_once('@').ok_or_else(invalid)?;
    let (tls, rest) = if let Some(rest) = url.strip_prefix("wss://") {
        (true, rest)
    } else if let Some(rest) = url.strip_prefix("ws://") {
        (false, rest)
    } else {
        return Err(invalid());
    };
    let (host, port) = rest.trim_end_matches('/').rsplit_once(':').ok_or_else(invalid)?;
    if host.is_empty() {
        return Err(invalid());
    }
    let port: u16 = port
        .parse()
        .map_err(|_| EntryPointError::InvalidPort(s.to_string()))?;

    let mut address = WebsocketAddress::new(host, port);
    address.tls = tls;
    Ok(PeerDescriptor::new(peer_id.parse()?).with_websocket(address))
}
