//! overlay-node: standalone peer of the overlay network.
//!
//! Runs a connection manager with a WebSocket server, keeps connections to
//! the configured entry points locked, and garbage collects idle ones.

use anyhow::{Context, Result};
use clap::Parser;
use overlay_core::{
    ConnectionManager, ConnectionManagerConfig, ConnectionManagerEvent, DisconnectionType,
    PeerDescriptor,
};
use overlay_node::{Args, WebsocketConnector};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Lock service id for connections to entry points.
const ENTRY_POINT_SERVICE: &str = "node/entry-point";

/// How often to re-lock lost entry points and collect idle connections.
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(30);

struct Node {
    manager: ConnectionManager,
    entry_points: Vec<PeerDescriptor>,
    max_connections: usize,
    idle_timeout: Duration,
}

impl Node {
    async fn maintain(&self) {
        for entry in &self.entry_points {
            if self
                .manager
                .has_local_locked_connection(entry, Some(ENTRY_POINT_SERVICE))
            {
                continue;
            }
            debug!("Locking connection to entry point {}", entry.label());
            if let Err(e) = self.manager.lock_connection(entry, ENTRY_POINT_SERVICE).await {
                warn!("Failed to lock entry point {}: {}", entry.label(), e);
            }
        }

        self.manager
            .garbage_collect_connections(self.max_connections, self.idle_timeout)
            .await;
        info!("Status: {}", self.status());
    }

    fn status(&self) -> serde_json::Value {
        let peers: Vec<String> = self
            .manager
            .connected_peers()
            .iter()
            .map(|peer| peer.label())
            .collect();
        serde_json::json!({
            "peer_id": self.manager.get_peer_descriptor().map(|d| d.peer_id.to_string()),
            "connections": self.manager.connection_count(),
            "connected_peers": peers,
        })
    }

    fn on_event(&self, event: ConnectionManagerEvent) {
        match event {
            ConnectionManagerEvent::Connected(peer) => {
                info!(
                    "Connected to {} ({} connection(s))",
                    peer.label(),
                    self.manager.connection_count()
                );
            }
            ConnectionManagerEvent::Disconnected(peer, DisconnectionType::Graceful(mode)) => {
                info!("Peer {} disconnected ({:?})", peer.label(), mode);
            }
            ConnectionManagerEvent::Disconnected(peer, kind) => {
                info!("Lost connection to {} ({:?})", peer.label(), kind);
            }
            ConnectionManagerEvent::Message(message) => {
                debug!(
                    "Message on {} from {}",
                    message.service_id,
                    message
                        .source_descriptor
                        .as_ref()
                        .map(|s| s.label())
                        .unwrap_or_else(|| "unknown".to_string())
                );
            }
            ConnectionManagerEvent::Error(error) => {
                warn!("Connection error: {}", error);
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,overlay_core=debug,overlay_node=debug"
    } else {
        "info,overlay_core=info,overlay_node=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting overlay-node");
    info!("Listen address: {}", args.listen);

    let descriptor = args.local_descriptor().context("invalid --peer-id")?;
    let manager = ConnectionManager::new(
        ConnectionManagerConfig::default()
            .with_local_peer_descriptor(descriptor)
            .with_websocket_connector(WebsocketConnector::new(args.websocket_config())),
    );

    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let _subscription = manager.subscribe(move |event| {
        let _ = event_tx.send(event);
    });

    manager.start().await.context("failed to start connection manager")?;
    if let Some(local) = manager.get_peer_descriptor() {
        let address = local
            .websocket()
            .map(|a| a.url())
            .unwrap_or_else(|| "none".to_string());
        info!("Peer ID: {} (address: {})", local.peer_id, address);
    }

    let node = Node {
        manager: manager.clone(),
        entry_points: args.entry_points.clone(),
        max_connections: args.max_connections,
        idle_timeout: args.idle_timeout(),
    };

    info!("Node running. Press Ctrl+C to stop.");
    let mut maintenance = tokio::time::interval(MAINTENANCE_INTERVAL);

    // Main event loop
    loop {
        tokio::select! {
            _ = maintenance.tick() => {
                node.maintain().await;
            }

            Some(event) = event_rx.recv() => {
                node.on_event(event);
            }

            // Handle graceful shutdown
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    info!("Shutting down");
    manager.stop().await;
    Ok(())
}
