//! Connection manager: one logical connection per remote peer.
//!
//! Provides:
//! - `send(message)` that finds or opens the connection to the target
//! - Transport selection across the configured connectors
//! - Duplicate and simultaneous-open resolution for incoming connections
//! - Per-service connection locks, mirrored to the peer over RPC
//! - Graceful, notice-based disconnects
//!
//! All tables live behind one mutex that is never held across an await.

use crate::config::ConnectionManagerConfig;
use crate::connection::{
    ConnectionDirection, ConnectionSink, HandshakeOptions, ManagedConnection,
    ManagedConnectionEvent,
};
use crate::connector::{Connector, LocalConnectivity, Transport};
use crate::duplicate::DuplicateDetector;
use crate::error::{ConnectionError, Result};
use crate::events::{ConnectionManagerEvent, DisconnectionType, EventBus, Subscription};
use crate::locks::LockTable;
use crate::peer_descriptor::{PeerDescriptor, PeerId, PeerKey, outgoing_wins};
use crate::protocol::{
    DisconnectMode, DisconnectNotice, LockRequest, LockResponse, Message, RpcPayload,
    UnlockRequest,
};
use crate::rpc::RpcCommunicator;
use async_trait::async_trait;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Service id of the manager's own RPCs, after the configured prefix.
pub const CONNECTION_MANAGER_SERVICE: &str = "system/connection-manager";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Idle,
    Started,
    Stopped,
}

struct ManagerState {
    lifecycle: Lifecycle,
    local: Option<PeerDescriptor>,
    connections: HashMap<PeerKey, Arc<ManagedConnection>>,
    locks: LockTable,
    duplicates: DuplicateDetector,
}

struct Inner {
    config: ConnectionManagerConfig,
    connectors: Vec<Arc<dyn Connector>>,
    rpc: RpcCommunicator,
    events: Arc<EventBus<ConnectionManagerEvent>>,
    state: Mutex<ManagerState>,
    /// Serializes `start` and `stop`.
    lifecycle_lock: tokio::sync::Mutex<()>,
}

/// Cheaply cloneable handle to a connection manager.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(config: ConnectionManagerConfig) -> Self {
        let connectors = config.connectors();
        let rpc = RpcCommunicator::new(format!(
            "{}{}",
            config.service_id_prefix, CONNECTION_MANAGER_SERVICE
        ));
        let duplicates = DuplicateDetector::new(config.duplicate_detector_capacity);
        Self {
            inner: Arc::new(Inner {
                config,
                connectors,
                rpc,
                events: Arc::new(EventBus::new()),
                state: Mutex::new(ManagerState {
                    lifecycle: Lifecycle::Idle,
                    local: None,
                    connections: HashMap::new(),
                    locks: LockTable::new(),
                    duplicates,
                }),
                lifecycle_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    // ==================== Lifecycle ====================

    /// Start with the configured descriptor, or a random peer id if none is set.
    ///
    /// A websocket address reported by a connector is filled in when the
    /// descriptor does not carry one.
    pub async fn start(&self) -> Result<()> {
        let configured = self.inner.config.local_peer_descriptor.clone();
        self.start_with(move |connectivity| {
            let mut descriptor =
                configured.unwrap_or_else(|| PeerDescriptor::new(PeerId::random()));
            if descriptor.transport_addresses.websocket.is_none() {
                descriptor.transport_addresses.websocket = connectivity.websocket.clone();
            }
            descriptor
        })
        .await
    }

    /// Start, computing the local descriptor from what the connectors bound.
    ///
    /// Idempotent. Fails with `Stopped` once the manager has been stopped.
    pub async fn start_with(
        &self,
        provider: impl FnOnce(&LocalConnectivity) -> PeerDescriptor + Send,
    ) -> Result<()> {
        let _guard = self.inner.lifecycle_lock.lock().await;
        let lifecycle = self.lock().lifecycle;
        match lifecycle {
            Lifecycle::Started => return Ok(()),
            Lifecycle::Stopped => return Err(ConnectionError::Stopped),
            Lifecycle::Idle => {}
        }

        let mut connectivity = LocalConnectivity::default();
        for connector in &self.inner.connectors {
            connectivity = connectivity.merge(connector.listen().await?);
        }
        let local = provider(&connectivity);
        self.lock().local = Some(local.clone());
        self.install_rpc_handler();

        let options = HandshakeOptions {
            local: local.clone(),
            protocol_version: self.inner.config.protocol_version.clone(),
            timeout: self.inner.config.handshake_timeout,
        };
        let sink: Arc<dyn ConnectionSink> = Arc::new(ManagerSink {
            inner: Arc::downgrade(&self.inner),
        });
        for connector in &self.inner.connectors {
            connector.clone().start(options.clone(), sink.clone())?;
        }

        self.lock().lifecycle = Lifecycle::Started;
        info!(
            "Connection manager started as {} ({} connectors)",
            local.label(),
            self.inner.connectors.len()
        );
        Ok(())
    }

    /// Leave the network: gracefully disconnect every connected peer, close
    /// whatever remains, and stop the connectors. Idempotent.
    pub async fn stop(&self) {
        let _guard = self.inner.lifecycle_lock.lock().await;
        let connected: Vec<PeerDescriptor> = {
            let mut state = self.lock();
            if state.lifecycle == Lifecycle::Stopped {
                return;
            }
            state.lifecycle = Lifecycle::Stopped;
            state
                .connections
                .values()
                .filter(|c| c.is_connected())
                .filter_map(|c| c.remote_descriptor())
                .collect()
        };

        info!(
            "Stopping connection manager, disconnecting {} peers",
            connected.len()
        );
        join_all(
            connected
                .iter()
                .map(|peer| self.gracefully_disconnect(peer, DisconnectMode::Leaving)),
        )
        .await;

        let remaining: Vec<Arc<ManagedConnection>> = {
            let mut state = self.lock();
            state.locks.clear();
            state.connections.drain().map(|(_, c)| c).collect()
        };
        for connection in remaining {
            connection.close(false);
        }
        for connector in &self.inner.connectors {
            connector.stop().await;
        }
        self.inner.rpc.cancel_all();
        self.inner.rpc.clear_handler();
        debug!("Connection manager stopped");
    }

    // ==================== Sending ====================

    /// Send a message to its target, opening a connection if needed.
    ///
    /// Resolves once the bytes are handed to the transport.
    pub async fn send(&self, message: Message) -> Result<()> {
        self.ensure_started()?;
        self.send_internal(message).await
    }

    async fn send_internal(&self, mut message: Message) -> Result<()> {
        let target = message
            .target_descriptor
            .clone()
            .ok_or(ConnectionError::MissingTargetDescriptor)?;
        let key = target.key();

        let (connection, local, created) = {
            let mut state = self.lock();
            let local = state.local.clone().ok_or(ConnectionError::NotStarted)?;
            if target.peer_id == local.peer_id {
                return Err(ConnectionError::CannotConnectToSelf);
            }
            let existing = state
                .connections
                .get(&key)
                .filter(|c| !c.is_closed())
                .cloned();
            match existing {
                Some(connection) => (connection, local, false),
                None => {
                    let connection = self.open_connection(&local, &target)?;
                    state.connections.insert(key, connection.clone());
                    (connection, local, true)
                }
            }
        };
        if created {
            self.track(&connection);
        }

        message.source_descriptor = Some(local);
        trace!(
            "Sending message {} ({}) to {}",
            message.message_id,
            message.service_id,
            target.label()
        );
        connection.send(message.encode()?).await
    }

    fn open_connection(
        &self,
        local: &PeerDescriptor,
        target: &PeerDescriptor,
    ) -> Result<Arc<ManagedConnection>> {
        for connector in &self.inner.connectors {
            if connector.can_connect(local, target) {
                debug!(
                    "Connecting to {} over {:?}",
                    target.label(),
                    connector.connection_type()
                );
                return connector.connect(target);
            }
        }
        Err(ConnectionError::NoTransport(target.key()))
    }

    // ==================== Queries ====================

    pub fn has_connection(&self, peer: &PeerDescriptor) -> bool {
        self.lock()
            .connections
            .get(&peer.key())
            .is_some_and(|c| !c.is_closed())
    }

    pub fn get_connection(&self, peer: &PeerDescriptor) -> Option<Arc<ManagedConnection>> {
        self.lock().connections.get(&peer.key()).cloned()
    }

    /// Our descriptor, once started.
    pub fn get_peer_descriptor(&self) -> Option<PeerDescriptor> {
        self.lock().local.clone()
    }

    pub fn connection_count(&self) -> usize {
        self.lock().connections.len()
    }

    /// Peers whose handshake has completed.
    pub fn connected_peers(&self) -> Vec<PeerDescriptor> {
        self.lock()
            .connections
            .values()
            .filter(|c| c.is_connected())
            .filter_map(|c| c.remote_descriptor())
            .collect()
    }

    pub fn service_id(&self) -> &str {
        self.inner.rpc.service_id()
    }

    /// Subscribe to manager events. Returns `Subscription` that unsubscribes on drop.
    pub fn subscribe(
        &self,
        callback: impl Fn(ConnectionManagerEvent) + Send + Sync + 'static,
    ) -> Subscription {
        self.inner.events.subscribe(callback)
    }

    // ==================== Locking ====================

    /// Ask that the connection to `peer` stay open on behalf of `service_id`.
    ///
    /// The first lock of a service also tells the peer. That request is best
    /// effort: a rejection, timeout or send failure is logged and the local
    /// lock is kept.
    pub async fn lock_connection(&self, peer: &PeerDescriptor, service_id: &str) -> Result<()> {
        let local = self.started_local()?;
        if peer.peer_id == local.peer_id {
            return Err(ConnectionError::CannotConnectToSelf);
        }
        let first = self.lock().locks.add_local(&peer.key(), service_id);
        if !first {
            return Ok(());
        }

        let payload = RpcPayload::LockRequest(LockRequest {
            peer_descriptor: local,
            protocol_version: self.inner.config.protocol_version.clone(),
            service_id: service_id.to_string(),
        });
        let (message, pending) = self.inner.rpc.prepare_request(peer, payload);
        let result = match self.send_internal(message).await {
            Ok(()) => {
                self.inner
                    .rpc
                    .wait(pending, self.inner.config.rpc_timeout)
                    .await
            }
            Err(e) => {
                self.inner.rpc.abandon(&pending);
                Err(e)
            }
        };

        match result {
            Ok(RpcPayload::LockResponse(response)) if response.accepted => {
                debug!("Locked connection to {} for {}", peer.label(), service_id);
            }
            Ok(RpcPayload::LockResponse(response)) => warn!(
                "Lock request to {} for {} rejected: {}",
                peer.label(),
                service_id,
                response.error.unwrap_or_default()
            ),
            Ok(other) => warn!(
                "Unexpected {} in reply to lock request to {}",
                other.method(),
                peer.label()
            ),
            Err(e) => warn!(
                "Lock request to {} for {} failed: {}",
                peer.label(),
                service_id,
                e
            ),
        }
        Ok(())
    }

    /// Release one lock of `service_id` on `peer`. Never closes the connection.
    pub fn unlock_connection(&self, peer: &PeerDescriptor, service_id: &str) {
        let key = peer.key();
        let (released, local, connected) = {
            let mut state = self.lock();
            if state.lifecycle != Lifecycle::Started {
                return;
            }
            let released = state.locks.remove_local(&key, service_id);
            let connected = state
                .connections
                .get(&key)
                .is_some_and(|c| !c.is_closed());
            (released, state.local.clone(), connected)
        };
        let Some(local) = local else {
            return;
        };
        if !released || !connected {
            return;
        }

        let message = self.inner.rpc.notification(
            peer,
            RpcPayload::UnlockRequest(UnlockRequest {
                peer_descriptor: local,
                protocol_version: self.inner.config.protocol_version.clone(),
                service_id: service_id.to_string(),
            }),
        );
        let manager = self.clone();
        let label = peer.label();
        tokio::spawn(async move {
            if let Err(e) = manager.send_internal(message).await {
                debug!("Failed to send unlock request to {}: {}", label, e);
            }
        });
    }

    pub fn has_local_locked_connection(
        &self,
        peer: &PeerDescriptor,
        service_id: Option<&str>,
    ) -> bool {
        self.lock().locks.is_local_locked(&peer.key(), service_id)
    }

    pub fn has_remote_locked_connection(
        &self,
        peer: &PeerDescriptor,
        service_id: Option<&str>,
    ) -> bool {
        self.lock().locks.is_remote_locked(&peer.key(), service_id)
    }

    // ==================== Disconnecting ====================

    /// Tell `peer` we are closing, wait for it to close its side, then tear
    /// down our side. Bounded by the configured notice timeout.
    pub async fn gracefully_disconnect(&self, peer: &PeerDescriptor, mode: DisconnectMode) {
        let key = peer.key();
        let (connection, local) = {
            let mut state = self.lock();
            state.locks.clear_peer(&key);
            (state.connections.remove(&key), state.local.clone())
        };
        let (Some(connection), Some(local)) = (connection, local) else {
            return;
        };
        let was_connected = connection.is_connected();
        let remote = connection.remote_descriptor().unwrap_or_else(|| peer.clone());

        if was_connected {
            debug!("Gracefully disconnecting from {} ({:?})", remote.label(), mode);
            let mut notice = self.inner.rpc.notification(
                &remote,
                RpcPayload::DisconnectNotice(DisconnectNotice {
                    peer_descriptor: local.clone(),
                    protocol_version: self.inner.config.protocol_version.clone(),
                    disconnect_mode: mode,
                }),
            );
            notice.source_descriptor = Some(local);

            let bounded = tokio::time::timeout(self.inner.config.disconnect_notice_timeout, async {
                let bytes = match notice.encode() {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        warn!("Failed to encode disconnect notice: {}", e);
                        return;
                    }
                };
                if let Err(e) = connection.send(bytes).await {
                    debug!("Disconnect notice to {} not sent: {}", remote.label(), e);
                    return;
                }
                connection.closed().await;
            })
            .await;
            if bounded.is_err() {
                debug!(
                    "{} did not close within {:?}, closing anyway",
                    remote.label(),
                    self.inner.config.disconnect_notice_timeout
                );
            }
        }

        connection.close(true);
        if was_connected {
            self.inner.events.emit(ConnectionManagerEvent::Disconnected(
                remote,
                DisconnectionType::Graceful(mode),
            ));
        }
    }

    /// Gracefully disconnect idle, unlocked connections, longest idle first,
    /// until at most `max_connections` remain.
    ///
    /// Locked connections and connections used within `last_used_limit` are
    /// never collected, even if that leaves more than `max_connections`.
    pub async fn garbage_collect_connections(
        &self,
        max_connections: usize,
        last_used_limit: Duration,
    ) {
        let candidates: Vec<PeerDescriptor> = {
            let state = self.lock();
            if state.lifecycle != Lifecycle::Started || state.connections.len() <= max_connections
            {
                return;
            }
            let excess = state.connections.len() - max_connections;
            let mut idle: Vec<(Duration, PeerDescriptor)> = state
                .connections
                .iter()
                .filter(|(key, _)| !state.locks.is_locked(key))
                .filter_map(|(_, connection)| {
                    let idle_for = connection.idle_for();
                    if idle_for <= last_used_limit {
                        return None;
                    }
                    connection.remote_descriptor().map(|peer| (idle_for, peer))
                })
                .collect();
            idle.sort_by(|a, b| b.0.cmp(&a.0));
            idle.into_iter().take(excess).map(|(_, peer)| peer).collect()
        };

        for peer in candidates {
            debug!("Garbage collecting idle connection to {}", peer.label());
            self.gracefully_disconnect(&peer, DisconnectMode::Normal)
                .await;
        }
    }

    // ==================== Incoming connections ====================

    /// Decide on an incoming connection whose handshake request arrived.
    fn accept_incoming(&self, connection: &Arc<ManagedConnection>) -> bool {
        let Some(remote) = connection.remote_descriptor() else {
            return false;
        };
        let key = remote.key();

        let adopt_into = {
            let mut state = self.lock();
            if state.lifecycle != Lifecycle::Started {
                return false;
            }
            let Some(local) = state.local.clone() else {
                return false;
            };
            match state.connections.get(&key).cloned() {
                None => {
                    state.connections.insert(key, connection.clone());
                    None
                }
                Some(existing) if existing.is_closed() => {
                    state.connections.insert(key, connection.clone());
                    None
                }
                Some(existing) if existing.is_connected() => {
                    debug!("Rejecting duplicate connection from {}", remote.label());
                    return false;
                }
                Some(existing) if existing.direction() == ConnectionDirection::Incoming => {
                    debug!(
                        "Rejecting second incoming connection from {}",
                        remote.label()
                    );
                    return false;
                }
                Some(existing) => {
                    if !existing.is_awaiting_adoption()
                        && outgoing_wins(&local.peer_id, &remote.peer_id)
                    {
                        debug!(
                            "Simultaneous open with {}: keeping our outgoing connection",
                            remote.label()
                        );
                        return false;
                    }
                    Some(existing)
                }
            }
        };

        match adopt_into {
            None => {
                debug!("Accepted incoming connection from {}", remote.label());
                self.track(connection);
                true
            }
            Some(existing) => {
                debug!(
                    "Simultaneous open with {}: adopting incoming connection",
                    remote.label()
                );
                existing.adopt_incoming(connection)
            }
        }
    }

    /// Register a connection a connector opened on its own initiative.
    fn adopt_new_connection(&self, connection: Arc<ManagedConnection>) {
        let Some(remote) = connection.remote_descriptor() else {
            connection.close(false);
            return;
        };
        let inserted = {
            let mut state = self.lock();
            let free = state.lifecycle == Lifecycle::Started
                && state
                    .connections
                    .get(&remote.key())
                    .is_none_or(|c| c.is_closed());
            if free {
                state.connections.insert(remote.key(), connection.clone());
            }
            free
        };
        if inserted {
            self.track(&connection);
        } else {
            debug!("Dropping redundant connection to {}", remote.label());
            connection.close(false);
        }
    }

    // ==================== Connection events ====================

    fn track(&self, connection: &Arc<ManagedConnection>) {
        let Some(mut rx) = connection.take_events() else {
            return;
        };
        let weak = Arc::downgrade(&self.inner);
        let object_id = connection.object_id();
        let mut remote = connection.remote_descriptor();

        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let manager = ConnectionManager { inner };
                match event {
                    ManagedConnectionEvent::Connected(peer) => {
                        manager.on_connected(object_id, &peer);
                        remote = Some(peer);
                    }
                    ManagedConnectionEvent::Data(bytes) => match &remote {
                        Some(peer) => manager.on_data(peer, &bytes),
                        None => warn!("Dropping data from a connection without a peer"),
                    },
                    ManagedConnectionEvent::Disconnected { graceful_leave } => {
                        if let Some(peer) = &remote {
                            manager.on_disconnected(object_id, peer, graceful_leave);
                        }
                        break;
                    }
                    ManagedConnectionEvent::HandshakeFailed(reason) => {
                        if let Some(peer) = &remote {
                            manager.on_handshake_failed(object_id, peer, &reason);
                        }
                        break;
                    }
                }
            }
        });
    }

    fn on_connected(&self, object_id: u64, peer: &PeerDescriptor) {
        let current = self
            .lock()
            .connections
            .get(&peer.key())
            .is_some_and(|c| c.object_id() == object_id);
        if current {
            info!("Connected to {}", peer.label());
            self.inner
                .events
                .emit(ConnectionManagerEvent::Connected(peer.clone()));
        }
    }

    /// Decode and dispatch a message that arrived on the connection to `peer`.
    ///
    /// The source is always the handshaken peer, whatever the sender wrote.
    fn on_data(&self, peer: &PeerDescriptor, bytes: &[u8]) {
        let mut message = match Message::decode(bytes) {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropping undecodable message from {}: {}", peer.label(), e);
                return;
            }
        };
        let spoofed = message
            .source_descriptor
            .as_ref()
            .filter(|claimed| claimed.peer_id != peer.peer_id);
        if let Some(claimed) = spoofed {
            debug!(
                "Message {} from {} claimed to be from {}",
                message.message_id,
                peer.label(),
                claimed.label()
            );
        }
        message.source_descriptor = Some(peer.clone());
        if self
            .lock()
            .duplicates
            .check_and_add(&message.message_id)
        {
            trace!("Dropping duplicate message {}", message.message_id);
            return;
        }

        if message.service_id == self.inner.rpc.service_id() {
            if let Some(response) = self.inner.rpc.handle_message(&message) {
                let manager = self.clone();
                tokio::spawn(async move {
                    if let Err(e) = manager.send_internal(response).await {
                        debug!("Failed to send RPC response: {}", e);
                    }
                });
            }
            return;
        }

        self.inner
            .events
            .emit(ConnectionManagerEvent::Message(message));
    }

    fn on_disconnected(&self, object_id: u64, peer: &PeerDescriptor, graceful_leave: bool) {
        let key = peer.key();
        let removed = {
            let mut state = self.lock();
            let removed = remove_if_current(&mut state, &key, object_id);
            if removed {
                state.locks.clear_peer(&key);
            }
            removed
        };
        if removed {
            info!("Disconnected from {}", peer.label());
            self.inner.events.emit(ConnectionManagerEvent::Disconnected(
                peer.clone(),
                DisconnectionType::Transport { graceful_leave },
            ));
        }
    }

    fn on_handshake_failed(&self, object_id: u64, peer: &PeerDescriptor, reason: &str) {
        let removed = remove_if_current(&mut self.lock(), &peer.key(), object_id);
        if removed {
            debug!("Connection to {} failed: {}", peer.label(), reason);
            self.inner.events.emit(ConnectionManagerEvent::Error(format!(
                "Connection to {} failed: {}",
                peer.label(),
                reason
            )));
        }
    }

    // ==================== RPC ====================

    fn install_rpc_handler(&self) {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        self.inner
            .rpc
            .set_handler(Arc::new(
                move |source: &PeerDescriptor, payload: RpcPayload| {
                    let inner = weak.upgrade()?;
                    ConnectionManager { inner }.handle_rpc(source, payload)
                },
            ));
    }

    fn handle_rpc(&self, source: &PeerDescriptor, payload: RpcPayload) -> Option<RpcPayload> {
        match payload {
            RpcPayload::LockRequest(request) => {
                let accepted = {
                    let mut state = self.lock();
                    let accepted = state.lifecycle == Lifecycle::Started;
                    if accepted {
                        state.locks.add_remote(&source.key(), &request.service_id);
                    }
                    accepted
                };
                debug!(
                    "Lock request from {} for {}: {}",
                    source.label(),
                    request.service_id,
                    if accepted { "accepted" } else { "rejected" }
                );
                Some(RpcPayload::LockResponse(LockResponse {
                    accepted,
                    error: (!accepted).then(|| "connection manager stopped".to_string()),
                }))
            }
            RpcPayload::UnlockRequest(request) => {
                self.lock()
                    .locks
                    .remove_remote(&source.key(), &request.service_id);
                trace!(
                    "Unlock request from {} for {}",
                    source.label(),
                    request.service_id
                );
                None
            }
            RpcPayload::DisconnectNotice(notice) => {
                self.handle_disconnect_notice(source, notice.disconnect_mode);
                None
            }
            other => {
                debug!(
                    "Unexpected {} on {}",
                    other.method(),
                    self.inner.rpc.service_id()
                );
                None
            }
        }
    }

    /// The peer is closing: close our side without a notice of our own.
    fn handle_disconnect_notice(&self, source: &PeerDescriptor, mode: DisconnectMode) {
        let key = source.key();
        let connection = {
            let mut state = self.lock();
            state.locks.clear_peer(&key);
            state.connections.remove(&key)
        };
        let Some(connection) = connection else {
            return;
        };
        let was_connected = connection.is_connected();
        debug!("{} is disconnecting ({:?})", source.label(), mode);
        connection.close(true);
        if was_connected {
            self.inner.events.emit(ConnectionManagerEvent::Disconnected(
                source.clone(),
                DisconnectionType::Graceful(mode),
            ));
        }
    }

    // ==================== Helpers ====================

    fn ensure_started(&self) -> Result<()> {
        match self.lock().lifecycle {
            Lifecycle::Idle => Err(ConnectionError::NotStarted),
            Lifecycle::Stopped => Err(ConnectionError::Stopped),
            Lifecycle::Started => Ok(()),
        }
    }

    fn started_local(&self) -> Result<PeerDescriptor> {
        self.ensure_started()?;
        self.lock().local.clone().ok_or(ConnectionError::NotStarted)
    }

    fn lock(&self) -> MutexGuard<'_, ManagerState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn remove_if_current(state: &mut ManagerState, key: &PeerKey, object_id: u64) -> bool {
    let current = state
        .connections
        .get(key)
        .is_some_and(|c| c.object_id() == object_id);
    if current {
        state.connections.remove(key);
    }
    current
}

/// Connector callbacks, holding the manager weakly.
struct ManagerSink {
    inner: Weak<Inner>,
}

impl ConnectionSink for ManagerSink {
    fn on_incoming_connection(&self, connection: &Arc<ManagedConnection>) -> bool {
        match self.inner.upgrade() {
            Some(inner) => ConnectionManager { inner }.accept_incoming(connection),
            None => false,
        }
    }

    fn on_new_connection(&self, connection: Arc<ManagedConnection>) {
        match self.inner.upgrade() {
            Some(inner) => ConnectionManager { inner }.adopt_new_connection(connection),
            None => connection.close(false),
        }
    }
}

#[async_trait]
impl Transport for ConnectionManager {
    async fn send(&self, message: Message) -> Result<()> {
        ConnectionManager::send(self, message).await
    }

    fn local_peer_descriptor(&self) -> Option<PeerDescriptor> {
        self.get_peer_descriptor()
    }

    fn subscribe_messages(&self, callback: Box<dyn Fn(Message) + Send + Sync>) -> Subscription {
        self.inner.events.subscribe(move |event| {
            if let ConnectionManagerEvent::Message(message) = event {
                callback(message);
            }
        })
    }
}
