//! Handshake-negotiated connection to one remote peer.
//!
//! A `ManagedConnection` owns up to two raw connections to the same peer:
//! the one we opened (outgoing) and the one the peer opened (incoming).
//! Exactly one of them becomes active once the handshake resolves.
//!
//! # Lifecycle
//! 1. Outgoing: when the raw connection reports `Connected`, send a
//!    `HandshakeRequest` and wait for the `HandshakeResponse`.
//! 2. Incoming: wait for the `HandshakeRequest`, validate the version, ask
//!    the `ConnectionSink` whether to accept, then answer.
//! 3. Sends issued before the handshake completes are buffered and flushed
//!    in call order.
//!
//! # Simultaneous open
//! When both peers dial each other, the side with the larger peer id keeps
//! its outgoing attempt. The other side adopts the incoming raw connection
//! into its existing `ManagedConnection` (see `adopt_incoming`) and closes
//! its own outgoing one.

use super::{Connection, ConnectionEvent, ConnectionId, ConnectionType};
use crate::error::{ConnectionError, HandshakeError, Result};
use crate::peer_descriptor::{PeerDescriptor, outgoing_wins};
use crate::protocol::{
    Frame, HandshakeRequest, HandshakeResponse, is_compatible_version, should_warn_version,
};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// How long an acceptor keeps a rejected raw connection open, so the
/// rejection reaches the initiator before the close does.
const REJECT_CLOSE_DELAY: Duration = Duration::from_secs(2);

static NEXT_OBJECT_ID: AtomicU64 = AtomicU64::new(1);

/// What every handshake on a node needs to know.
#[derive(Debug, Clone)]
pub struct HandshakeOptions {
    pub local: PeerDescriptor,
    pub protocol_version: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionDirection {
    Outgoing,
    Incoming,
}

#[derive(Debug, Clone)]
pub enum ManagedConnectionEvent {
    /// Handshake accepted; carries the remote descriptor.
    Connected(PeerDescriptor),
    /// Application bytes from the active raw connection.
    Data(Vec<u8>),
    /// A connected connection went away.
    Disconnected { graceful_leave: bool },
    /// The handshake never completed.
    HandshakeFailed(String),
}

/// Owner-side callbacks a connector reports new connections to.
pub trait ConnectionSink: Send + Sync {
    /// An incoming connection received its handshake request. Return false to
    /// reject it as a duplicate.
    fn on_incoming_connection(&self, connection: &Arc<ManagedConnection>) -> bool;

    /// A connector opened a connection on its own initiative.
    fn on_new_connection(&self, connection: Arc<ManagedConnection>);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Handshaking,
    Connected,
    Closed,
    /// Raw connection handed to another `ManagedConnection`.
    Transferred,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Outgoing,
    Incoming,
}

type PendingSend = (Vec<u8>, oneshot::Sender<Result<()>>);

struct State {
    remote: Option<PeerDescriptor>,
    phase: Phase,
    outgoing: Option<Arc<dyn Connection>>,
    incoming: Option<Arc<dyn Connection>>,
    active: Option<Side>,
    pending: Vec<PendingSend>,
    early_data: Vec<Vec<u8>>,
    /// Our outgoing attempt lost the race; the peer's attempt will arrive.
    awaiting_adoption: bool,
    forward_to: Option<Arc<ManagedConnection>>,
    last_used: Instant,
}

impl State {
    fn side_of(&self, id: &ConnectionId) -> Option<Side> {
        if self.outgoing.as_ref().is_some_and(|c| c.id() == id) {
            Some(Side::Outgoing)
        } else if self.incoming.as_ref().is_some_and(|c| c.id() == id) {
            Some(Side::Incoming)
        } else {
            None
        }
    }

    fn slot(&self, side: Side) -> Option<&Arc<dyn Connection>> {
        match side {
            Side::Outgoing => self.outgoing.as_ref(),
            Side::Incoming => self.incoming.as_ref(),
        }
    }

    fn take_slot(&mut self, side: Side) -> Option<Arc<dyn Connection>> {
        match side {
            Side::Outgoing => self.outgoing.take(),
            Side::Incoming => self.incoming.take(),
        }
    }

    fn active_connection(&self) -> Option<Arc<dyn Connection>> {
        self.active.and_then(|side| self.slot(side).cloned())
    }

    fn take_connections(&mut self) -> Vec<Arc<dyn Connection>> {
        self.active = None;
        self.outgoing
            .take()
            .into_iter()
            .chain(self.incoming.take())
            .collect()
    }
}

enum DisconnectOutcome {
    Ignore,
    Disconnected(Vec<Arc<dyn Connection>>),
    Fail,
}

pub struct ManagedConnection {
    object_id: u64,
    options: HandshakeOptions,
    direction: ConnectionDirection,
    connection_type: ConnectionType,
    sink: Option<Arc<dyn ConnectionSink>>,
    state: Mutex<State>,
    events_tx: mpsc::UnboundedSender<ManagedConnectionEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<ManagedConnectionEvent>>>,
    closed: watch::Sender<bool>,
}

impl ManagedConnection {
    fn build(
        options: HandshakeOptions,
        direction: ConnectionDirection,
        connection_type: ConnectionType,
        remote: Option<PeerDescriptor>,
        sink: Option<Arc<dyn ConnectionSink>>,
    ) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);
        Arc::new(Self {
            object_id: NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed),
            options,
            direction,
            connection_type,
            sink,
            state: Mutex::new(State {
                remote,
                phase: Phase::Handshaking,
                outgoing: None,
                incoming: None,
                active: None,
                pending: Vec::new(),
                early_data: Vec::new(),
                awaiting_adoption: false,
                forward_to: None,
                last_used: Instant::now(),
            }),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            closed,
        })
    }

    /// Wrap a raw connection we are opening to `target`.
    pub fn outgoing(
        options: HandshakeOptions,
        target: PeerDescriptor,
        connection_type: ConnectionType,
        connection: Arc<dyn Connection>,
    ) -> Arc<Self> {
        let this = Self::build(
            options,
            ConnectionDirection::Outgoing,
            connection_type,
            Some(target),
            None,
        );
        this.lock().outgoing = Some(connection.clone());
        this.drive(connection);
        this.arm_timeout();
        this
    }

    /// Outgoing connection whose raw connection will be opened by the peer.
    ///
    /// Completes when an incoming connection from `target` is adopted.
    pub fn pending(
        options: HandshakeOptions,
        target: PeerDescriptor,
        connection_type: ConnectionType,
    ) -> Arc<Self> {
        let this = Self::build(
            options,
            ConnectionDirection::Outgoing,
            connection_type,
            Some(target),
            None,
        );
        this.lock().awaiting_adoption = true;
        this.arm_timeout();
        this
    }

    /// Wrap a raw connection the peer opened to us.
    pub fn incoming(
        options: HandshakeOptions,
        connection_type: ConnectionType,
        connection: Arc<dyn Connection>,
        sink: Arc<dyn ConnectionSink>,
    ) -> Arc<Self> {
        let this = Self::build(
            options,
            ConnectionDirection::Incoming,
            connection_type,
            None,
            Some(sink),
        );
        this.lock().incoming = Some(connection.clone());
        this.drive(connection);
        this.arm_timeout();
        this
    }

    // ==================== Accessors ====================

    /// Process-unique id of this wrapper, distinct from raw connection ids.
    pub fn object_id(&self) -> u64 {
        self.object_id
    }

    pub fn direction(&self) -> ConnectionDirection {
        self.direction
    }

    pub fn connection_type(&self) -> ConnectionType {
        self.connection_type
    }

    pub fn local_descriptor(&self) -> &PeerDescriptor {
        &self.options.local
    }

    pub fn remote_descriptor(&self) -> Option<PeerDescriptor> {
        self.lock().remote.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.lock().phase == Phase::Connected
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.lock().phase, Phase::Closed | Phase::Transferred)
    }

    /// Handshaking without a live outgoing attempt of its own, so the peer's
    /// incoming connection is the only way this connection can complete.
    pub fn is_awaiting_adoption(&self) -> bool {
        let state = self.lock();
        state.phase == Phase::Handshaking && state.awaiting_adoption && state.outgoing.is_none()
    }

    /// Time since the last send or receive.
    pub fn idle_for(&self) -> Duration {
        self.lock().last_used.elapsed()
    }

    pub fn last_used(&self) -> Instant {
        self.lock().last_used
    }

    /// Take the event stream. Returns `None` after the first call.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ManagedConnectionEvent>> {
        self.events_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    /// Resolves once this connection is closed for good.
    pub fn closed(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut rx = self.closed.subscribe();
        async move {
            let _ = rx.wait_for(|closed| *closed).await;
        }
    }

    // ==================== Sending and closing ====================

    /// Send application bytes.
    ///
    /// Before the handshake completes the bytes are buffered; the returned
    /// future resolves when they are handed to the raw connection, or fails
    /// if the handshake fails.
    pub async fn send(&self, data: Vec<u8>) -> Result<()> {
        let frame = Frame::Data(data).encode()?;
        let waiter = {
            let mut state = self.lock();
            match state.phase {
                Phase::Connected => {
                    let Some(connection) = state.active_connection() else {
                        return Err(ConnectionError::ConnectionClosed);
                    };
                    // Sent under the lock so concurrent sends keep call order.
                    connection.send(frame);
                    state.last_used = Instant::now();
                    return Ok(());
                }
                Phase::Handshaking => {
                    let (tx, rx) = oneshot::channel();
                    state.pending.push((frame, tx));
                    rx
                }
                Phase::Closed | Phase::Transferred => {
                    return Err(ConnectionError::ConnectionClosed);
                }
            }
        };
        waiter.await.unwrap_or(Err(ConnectionError::ConnectionClosed))
    }

    /// Close every raw connection. Idempotent.
    pub fn close(&self, graceful: bool) {
        let (connections, waiters, was_connected) = {
            let mut state = self.lock();
            if matches!(state.phase, Phase::Closed | Phase::Transferred) {
                return;
            }
            let was_connected = state.phase == Phase::Connected;
            state.phase = Phase::Closed;
            let waiters: Vec<_> = state.pending.drain(..).map(|(_, tx)| tx).collect();
            (state.take_connections(), waiters, was_connected)
        };

        debug!(
            "Closing connection to {} (graceful: {})",
            self.remote_label(),
            graceful
        );
        for connection in connections {
            connection.close(graceful);
        }
        for waiter in waiters {
            let _ = waiter.send(Err(ConnectionError::ConnectionClosed));
        }
        if was_connected {
            self.emit(ManagedConnectionEvent::Disconnected {
                graceful_leave: graceful,
            });
        }
        self.closed.send_replace(true);
    }

    /// Give up on the handshake with `error`.
    pub fn abort(&self, error: ConnectionError) {
        self.fail(error);
    }

    /// Hand a late-arriving outgoing raw connection to a placeholder created
    /// with `pending`. Returns false if the handshake already resolved.
    pub fn attach_outgoing(self: &Arc<Self>, connection: Arc<dyn Connection>) -> bool {
        {
            let mut state = self.lock();
            if state.phase != Phase::Handshaking || state.outgoing.is_some() {
                return false;
            }
            state.outgoing = Some(connection.clone());
        }
        self.drive(connection);
        true
    }

    /// Take over an incoming raw connection from `wrapper`, which was opened by
    /// the same peer while our own attempt was still handshaking.
    ///
    /// On success the wrapper forwards any further raw events here and must
    /// not be registered anywhere. Returns false if this connection is no
    /// longer handshaking.
    pub fn adopt_incoming(self: &Arc<Self>, wrapper: &Arc<ManagedConnection>) -> bool {
        if Arc::ptr_eq(self, wrapper) || self.direction != ConnectionDirection::Outgoing {
            return false;
        }

        let (connection, remote) = {
            let mut w = wrapper.lock();
            if w.phase != Phase::Handshaking {
                return false;
            }
            let Some(connection) = w.incoming.take() else {
                return false;
            };
            w.phase = Phase::Transferred;
            w.forward_to = Some(self.clone());
            (connection, w.remote.clone())
        };

        let attached = {
            let mut state = self.lock();
            if state.phase == Phase::Handshaking {
                if state.remote.is_none() {
                    state.remote = remote;
                }
                state.incoming = Some(connection.clone());
                true
            } else {
                false
            }
        };

        if !attached {
            let mut w = wrapper.lock();
            w.incoming = Some(connection);
            w.phase = Phase::Handshaking;
            w.forward_to = None;
            return false;
        }

        debug!(
            "Adopting incoming connection {} from {}",
            connection.id(),
            self.remote_label()
        );
        let response = HandshakeResponse::accepted(self.options.protocol_version.clone());
        self.complete(Side::Incoming, Some(response))
    }

    // ==================== Raw connection events ====================

    fn drive(self: &Arc<Self>, connection: Arc<dyn Connection>) {
        let Some(mut rx) = connection.take_events() else {
            warn!("Events of connection {} already taken", connection.id());
            return;
        };
        let this = self.clone();
        let id = connection.id().clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let last = matches!(event, ConnectionEvent::Disconnected { .. });
                this.on_connection_event(&id, event);
                if last {
                    break;
                }
            }
        });
    }

    fn arm_timeout(self: &Arc<Self>) {
        let this = Arc::downgrade(self);
        let timeout = self.options.timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(this) = this.upgrade() else {
                return;
            };
            if this.lock().phase == Phase::Handshaking {
                warn!("Handshake with {} timed out", this.remote_label());
                this.fail(ConnectionError::HandshakeTimeout);
            }
        });
    }

    fn on_connection_event(self: &Arc<Self>, id: &ConnectionId, event: ConnectionEvent) {
        let forward = self.lock().forward_to.clone();
        if let Some(adopter) = forward {
            adopter.on_connection_event(id, event);
            return;
        }

        match event {
            ConnectionEvent::Connected => self.on_connected(id),
            ConnectionEvent::Data(data) => self.on_data(id, data),
            ConnectionEvent::Disconnected { graceful_leave } => {
                self.on_disconnected(id, graceful_leave)
            }
            ConnectionEvent::Error(error) => {
                debug!("Connection {} reported error: {}", id, error);
            }
        }
    }

    fn on_connected(&self, id: &ConnectionId) {
        let connection = {
            let state = self.lock();
            if state.phase != Phase::Handshaking || state.side_of(id) != Some(Side::Outgoing) {
                return;
            }
            state.outgoing.clone()
        };
        let Some(connection) = connection else {
            return;
        };

        let request = HandshakeRequest::new(
            self.options.local.clone(),
            self.options.protocol_version.clone(),
        );
        debug!(
            "Sending handshake request to {} over {}",
            self.remote_label(),
            id
        );
        trace!("Handshake request: {}", request.to_json());
        send_frame(connection.as_ref(), &Frame::HandshakeRequest(request));
    }

    fn on_data(self: &Arc<Self>, id: &ConnectionId, data: Vec<u8>) {
        let frame = match Frame::decode(&data) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Undecodable frame on connection {}: {}", id, e);
                return;
            }
        };

        match frame {
            Frame::HandshakeRequest(request) => self.on_handshake_request(id, request),
            Frame::HandshakeResponse(response) => self.on_handshake_response(id, response),
            Frame::Data(payload) => {
                let deliver = {
                    let mut state = self.lock();
                    let side = state.side_of(id);
                    match (state.phase, side) {
                        (Phase::Connected, Some(side)) if state.active == Some(side) => {
                            state.last_used = Instant::now();
                            Some(payload)
                        }
                        // Data can overtake the handshake response on links
                        // without ordering guarantees.
                        (Phase::Handshaking, Some(_)) => {
                            state.early_data.push(payload);
                            None
                        }
                        _ => {
                            trace!("Dropping data from inactive connection {}", id);
                            None
                        }
                    }
                };
                if let Some(payload) = deliver {
                    self.emit(ManagedConnectionEvent::Data(payload));
                }
            }
        }
    }

    fn on_handshake_request(self: &Arc<Self>, id: &ConnectionId, request: HandshakeRequest) {
        let connection = {
            let state = self.lock();
            if state.side_of(id) != Some(Side::Incoming) {
                warn!("Handshake request on unexpected connection {}", id);
                return;
            }
            if state.phase != Phase::Handshaking {
                debug!("Ignoring repeated handshake request on {}", id);
                return;
            }
            state.incoming.clone()
        };
        let Some(connection) = connection else {
            return;
        };

        let source = request.source_descriptor;
        let local_version = &self.options.protocol_version;
        if !is_compatible_version(local_version, &request.protocol_version) {
            warn!(
                "Rejecting handshake from {}: unsupported protocol version {}",
                source.label(),
                request.protocol_version
            );
            self.reject(
                connection,
                HandshakeError::UnsupportedVersion(request.protocol_version),
            );
            return;
        }
        if should_warn_version(local_version, &request.protocol_version) {
            warn!(
                "Peer {} uses protocol version {} (ours: {})",
                source.label(),
                request.protocol_version,
                local_version
            );
        }
        if source.peer_id == self.options.local.peer_id {
            self.reject(connection, HandshakeError::InvalidRequest);
            return;
        }

        self.lock().remote = Some(source);
        let accepted = match &self.sink {
            Some(sink) => sink.on_incoming_connection(self),
            None => true,
        };

        if self.lock().phase == Phase::Transferred {
            return;
        }
        if !accepted {
            debug!(
                "Rejecting duplicate connection from {}",
                self.remote_label()
            );
            self.reject(connection, HandshakeError::Duplicate);
            return;
        }

        let response = HandshakeResponse::accepted(self.options.protocol_version.clone());
        self.complete(Side::Incoming, Some(response));
    }

    fn on_handshake_response(&self, id: &ConnectionId, response: HandshakeResponse) {
        {
            let state = self.lock();
            if state.phase != Phase::Handshaking || state.side_of(id) != Some(Side::Outgoing) {
                trace!("Ignoring stale handshake response on {}", id);
                return;
            }
        }

        if response.accepted {
            if should_warn_version(&self.options.protocol_version, &response.protocol_version) {
                warn!(
                    "Peer {} uses protocol version {} (ours: {})",
                    self.remote_label(),
                    response.protocol_version,
                    self.options.protocol_version
                );
            }
            self.complete(Side::Outgoing, None);
            return;
        }

        let error = response.error.unwrap_or(HandshakeError::InvalidRequest);
        let (connection, wait_for_peer) = {
            let mut state = self.lock();
            let lost_race = error == HandshakeError::Duplicate
                && state
                    .remote
                    .as_ref()
                    .is_some_and(|r| !outgoing_wins(&self.options.local.peer_id, &r.peer_id));
            if lost_race {
                state.awaiting_adoption = true;
            }
            (state.outgoing.take(), lost_race)
        };
        if let Some(connection) = connection {
            connection.close(false);
        }

        if wait_for_peer {
            debug!(
                "Outgoing connection to {} lost the simultaneous-open race, waiting for the peer's attempt",
                self.remote_label()
            );
            return;
        }
        self.fail(ConnectionError::HandshakeRejected(error));
    }

    fn on_disconnected(&self, id: &ConnectionId, graceful_leave: bool) {
        let outcome = {
            let mut state = self.lock();
            let Some(side) = state.side_of(id) else {
                trace!("Ignoring disconnect of inactive connection {}", id);
                return;
            };
            match state.phase {
                Phase::Connected if state.active == Some(side) => {
                    state.phase = Phase::Closed;
                    state.take_slot(side);
                    DisconnectOutcome::Disconnected(state.take_connections())
                }
                Phase::Handshaking => {
                    state.take_slot(side);
                    if state.outgoing.is_none()
                        && state.incoming.is_none()
                        && !state.awaiting_adoption
                    {
                        DisconnectOutcome::Fail
                    } else {
                        DisconnectOutcome::Ignore
                    }
                }
                _ => {
                    state.take_slot(side);
                    DisconnectOutcome::Ignore
                }
            }
        };

        match outcome {
            DisconnectOutcome::Ignore => {}
            DisconnectOutcome::Disconnected(remaining) => {
                for connection in remaining {
                    connection.close(false);
                }
                debug!("Disconnected from {}", self.remote_label());
                self.emit(ManagedConnectionEvent::Disconnected { graceful_leave });
                self.closed.send_replace(true);
            }
            DisconnectOutcome::Fail => self.fail(ConnectionError::ConnectionFailed(
                "connection closed during handshake".into(),
            )),
        }
    }

    // ==================== Handshake outcomes ====================

    /// Make `side` the active connection. Returns false if no longer handshaking.
    fn complete(&self, side: Side, response: Option<HandshakeResponse>) -> bool {
        let (obsolete, waiters, early_data, remote) = {
            let mut state = self.lock();
            if state.phase != Phase::Handshaking {
                return false;
            }
            let Some(connection) = state.slot(side).cloned() else {
                return false;
            };
            if let Some(response) = response {
                send_frame(connection.as_ref(), &Frame::HandshakeResponse(response));
            }

            state.phase = Phase::Connected;
            state.active = Some(side);
            state.awaiting_adoption = false;
            state.last_used = Instant::now();
            let obsolete = match side {
                Side::Outgoing => state.incoming.take(),
                Side::Incoming => state.outgoing.take(),
            };
            // Flush under the lock so later sends cannot overtake buffered ones.
            let waiters: Vec<_> = state
                .pending
                .drain(..)
                .map(|(frame, tx)| {
                    connection.send(frame);
                    tx
                })
                .collect();
            let early_data = std::mem::take(&mut state.early_data);
            (obsolete, waiters, early_data, state.remote.clone())
        };

        if let Some(obsolete) = obsolete {
            obsolete.close(false);
        }
        if let Some(remote) = remote {
            debug!(
                "Handshake with {} completed ({:?})",
                remote.label(),
                self.direction
            );
            self.emit(ManagedConnectionEvent::Connected(remote));
        }
        for data in early_data {
            self.emit(ManagedConnectionEvent::Data(data));
        }
        for waiter in waiters {
            let _ = waiter.send(Ok(()));
        }
        true
    }

    /// Refuse an incoming handshake. The initiator closes on receipt; our
    /// side closes after a grace period.
    fn reject(&self, connection: Arc<dyn Connection>, error: HandshakeError) {
        let response =
            HandshakeResponse::rejected(error.clone(), self.options.protocol_version.clone());
        send_frame(connection.as_ref(), &Frame::HandshakeResponse(response));

        let waiters: Vec<_> = {
            let mut state = self.lock();
            state.phase = Phase::Closed;
            state.take_connections();
            state.pending.drain(..).map(|(_, tx)| tx).collect()
        };
        for waiter in waiters {
            let _ = waiter.send(Err(ConnectionError::HandshakeRejected(error.clone())));
        }
        self.emit(ManagedConnectionEvent::HandshakeFailed(error.to_string()));
        self.closed.send_replace(true);

        tokio::spawn(async move {
            tokio::time::sleep(REJECT_CLOSE_DELAY).await;
            connection.close(false);
        });
    }

    fn fail(&self, error: ConnectionError) {
        let (connections, waiters) = {
            let mut state = self.lock();
            if matches!(state.phase, Phase::Closed | Phase::Transferred) {
                return;
            }
            state.phase = Phase::Closed;
            let waiters: Vec<_> = state.pending.drain(..).map(|(_, tx)| tx).collect();
            (state.take_connections(), waiters)
        };

        debug!("Connection to {} failed: {}", self.remote_label(), error);
        for connection in connections {
            connection.close(false);
        }
        for waiter in waiters {
            let _ = waiter.send(Err(error.duplicate()));
        }
        self.emit(ManagedConnectionEvent::HandshakeFailed(error.to_string()));
        self.closed.send_replace(true);
    }

    fn emit(&self, event: ManagedConnectionEvent) {
        let _ = self.events_tx.send(event);
    }

    fn remote_label(&self) -> String {
        self.lock()
            .remote
            .as_ref()
            .map(|r| r.label())
            .unwrap_or_else(|| "<unknown peer>".to_string())
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl fmt::Debug for ManagedConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("ManagedConnection")
            .field("object_id", &self.object_id)
            .field("direction", &self.direction)
            .field("connection_type", &self.connection_type)
            .field("phase", &state.phase)
            .field("remote", &state.remote.as_ref().map(|r| r.label()))
            .finish()
    }
}

fn send_frame(connection: &dyn Connection, frame: &Frame) {
    match frame.encode() {
        Ok(bytes) => connection.send(bytes),
        Err(e) => warn!("Failed to encode {} frame: {}", frame.kind(), e),
    }
}
