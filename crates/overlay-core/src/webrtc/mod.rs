//! WebRTC connector.
//!
//! Data channels come from a pluggable `WebrtcEngine`; this module only
//! handles signaling, which travels as notifications over another transport
//! on the `system/webrtc-connector` service.
//!
//! # Roles
//! - The *offerer* is fixed per pair of peers by `is_offering`.
//! - The caller of `connect` is the handshake initiator. If it is not the
//!   offerer it sends a `WebrtcConnectionRequest` and waits for the offer.
//! - Every attempt carries a connection id; answers and candidates for an
//!   unknown id are ignored.

pub mod connection;
pub mod loopback;

pub use connection::{LocalSignal, SignalHandler, WebrtcConnection};
pub use loopback::LoopbackWebrtcEngine;

use crate::connection::{
    Connection, ConnectionSink, ConnectionType, HandshakeOptions, ManagedConnection,
};
use crate::connector::{Connector, Transport};
use crate::error::{ConnectionError, Result};
use crate::events::Subscription;
use crate::peer_descriptor::{PeerDescriptor, PeerId, PeerKey};
use crate::protocol::{IceCandidate, RpcPayload, RtcDescription, WebrtcConnectionRequest};
use crate::rpc::RpcCommunicator;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

pub const WEBRTC_CONNECTOR_SERVICE: &str = "system/webrtc-connector";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptionKind {
    Offer,
    Answer,
}

/// Output of an engine's peer connection.
#[derive(Debug, Clone)]
pub enum RtcPeerEvent {
    LocalDescription(DescriptionKind, String),
    LocalCandidate { candidate: String, mid: String },
    /// The data channel is open.
    Open,
    Data(Vec<u8>),
    Error(String),
    Closed,
}

/// One peer connection with a single data channel.
pub trait RtcPeer: Send + Sync {
    /// Create an offer; emits `LocalDescription(Offer, _)`.
    fn start_offer(&self);

    /// Apply the remote description. Applying an offer emits the answer.
    fn set_remote_description(&self, kind: DescriptionKind, description: &str);

    fn add_remote_candidate(&self, candidate: &str, mid: &str);

    fn send(&self, data: Vec<u8>);

    /// Close the channel. Emits `Closed` here and on the remote side.
    fn close(&self);

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<RtcPeerEvent>>;
}

pub trait WebrtcEngine: Send + Sync {
    fn create_peer(&self, local: &PeerDescriptor, remote: &PeerDescriptor) -> Arc<dyn RtcPeer>;
}

/// Whether `local` makes the offer when connecting with `remote`.
///
/// Exactly one side of a pair offers: compares SHA-256 of the two ids
/// concatenated in each order.
pub fn is_offering(local: &PeerId, remote: &PeerId) -> bool {
    let mine = Sha256::new()
        .chain_update(local.as_bytes())
        .chain_update(remote.as_bytes())
        .finalize();
    let theirs = Sha256::new()
        .chain_update(remote.as_bytes())
        .chain_update(local.as_bytes())
        .finalize();
    mine.as_slice() < theirs.as_slice()
}

struct Attempt {
    peer: PeerKey,
    connection: Option<Arc<WebrtcConnection>>,
    /// Set while a non-offering initiator waits for the offer.
    placeholder: Option<Weak<ManagedConnection>>,
}

#[derive(Default)]
struct ConnectorState {
    options: Option<HandshakeOptions>,
    sink: Option<Arc<dyn ConnectionSink>>,
    outbox: Option<mpsc::UnboundedSender<(PeerDescriptor, RpcPayload)>>,
    subscription: Option<Subscription>,
    attempts: HashMap<String, Attempt>,
    stopped: bool,
}

pub struct WebrtcConnector {
    engine: Arc<dyn WebrtcEngine>,
    signaling: Arc<dyn Transport>,
    rpc: Arc<RpcCommunicator>,
    me: Weak<WebrtcConnector>,
    state: Mutex<ConnectorState>,
}

impl WebrtcConnector {
    pub fn new(engine: Arc<dyn WebrtcEngine>, signaling: Arc<dyn Transport>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            engine,
            signaling,
            rpc: Arc::new(RpcCommunicator::new(WEBRTC_CONNECTOR_SERVICE)),
            me: me.clone(),
            state: Mutex::new(ConnectorState::default()),
        })
    }

    /// Attempts whose signaling has not finished or whose channel is open.
    pub fn attempt_count(&self) -> usize {
        self.lock().attempts.len()
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

    fn create_connection(
        &self,
        local: &PeerDescriptor,
        remote: &PeerDescriptor,
        connection_id: &str,
    ) -> Arc<WebrtcConnection> {
        let peer = self.engine.create_peer(local, remote);
        let me = self.me.clone();
        let local = local.clone();
        let remote = remote.clone();
        let id = connection_id.to_string();
        WebrtcConnection::new(
            peer,
            Box::new(move |signal| {
                if let Some(connector) = me.upgrade() {
                    connector.on_local_signal(&local, &remote, &id, signal);
                }
            }),
        )
    }

    fn on_local_signal(
        &self,
        local: &PeerDescriptor,
        remote: &PeerDescriptor,
        connection_id: &str,
        signal: LocalSignal,
    ) {
        let description = |description: String| RtcDescription {
            requester: local.clone(),
            target: remote.clone(),
            description,
            connection_id: connection_id.to_string(),
        };
        let payload = match signal {
            LocalSignal::Description(DescriptionKind::Offer, sdp) => {
                RpcPayload::RtcOffer(description(sdp))
            }
            LocalSignal::Description(DescriptionKind::Answer, sdp) => {
                RpcPayload::RtcAnswer(description(sdp))
            }
            LocalSignal::Candidate { candidate, mid } => RpcPayload::IceCandidate(IceCandidate {
                requester: local.clone(),
                target: remote.clone(),
                candidate,
                mid,
                connection_id: connection_id.to_string(),
            }),
            LocalSignal::Closed => {
                self.lock().attempts.remove(connection_id);
                return;
            }
        };
        self.signal(remote, payload);
    }

    fn signal(&self, target: &PeerDescriptor, payload: RpcPayload) {
        let outbox = self.lock().outbox.clone();
        match outbox {
            Some(outbox) => {
                let _ = outbox.send((target.clone(), payload));
            }
            None => trace!("Dropping {} after stop", payload.method()),
        }
    }

    // ==================== Signaling ====================

    fn handle_signal(&self, payload: RpcPayload) {
        match payload {
            RpcPayload::WebrtcConnectionRequest(request) => self.on_connection_request(request),
            RpcPayload::RtcOffer(offer) => self.on_offer(offer),
            RpcPayload::RtcAnswer(answer) => {
                if let Some(connection) =
                    self.matching_connection(&answer.connection_id, &answer.requester)
                {
                    connection.set_remote_description(DescriptionKind::Answer, &answer.description);
                }
            }
            RpcPayload::IceCandidate(candidate) => {
                if let Some(connection) =
                    self.matching_connection(&candidate.connection_id, &candidate.requester)
                {
                    connection.add_remote_candidate(&candidate.candidate, &candidate.mid);
                }
            }
            other => debug!("Unexpected {} on {}", other.method(), WEBRTC_CONNECTOR_SERVICE),
        }
    }

    /// A non-offering peer wants to connect: we offer and accept.
    fn on_connection_request(&self, request: WebrtcConnectionRequest) {
        let Ok((options, sink)) = self.running() else {
            return;
        };
        debug!(
            "WebRTC connection request {} from {}",
            request.connection_id,
            request.requester.label()
        );
        let raw =
            self.create_connection(&options.local, &request.requester, &request.connection_id);
        self.lock().attempts.insert(
            request.connection_id,
            Attempt {
                peer: request.requester.key(),
                connection: Some(raw.clone()),
                placeholder: None,
            },
        );
        ManagedConnection::incoming(options, ConnectionType::Webrtc, raw.clone(), sink);
        raw.start_offer();
    }

    fn on_offer(&self, offer: RtcDescription) {
        let Ok((options, sink)) = self.running() else {
            return;
        };

        enum Role {
            Answer,
            Complete(Weak<ManagedConnection>),
            Ignore,
        }
        let role = {
            let mut state = self.lock();
            match state.attempts.get_mut(&offer.connection_id) {
                None => {
                    state.attempts.insert(
                        offer.connection_id.clone(),
                        Attempt {
                            peer: offer.requester.key(),
                            connection: None,
                            placeholder: None,
                        },
                    );
                    Role::Answer
                }
                Some(attempt)
                    if attempt.connection.is_none() && attempt.peer == offer.requester.key() =>
                {
                    match attempt.placeholder.take() {
                        Some(placeholder) => Role::Complete(placeholder),
                        None => Role::Ignore,
                    }
                }
                Some(_) => Role::Ignore,
            }
        };
        if matches!(role, Role::Ignore) {
            trace!("Ignoring offer for attempt {}", offer.connection_id);
            return;
        }

        let raw = self.create_connection(&options.local, &offer.requester, &offer.connection_id);
        if let Some(attempt) = self.lock().attempts.get_mut(&offer.connection_id) {
            attempt.connection = Some(raw.clone());
        }
        match role {
            Role::Answer => {
                debug!(
                    "Answering WebRTC offer {} from {}",
                    offer.connection_id,
                    offer.requester.label()
                );
                ManagedConnection::incoming(options, ConnectionType::Webrtc, raw.clone(), sink);
            }
            Role::Complete(placeholder) => {
                let attached = placeholder
                    .upgrade()
                    .is_some_and(|managed| managed.attach_outgoing(raw.clone()));
                if !attached {
                    debug!("WebRTC attempt {} gave up before the offer", offer.connection_id);
                    raw.close(false);
                    return;
                }
            }
            Role::Ignore => return,
        }
        raw.set_remote_description(DescriptionKind::Offer, &offer.description);
    }

    fn matching_connection(
        &self,
        connection_id: &str,
        requester: &PeerDescriptor,
    ) -> Option<Arc<WebrtcConnection>> {
        let state = self.lock();
        let found = state
            .attempts
            .get(connection_id)
            .filter(|attempt| attempt.peer == requester.key())
            .and_then(|attempt| attempt.connection.clone());
        if found.is_none() {
            trace!(
                "Ignoring signaling from {} for unknown attempt {}",
                requester.label(),
                connection_id
            );
        }
        found
    }

    fn lock(&self) -> MutexGuard<'_, ConnectorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Connector for WebrtcConnector {
    fn connection_type(&self) -> ConnectionType {
        ConnectionType::Webrtc
    }

    fn start(
        self: Arc<Self>,
        options: HandshakeOptions,
        sink: Arc<dyn ConnectionSink>,
    ) -> Result<()> {
        let me = Arc::downgrade(&self);
        self.rpc.set_handler(Arc::new(move |_source: &PeerDescriptor, payload: RpcPayload| {
            if let Some(connector) = me.upgrade() {
                connector.handle_signal(payload);
            }
            None
        }));
        let subscription = self.rpc.listen(&self.signaling);

        // One sender task keeps signaling to a peer in order.
        let (outbox, mut rx) = mpsc::unbounded_channel::<(PeerDescriptor, RpcPayload)>();
        let rpc = self.rpc.clone();
        let signaling = self.signaling.clone();
        tokio::spawn(async move {
            while let Some((target, payload)) = rx.recv().await {
                let method = payload.method();
                if let Err(e) = rpc.notify(signaling.as_ref(), &target, payload).await {
                    warn!("Failed to send {} to {}: {}", method, target.label(), e);
                }
            }
        });

        let mut state = self.lock();
        state.options = Some(options);
        state.sink = Some(sink);
        state.outbox = Some(outbox);
        state.subscription = Some(subscription);
        state.stopped = false;
        Ok(())
    }

    fn connect(&self, target: &PeerDescriptor) -> Result<Arc<ManagedConnection>> {
        let (options, _) = self.running()?;
        let connection_id = uuid::Uuid::new_v4().to_string();

        if is_offering(&options.local.peer_id, &target.peer_id) {
            debug!("Offering WebRTC connection {} to {}", connection_id, target.label());
            let raw = self.create_connection(&options.local, target, &connection_id);
            self.lock().attempts.insert(
                connection_id,
                Attempt {
                    peer: target.key(),
                    connection: Some(raw.clone()),
                    placeholder: None,
                },
            );
            let managed = ManagedConnection::outgoing(
                options,
                target.clone(),
                ConnectionType::Webrtc,
                raw.clone(),
            );
            raw.start_offer();
            return Ok(managed);
        }

        debug!(
            "Requesting WebRTC connection {} from {}",
            connection_id,
            target.label()
        );
        let managed =
            ManagedConnection::pending(options.clone(), target.clone(), ConnectionType::Webrtc);
        {
            let mut state = self.lock();
            state.attempts.retain(|_, attempt| {
                attempt
                    .placeholder
                    .as_ref()
                    .is_none_or(|p| p.strong_count() > 0)
            });
            state.attempts.insert(
                connection_id.clone(),
                Attempt {
                    peer: target.key(),
                    connection: None,
                    placeholder: Some(Arc::downgrade(&managed)),
                },
            );
        }
        self.signal(
            target,
            RpcPayload::WebrtcConnectionRequest(WebrtcConnectionRequest {
                requester: options.local,
                target: target.clone(),
                connection_id,
            }),
        );
        Ok(managed)
    }

    fn can_connect(&self, _local: &PeerDescriptor, target: &PeerDescriptor) -> bool {
        target.transport_addresses.webrtc
    }

    async fn stop(&self) {
        let connections: Vec<Arc<WebrtcConnection>> = {
            let mut state = self.lock();
            state.stopped = true;
            state.outbox = None;
            state.subscription = None;
            state
                .attempts
                .drain()
                .filter_map(|(_, attempt)| attempt.connection)
                .collect()
        };
        self.rpc.clear_handler();
        for connection in connections {
            connection.close(false);
        }
    }
}
