//! Raw connection over a WebRTC data channel.

use super::{DescriptionKind, RtcPeer, RtcPeerEvent};
use crate::connection::{
    Connection, ConnectionEvent, ConnectionEvents, ConnectionId, ConnectionState, ConnectionType,
    StateCell,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Signaling output of a data channel, forwarded to the connector.
#[derive(Debug, Clone)]
pub enum LocalSignal {
    Description(DescriptionKind, String),
    Candidate { candidate: String, mid: String },
    Closed,
}

pub type SignalHandler = Box<dyn Fn(LocalSignal) + Send + Sync>;

pub struct WebrtcConnection {
    id: ConnectionId,
    peer: Arc<dyn RtcPeer>,
    state: StateCell,
    events: ConnectionEvents,
}

impl WebrtcConnection {
    /// Wrap `peer`, forwarding its signaling output to `on_signal`.
    pub fn new(peer: Arc<dyn RtcPeer>, on_signal: SignalHandler) -> Arc<Self> {
        let this = Arc::new(Self {
            id: ConnectionId::new(ConnectionType::Webrtc),
            peer,
            state: StateCell::new(ConnectionState::Connecting),
            events: ConnectionEvents::new(),
        });
        if let Some(rx) = this.peer.take_events() {
            tokio::spawn(run_peer_events(Arc::downgrade(&this), rx, on_signal));
        }
        this
    }

    pub fn start_offer(&self) {
        self.peer.start_offer();
    }

    pub fn set_remote_description(&self, kind: DescriptionKind, description: &str) {
        self.peer.set_remote_description(kind, description);
    }

    pub fn add_remote_candidate(&self, candidate: &str, mid: &str) {
        self.peer.add_remote_candidate(candidate, mid);
    }

    fn handle_closed(&self) {
        if self.state.transition(ConnectionState::Closed).is_some() {
            self.events
                .emit(ConnectionEvent::Disconnected { graceful_leave: false });
        }
    }
}

async fn run_peer_events(
    connection: std::sync::Weak<WebrtcConnection>,
    mut rx: mpsc::UnboundedReceiver<RtcPeerEvent>,
    on_signal: SignalHandler,
) {
    while let Some(event) = rx.recv().await {
        match event {
            RtcPeerEvent::LocalDescription(kind, description) => {
                on_signal(LocalSignal::Description(kind, description));
            }
            RtcPeerEvent::LocalCandidate { candidate, mid } => {
                on_signal(LocalSignal::Candidate { candidate, mid });
            }
            RtcPeerEvent::Open => {
                let Some(connection) = connection.upgrade() else {
                    break;
                };
                if connection
                    .state
                    .transition(ConnectionState::Connected)
                    .is_some()
                {
                    debug!("Data channel {} open", connection.id);
                    connection.events.emit(ConnectionEvent::Connected);
                }
            }
            RtcPeerEvent::Data(data) => {
                let Some(connection) = connection.upgrade() else {
                    break;
                };
                connection.events.emit(ConnectionEvent::Data(data));
            }
            RtcPeerEvent::Error(reason) => {
                if let Some(connection) = connection.upgrade() {
                    connection.events.emit(ConnectionEvent::Error(reason));
                }
            }
            RtcPeerEvent::Closed => {
                if let Some(connection) = connection.upgrade() {
                    connection.handle_closed();
                }
                on_signal(LocalSignal::Closed);
                break;
            }
        }
    }
}

impl Connection for WebrtcConnection {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    fn connection_type(&self) -> ConnectionType {
        ConnectionType::Webrtc
    }

    fn state(&self) -> ConnectionState {
        self.state.get()
    }

    fn send(&self, data: Vec<u8>) {
        if self.state.get() != ConnectionState::Connected {
            trace!("Dropping send on {} in state {:?}", self.id, self.state.get());
            return;
        }
        self.peer.send(data);
    }

    fn close(&self, graceful: bool) {
        let Some(previous) = self.state.transition(ConnectionState::Closing) else {
            return;
        };
        debug!("Closing data channel {} (graceful: {})", self.id, graceful);
        self.peer.close();
        if self.state.transition(ConnectionState::Closed).is_some()
            && previous == ConnectionState::Connected
        {
            self.events
                .emit(ConnectionEvent::Disconnected { graceful_leave: graceful });
        }
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ConnectionEvent>> {
        self.events.take()
    }
}
