//! Raw transport connections and the handshake-managed wrapper around them.
//!
//! A `Connection` owns exactly one transport resource (socket, data channel,
//! simulated link). It never retries and never reports failures to callers;
//! everything it has to say goes through its `ConnectionEvent` stream.

pub mod managed;

pub use managed::{
    ConnectionDirection, ConnectionSink, HandshakeOptions, ManagedConnection,
    ManagedConnectionEvent,
};

use std::fmt::{self, Display, Formatter};
use std::sync::Mutex;
use tokio::sync::mpsc;

/// Transport variant of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionType {
    WebsocketServer,
    WebsocketClient,
    Webrtc,
    Simulator,
}

impl ConnectionType {
    fn prefix(&self) -> &'static str {
        match self {
            Self::WebsocketServer => "ws-server",
            Self::WebsocketClient => "ws-client",
            Self::Webrtc => "webrtc",
            Self::Simulator => "sim",
        }
    }
}

/// Identifier assigned when a connection is created.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn new(connection_type: ConnectionType) -> Self {
        Self(format!(
            "{}-{}",
            connection_type.prefix(),
            uuid::Uuid::new_v4()
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ConnectionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle of a raw connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Closing,
    Closed,
}

impl ConnectionState {
    /// Legal transitions. `Closed` is terminal.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Idle, Connecting)
                | (Idle, Connected)
                | (Idle, Closing)
                | (Idle, Closed)
                | (Connecting, Connected)
                | (Connecting, Closing)
                | (Connecting, Closed)
                | (Connected, Closing)
                | (Connected, Closed)
                | (Closing, Closed)
        )
    }
}

/// Thread-safe holder of a `ConnectionState` that only moves along legal edges.
#[derive(Debug)]
pub struct StateCell(Mutex<ConnectionState>);

impl StateCell {
    pub fn new(initial: ConnectionState) -> Self {
        Self(Mutex::new(initial))
    }

    pub fn get(&self) -> ConnectionState {
        *self.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Move to `next` if legal. Returns the previous state on success.
    pub fn transition(&self, next: ConnectionState) -> Option<ConnectionState> {
        let mut state = self.0.lock().unwrap_or_else(|e| e.into_inner());
        let previous = *state;
        if previous.can_transition_to(next) {
            *state = next;
            Some(previous)
        } else {
            None
        }
    }
}

/// Event emitted by a raw connection.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    Connected,
    Data(Vec<u8>),
    Disconnected { graceful_leave: bool },
    Error(String),
}

/// Event channel owned by a connection.
///
/// Events are buffered until the receiver is taken, so nothing is lost
/// between creating a connection and attaching its owner.
pub struct ConnectionEvents {
    tx: mpsc::UnboundedSender<ConnectionEvent>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<ConnectionEvent>>>,
}

impl ConnectionEvents {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }

    pub fn emit(&self, event: ConnectionEvent) {
        // Receiver gone means the owner is gone; nothing to tell.
        let _ = self.tx.send(event);
    }

    pub fn take(&self) -> Option<mpsc::UnboundedReceiver<ConnectionEvent>> {
        self.rx.lock().unwrap_or_else(|e| e.into_inner()).take()
    }
}

impl Default for ConnectionEvents {
    fn default() -> Self {
        Self::new()
    }
}

/// A transport-specific bidirectional byte channel.
pub trait Connection: Send + Sync + 'static {
    fn id(&self) -> &ConnectionId;

    fn connection_type(&self) -> ConnectionType;

    fn state(&self) -> ConnectionState;

    /// Queue bytes for the remote side. Dropped with a log line if not connected.
    fn send(&self, data: Vec<u8>);

    /// Close the connection. Idempotent.
    fn close(&self, graceful: bool);

    /// Take the event stream. Returns `None` after the first call.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ConnectionEvent>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        let cell = StateCell::new(ConnectionState::Idle);
        assert_eq!(
            cell.transition(ConnectionState::Connecting),
            Some(ConnectionState::Idle)
        );
        assert!(cell.transition(ConnectionState::Connected).is_some());
        assert!(cell.transition(ConnectionState::Closing).is_some());
        assert!(cell.transition(ConnectionState::Closed).is_some());
        assert_eq!(cell.get(), ConnectionState::Closed);
    }

    #[test]
    fn test_connect_failure_skips_connected() {
        let cell = StateCell::new(ConnectionState::Connecting);
        assert!(cell.transition(ConnectionState::Closed).is_some());
    }

    #[test]
    fn test_closed_is_terminal() {
        let cell = StateCell::new(ConnectionState::Closed);
        for next in [
            ConnectionState::Idle,
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::Closing,
            ConnectionState::Closed,
        ] {
            assert!(cell.transition(next).is_none());
        }
    }

    #[test]
    fn test_no_going_back() {
        let cell = StateCell::new(ConnectionState::Connected);
        assert!(cell.transition(ConnectionState::Connecting).is_none());
        assert!(cell.transition(ConnectionState::Idle).is_none());
    }

    #[test]
    fn test_events_buffer_until_taken() {
        let events = ConnectionEvents::new();
        events.emit(ConnectionEvent::Connected);
        events.emit(ConnectionEvent::Data(vec![9]));

        let mut rx = events.take().unwrap();
        assert!(events.take().is_none());
        assert!(matches!(rx.try_recv(), Ok(ConnectionEvent::Connected)));
        assert!(matches!(rx.try_recv(), Ok(ConnectionEvent::Data(d)) if d == vec![9]));
    }

    #[test]
    fn test_connection_id_carries_type_prefix() {
        let id = ConnectionId::new(ConnectionType::Simulator);
        assert!(id.as_str().starts_with("sim-"));
        assert_ne!(id, ConnectionId::new(ConnectionType::Simulator));
    }
}
