//! Raw connection over the virtual network.

use super::Simulator;
use crate::connection::{
    Connection, ConnectionEvent, ConnectionEvents, ConnectionId, ConnectionState, ConnectionType,
    StateCell,
};
use crate::error::SimulatorError;
use crate::peer_descriptor::PeerDescriptor;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::trace;

/// One end of a simulated link. The other end is created by the target's
/// `SimulatorConnector` when the connect operation is delivered.
pub struct SimulatorConnection {
    id: ConnectionId,
    local: PeerDescriptor,
    remote: PeerDescriptor,
    simulator: Arc<Simulator>,
    state: StateCell,
    events: ConnectionEvents,
}

impl SimulatorConnection {
    pub fn new(
        local: PeerDescriptor,
        remote: PeerDescriptor,
        simulator: Arc<Simulator>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: ConnectionId::new(ConnectionType::Simulator),
            local,
            remote,
            simulator,
            state: StateCell::new(ConnectionState::Idle),
            events: ConnectionEvents::new(),
        })
    }

    pub fn local(&self) -> &PeerDescriptor {
        &self.local
    }

    pub fn remote(&self) -> &PeerDescriptor {
        &self.remote
    }

    /// Start connecting to `remote`.
    pub fn connect(self: &Arc<Self>) -> Result<(), SimulatorError> {
        if self.state.transition(ConnectionState::Connecting).is_none() {
            trace!("connect() on {} in state {:?}", self.id, self.state.get());
            return Ok(());
        }
        self.simulator.connect(self, &self.remote)
    }

    pub(crate) fn is_connecting(&self) -> bool {
        self.state.get() == ConnectionState::Connecting
    }

    pub(crate) fn handle_connected(&self) {
        if self.state.transition(ConnectionState::Connected).is_some() {
            self.events.emit(ConnectionEvent::Connected);
        }
    }

    pub(crate) fn handle_incoming_data(&self, data: Vec<u8>) {
        if self.state.get() == ConnectionState::Connected {
            self.events.emit(ConnectionEvent::Data(data));
        } else {
            trace!("{} dropping data in state {:?}", self.id, self.state.get());
        }
    }

    pub(crate) fn handle_incoming_disconnection(&self) {
        if self.state.transition(ConnectionState::Closed).is_some() {
            self.events.emit(ConnectionEvent::Disconnected {
                graceful_leave: false,
            });
        }
    }

    pub(crate) fn handle_connect_failed(&self, reason: &str) {
        if self.state.transition(ConnectionState::Closed).is_some() {
            self.events.emit(ConnectionEvent::Error(reason.to_string()));
            self.events.emit(ConnectionEvent::Disconnected {
                graceful_leave: false,
            });
        }
    }
}

impl Connection for SimulatorConnection {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    fn connection_type(&self) -> ConnectionType {
        ConnectionType::Simulator
    }

    fn state(&self) -> ConnectionState {
        self.state.get()
    }

    fn send(&self, data: Vec<u8>) {
        if self.state.get() != ConnectionState::Connected {
            trace!("{} dropping send in state {:?}", self.id, self.state.get());
            return;
        }
        self.simulator.send(self, data);
    }

    fn close(&self, graceful: bool) {
        let Some(previous) = self.state.transition(ConnectionState::Closing) else {
            return;
        };
        if matches!(
            previous,
            ConnectionState::Connecting | ConnectionState::Connected
        ) {
            self.simulator.disconnect(self);
        }
        self.state.transition(ConnectionState::Closed);
        self.events.emit(ConnectionEvent::Disconnected {
            graceful_leave: graceful,
        });
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ConnectionEvent>> {
        self.events.take()
    }
}
