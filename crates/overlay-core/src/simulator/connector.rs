//! Connector that opens and accepts connections through a `Simulator`.

use super::{Simulator, SimulatorConnection};
use crate::connection::{
    Connection, ConnectionSink, ConnectionType, HandshakeOptions, ManagedConnection,
};
use crate::connector::Connector;
use crate::error::{ConnectionError, Result};
use crate::peer_descriptor::PeerDescriptor;
use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

#[derive(Default)]
struct ConnectorState {
    options: Option<HandshakeOptions>,
    sink: Option<Arc<dyn ConnectionSink>>,
    stopped: bool,
}

pub struct SimulatorConnector {
    simulator: Arc<Simulator>,
    state: Mutex<ConnectorState>,
}

impl SimulatorConnector {
    pub fn new(simulator: Arc<Simulator>) -> Arc<Self> {
        Arc::new(Self {
            simulator,
            state: Mutex::new(ConnectorState::default()),
        })
    }

    pub fn simulator(&self) -> &Arc<Simulator> {
        &self.simulator
    }

    /// Called by the simulator when a connect operation reaches this peer.
    pub fn handle_incoming_connection(&self, source: &Arc<SimulatorConnection>) {
        let running = {
            let state = self.lock();
            match (&state.options, &state.sink) {
                (Some(options), Some(sink)) if !state.stopped => {
                    Some((options.clone(), sink.clone()))
                }
                _ => None,
            }
        };
        let Some((options, sink)) = running else {
            source.handle_connect_failed("target connector not running");
            return;
        };

        let target = SimulatorConnection::new(
            options.local.clone(),
            source.local().clone(),
            self.simulator.clone(),
        );
        if !self.simulator.accept(source, &target) {
            debug!("Simulator connection from {} abandoned", source.local().label());
            target.close(false);
            return;
        }
        ManagedConnection::incoming(options, ConnectionType::Simulator, target, sink);
    }

    fn lock(&self) -> MutexGuard<'_, ConnectorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Connector for SimulatorConnector {
    fn connection_type(&self) -> ConnectionType {
        ConnectionType::Simulator
    }

    fn start(
        self: Arc<Self>,
        options: HandshakeOptions,
        sink: Arc<dyn ConnectionSink>,
    ) -> Result<()> {
        self.simulator.add_connector(&options.local, &self)?;
        let mut state = self.lock();
        state.options = Some(options);
        state.sink = Some(sink);
        state.stopped = false;
        Ok(())
    }

    fn connect(&self, target: &PeerDescriptor) -> Result<Arc<ManagedConnection>> {
        let options = {
            let state = self.lock();
            if state.stopped {
                return Err(ConnectionError::Stopped);
            }
            state.options.clone().ok_or(ConnectionError::NotStarted)?
        };

        let raw = SimulatorConnection::new(
            options.local.clone(),
            target.clone(),
            self.simulator.clone(),
        );
        let managed = ManagedConnection::outgoing(
            options,
            target.clone(),
            ConnectionType::Simulator,
            raw.clone(),
        );
        if let Err(e) = raw.connect() {
            managed.close(false);
            return Err(e.into());
        }
        Ok(managed)
    }

    async fn stop(&self) {
        let local = {
            let mut state = self.lock();
            state.stopped = true;
            state.sink = None;
            state.options.as_ref().map(|o| o.local.key())
        };
        if let Some(key) = local {
            self.simulator.remove_connector(&key);
        }
    }
}
