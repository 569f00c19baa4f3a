//! Virtual network for deterministic tests.
//!
//! The simulator routes `connect`, `send` and `disconnect` operations between
//! `SimulatorConnection`s after a delay chosen by the `LatencyType`. Every
//! operation is an independent timer on the injected `Scheduler`, tracked
//! under the connection that issued it so a disconnect can cancel whatever
//! that connection still has in flight.
//!
//! There is no per-connection FIFO: under `Random` latency two sends from the
//! same connection may arrive out of order. Under `None` and `Fixed` latency
//! equal deadlines fire in scheduling order, so delivery follows send order.

pub mod connection;
pub mod connector;
pub mod pings;

pub use connection::SimulatorConnection;
pub use connector::SimulatorConnector;

use crate::connection::{Connection, ConnectionId};
use crate::error::SimulatorError;
use crate::peer_descriptor::{PeerDescriptor, PeerKey};
use crate::scheduler::{Scheduler, TimerHandle};
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::panic::Location;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Connection setup takes this many one-way delays under `Real` latency.
const REAL_CONNECT_MULTIPLIER: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatencyType {
    /// Deliver on the next scheduler tick.
    None,
    Fixed(Duration),
    /// Uniform in [5, 250) ms, drawn per operation.
    Random,
    /// Region matrix lookup; requires a valid region on both ends.
    Real,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct TimerId(u64);

#[derive(Debug, Clone, Copy)]
enum Operation {
    Connect,
    Data,
    Disconnect,
}

#[derive(Default)]
struct SimulatorState {
    stopped: bool,
    connectors: HashMap<PeerKey, Weak<SimulatorConnector>>,
    /// Each connected simulator connection, mapped to its peer.
    associations: HashMap<ConnectionId, Arc<SimulatorConnection>>,
    pending_timers: HashMap<TimerId, (ConnectionId, TimerHandle)>,
    timers_by_connection: HashMap<ConnectionId, HashSet<TimerId>>,
    next_timer_id: u64,
}

pub struct Simulator {
    latency: LatencyType,
    scheduler: Arc<dyn Scheduler>,
    state: Mutex<SimulatorState>,
    me: Weak<Simulator>,
}

impl Simulator {
    pub fn new(latency: LatencyType, scheduler: Arc<dyn Scheduler>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            latency,
            scheduler,
            state: Mutex::new(SimulatorState::default()),
            me: me.clone(),
        })
    }

    pub fn latency(&self) -> LatencyType {
        self.latency
    }

    /// Register the connector reachable at `descriptor`.
    pub fn add_connector(
        &self,
        descriptor: &PeerDescriptor,
        connector: &Arc<SimulatorConnector>,
    ) -> Result<(), SimulatorError> {
        if self.latency == LatencyType::Real {
            pings::region_index(descriptor.region)?;
        }
        let mut state = self.lock();
        if state.stopped {
            error!(
                "add_connector() called on a stopped simulator for {}",
                descriptor.label()
            );
            return Ok(());
        }
        state
            .connectors
            .insert(descriptor.key(), Arc::downgrade(connector));
        debug!("Simulator registered connector for {}", descriptor.label());
        Ok(())
    }

    pub fn remove_connector(&self, key: &PeerKey) {
        self.lock().connectors.remove(key);
    }

    /// Schedule delivery of a connection attempt from `source` to `target`.
    #[track_caller]
    pub fn connect(
        &self,
        source: &Arc<SimulatorConnection>,
        target: &PeerDescriptor,
    ) -> Result<(), SimulatorError> {
        if self.is_stopped() {
            log_stopped("connect");
            return Ok(());
        }
        let delay = self.delay(source.local().region, target.region, Operation::Connect)?;

        let source_conn = source.clone();
        let target = target.clone();
        let mut state = self.lock();
        self.schedule(&mut state, source.id(), delay, move |sim| {
            sim.execute_connect(source_conn, target);
        });
        Ok(())
    }

    /// Pair `source` with the freshly created `target`. Both become connected.
    ///
    /// Returns false if the source gave up in the meantime.
    pub fn accept(
        &self,
        source: &Arc<SimulatorConnection>,
        target: &Arc<SimulatorConnection>,
    ) -> bool {
        {
            let mut state = self.lock();
            if state.stopped || !source.is_connecting() {
                return false;
            }
            state
                .associations
                .insert(source.id().clone(), target.clone());
            state
                .associations
                .insert(target.id().clone(), source.clone());
        }
        target.handle_connected();
        source.handle_connected();
        true
    }

    /// Schedule delivery of `data` to the peer of `source`.
    #[track_caller]
    pub fn send(&self, source: &SimulatorConnection, data: Vec<u8>) {
        let caller = Location::caller();
        let mut state = self.lock();
        if state.stopped {
            drop(state);
            error!("send() called on a stopped simulator at {}", caller);
            return;
        }
        let Some(target) = state.associations.get(source.id()).cloned() else {
            trace!("Simulator dropping send on unassociated {}", source.id());
            return;
        };
        let delay = match self.delay(
            source.local().region,
            target.local().region,
            Operation::Data,
        ) {
            Ok(delay) => delay,
            Err(e) => {
                warn!("Simulator dropping send on {}: {}", source.id(), e);
                return;
            }
        };
        self.schedule(&mut state, source.id(), delay, move |_| {
            target.handle_incoming_data(data);
        });
    }

    /// Tear down the association of `source`, cancel everything it still has
    /// in flight, and schedule the disconnect notification to its peer.
    #[track_caller]
    pub fn disconnect(&self, source: &SimulatorConnection) {
        let caller = Location::caller();
        let mut state = self.lock();
        if state.stopped {
            drop(state);
            error!("disconnect() called on a stopped simulator at {}", caller);
            return;
        }

        let cancelled = self.cancel_timers(&mut state, source.id());
        if cancelled > 0 {
            trace!(
                "Cancelled {} pending operations of {}",
                cancelled,
                source.id()
            );
        }

        let Some(target) = state.associations.remove(source.id()) else {
            return;
        };
        state.associations.remove(target.id());

        let delay = self
            .delay(
                source.local().region,
                target.local().region,
                Operation::Disconnect,
            )
            .unwrap_or(Duration::ZERO);
        self.schedule(&mut state, source.id(), delay, move |_| {
            target.handle_incoming_disconnection();
        });
    }

    /// Cancel every pending operation and make the simulator inert. Idempotent.
    pub fn stop(&self) {
        let handles: Vec<TimerHandle> = {
            let mut state = self.lock();
            if state.stopped {
                return;
            }
            state.stopped = true;
            info!(
                "Stopping simulator with {} associations and {} pending operations",
                state.associations.len(),
                state.pending_timers.len()
            );
            state.associations.clear();
            state.connectors.clear();
            state.timers_by_connection.clear();
            state
                .pending_timers
                .drain()
                .map(|(_, (_, handle))| handle)
                .collect()
        };
        for handle in handles {
            self.scheduler.cancel(handle);
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.lock().stopped
    }

    /// Operations scheduled but not yet delivered.
    pub fn pending_timer_count(&self) -> usize {
        self.lock().pending_timers.len()
    }

    pub fn association_count(&self) -> usize {
        self.lock().associations.len()
    }

    fn execute_connect(&self, source: Arc<SimulatorConnection>, target: PeerDescriptor) {
        let connector = self
            .lock()
            .connectors
            .get(&target.key())
            .and_then(Weak::upgrade);
        match connector {
            Some(connector) => connector.handle_incoming_connection(&source),
            None => {
                debug!(
                    "Simulator found no connector for {}, failing {}",
                    target.label(),
                    source.id()
                );
                source.handle_connect_failed("target connector not found");
            }
        }
    }

    fn delay(
        &self,
        source_region: Option<u32>,
        target_region: Option<u32>,
        operation: Operation,
    ) -> Result<Duration, SimulatorError> {
        Ok(match self.latency {
            LatencyType::None => Duration::ZERO,
            LatencyType::Fixed(delay) => delay,
            LatencyType::Random => Duration::from_micros(rand::rng().random_range(5_000..250_000)),
            LatencyType::Real => {
                let delay = pings::region_delay(source_region, target_region)?;
                match operation {
                    Operation::Connect => delay * REAL_CONNECT_MULTIPLIER,
                    Operation::Data | Operation::Disconnect => delay,
                }
            }
        })
    }

    fn schedule(
        &self,
        state: &mut SimulatorState,
        source: &ConnectionId,
        delay: Duration,
        task: impl FnOnce(&Simulator) + Send + 'static,
    ) {
        let id = TimerId(state.next_timer_id);
        state.next_timer_id += 1;

        let me = self.me.clone();
        let handle = self.scheduler.after(
            delay,
            Box::new(move || {
                let Some(sim) = me.upgrade() else {
                    return;
                };
                if sim.finish_timer(id) {
                    task(&sim);
                }
            }),
        );
        state.pending_timers.insert(id, (source.clone(), handle));
        state
            .timers_by_connection
            .entry(source.clone())
            .or_default()
            .insert(id);
    }

    /// Forget a fired timer. False if it was cancelled in the meantime.
    fn finish_timer(&self, id: TimerId) -> bool {
        let mut state = self.lock();
        if state.stopped {
            return false;
        }
        let Some((source, _)) = state.pending_timers.remove(&id) else {
            return false;
        };
        if let Some(timers) = state.timers_by_connection.get_mut(&source) {
            timers.remove(&id);
            if timers.is_empty() {
                state.timers_by_connection.remove(&source);
            }
        }
        true
    }

    fn cancel_timers(&self, state: &mut SimulatorState, source: &ConnectionId) -> usize {
        let Some(ids) = state.timers_by_connection.remove(source) else {
            return 0;
        };
        let mut cancelled = 0;
        for id in ids {
            if let Some((_, handle)) = state.pending_timers.remove(&id) {
                self.scheduler.cancel(handle);
                cancelled += 1;
            }
        }
        cancelled
    }

    fn lock(&self) -> MutexGuard<'_, SimulatorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[track_caller]
fn log_stopped(operation: &str) {
    error!(
        "{}() called on a stopped simulator at {}",
        operation,
        Location::caller()
    );
}
