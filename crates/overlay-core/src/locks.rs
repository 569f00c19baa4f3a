//! Per-peer, per-service "keep this connection open" bookkeeping.
//!
//! Local locks are reference counts: the same service may lock a peer several
//! times and must unlock as often. Remote locks are what the peer reported
//! through lock requests; the peer only reports each service once.

use crate::peer_descriptor::PeerKey;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Default)]
pub struct LockTable {
    local: HashMap<PeerKey, HashMap<String, usize>>,
    remote: HashMap<PeerKey, HashSet<String>>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one more local lock. True on the first lock of this service.
    pub fn add_local(&mut self, peer: &PeerKey, service_id: &str) -> bool {
        let count = self
            .local
            .entry(peer.clone())
            .or_default()
            .entry(service_id.to_string())
            .or_insert(0);
        *count += 1;
        *count == 1
    }

    /// Drop one local lock. True when the service's count reached zero.
    ///
    /// Unlocking a service that holds no lock is a no-op returning false.
    pub fn remove_local(&mut self, peer: &PeerKey, service_id: &str) -> bool {
        let Some(services) = self.local.get_mut(peer) else {
            return false;
        };
        let Some(count) = services.get_mut(service_id) else {
            return false;
        };
        *count = count.saturating_sub(1);
        if *count > 0 {
            return false;
        }
        services.remove(service_id);
        if services.is_empty() {
            self.local.remove(peer);
        }
        true
    }

    pub fn add_remote(&mut self, peer: &PeerKey, service_id: &str) {
        self.remote
            .entry(peer.clone())
            .or_default()
            .insert(service_id.to_string());
    }

    pub fn remove_remote(&mut self, peer: &PeerKey, service_id: &str) {
        if let Some(services) = self.remote.get_mut(peer) {
            services.remove(service_id);
            if services.is_empty() {
                self.remote.remove(peer);
            }
        }
    }

    /// Whether we hold a lock on `peer`, for `service_id` or for any service.
    pub fn is_local_locked(&self, peer: &PeerKey, service_id: Option<&str>) -> bool {
        match (self.local.get(peer), service_id) {
            (None, _) => false,
            (Some(services), None) => !services.is_empty(),
            (Some(services), Some(id)) => services.contains_key(id),
        }
    }

    /// Whether `peer` reported a lock on us, for `service_id` or for any service.
    pub fn is_remote_locked(&self, peer: &PeerKey, service_id: Option<&str>) -> bool {
        match (self.remote.get(peer), service_id) {
            (None, _) => false,
            (Some(services), None) => !services.is_empty(),
            (Some(services), Some(id)) => services.contains(id),
        }
    }

    pub fn is_locked(&self, peer: &PeerKey) -> bool {
        self.is_local_locked(peer, None) || self.is_remote_locked(peer, None)
    }

    /// Services we hold locks for on `peer`.
    pub fn local_services(&self, peer: &PeerKey) -> Vec<String> {
        self.local
            .get(peer)
            .map(|services| services.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Forget every lock in both directions for `peer`.
    pub fn clear_peer(&mut self, peer: &PeerKey) {
        self.local.remove(peer);
        self.remote.remove(peer);
    }

    pub fn clear(&mut self) {
        self.local.clear();
        self.remote.clear();
    }
}
