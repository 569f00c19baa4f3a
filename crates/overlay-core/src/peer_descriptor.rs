//! Peer identity: `PeerId`, its hex `PeerKey`, and the `PeerDescriptor` record.
//!
//! Peer ids are arbitrary byte strings. They display and serialize as
//! lowercase hex, and the hex form doubles as the map key everywhere a
//! peer needs to be looked up.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt::{self, Display, Formatter};
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use thiserror::Error;

/// Length of randomly generated peer ids (Kademlia-style 160 bits).
pub const PEER_ID_LENGTH: usize = 20;

/// Number of regions in the simulated latency matrix.
pub const REGION_COUNT: u32 = 16;

#[derive(Debug, Error)]
pub enum PeerIdError {
    #[error("Invalid peer ID format: expected non-empty hex string")]
    InvalidFormat,
    #[error("Invalid hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),
}

/// A peer identifier.
///
/// Ordered lexicographically by its bytes, which gives every pair of peers
/// the same answer to "who is larger" regardless of timing.
///
/// # Examples
/// ```
/// use overlay_core::PeerId;
///
/// let peer_id: PeerId = "0a0b".parse().unwrap();
/// assert_eq!(peer_id.as_bytes(), &[0x0a, 0x0b]);
/// assert_eq!(peer_id.to_string(), "0a0b");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(Vec<u8>);

impl PeerId {
    /// Generate a new random peer ID of `PEER_ID_LENGTH` bytes.
    pub fn random() -> Self {
        use rand::Rng;
        let mut bytes = vec![0u8; PEER_ID_LENGTH];
        rand::rng().fill(&mut bytes[..]);
        Self(bytes)
    }

    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// The string key used for all per-peer tables.
    pub fn key(&self) -> PeerKey {
        PeerKey(hex::encode(&self.0))
    }
}

impl Display for PeerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0))
    }
}

impl FromStr for PeerId {
    type Err = PeerIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(PeerIdError::InvalidFormat);
        }
        Ok(Self(hex::decode(s.to_ascii_lowercase())?))
    }
}

impl Serialize for PeerId {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for PeerId {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Hex form of a `PeerId`, used as the key of per-peer maps.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerKey(String);

impl PeerKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for PeerKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Address of a peer's WebSocket server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebsocketAddress {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl WebsocketAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            tls: false,
        }
    }

    pub fn url(&self) -> String {
        let scheme = if self.tls { "wss" } else { "ws" };
        format!("{}://{}:{}", scheme, self.host, self.port)
    }
}

/// Transports a peer can be reached over.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportAddresses {
    pub websocket: Option<WebsocketAddress>,
    /// Whether the peer accepts WebRTC data channels.
    pub webrtc: bool,
}

/// Identity and reachability record of a node.
///
/// Two descriptors are equal when their peer ids are equal; the remaining
/// fields are advisory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerDescriptor {
    pub peer_id: PeerId,
    pub node_name: Option<String>,
    pub transport_addresses: TransportAddresses,
    /// Region index used by the simulator's `Real` latency model.
    pub region: Option<u32>,
}

impl PeerDescriptor {
    pub fn new(peer_id: PeerId) -> Self {
        Self {
            peer_id,
            node_name: None,
            transport_addresses: TransportAddresses::default(),
            region: None,
        }
    }

    pub fn with_node_name(mut self, name: impl Into<String>) -> Self {
        self.node_name = Some(name.into());
        self
    }

    pub fn with_websocket(mut self, address: WebsocketAddress) -> Self {
        self.transport_addresses.websocket = Some(address);
        self
    }

    pub fn with_webrtc(mut self) -> Self {
        self.transport_addresses.webrtc = true;
        self
    }

    pub fn with_region(mut self, region: u32) -> Self {
        self.region = Some(region);
        self
    }

    pub fn key(&self) -> PeerKey {
        self.peer_id.key()
    }

    pub fn websocket(&self) -> Option<&WebsocketAddress> {
        self.transport_addresses.websocket.as_ref()
    }

    /// Human-readable label for logs: node name if set, hex id otherwise.
    pub fn label(&self) -> String {
        match &self.node_name {
            Some(name) => name.clone(),
            None => self.peer_id.to_string(),
        }
    }
}

impl PartialEq for PeerDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.peer_id == other.peer_id
    }
}

impl Eq for PeerDescriptor {}

impl Hash for PeerDescriptor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.peer_id.hash(state);
    }
}

/// Deterministic tie-break for simultaneous connection attempts: the side
/// with the larger peer id keeps its outgoing attempt.
pub fn outgoing_wins(local: &PeerId, remote: &PeerId) -> bool {
    local.cmp(remote) == Ordering::Greater
}
