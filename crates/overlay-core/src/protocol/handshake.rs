//! Versioned handshake exchanged on every new raw connection.
//!
//! The initiating side sends a `HandshakeRequest` as soon as its raw
//! connection is up; the accepting side answers with a `HandshakeResponse`.
//! No application data flows before the response is accepted.

use crate::error::HandshakeError;
use crate::peer_descriptor::PeerDescriptor;
use serde::{Deserialize, Serialize};

/// Current protocol version as `"major.minor"`.
///
/// Peers with different major versions refuse each other.
pub const PROTOCOL_VERSION: &str = "1.0";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeRequest {
    pub source_descriptor: PeerDescriptor,
    pub protocol_version: String,
}

impl HandshakeRequest {
    pub fn new(source_descriptor: PeerDescriptor, protocol_version: impl Into<String>) -> Self {
        Self {
            source_descriptor,
            protocol_version: protocol_version.into(),
        }
    }

    /// JSON rendering for logs.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeResponse {
    pub accepted: bool,
    pub error: Option<HandshakeError>,
    pub protocol_version: String,
}

impl HandshakeResponse {
    pub fn accepted(protocol_version: impl Into<String>) -> Self {
        Self {
            accepted: true,
            error: None,
            protocol_version: protocol_version.into(),
        }
    }

    pub fn rejected(error: HandshakeError, protocol_version: impl Into<String>) -> Self {
        Self {
            accepted: false,
            error: Some(error),
            protocol_version: protocol_version.into(),
        }
    }
}

/// Parse `"major.minor"`; a bare `"major"` counts as minor 0.
fn parse_version(version: &str) -> Option<(u32, u32)> {
    let mut parts = version.trim().splitn(2, '.');
    let major = parts.next()?.parse().ok()?;
    let minor = match parts.next() {
        Some(minor) => minor.parse().ok()?,
        None => 0,
    };
    Some((major, minor))
}

/// Whether a remote protocol version can talk to ours.
pub fn is_compatible_version(local: &str, remote: &str) -> bool {
    match (parse_version(local), parse_version(remote)) {
        (Some((local_major, _)), Some((remote_major, _))) => local_major == remote_major,
        _ => false,
    }
}

/// Compatible but not identical; worth a log line.
pub fn should_warn_version(local: &str, remote: &str) -> bool {
    is_compatible_version(local, remote) && parse_version(local) != parse_version(remote)
}
