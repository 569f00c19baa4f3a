//! RPC payloads exchanged by the connection layer itself.
//!
//! - Locking: `LockRequest`/`LockResponse`, `UnlockRequest`
//! - Teardown: `DisconnectNotice`
//! - Reverse WebSocket connections: `WebsocketConnectionRequest`/`Response`
//! - WebRTC signaling: connection request, offer, answer, ICE candidate

use crate::peer_descriptor::PeerDescriptor;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcKind {
    Request,
    Response,
    /// Fire-and-forget; never answered.
    Notification,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcMessage {
    pub request_id: String,
    pub kind: RpcKind,
    pub payload: RpcPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RpcPayload {
    LockRequest(LockRequest),
    LockResponse(LockResponse),
    UnlockRequest(UnlockRequest),
    DisconnectNotice(DisconnectNotice),
    WebsocketConnectionRequest(WebsocketConnectionRequest),
    WebsocketConnectionResponse(WebsocketConnectionResponse),
    WebrtcConnectionRequest(WebrtcConnectionRequest),
    RtcOffer(RtcDescription),
    RtcAnswer(RtcDescription),
    IceCandidate(IceCandidate),
}

impl RpcPayload {
    /// Method name for logs.
    pub fn method(&self) -> &'static str {
        match self {
            Self::LockRequest(_) => "lockRequest",
            Self::LockResponse(_) => "lockResponse",
            Self::UnlockRequest(_) => "unlockRequest",
            Self::DisconnectNotice(_) => "gracefulDisconnect",
            Self::WebsocketConnectionRequest(_) => "requestConnection",
            Self::WebsocketConnectionResponse(_) => "requestConnectionResponse",
            Self::WebrtcConnectionRequest(_) => "requestWebrtcConnection",
            Self::RtcOffer(_) => "rtcOffer",
            Self::RtcAnswer(_) => "rtcAnswer",
            Self::IceCandidate(_) => "iceCandidate",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockRequest {
    pub peer_descriptor: PeerDescriptor,
    pub protocol_version: String,
    pub service_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockResponse {
    pub accepted: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnlockRequest {
    pub peer_descriptor: PeerDescriptor,
    pub protocol_version: String,
    pub service_id: String,
}

/// Why a peer is disconnecting voluntarily.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisconnectMode {
    /// Closing this one connection.
    Normal,
    /// Leaving the network entirely.
    Leaving,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisconnectNotice {
    pub peer_descriptor: PeerDescriptor,
    pub protocol_version: String,
    pub disconnect_mode: DisconnectMode,
}

/// Asks a peer without a reachable server to connect back to the requester.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebsocketConnectionRequest {
    pub requester: PeerDescriptor,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebsocketConnectionResponse {
    pub accepted: bool,
    pub reason: Option<String>,
}

/// Sent by the non-offering side to ask the offering side to start.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebrtcConnectionRequest {
    pub requester: PeerDescriptor,
    pub target: PeerDescriptor,
    pub connection_id: String,
}

/// An SDP offer or answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtcDescription {
    pub requester: PeerDescriptor,
    pub target: PeerDescriptor,
    pub description: String,
    pub connection_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub requester: PeerDescriptor,
    pub target: PeerDescriptor,
    pub candidate: String,
    pub mid: String,
    pub connection_id: String,
}
