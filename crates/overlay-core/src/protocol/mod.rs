//! Wire protocol for the connection layer.
//!
//! - Versioned handshake for every new raw connection
//! - `Frame` encoding on raw connections (bincode)
//! - `Message` envelope and the layer's own RPC payloads

pub mod envelope;
pub mod frame;
pub mod handshake;
pub mod rpc;

pub use envelope::{Message, MessageBody};
pub use frame::{Frame, MAX_FRAME_SIZE};
pub use handshake::{
    HandshakeRequest, HandshakeResponse, PROTOCOL_VERSION, is_compatible_version,
    should_warn_version,
};
pub use rpc::{
    DisconnectMode, DisconnectNotice, IceCandidate, LockRequest, LockResponse, RtcDescription,
    RpcKind, RpcMessage, RpcPayload, UnlockRequest, WebrtcConnectionRequest,
    WebsocketConnectionRequest, WebsocketConnectionResponse,
};
