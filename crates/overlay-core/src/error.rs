//! Error types for the connection layer.

use crate::peer_descriptor::PeerKey;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Reason an acceptor refused a handshake.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum HandshakeError {
    #[error("Duplicate connection")]
    Duplicate,
    #[error("Unsupported protocol version {0}")]
    UnsupportedVersion(String),
    #[error("Invalid handshake request")]
    InvalidRequest,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SimulatorError {
    #[error("Invalid region {0:?}: expected an index below 16")]
    InvalidRegion(Option<u32>),
}

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Connection manager not started")]
    NotStarted,

    #[error("Connection manager stopped")]
    Stopped,

    #[error("Cannot connect to self")]
    CannotConnectToSelf,

    #[error("Message has no target descriptor")]
    MissingTargetDescriptor,

    #[error("No transport available to reach peer {0}")]
    NoTransport(PeerKey),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Handshake rejected: {0}")]
    HandshakeRejected(HandshakeError),

    #[error("Handshake timed out")]
    HandshakeTimeout,

    #[error("RPC request timed out")]
    RpcTimeout,

    #[error("RPC failed: {0}")]
    Rpc(String),

    #[error("Codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("Simulator error: {0}")]
    Simulator(#[from] SimulatorError),

    #[error("Transport error: {0}")]
    Transport(String),
}

impl ConnectionError {
    /// Clone-able copy for fanning one failure out to several waiters.
    pub(crate) fn duplicate(&self) -> Self {
        match self {
            Self::NotStarted => Self::NotStarted,
            Self::Stopped => Self::Stopped,
            Self::CannotConnectToSelf => Self::CannotConnectToSelf,
            Self::MissingTargetDescriptor => Self::MissingTargetDescriptor,
            Self::NoTransport(key) => Self::NoTransport(key.clone()),
            Self::ConnectionFailed(reason) => Self::ConnectionFailed(reason.clone()),
            Self::ConnectionClosed => Self::ConnectionClosed,
            Self::HandshakeRejected(err) => Self::HandshakeRejected(err.clone()),
            Self::HandshakeTimeout => Self::HandshakeTimeout,
            Self::RpcTimeout => Self::RpcTimeout,
            Self::Rpc(reason) => Self::Rpc(reason.clone()),
            Self::Codec(err) => Self::Transport(err.to_string()),
            Self::Simulator(err) => Self::Simulator(err.clone()),
            Self::Transport(reason) => Self::Transport(reason.clone()),
        }
    }
}

pub type Result<T> = std::result::Result<T, ConnectionError>;
