//! Frames carried by a raw connection.
//!
//! Every byte buffer a `Connection` sends or receives is exactly one
//! bincode-encoded `Frame`.

use super::handshake::{HandshakeRequest, HandshakeResponse};
use serde::{Deserialize, Serialize};

/// Maximum size of a single frame accepted from the network (50MB).
pub const MAX_FRAME_SIZE: usize = 50 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Frame {
    HandshakeRequest(HandshakeRequest),
    HandshakeResponse(HandshakeResponse),
    /// An encoded `Message`, only valid after the handshake.
    Data(Vec<u8>),
}

impl Frame {
    pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn decode(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }

    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::HandshakeRequest(_) => "HandshakeRequest",
            Self::HandshakeResponse(_) => "HandshakeResponse",
            Self::Data(_) => "Data",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HandshakeError;
    use crate::protocol::PROTOCOL_VERSION;

    #[test]
    fn test_data_frame_keeps_payload() {
        let frame = Frame::Data(vec![1, 2, 3, 4]);
        let decoded = Frame::decode(&frame.encode().unwrap()).unwrap();
        match decoded {
            Frame::Data(bytes) => assert_eq!(bytes, vec![1, 2, 3, 4]),
            other => panic!("Expected Data, got {}", other.kind()),
        }
    }

    #[test]
    fn test_rejection_survives_encoding() {
        let frame = Frame::HandshakeResponse(HandshakeResponse::rejected(
            HandshakeError::UnsupportedVersion("2.0".into()),
            PROTOCOL_VERSION,
        ));
        let decoded = Frame::decode(&frame.encode().unwrap()).unwrap();
        match decoded {
            Frame::HandshakeResponse(response) => {
                assert!(!response.accepted);
                assert_eq!(
                    response.error,
                    Some(HandshakeError::UnsupportedVersion("2.0".into()))
                );
            }
            other => panic!("Expected HandshakeResponse, got {}", other.kind()),
        }
    }

    #[test]
    fn test_garbage_does_not_decode() {
        assert!(Frame::decode(&[0xff, 0xff, 0xff, 0xff, 0x00]).is_err());
    }
}
