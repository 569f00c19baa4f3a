//! Message envelope routed by the `ConnectionManager`.
//!
//! A `Message` names the service it belongs to and carries routing
//! descriptors. Its body is either opaque application bytes or one of the
//! connection layer's own RPC messages.

use super::rpc::RpcMessage;
use crate::peer_descriptor::PeerDescriptor;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MessageBody {
    Payload(Vec<u8>),
    Rpc(RpcMessage),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub message_id: String,
    pub service_id: String,
    pub source_descriptor: Option<PeerDescriptor>,
    pub target_descriptor: Option<PeerDescriptor>,
    pub body: MessageBody,
}

impl Message {
    pub fn new(service_id: impl Into<String>, target: PeerDescriptor, body: MessageBody) -> Self {
        Self {
            message_id: uuid::Uuid::new_v4().to_string(),
            service_id: service_id.into(),
            source_descriptor: None,
            target_descriptor: Some(target),
            body,
        }
    }

    /// Application message with an opaque payload.
    pub fn payload(service_id: impl Into<String>, target: PeerDescriptor, data: Vec<u8>) -> Self {
        Self::new(service_id, target, MessageBody::Payload(data))
    }

    pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn decode(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }

    pub fn as_payload(&self) -> Option<&[u8]> {
        match &self.body {
            MessageBody::Payload(data) => Some(data),
            MessageBody::Rpc(_) => None,
        }
    }
}
