//! Request/response correlation for the connection layer's own RPCs.
//!
//! The communicator does no I/O of its own. It builds request and
//! notification `Message`s for the caller to send, matches responses to
//! waiting requests by request id, and hands incoming requests to a single
//! registered handler.

use crate::connector::Transport;
use crate::error::{ConnectionError, Result};
use crate::events::Subscription;
use crate::peer_descriptor::PeerDescriptor;
use crate::protocol::{Message, MessageBody, RpcKind, RpcMessage, RpcPayload};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

/// Answers an incoming request or notification. The return value is sent
/// back for requests and ignored for notifications.
pub type RpcHandler =
    Arc<dyn Fn(&PeerDescriptor, RpcPayload) -> Option<RpcPayload> + Send + Sync>;

/// A request whose response has not arrived yet.
pub struct PendingRequest {
    request_id: String,
    rx: oneshot::Receiver<RpcPayload>,
}

impl PendingRequest {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }
}

pub struct RpcCommunicator {
    service_id: String,
    pending: Mutex<HashMap<String, oneshot::Sender<RpcPayload>>>,
    handler: RwLock<Option<RpcHandler>>,
}

impl RpcCommunicator {
    pub fn new(service_id: impl Into<String>) -> Self {
        Self {
            service_id: service_id.into(),
            pending: Mutex::new(HashMap::new()),
            handler: RwLock::new(None),
        }
    }

    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    pub fn set_handler(&self, handler: RpcHandler) {
        *self.handler.write().unwrap_or_else(|e| e.into_inner()) = Some(handler);
    }

    pub fn clear_handler(&self) {
        *self.handler.write().unwrap_or_else(|e| e.into_inner()) = None;
    }

    /// Build a request and register it as pending.
    pub fn prepare_request(
        &self,
        target: &PeerDescriptor,
        payload: RpcPayload,
    ) -> (Message, PendingRequest) {
        let request_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.lock_pending().insert(request_id.clone(), tx);

        let message = Message::new(
            self.service_id.clone(),
            target.clone(),
            MessageBody::Rpc(RpcMessage {
                request_id: request_id.clone(),
                kind: RpcKind::Request,
                payload,
            }),
        );
        (message, PendingRequest { request_id, rx })
    }

    /// Build a fire-and-forget notification.
    pub fn notification(&self, target: &PeerDescriptor, payload: RpcPayload) -> Message {
        Message::new(
            self.service_id.clone(),
            target.clone(),
            MessageBody::Rpc(RpcMessage {
                request_id: uuid::Uuid::new_v4().to_string(),
                kind: RpcKind::Notification,
                payload,
            }),
        )
    }

    /// Wait for the response to `pending`, giving up after `timeout`.
    pub async fn wait(&self, pending: PendingRequest, timeout: Duration) -> Result<RpcPayload> {
        let PendingRequest { request_id, rx } = pending;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(payload)) => Ok(payload),
            Ok(Err(_)) => Err(ConnectionError::Rpc(format!(
                "request {} cancelled",
                request_id
            ))),
            Err(_) => {
                self.lock_pending().remove(&request_id);
                Err(ConnectionError::RpcTimeout)
            }
        }
    }

    /// Forget a pending request, e.g. because sending it failed.
    pub fn abandon(&self, pending: &PendingRequest) {
        self.lock_pending().remove(&pending.request_id);
    }

    /// Send a request over `transport` and wait for its response.
    pub async fn request(
        &self,
        transport: &dyn Transport,
        target: &PeerDescriptor,
        payload: RpcPayload,
        timeout: Duration,
    ) -> Result<RpcPayload> {
        let method = payload.method();
        let (message, pending) = self.prepare_request(target, payload);
        trace!("Sending {} request {} to {}", method, pending.request_id, target.label());
        if let Err(e) = transport.send(message).await {
            self.abandon(&pending);
            return Err(e);
        }
        self.wait(pending, timeout).await
    }

    /// Send a notification over `transport`.
    pub async fn notify(
        &self,
        transport: &dyn Transport,
        target: &PeerDescriptor,
        payload: RpcPayload,
    ) -> Result<()> {
        transport.send(self.notification(target, payload)).await
    }

    /// Process an incoming message for this service.
    ///
    /// Responses complete pending requests. Requests and notifications go to
    /// the handler; the response message to send back, if any, is returned.
    pub fn handle_message(&self, message: &Message) -> Option<Message> {
        if message.service_id != self.service_id {
            return None;
        }
        let MessageBody::Rpc(rpc) = &message.body else {
            return None;
        };

        match rpc.kind {
            RpcKind::Response => {
                match self.lock_pending().remove(&rpc.request_id) {
                    Some(tx) => {
                        let _ = tx.send(rpc.payload.clone());
                    }
                    None => trace!("Late or unknown RPC response {}", rpc.request_id),
                }
                None
            }
            RpcKind::Request | RpcKind::Notification => {
                let Some(source) = &message.source_descriptor else {
                    warn!("Dropping {} without a source descriptor", rpc.payload.method());
                    return None;
                };
                let handler = self
                    .handler
                    .read()
                    .unwrap_or_else(|e| e.into_inner())
                    .clone();
                let Some(handler) = handler else {
                    debug!("No handler for {} on {}", rpc.payload.method(), self.service_id);
                    return None;
                };

                let response = handler(source, rpc.payload.clone())?;
                if rpc.kind == RpcKind::Notification {
                    return None;
                }
                Some(Message::new(
                    self.service_id.clone(),
                    source.clone(),
                    MessageBody::Rpc(RpcMessage {
                        request_id: rpc.request_id.clone(),
                        kind: RpcKind::Response,
                        payload: response,
                    }),
                ))
            }
        }
    }

    /// Answer messages arriving over `transport` for as long as the returned
    /// subscription is held.
    pub fn listen(self: &Arc<Self>, transport: &Arc<dyn Transport>) -> Subscription {
        let rpc = Arc::downgrade(self);
        let weak_transport = Arc::downgrade(transport);
        transport.subscribe_messages(Box::new(move |message| {
            let Some(rpc) = rpc.upgrade() else {
                return;
            };
            let Some(response) = rpc.handle_message(&message) else {
                return;
            };
            let transport = weak_transport.clone();
            tokio::spawn(async move {
                let Some(transport) = transport.upgrade() else {
                    return;
                };
                if let Err(e) = transport.send(response).await {
                    debug!("Failed to send RPC response: {}", e);
                }
            });
        }))
    }

    /// Drop every pending request. Their waiters fail immediately.
    pub fn cancel_all(&self) {
        self.lock_pending().clear();
    }

    pub fn pending_count(&self) -> usize {
        self.lock_pending().len()
    }

    fn lock_pending(&self) -> MutexGuard<'_, HashMap<String, oneshot::Sender<RpcPayload>>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}
