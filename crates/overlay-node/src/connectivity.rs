//! Connectivity checks against entry points.
//!
//! A node with a WebSocket server asks an entry point whether it can be
//! reached: it opens a socket with `?action=connectivityRequest` and sends a
//! `ConnectivityRequest`. The entry point dials the requested address back
//! with `?action=connectivityProbe`, and answers with the host it observed
//! and, if the probe succeeded, the verified WebSocket address.
//!
//! Neither socket is handshaken or handed to a connection manager.

use futures::{SinkExt, StreamExt};
use overlay_core::WebsocketAddress;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::{WebSocketStream, connect_async, tungstenite::Message};
use tracing::{debug, trace, warn};

pub const CONNECTIVITY_CHECKER_SERVICE: &str = "system/connectivity-checker";

/// Wait for the response to a connectivity request.
pub const CONNECTIVITY_TIMEOUT: Duration = Duration::from_secs(5);

/// Opening the request socket, and the entry point's probe back to us.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum ConnectivityError {
    #[error("Failed to connect to {0}: {1}")]
    ConnectionFailed(String, String),
    #[error("No connectivity response within {0:?}")]
    Timeout(Duration),
    #[error("Connection closed before a connectivity response")]
    Closed,
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("Encoding error: {0}")]
    Encoding(#[from] bincode::Error),
}

/// Purpose of a socket that is not a peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Request,
    Probe,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Request => "connectivityRequest",
            Action::Probe => "connectivityProbe",
        }
    }

    /// Parse the `action` parameter of a request URI query.
    pub fn from_query(query: Option<&str>) -> Option<Self> {
        let value = query?
            .split('&')
            .find_map(|pair| pair.strip_prefix("action="))?;
        match value {
            "connectivityRequest" => Some(Action::Request),
            "connectivityProbe" => Some(Action::Probe),
            _ => None,
        }
    }

    pub fn url(self, address: &WebsocketAddress) -> String {
        format!("{}?action={}", address.url(), self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectivityRequest {
    /// Host to probe. The entry point uses our observed IP when unset.
    pub host: Option<String>,
    pub port: u16,
    pub tls: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectivityResponse {
    /// Whether the probe reached our server.
    pub open_internet: bool,
    /// Host the entry point probed: the requested one or our observed IP.
    pub host: String,
    /// Verified server address, present only when `open_internet`.
    pub websocket: Option<WebsocketAddress>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum ConnectivityBody {
    Request(ConnectivityRequest),
    Response(ConnectivityResponse),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ConnectivityMessage {
    service_id: String,
    message_id: String,
    body: ConnectivityBody,
}

impl ConnectivityMessage {
    fn new(body: ConnectivityBody) -> Self {
        Self {
            service_id: CONNECTIVITY_CHECKER_SERVICE.to_string(),
            message_id: uuid::Uuid::new_v4().to_string(),
            body,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    fn decode(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }
}

/// Ask the entry point at `entry_point` how it sees us.
pub async fn send_connectivity_request(
    entry_point: &WebsocketAddress,
    request: ConnectivityRequest,
) -> Result<ConnectivityResponse, ConnectivityError> {
    let url = Action::Request.url(entry_point);
    let mut ws = match tokio::time::timeout(CONNECT_TIMEOUT, connect_async(url.as_str())).await {
        Ok(Ok((ws, _response))) => ws,
        Ok(Err(e)) => return Err(ConnectivityError::ConnectionFailed(url, e.to_string())),
        Err(_) => return Err(ConnectivityError::ConnectionFailed(url, "timed out".into())),
    };

    let message = ConnectivityMessage::new(ConnectivityBody::Request(request));
    ws.send(Message::Binary(message.encode()?)).await?;
    trace!("Connectivity request {} sent to {}", message.message_id, url);

    let result = tokio::time::timeout(CONNECTIVITY_TIMEOUT, next_response(&mut ws))
        .await
        .unwrap_or(Err(ConnectivityError::Timeout(CONNECTIVITY_TIMEOUT)));
    let _ = ws.close(None).await;
    result
}

async fn next_response<S>(
    ws: &mut WebSocketStream<S>,
) -> Result<ConnectivityResponse, ConnectivityError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(message) = ws.next().await {
        let data = match message? {
            Message::Binary(data) => data,
            Message::Close(_) => break,
            _ => continue,
        };
        match ConnectivityMessage::decode(&data) {
            Ok(ConnectivityMessage {
                body: ConnectivityBody::Response(response),
                ..
            }) => return Ok(response),
            Ok(_) => continue,
            Err(e) => trace!("Could not parse connectivity message: {}", e),
        }
    }
    Err(ConnectivityError::Closed)
}

/// Answer the first connectivity request on an accepted socket.
pub async fn handle_connectivity_request<S>(mut ws: WebSocketStream<S>, remote: SocketAddr)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = tokio::time::timeout(CONNECTIVITY_TIMEOUT, next_request(&mut ws)).await;
    let Ok(Some(request)) = request else {
        debug!("No connectivity request from {}", remote);
        let _ = ws.close(None).await;
        return;
    };

    let host = request.host.unwrap_or_else(|| remote.ip().to_string());
    let mut address = WebsocketAddress::new(host.clone(), request.port);
    address.tls = request.tls;
    let open_internet = probe(&address).await;
    debug!(
        "Connectivity check for {} from {}: {}",
        address.url(),
        remote,
        if open_internet { "reachable" } else { "unreachable" }
    );

    let response = ConnectivityResponse {
        open_internet,
        host,
        websocket: open_internet.then_some(address),
    };
    let sent = match ConnectivityMessage::new(ConnectivityBody::Response(response)).encode() {
        Ok(bytes) => ws.send(Message::Binary(bytes)).await.map_err(|e| e.to_string()),
        Err(e) => Err(e.to_string()),
    };
    if let Err(e) = sent {
        warn!("Failed to send connectivity response to {}: {}", remote, e);
    }
    let _ = ws.close(None).await;
}

async fn next_request<S>(ws: &mut WebSocketStream<S>) -> Option<ConnectivityRequest>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(Ok(message)) = ws.next().await {
        let Message::Binary(data) = message else {
            continue;
        };
        if let Ok(ConnectivityMessage {
            body: ConnectivityBody::Request(request),
            ..
        }) = ConnectivityMessage::decode(&data)
        {
            return Some(request);
        }
    }
    None
}

/// Whether a WebSocket server answers at `address`.
async fn probe(address: &WebsocketAddress) -> bool {
    let url = Action::Probe.url(address);
    match tokio::time::timeout(CONNECT_TIMEOUT, connect_async(url.as_str())).await {
        Ok(Ok((mut ws, _response))) => {
            let _ = ws.close(None).await;
            true
        }
        Ok(Err(e)) => {
            trace!("Probe to {} failed: {}", url, e);
            false
        }
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_from_query() {
        assert_eq!(
            Action::from_query(Some("action=connectivityRequest")),
            Some(Action::Request)
        );
        assert_eq!(
            Action::from_query(Some("x=1&action=connectivityProbe")),
            Some(Action::Probe)
        );
        assert_eq!(Action::from_query(Some("action=other")), None);
        assert_eq!(Action::from_query(None), None);
    }

    #[test]
    fn test_action_url() {
        let address = WebsocketAddress::new("10.0.0.1", 8080);
        assert_eq!(
            Action::Probe.url(&address),
            "ws://10.0.0.1:8080?action=connectivityProbe"
        );
    }

    #[tokio::test]
    async fn test_probe_to_closed_port_fails() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        assert!(!probe(&WebsocketAddress::new("127.0.0.1", port)).await);
    }

    #[tokio::test]
    async fn test_request_to_closed_port_fails() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let request = ConnectivityRequest {
            host: None,
            port: 1,
            tls: false,
        };
        let result =
            send_connectivity_request(&WebsocketAddress::new("127.0.0.1", port), request).await;
        assert!(matches!(result, Err(ConnectivityError::ConnectionFailed(..))));
    }
}
