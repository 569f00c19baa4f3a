//! WebSocket server accepting peer connections.
//!
//! The server only upgrades sockets. Handshakes and duplicate detection
//! happen in the connection manager once the accepted connection is wrapped.
//! Sockets opened for connectivity checks are answered here and never
//! reach the handler.

use crate::connection::WebsocketConnection;
use crate::connectivity::{Action, handle_connectivity_request};
use overlay_core::Connection;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tracing::{debug, error, info, trace};

/// How long a new socket may take to finish the WebSocket upgrade.
const UPGRADE_TIMEOUT: Duration = Duration::from_secs(10);

/// Pause after a failed accept, e.g. when out of file descriptors.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

pub type AcceptHandler = Arc<dyn Fn(Arc<WebsocketConnection>) + Send + Sync>;

struct ServerState {
    listener: Option<TcpListener>,
    accept_task: Option<JoinHandle<()>>,
}

pub struct WebsocketServer {
    local_addr: SocketAddr,
    state: Mutex<ServerState>,
}

impl WebsocketServer {
    /// Bind to `listen_addr`. Port 0 picks a free port.
    pub async fn bind(listen_addr: &str) -> std::io::Result<Self> {
        let listener = TcpListener::bind(listen_addr).await?;
        let local_addr = listener.local_addr()?;
        info!("WebSocket server listening on {}", local_addr);
        Ok(Self {
            local_addr,
            state: Mutex::new(ServerState {
                listener: Some(listener),
                accept_task: None,
            }),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Start accepting. Every upgraded socket is passed to `on_connection`.
    /// Returns false if the server was already started or stopped.
    pub fn start(&self, on_connection: AcceptHandler) -> bool {
        let mut state = self.lock();
        let Some(listener) = state.listener.take() else {
            return false;
        };
        state.accept_task = Some(tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        tokio::spawn(Self::upgrade(stream, addr, on_connection.clone()));
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                }
            }
        }));
        true
    }

    async fn upgrade(stream: TcpStream, addr: SocketAddr, on_connection: AcceptHandler) {
        let mut action = None;
        let record_action = |request: &Request, response: Response| {
            action = Action::from_query(request.uri().query());
            Ok::<Response, ErrorResponse>(response)
        };
        let upgrade = accept_hdr_async(stream, record_action);
        let ws_stream = match tokio::time::timeout(UPGRADE_TIMEOUT, upgrade).await {
            Ok(Ok(ws)) => ws,
            Ok(Err(e)) => {
                // Health checks (like `nc -z`) connect and immediately close without
                // completing the WebSocket handshake. Log these as debug, not error.
                let err_str = e.to_string();
                if err_str.contains("Handshake not finished")
                    || err_str.contains("Connection reset")
                    || err_str.contains("unexpected EOF")
                {
                    debug!("Connection closed before upgrade from {}", addr);
                } else {
                    error!("WebSocket upgrade failed for {}: {}", addr, e);
                }
                return;
            }
            Err(_) => {
                debug!("WebSocket upgrade from {} timed out", addr);
                return;
            }
        };

        match action {
            Some(Action::Request) => {
                debug!("Connectivity request from {}", addr);
                handle_connectivity_request(ws_stream, addr).await;
                return;
            }
            Some(Action::Probe) => {
                trace!("Connectivity probe from {}", addr);
                let mut ws_stream = ws_stream;
                let _ = ws_stream.close(None).await;
                return;
            }
            None => {}
        }

        let connection = WebsocketConnection::accepted(ws_stream);
        info!("New connection from {} ({})", addr, connection.id());
        on_connection(connection);
    }

    /// Stop accepting. Connections already handed out are unaffected.
    pub fn stop(&self) {
        let mut state = self.lock();
        state.listener = None;
        if let Some(task) = state.accept_task.take() {
            task.abort();
            debug!("WebSocket server on {} stopped", self.local_addr);
        }
    }

    fn lock(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for WebsocketServer {
    fn drop(&mut self) {
        if let Some(task) = self.lock().accept_task.take() {
            task.abort();
        }
    }
}
