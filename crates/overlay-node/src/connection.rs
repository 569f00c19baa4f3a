//! WebSocket-backed raw connection.
//!
//! Each connection splits its stream into a writer task fed by a channel and
//! a read loop that forwards binary frames as `ConnectionEvent::Data`.

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use overlay_core::connection::{ConnectionEvents, StateCell};
use overlay_core::protocol::MAX_FRAME_SIZE;
use overlay_core::{Connection, ConnectionEvent, ConnectionId, ConnectionState, ConnectionType};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    WebSocketStream, connect_async,
    tungstenite::{Error as WsError, Message},
};
use tracing::{debug, error, trace, warn};

#[derive(Default)]
struct Io {
    writer: Option<mpsc::UnboundedSender<Message>>,
    tasks: Vec<JoinHandle<()>>,
}

/// A single WebSocket connection, either accepted by our server or dialed by us.
pub struct WebsocketConnection {
    id: ConnectionId,
    connection_type: ConnectionType,
    state: StateCell,
    events: ConnectionEvents,
    io: Mutex<Io>,
}

impl WebsocketConnection {
    fn new(connection_type: ConnectionType) -> Arc<Self> {
        Arc::new(Self {
            id: ConnectionId::new(connection_type),
            connection_type,
            state: StateCell::new(ConnectionState::Connecting),
            events: ConnectionEvents::new(),
            io: Mutex::new(Io::default()),
        })
    }

    /// Wrap a socket our server accepted. It is connected immediately.
    pub fn accepted<S>(stream: WebSocketStream<S>) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let this = Self::new(ConnectionType::WebsocketServer);
        this.attach(stream);
        this
    }

    /// Dial `url`. Failures are reported as `Error` then `Disconnected`.
    pub fn connect(url: String, timeout: Duration) -> Arc<Self> {
        let this = Self::new(ConnectionType::WebsocketClient);
        let weak = Arc::downgrade(&this);
        let task = tokio::spawn(async move {
            let result = tokio::time::timeout(timeout, connect_async(url.as_str())).await;
            let Some(this) = weak.upgrade() else {
                return;
            };
            match result {
                Ok(Ok((stream, _response))) => {
                    debug!("Connected to {} ({})", url, this.id);
                    this.attach(stream);
                }
                Ok(Err(e)) => this.fail(format!("Failed to connect to {}: {}", url, e)),
                Err(_) => this.fail(format!("Timed out connecting to {}", url)),
            }
        });
        this.lock().tasks.push(task);
        this
    }

    fn attach<S>(self: &Arc<Self>, stream: WebSocketStream<S>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (write, read) = stream.split();
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut io = self.lock();
            // Closed while the dial was in flight; dropping the stream hangs up.
            if self.state.transition(ConnectionState::Connected).is_none() {
                return;
            }
            io.writer = Some(tx);
            io.tasks
                .push(tokio::spawn(Self::write_loop(self.id.clone(), write, rx)));
        }
        self.events.emit(ConnectionEvent::Connected);

        let task = tokio::spawn(Self::read_loop(Arc::downgrade(self), self.id.clone(), read));
        self.lock().tasks.push(task);
    }

    async fn write_loop<S>(
        id: ConnectionId,
        mut write: SplitSink<WebSocketStream<S>, Message>,
        mut rx: mpsc::UnboundedReceiver<Message>,
    ) where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        while let Some(message) = rx.recv().await {
            let last = matches!(message, Message::Close(_));
            if let Err(e) = write.send(message).await {
                debug!("Failed to write to {}: {}", id, e);
                break;
            }
            if last {
                break;
            }
        }
    }

    async fn read_loop<S>(
        connection: Weak<WebsocketConnection>,
        id: ConnectionId,
        mut read: SplitStream<WebSocketStream<S>>,
    ) where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        loop {
            let data = match read.next().await {
                Some(Ok(Message::Binary(data))) => data,
                Some(Ok(Message::Text(text))) => text.into_bytes(),
                Some(Ok(Message::Close(_))) => {
                    debug!("Received close frame on {}", id);
                    break;
                }
                Some(Ok(_)) => continue,
                Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) => {
                    debug!("Connection {} closed", id);
                    break;
                }
                Some(Err(e)) => {
                    error!("WebSocket error on {}: {}", id, e);
                    break;
                }
                None => {
                    debug!("Connection {} stream ended", id);
                    break;
                }
            };

            if data.len() > MAX_FRAME_SIZE {
                warn!(
                    "Message on {} exceeds max size ({} > {}), dropping",
                    id,
                    data.len(),
                    MAX_FRAME_SIZE
                );
                continue;
            }
            let Some(this) = connection.upgrade() else {
                return;
            };
            this.events.emit(ConnectionEvent::Data(data));
        }

        if let Some(this) = connection.upgrade() {
            this.handle_remote_close();
        }
    }

    fn handle_remote_close(&self) {
        if self.state.transition(ConnectionState::Closed).is_some() {
            self.lock().writer = None;
            self.events.emit(ConnectionEvent::Disconnected {
                graceful_leave: false,
            });
        }
    }

    fn fail(&self, reason: String) {
        if self.state.transition(ConnectionState::Closed).is_some() {
            debug!("{}: {}", self.id, reason);
            self.events.emit(ConnectionEvent::Error(reason));
            self.events.emit(ConnectionEvent::Disconnected {
                graceful_leave: false,
            });
        }
    }

    fn lock(&self) -> MutexGuard<'_, Io> {
        self.io.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Connection for WebsocketConnection {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    fn connection_type(&self) -> ConnectionType {
        self.connection_type
    }

    fn state(&self) -> ConnectionState {
        self.state.get()
    }

    fn send(&self, data: Vec<u8>) {
        if self.state.get() != ConnectionState::Connected {
            trace!("{} dropping send in state {:?}", self.id, self.state.get());
            return;
        }
        if data.len() > MAX_FRAME_SIZE {
            warn!(
                "Refusing to send {} bytes on {} (max {})",
                data.len(),
                self.id,
                MAX_FRAME_SIZE
            );
            return;
        }
        if let Some(writer) = &self.lock().writer {
            let _ = writer.send(Message::Binary(data));
        }
    }

    fn close(&self, graceful: bool) {
        let Some(previous) = self.state.transition(ConnectionState::Closing) else {
            return;
        };
        let dialing = {
            let mut io = self.lock();
            if let Some(writer) = io.writer.take() {
                // The writer task exits after flushing the close frame.
                let _ = writer.send(Message::Close(None));
            }
            if previous == ConnectionState::Connecting {
                std::mem::take(&mut io.tasks)
            } else {
                Vec::new()
            }
        };
        for task in dialing {
            task.abort();
        }
        self.state.transition(ConnectionState::Closed);
        debug!("Closed {} (graceful: {})", self.id, graceful);
        self.events.emit(ConnectionEvent::Disconnected {
            graceful_leave: graceful,
        });
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ConnectionEvent>> {
        self.events.take()
    }
}

impl Drop for WebsocketConnection {
    fn drop(&mut self) {
        let io = self.io.get_mut().unwrap_or_else(|e| e.into_inner());
        io.writer = None;
        for task in io.tasks.drain(..) {
            task.abort();
        }
    }
}
