//! Individual relay client connections.
//!
//! Each accepted client wraps a WebSocket stream split into a shared write
//! half and a spawned read task that decodes control frames into the
//! server's event channel.

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use podium_core::protocol::{ServerBound, MAX_MESSAGE_SIZE};
use std::fmt::{self, Display, Formatter};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    tungstenite::{Error as WsError, Message},
    WebSocketStream,
};
use tracing::{debug, error, warn};

#[derive(Debug, Error)]
pub enum SendError {
    #[error("Client {0} is gone")]
    Gone(ClientId),
    #[error("WebSocket send failed: {0}")]
    Ws(#[from] WsError),
}

/// Server-assigned connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(pub u64);

impl Display for ClientId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// Event emitted by a client connection.
#[derive(Debug)]
pub enum ClientEvent {
    /// A decoded control frame from the client.
    Frame { client: ClientId, frame: ServerBound },
    /// The connection closed.
    Closed { client: ClientId },
}

/// A single accepted WebSocket client.
pub struct ClientConnection {
    pub id: ClientId,
    write: Arc<Mutex<SplitSink<WebSocketStream<TcpStream>, Message>>>,
    read_task: Option<JoinHandle<()>>,
}

impl ClientConnection {
    /// Wrap an upgraded stream. Spawns a read task that forwards decoded
    /// frames to the event channel until the socket closes.
    pub fn new(
        id: ClientId,
        ws_stream: WebSocketStream<TcpStream>,
        event_tx: mpsc::UnboundedSender<ClientEvent>,
    ) -> Self {
        let (write, read) = ws_stream.split();
        let write = Arc::new(Mutex::new(write));

        let read_task = tokio::spawn(async move {
            Self::read_loop(id, read, event_tx).await;
        });

        Self {
            id,
            write,
            read_task: Some(read_task),
        }
    }

    async fn read_loop(
        id: ClientId,
        mut read: SplitStream<WebSocketStream<TcpStream>>,
        event_tx: mpsc::UnboundedSender<ClientEvent>,
    ) {
        loop {
            match read.next().await {
                Some(Ok(msg)) => {
                    let text = match msg {
                        Message::Text(text) => text.to_string(),
                        Message::Binary(data) => match String::from_utf8(data.to_vec()) {
                            Ok(text) => text,
                            Err(_) => {
                                debug!("Dropping non-UTF-8 frame from {}", id);
                                continue;
                            }
                        },
                        Message::Ping(_) | Message::Pong(_) => continue,
                        Message::Close(_) => {
                            debug!("Received close frame from {}", id);
                            break;
                        }
                        Message::Frame(_) => continue,
                    };

                    if text.len() > MAX_MESSAGE_SIZE {
                        warn!(
                            "Frame from {} exceeds max size ({} > {}), dropping",
                            id,
                            text.len(),
                            MAX_MESSAGE_SIZE
                        );
                        continue;
                    }

                    // Malformed frames are dropped, not fatal
                    match ServerBound::from_json(&text) {
                        Some(frame) => {
                            if event_tx.send(ClientEvent::Frame { client: id, frame }).is_err() {
                                return;
                            }
                        }
                        None => {
                            debug!("Dropping unrecognized frame from {}", id);
                        }
                    }
                }
                Some(Err(e)) => {
                    match e {
                        WsError::ConnectionClosed | WsError::AlreadyClosed => {
                            debug!("Connection {} closed", id);
                        }
                        _ => {
                            error!("WebSocket error on {}: {}", id, e);
                        }
                    }
                    break;
                }
                None => {
                    debug!("Connection {} stream ended", id);
                    break;
                }
            }
        }

        let _ = event_tx.send(ClientEvent::Closed { client: id });
    }

    /// Send a control frame to the client as a text WebSocket frame.
    pub async fn send(&self, frame: &podium_core::protocol::ClientBound) -> Result<(), SendError> {
        let mut write = self.write.lock().await;
        write.send(Message::Text(frame.to_json().into())).await?;
        Ok(())
    }

    /// Close the connection gracefully.
    pub async fn close(&mut self) {
        if let Ok(mut write) = self.write.try_lock() {
            let _ = write.send(Message::Close(None)).await;
        }
        if let Some(task) = self.read_task.take() {
            task.abort();
        }
    }
}

impl Drop for ClientConnection {
    fn drop(&mut self) {
        if let Some(task) = self.read_task.take() {
            task.abort();
        }
    }
}
