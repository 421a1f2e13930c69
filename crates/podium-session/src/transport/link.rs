//! A single mesh data link.
//!
//! Accepted and dialed sockets share one stream type so the host's incoming
//! links and the follower's upstream link behave identically: write half
//! behind a mutex, read half a spawned task decoding session messages into
//! the transport's event channel.

use crate::transport::{LinkId, Result, TransportError};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use podium_core::protocol::MAX_MESSAGE_SIZE;
use podium_core::SessionMessage;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    accept_async, connect_async,
    tungstenite::{Error as WsError, Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, warn};

/// One stream type for both directions.
pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Upgrade an accepted TCP connection to a WebSocket.
pub async fn accept(stream: TcpStream) -> std::result::Result<WsStream, WsError> {
    accept_async(MaybeTlsStream::Plain(stream)).await
}

/// Dial a WebSocket URL.
pub async fn dial(url: &str) -> Result<WsStream> {
    let (ws, _) = connect_async(url)
        .await
        .map_err(|e| TransportError::ConnectionFailed(format!("{}: {}", url, e)))?;
    Ok(ws)
}

/// Event emitted by a link's read task.
#[derive(Debug)]
pub enum LinkEvent {
    Message { link: LinkId, message: SessionMessage },
    Closed { link: LinkId },
}

/// An open data link carrying session messages.
pub struct WsLink {
    pub id: LinkId,
    write: Arc<Mutex<SplitSink<WsStream, Message>>>,
    read_task: Option<JoinHandle<()>>,
}

impl WsLink {
    /// Wrap a connected stream. Spawns the read task that forwards decoded
    /// messages until the socket closes.
    pub fn new(id: LinkId, ws_stream: WsStream, event_tx: mpsc::UnboundedSender<LinkEvent>) -> Self {
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
        id: LinkId,
        mut read: SplitStream<WsStream>,
        event_tx: mpsc::UnboundedSender<LinkEvent>,
    ) {
        loop {
            match read.next().await {
                Some(Ok(msg)) => {
                    let text = match msg {
                        Message::Text(text) => text.to_string(),
                        Message::Binary(data) => match String::from_utf8(data.to_vec()) {
                            Ok(text) => text,
                            Err(_) => {
                                debug!("Dropping non-UTF-8 frame on {}", id);
                                continue;
                            }
                        },
                        Message::Ping(_) | Message::Pong(_) => continue,
                        Message::Close(_) => {
                            debug!("Received close frame on {}", id);
                            break;
                        }
                        Message::Frame(_) => continue,
                    };

                    if text.len() > MAX_MESSAGE_SIZE {
                        warn!(
                            "Frame on {} exceeds max size ({} > {}), dropping",
                            id,
                            text.len(),
                            MAX_MESSAGE_SIZE
                        );
                        continue;
                    }

                    // Protocol faults are dropped, never fatal
                    match SessionMessage::from_json(&text) {
                        Some(message) => {
                            if event_tx.send(LinkEvent::Message { link: id, message }).is_err() {
                                return;
                            }
                        }
                        None => {
                            debug!("Dropping unrecognized frame on {}", id);
                        }
                    }
                }
                Some(Err(e)) => {
                    match e {
                        WsError::ConnectionClosed | WsError::AlreadyClosed => {
                            debug!("Link {} closed", id);
                        }
                        _ => {
                            error!("WebSocket error on {}: {}", id, e);
                        }
                    }
                    break;
                }
                None => {
                    debug!("Link {} stream ended", id);
                    break;
                }
            }
        }

        let _ = event_tx.send(LinkEvent::Closed { link: id });
    }

    /// Send a session message as a text frame.
    pub async fn send(&self, message: &SessionMessage) -> Result<()> {
        let mut write = self.write.lock().await;
        write
            .send(Message::Text(message.to_json().into()))
            .await
            .map_err(|e| TransportError::SendFailed(format!("{}: {}", self.id, e)))
    }

    /// Close the link gracefully.
    pub async fn close(&mut self) {
        if let Ok(mut write) = self.write.try_lock() {
            let _ = write.send(Message::Close(None)).await;
        }
        if let Some(task) = self.read_task.take() {
            task.abort();
        }
    }
}

impl Drop for WsLink {
    fn drop(&mut self) {
        if let Some(task) = self.read_task.take() {
            task.abort();
        }
    }
}
