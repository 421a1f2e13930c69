//! Relay transport: all traffic through the shared relay server.
//!
//! Both roles hold a single WebSocket to the relay, join their room with a
//! control event, and exchange room-coded envelopes the server fans out to
//! the other members. The relay cannot address individual members, so
//! `send_to` degrades to a room broadcast; only the host processes follower
//! messages, which makes that harmless.
//!
//! Membership is visible only through `peerJoined`/`peerLeft` events with no
//! member identity attached, so host-side links are synthetic registry
//! entries kept for diagnostics, and all inbound traffic arrives on
//! [`LinkId::SHARED`].

use crate::registry::ConnectionRegistry;
use crate::transport::link::{dial, WsStream};
use crate::transport::{LinkId, Result, Role, Transport, TransportError, TransportEvent};
use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use podium_core::protocol::{ClientBound, ServerBound, MAX_MESSAGE_SIZE};
use podium_core::{RoomCode, SessionMessage};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, error, info, warn};

/// Event emitted by the relay socket's read task.
#[derive(Debug)]
enum RelayEvent {
    Frame(ClientBound),
    Closed,
}

/// Transport driver speaking the relay envelope contract.
pub struct RelayTransport {
    server_url: String,
    role: Option<Role>,
    room: Option<RoomCode>,
    write: Option<Arc<Mutex<SplitSink<WsStream, Message>>>>,
    read_task: Option<JoinHandle<()>>,
    event_tx: mpsc::UnboundedSender<RelayEvent>,
    event_rx: mpsc::UnboundedReceiver<RelayEvent>,
    /// Synthetic member links (host side, diagnostics only).
    members: ConnectionRegistry<()>,
    next_member_id: u64,
    pending: VecDeque<TransportEvent>,
}

impl RelayTransport {
    pub fn new(server_url: &str) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Self {
            server_url: server_url.to_string(),
            role: None,
            room: None,
            write: None,
            read_task: None,
            event_tx,
            event_rx,
            members: ConnectionRegistry::new(),
            next_member_id: 1,
            pending: VecDeque::new(),
        }
    }

    fn is_host(&self) -> bool {
        self.role == Some(Role::Host)
    }

    fn socket_alive(&self) -> bool {
        self.write.is_some() && self.read_task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Dial the relay and join the room.
    async fn connect_socket(&mut self, room: RoomCode) -> Result<()> {
        self.teardown_socket().await;

        let ws = dial(&self.server_url).await?;
        let (write, read) = ws.split();
        self.write = Some(Arc::new(Mutex::new(write)));

        let event_tx = self.event_tx.clone();
        self.read_task = Some(tokio::spawn(async move {
            Self::read_loop(read, event_tx).await;
        }));

        self.send_frame(&ServerBound::JoinRoom { room_code: room })
            .await?;
        info!("Joined relay room {} at {}", room, self.server_url);
        Ok(())
    }

    async fn read_loop(mut read: SplitStream<WsStream>, event_tx: mpsc::UnboundedSender<RelayEvent>) {
        loop {
            match read.next().await {
                Some(Ok(msg)) => {
                    let text = match msg {
                        Message::Text(text) => text.to_string(),
                        Message::Binary(data) => match String::from_utf8(data.to_vec()) {
                            Ok(text) => text,
                            Err(_) => {
                                debug!("Dropping non-UTF-8 relay frame");
                                continue;
                            }
                        },
                        Message::Ping(_) | Message::Pong(_) => continue,
                        Message::Close(_) => {
                            debug!("Relay sent close frame");
                            break;
                        }
                        Message::Frame(_) => continue,
                    };

                    if text.len() > MAX_MESSAGE_SIZE {
                        warn!(
                            "Relay frame exceeds max size ({} > {}), dropping",
                            text.len(),
                            MAX_MESSAGE_SIZE
                        );
                        continue;
                    }

                    // Malformed frames are dropped, never fatal
                    match ClientBound::from_json(&text) {
                        Some(frame) => {
                            if event_tx.send(RelayEvent::Frame(frame)).is_err() {
                                return;
                            }
                        }
                        None => debug!("Dropping unrecognized relay frame"),
                    }
                }
                Some(Err(e)) => {
                    match e {
                        WsError::ConnectionClosed | WsError::AlreadyClosed => {
                            debug!("Relay connection closed");
                        }
                        _ => error!("WebSocket error on relay connection: {}", e),
                    }
                    break;
                }
                None => {
                    debug!("Relay stream ended");
                    break;
                }
            }
        }

        let _ = event_tx.send(RelayEvent::Closed);
    }

    async fn send_frame(&self, frame: &ServerBound) -> Result<()> {
        let Some(write) = &self.write else {
            return Err(TransportError::NotConnected);
        };
        let mut write = write.lock().await;
        write
            .send(Message::Text(frame.to_json().into()))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn send_envelope(&self, message: &SessionMessage) -> Result<()> {
        let room = self.room.ok_or(TransportError::NotConnected)?;
        self.send_frame(&ServerBound::Envelope {
            room_code: room,
            message: message.to_value(),
        })
        .await
    }

    async fn teardown_socket(&mut self) {
        if let Some(write) = self.write.take() {
            if let Ok(mut write) = write.try_lock() {
                let _ = write.send(Message::Close(None)).await;
            }
        }
        if let Some(task) = self.read_task.take() {
            task.abort();
        }
    }
}

#[async_trait]
impl Transport for RelayTransport {
    async fn open(&mut self, role: Role, room: RoomCode) -> Result<()> {
        self.role = Some(role);
        self.room = Some(room);
        self.connect_socket(room).await?;

        // The relay does not notify a member of its own join, so the
        // follower's upstream-open event is synthesized here.
        if role == Role::Follower {
            self.pending
                .push_back(TransportEvent::LinkOpened { link: LinkId::SHARED });
        }
        Ok(())
    }

    async fn send_to(&mut self, _link: LinkId, message: &SessionMessage) -> Result<()> {
        // The relay cannot address individuals; fan out to the room
        self.send_envelope(message).await
    }

    async fn broadcast(&mut self, message: &SessionMessage) -> Result<()> {
        self.send_envelope(message).await
    }

    async fn next_event(&mut self) -> Option<TransportEvent> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(event);
            }

            match self.event_rx.recv().await? {
                RelayEvent::Frame(ClientBound::Envelope { room_code, message }) => {
                    if Some(room_code) != self.room {
                        debug!("Dropping envelope for foreign room {}", room_code);
                        continue;
                    }
                    match SessionMessage::from_value(message) {
                        Some(message) => {
                            return Some(TransportEvent::Message {
                                link: LinkId::SHARED,
                                message,
                            })
                        }
                        None => {
                            debug!("Dropping undecodable envelope payload");
                            continue;
                        }
                    }
                }
                RelayEvent::Frame(ClientBound::PeerJoined { .. }) => {
                    // Only the host tracks membership; a follower seeing
                    // other followers join is noise.
                    if !self.is_host() {
                        continue;
                    }
                    let link = LinkId(self.next_member_id);
                    self.next_member_id += 1;
                    self.members.insert(link, ());
                    return Some(TransportEvent::LinkOpened { link });
                }
                RelayEvent::Frame(ClientBound::PeerLeft { .. }) => {
                    if !self.is_host() {
                        continue;
                    }
                    // Departures carry no member identity; retire the
                    // oldest synthetic entry.
                    match self.members.remove_oldest() {
                        Some((link, ())) => return Some(TransportEvent::LinkClosed { link }),
                        None => continue,
                    }
                }
                RelayEvent::Frame(ClientBound::Pong) => continue,
                RelayEvent::Frame(frame) => {
                    debug!("Dropping unexpected relay frame: {:?}", frame);
                    continue;
                }
                RelayEvent::Closed => {
                    if self.write.is_none() {
                        // Teardown we initiated ourselves
                        continue;
                    }
                    self.write = None;
                    return Some(TransportEvent::SignalingLost);
                }
            }
        }
    }

    fn needs_probe(&self) -> bool {
        // The relay's own lifecycle events suffice
        false
    }

    async fn probe(&mut self) -> bool {
        self.socket_alive()
    }

    async fn reconnect(&mut self) -> Result<()> {
        if self.socket_alive() {
            return Ok(());
        }
        let room = self.room.ok_or(TransportError::NotConnected)?;
        self.connect_socket(room).await?;
        if self.role == Some(Role::Follower) {
            self.pending
                .push_back(TransportEvent::LinkOpened { link: LinkId::SHARED });
        }
        Ok(())
    }

    async fn close(&mut self) {
        self.teardown_socket().await;
        self.members.drain();
        self.pending.clear();
        self.role = None;
        self.room = None;
    }

    fn link_count(&self) -> usize {
        if self.is_host() {
            self.members.len()
        } else {
            usize::from(self.socket_alive())
        }
    }
}
