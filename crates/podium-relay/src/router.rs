//! Room and identity routing.
//!
//! The relay keeps two tables: room membership for envelope fan-out, and the
//! rendezvous directory mapping claimed identities to dial-back addresses.
//! Payloads are relayed untouched; the server never interprets session
//! messages.

use crate::connection::{ClientConnection, ClientEvent, ClientId};
use anyhow::Result;
use podium_core::protocol::{ClientBound, ServerBound};
use podium_core::RoomCode;
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tracing::{debug, error, info, warn};

/// A claimed identity and where to dial it.
struct IdentityRecord {
    holder: ClientId,
    addr: String,
}

/// The shared relay/rendezvous server.
///
/// One instance serves both transport strategies: relay rooms and the mesh
/// rendezvous directory live side by side on the same endpoint.
pub struct RelayServer {
    /// Live connections by id.
    clients: HashMap<ClientId, ClientConnection>,
    /// Room membership in arrival order.
    rooms: HashMap<RoomCode, Vec<ClientId>>,
    /// Rendezvous directory.
    identities: HashMap<String, IdentityRecord>,
    next_client_id: u64,
    event_tx: mpsc::UnboundedSender<ClientEvent>,
    event_rx: mpsc::UnboundedReceiver<ClientEvent>,
}

impl Default for RelayServer {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayServer {
    pub fn new() -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Self {
            clients: HashMap::new(),
            rooms: HashMap::new(),
            identities: HashMap::new(),
            next_client_id: 1,
            event_tx,
            event_rx,
        }
    }

    /// Bind to an address and return the TCP listener.
    pub async fn bind(listen_addr: &str) -> Result<TcpListener> {
        let listener = TcpListener::bind(listen_addr).await?;
        info!("Relay listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Accept connections and route frames until `shutdown` resolves, then
    /// close the remaining clients gracefully.
    pub async fn serve(mut self, listener: TcpListener, shutdown: impl Future<Output = ()>) {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => self.accept_connection(stream, addr).await,
                        Err(e) => error!("Failed to accept connection: {}", e),
                    }
                }
                event = self.event_rx.recv() => {
                    match event {
                        Some(event) => self.handle_event(event).await,
                        None => break,
                    }
                }
                _ = &mut shutdown => break,
            }
        }
        self.close_all().await;
    }

    /// Send close frames to every live connection and clear the tables.
    async fn close_all(&mut self) {
        info!("Closing {} client connection(s)", self.clients.len());
        for (_, mut conn) in self.clients.drain() {
            conn.close().await;
        }
        self.rooms.clear();
        self.identities.clear();
    }

    /// Upgrade an incoming TCP connection and start reading frames from it.
    async fn accept_connection(&mut self, stream: TcpStream, addr: SocketAddr) {
        let ws_stream = match accept_async(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                // Port probes connect and drop without finishing the upgrade
                debug!("WebSocket upgrade failed for {}: {}", addr, e);
                return;
            }
        };

        let id = ClientId(self.next_client_id);
        self.next_client_id += 1;
        info!("New connection from {} ({})", addr, id);

        let conn = ClientConnection::new(id, ws_stream, self.event_tx.clone());
        self.clients.insert(id, conn);
    }

    async fn handle_event(&mut self, event: ClientEvent) {
        match event {
            ClientEvent::Frame { client, frame } => self.handle_frame(client, frame).await,
            ClientEvent::Closed { client } => self.handle_closed(client).await,
        }
    }

    async fn handle_frame(&mut self, client: ClientId, frame: ServerBound) {
        match frame {
            ServerBound::JoinRoom { room_code } => {
                let members = self.rooms.entry(room_code).or_default();
                if members.contains(&client) {
                    debug!("{} re-joined room {}", client, room_code);
                    return;
                }
                members.push(client);
                info!("{} joined room {}", client, room_code);

                let others: Vec<ClientId> = members
                    .iter()
                    .copied()
                    .filter(|id| *id != client)
                    .collect();
                self.send_to_all(&others, &ClientBound::PeerJoined { room_code })
                    .await;
            }
            ServerBound::Envelope { room_code, message } => {
                let Some(members) = self.rooms.get(&room_code) else {
                    debug!("Envelope for unknown room {} from {}", room_code, client);
                    return;
                };
                if !members.contains(&client) {
                    debug!("Envelope from non-member {} for room {}", client, room_code);
                    return;
                }
                let others: Vec<ClientId> = members
                    .iter()
                    .copied()
                    .filter(|id| *id != client)
                    .collect();
                debug!(
                    "Relaying envelope in room {} from {} to {} member(s)",
                    room_code,
                    client,
                    others.len()
                );
                self.send_to_all(&others, &ClientBound::Envelope { room_code, message })
                    .await;
            }
            ServerBound::Claim { identity, addr } => {
                // A claim whose holder has since disconnected is granted
                if let Some(record) = self.identities.get(&identity) {
                    if record.holder != client && self.clients.contains_key(&record.holder) {
                        info!("Claim conflict on {} from {}", identity, client);
                        self.send_to(client, &ClientBound::IdentityTaken { identity })
                            .await;
                        return;
                    }
                }
                info!("{} claimed {} at {}", client, identity, addr);
                self.identities.insert(
                    identity.clone(),
                    IdentityRecord {
                        holder: client,
                        addr,
                    },
                );
                self.send_to(client, &ClientBound::Claimed { identity }).await;
            }
            ServerBound::Resolve { identity } => {
                let reply = match self.identities.get(&identity) {
                    Some(record) if self.clients.contains_key(&record.holder) => {
                        ClientBound::Resolved {
                            identity,
                            addr: record.addr.clone(),
                        }
                    }
                    Some(_) => {
                        // Stale entry; drop it so later claims are clean
                        self.identities.remove(&identity);
                        ClientBound::UnknownIdentity { identity }
                    }
                    None => ClientBound::UnknownIdentity { identity },
                };
                self.send_to(client, &reply).await;
            }
            ServerBound::Ping => {
                self.send_to(client, &ClientBound::Pong).await;
            }
        }
    }

    async fn handle_closed(&mut self, client: ClientId) {
        info!("Connection closed: {}", client);
        self.clients.remove(&client);

        self.identities
            .retain(|_, record| record.holder != client);

        // Collect first; notifying members needs &self
        let mut departures: Vec<(RoomCode, Vec<ClientId>)> = Vec::new();
        for (room_code, members) in self.rooms.iter_mut() {
            if let Some(pos) = members.iter().position(|id| *id == client) {
                members.remove(pos);
                departures.push((*room_code, members.clone()));
            }
        }
        self.rooms.retain(|_, members| !members.is_empty());

        for (room_code, remaining) in departures {
            self.send_to_all(&remaining, &ClientBound::PeerLeft { room_code })
                .await;
        }
    }

    async fn send_to(&self, client: ClientId, frame: &ClientBound) {
        if let Some(conn) = self.clients.get(&client) {
            if let Err(e) = conn.send(frame).await {
                warn!("Failed to send to {}: {}", client, e);
            }
        }
    }

    async fn send_to_all(&self, clients: &[ClientId], frame: &ClientBound) {
        for client in clients {
            self.send_to(*client, frame).await;
        }
    }
}
