//! Mesh transport: direct data links brokered by the rendezvous directory.
//!
//! The host claims the identity `podium-<roomCode>` at the rendezvous
//! server, publishing a dial-back address, and accepts direct WebSocket
//! links from followers. A follower claims an ephemeral identity, resolves
//! the host's, and dials it. Session traffic then flows over the direct
//! links; the rendezvous connection stays open only as the signaling link.
//!
//! The signaling layer can drop silently without closing data links, so
//! this driver asks for periodic probing ([`Transport::needs_probe`]).

use crate::registry::{ConnectionRegistry, Upstream};
use crate::transport::link::{accept, dial, LinkEvent, WsLink, WsStream};
use crate::transport::{LinkId, Result, Role, Transport, TransportError, TransportEvent};
use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use podium_core::protocol::{host_identity, ClientBound, ServerBound, MAX_MESSAGE_SIZE};
use podium_core::{RoomCode, SessionMessage};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, error, info, warn};

/// How long to wait for a rendezvous reply before giving up.
const SIGNAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Control-plane event: accepted sockets and rendezvous frames.
#[derive(Debug)]
enum CtlEvent {
    Accepted(WsStream),
    Signal(ClientBound),
    SignalingClosed,
}

/// Transport driver building direct links through rendezvous discovery.
pub struct MeshTransport {
    server_url: String,
    listen_addr: String,
    role: Option<Role>,
    room: Option<RoomCode>,
    /// Our claimed rendezvous identity.
    identity: Option<String>,
    /// The dial-back address published with the host's claim.
    advertised: Option<String>,
    signaling_write: Option<Arc<Mutex<SplitSink<WsStream, Message>>>>,
    signaling_task: Option<JoinHandle<()>>,
    accept_task: Option<JoinHandle<()>>,
    /// Live follower links (host side).
    links: ConnectionRegistry<WsLink>,
    /// The single link to the host (follower side).
    upstream: Upstream<WsLink>,
    next_link_id: u64,
    link_tx: mpsc::UnboundedSender<LinkEvent>,
    link_rx: mpsc::UnboundedReceiver<LinkEvent>,
    ctl_tx: mpsc::UnboundedSender<CtlEvent>,
    ctl_rx: mpsc::UnboundedReceiver<CtlEvent>,
    /// Sockets accepted while a rendezvous reply was being awaited.
    stashed_accepts: VecDeque<WsStream>,
    pending: VecDeque<TransportEvent>,
}

impl MeshTransport {
    pub fn new(server_url: &str, listen_addr: &str) -> Self {
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let (ctl_tx, ctl_rx) = mpsc::unbounded_channel();
        Self {
            server_url: server_url.to_string(),
            listen_addr: listen_addr.to_string(),
            role: None,
            room: None,
            identity: None,
            advertised: None,
            signaling_write: None,
            signaling_task: None,
            accept_task: None,
            links: ConnectionRegistry::new(),
            upstream: Upstream::new(),
            next_link_id: 1,
            link_tx,
            link_rx,
            ctl_tx,
            ctl_rx,
            stashed_accepts: VecDeque::new(),
            pending: VecDeque::new(),
        }
    }

    fn is_host(&self) -> bool {
        self.role == Some(Role::Host)
    }

    fn signaling_alive(&self) -> bool {
        self.signaling_write.is_some()
            && self.signaling_task.as_ref().is_some_and(|t| !t.is_finished())
    }

    fn alloc_link_id(&mut self) -> LinkId {
        let id = LinkId(self.next_link_id);
        self.next_link_id += 1;
        id
    }

    /// Dial the rendezvous server and start its read task.
    async fn connect_signaling(&mut self) -> Result<()> {
        self.teardown_signaling().await;

        // Frames queued by the previous socket would confuse the upcoming
        // claim handshake; accepted sockets are kept
        while let Ok(event) = self.ctl_rx.try_recv() {
            match event {
                CtlEvent::Accepted(ws) => self.stashed_accepts.push_back(ws),
                CtlEvent::Signal(_) | CtlEvent::SignalingClosed => {}
            }
        }

        let ws = dial(&self.server_url).await?;
        let (write, read) = ws.split();
        self.signaling_write = Some(Arc::new(Mutex::new(write)));

        let ctl_tx = self.ctl_tx.clone();
        self.signaling_task = Some(tokio::spawn(async move {
            Self::signaling_loop(read, ctl_tx).await;
        }));
        debug!("Signaling link to {} established", self.server_url);
        Ok(())
    }

    async fn signaling_loop(
        mut read: SplitStream<WsStream>,
        ctl_tx: mpsc::UnboundedSender<CtlEvent>,
    ) {
        loop {
            match read.next().await {
                Some(Ok(msg)) => {
                    let text = match msg {
                        Message::Text(text) => text.to_string(),
                        Message::Binary(data) => match String::from_utf8(data.to_vec()) {
                            Ok(text) => text,
                            Err(_) => {
                                debug!("Dropping non-UTF-8 signaling frame");
                                continue;
                            }
                        },
                        Message::Ping(_) | Message::Pong(_) => continue,
                        Message::Close(_) => {
                            debug!("Rendezvous sent close frame");
                            break;
                        }
                        Message::Frame(_) => continue,
                    };

                    if text.len() > MAX_MESSAGE_SIZE {
                        warn!(
                            "Signaling frame exceeds max size ({} > {}), dropping",
                            text.len(),
                            MAX_MESSAGE_SIZE
                        );
                        continue;
                    }

                    match ClientBound::from_json(&text) {
                        Some(frame) => {
                            if ctl_tx.send(CtlEvent::Signal(frame)).is_err() {
                                return;
                            }
                        }
                        None => debug!("Dropping unrecognized signaling frame"),
                    }
                }
                Some(Err(e)) => {
                    match e {
                        WsError::ConnectionClosed | WsError::AlreadyClosed => {
                            debug!("Signaling link closed");
                        }
                        _ => error!("WebSocket error on signaling link: {}", e),
                    }
                    break;
                }
                None => {
                    debug!("Signaling stream ended");
                    break;
                }
            }
        }

        let _ = ctl_tx.send(CtlEvent::SignalingClosed);
    }

    async fn send_signal(&self, frame: &ServerBound) -> Result<()> {
        let Some(write) = &self.signaling_write else {
            return Err(TransportError::NotConnected);
        };
        let mut write = write.lock().await;
        write
            .send(Message::Text(frame.to_json().into()))
            .await
            .map_err(|e| TransportError::Signaling(e.to_string()))
    }

    /// Wait for the next rendezvous frame. Data sockets accepted in the
    /// meantime are stashed and surfaced through `next_event` later.
    async fn await_signal(&mut self) -> Result<ClientBound> {
        loop {
            let event = timeout(SIGNAL_TIMEOUT, self.ctl_rx.recv())
                .await
                .map_err(|_| TransportError::Timeout(SIGNAL_TIMEOUT))?;
            match event {
                Some(CtlEvent::Signal(frame)) => return Ok(frame),
                Some(CtlEvent::Accepted(ws)) => {
                    self.stashed_accepts.push_back(ws);
                    continue;
                }
                Some(CtlEvent::SignalingClosed) | None => {
                    return Err(TransportError::Signaling(
                        "signaling link closed during rendezvous".to_string(),
                    ))
                }
            }
        }
    }

    /// Claim our identity at the rendezvous directory.
    ///
    /// Returns whether the claim was granted; a conflict is left to the
    /// caller, since the host treats it as "already hosting."
    async fn claim(&mut self, identity: &str, addr: &str) -> Result<bool> {
        self.send_signal(&ServerBound::Claim {
            identity: identity.to_string(),
            addr: addr.to_string(),
        })
        .await?;
        loop {
            match self.await_signal().await? {
                ClientBound::Claimed { identity: granted } if granted == identity => {
                    return Ok(true)
                }
                ClientBound::IdentityTaken { identity: taken } if taken == identity => {
                    return Ok(false)
                }
                other => {
                    debug!("Skipping signaling frame while claiming: {:?}", other);
                    continue;
                }
            }
        }
    }

    /// Resolve the host identity and dial the direct link.
    async fn dial_host(&mut self, room: RoomCode) -> Result<()> {
        let identity = host_identity(room);
        self.send_signal(&ServerBound::Resolve {
            identity: identity.clone(),
        })
        .await?;

        let addr = loop {
            match self.await_signal().await? {
                ClientBound::Resolved {
                    identity: resolved,
                    addr,
                } if resolved == identity => break addr,
                ClientBound::UnknownIdentity { identity: unknown } if unknown == identity => {
                    return Err(TransportError::RoomNotFound(room))
                }
                other => {
                    debug!("Skipping signaling frame while resolving: {:?}", other);
                    continue;
                }
            }
        };

        // An advertised host that cannot be reached reads the same as an
        // absent one to the person typing the code
        let ws = dial(&addr)
            .await
            .map_err(|_| TransportError::RoomNotFound(room))?;

        let id = self.alloc_link_id();
        let link = WsLink::new(id, ws, self.link_tx.clone());
        if let Some(mut old) = self.upstream.replace(id, link) {
            old.close().await;
        }
        info!("Direct link to host {} established ({})", addr, id);
        self.pending
            .push_back(TransportEvent::LinkOpened { link: id });
        Ok(())
    }

    /// Register an accepted follower socket as a live link.
    fn open_accepted(&mut self, ws: WsStream) -> TransportEvent {
        let id = self.alloc_link_id();
        let link = WsLink::new(id, ws, self.link_tx.clone());
        self.links.insert(id, link);
        info!("Accepted follower link {}", id);
        TransportEvent::LinkOpened { link: id }
    }

    async fn teardown_signaling(&mut self) {
        if let Some(write) = self.signaling_write.take() {
            if let Ok(mut write) = write.try_lock() {
                let _ = write.send(Message::Close(None)).await;
            }
        }
        if let Some(task) = self.signaling_task.take() {
            task.abort();
        }
    }
}

#[async_trait]
impl Transport for MeshTransport {
    async fn open(&mut self, role: Role, room: RoomCode) -> Result<()> {
        self.role = Some(role);
        self.room = Some(room);

        match role {
            Role::Host => {
                let listener = TcpListener::bind(&self.listen_addr)
                    .await
                    .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
                let local = listener
                    .local_addr()
                    .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
                let advertised = format!("ws://{}", local);
                info!("Accepting direct links on {}", advertised);

                let ctl_tx = self.ctl_tx.clone();
                self.accept_task = Some(tokio::spawn(async move {
                    loop {
                        match listener.accept().await {
                            Ok((stream, addr)) => match accept(stream).await {
                                Ok(ws) => {
                                    if ctl_tx.send(CtlEvent::Accepted(ws)).is_err() {
                                        return;
                                    }
                                }
                                Err(e) => {
                                    // Port probes drop before finishing the upgrade
                                    debug!("WebSocket upgrade failed for {}: {}", addr, e);
                                }
                            },
                            Err(e) => error!("Failed to accept connection: {}", e),
                        }
                    }
                }));

                self.connect_signaling().await?;
                let identity = host_identity(room);
                if !self.claim(&identity, &advertised).await? {
                    // Another claim holds the room identity; treat as
                    // already hosting rather than failing the start
                    warn!("Identity {} already claimed; treating as already hosting", identity);
                }
                self.identity = Some(identity);
                self.advertised = Some(advertised);
            }
            Role::Follower => {
                self.connect_signaling().await?;
                let identity = format!("follower-{}", uuid::Uuid::new_v4());
                if !self.claim(&identity, "").await? {
                    return Err(TransportError::ConnectionFailed(format!(
                        "ephemeral identity {} already claimed",
                        identity
                    )));
                }
                self.identity = Some(identity);
                self.dial_host(room).await?;
            }
        }
        Ok(())
    }

    async fn send_to(&mut self, link: LinkId, message: &SessionMessage) -> Result<()> {
        if self.is_host() {
            match self.links.get(link) {
                Some(ws_link) => ws_link.send(message).await,
                None => Err(TransportError::SendFailed(format!("{} is gone", link))),
            }
        } else {
            match self.upstream.get() {
                Some(ws_link) => ws_link.send(message).await,
                None => Err(TransportError::NotConnected),
            }
        }
    }

    async fn broadcast(&mut self, message: &SessionMessage) -> Result<()> {
        if self.is_host() {
            for entry in self.links.iter() {
                if let Err(e) = entry.link.send(message).await {
                    warn!("Failed to broadcast to {}: {}", entry.id, e);
                }
            }
            Ok(())
        } else {
            match self.upstream.get() {
                Some(ws_link) => ws_link.send(message).await,
                None => Err(TransportError::NotConnected),
            }
        }
    }

    async fn next_event(&mut self) -> Option<TransportEvent> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(event);
            }
            if let Some(ws) = self.stashed_accepts.pop_front() {
                return Some(self.open_accepted(ws));
            }

            tokio::select! {
                event = self.link_rx.recv() => match event? {
                    LinkEvent::Message { link, message } => {
                        return Some(TransportEvent::Message { link, message })
                    }
                    LinkEvent::Closed { link } => {
                        if self.is_host() {
                            if self.links.remove(link).is_none() {
                                // Stale close from an already-pruned link
                                continue;
                            }
                        } else if self.upstream.clear(link).is_none() {
                            continue;
                        }
                        return Some(TransportEvent::LinkClosed { link });
                    }
                },
                event = self.ctl_rx.recv() => match event? {
                    CtlEvent::Accepted(ws) => return Some(self.open_accepted(ws)),
                    CtlEvent::Signal(ClientBound::Pong) => continue,
                    CtlEvent::Signal(frame) => {
                        debug!("Dropping unexpected signaling frame: {:?}", frame);
                        continue;
                    }
                    CtlEvent::SignalingClosed => {
                        if self.signaling_write.is_none() {
                            // Teardown we initiated ourselves
                            continue;
                        }
                        self.signaling_write = None;
                        return Some(TransportEvent::SignalingLost);
                    }
                },
            }
        }
    }

    fn needs_probe(&self) -> bool {
        // The signaling layer can drop silently while data links survive
        true
    }

    async fn probe(&mut self) -> bool {
        if !self.signaling_alive() {
            return false;
        }
        self.send_signal(&ServerBound::Ping).await.is_ok()
    }

    async fn reconnect(&mut self) -> Result<()> {
        let room = self.room.ok_or(TransportError::NotConnected)?;

        if !self.signaling_alive() {
            self.connect_signaling().await?;
            match self.role {
                Some(Role::Host) => {
                    let identity = host_identity(room);
                    let advertised = self
                        .advertised
                        .clone()
                        .ok_or(TransportError::NotConnected)?;
                    if !self.claim(&identity, &advertised).await? {
                        warn!("Identity {} already claimed on reconnect", identity);
                    }
                }
                Some(Role::Follower) => {
                    // Re-claiming our own identity succeeds via stale
                    // override once the server notices the old socket died
                    let identity = self
                        .identity
                        .clone()
                        .unwrap_or_else(|| format!("follower-{}", uuid::Uuid::new_v4()));
                    if !self.claim(&identity, "").await? {
                        // The server has not yet released the old holder;
                        // harmless, followers are never resolved
                        warn!("Identity {} still held on reconnect", identity);
                    }
                    self.identity = Some(identity);
                }
                None => return Err(TransportError::NotConnected),
            }
            info!("Signaling link re-established");
        }

        // A follower that lost its data link re-resolves the host too
        if self.role == Some(Role::Follower) && !self.upstream.is_connected() {
            self.dial_host(room).await?;
        }
        Ok(())
    }

    async fn close(&mut self) {
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
        self.teardown_signaling().await;
        for mut link in self.links.drain() {
            link.close().await;
        }
        if let Some(mut link) = self.upstream.take() {
            link.close().await;
        }
        self.stashed_accepts.clear();
        self.pending.clear();
        self.role = None;
        self.room = None;
        self.identity = None;
        self.advertised = None;
    }

    fn link_count(&self) -> usize {
        if self.is_host() {
            self.links.len()
        } else {
            usize::from(self.upstream.is_connected())
        }
    }
}
