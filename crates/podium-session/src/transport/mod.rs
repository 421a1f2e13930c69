//! Transport abstraction for session traffic.
//!
//! Implementations:
//! - Mesh: direct WebSocket data links between participants, brokered by a
//!   rendezvous identity directory
//! - Relay: a shared server fans envelopes out to room members
//!
//! The strategy is chosen once at configuration time. Both carry the same
//! opaque session messages; neither interprets them.

use async_trait::async_trait;
use podium_core::{RoomCode, SessionMessage};
use std::fmt::{self, Display, Formatter};
use std::time::Duration;
use thiserror::Error;

pub mod link;
pub mod mesh;
pub mod relay;

pub use link::{LinkEvent, WsLink};
pub use mesh::MeshTransport;
pub use relay::RelayTransport;

#[derive(Debug, Error)]
pub enum TransportError {
    /// The room cannot be reached (unknown identity, no host). User-facing.
    #[error("Room {0} not found")]
    RoomNotFound(RoomCode),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Signaling error: {0}")]
    Signaling(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Not connected")]
    NotConnected,
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Which end of the session this participant is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Host,
    Follower,
}

/// Identifier for one live data link.
///
/// Mesh links map one-to-one onto sockets. The relay cannot attribute
/// individual members, so relay links are synthetic: inbound traffic arrives
/// on [`LinkId::SHARED`] and membership events allocate placeholder ids that
/// exist for diagnostics only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(pub u64);

impl LinkId {
    /// The shared room link used where senders cannot be told apart.
    pub const SHARED: LinkId = LinkId(0);
}

impl Display for LinkId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "link-{}", self.0)
    }
}

/// Connectivity and message events surfaced to the session service.
#[derive(Debug)]
pub enum TransportEvent {
    /// A data link opened. Host side: a follower arrived. Follower side:
    /// the upstream link to the host is up.
    LinkOpened { link: LinkId },
    /// A data link closed. The registry entry is already pruned.
    LinkClosed { link: LinkId },
    /// A session message arrived.
    Message { link: LinkId, message: SessionMessage },
    /// The signaling link dropped. Existing data links may still be alive;
    /// the reconnection supervisor takes over.
    SignalingLost,
    /// Unrecoverable fault. Surfaced as status `error`; recovery is an
    /// explicit re-host/re-join by the user.
    Fault { detail: String },
}

/// A transport driver carrying session messages for one participant.
#[async_trait]
pub trait Transport: Send {
    /// Establish the transport for the given role and room. Host: announce
    /// the room and start accepting. Follower: locate the host and open the
    /// upstream link. Errors surface to the caller; `RoomNotFound` is the
    /// user-facing join failure.
    async fn open(&mut self, role: Role, room: RoomCode) -> Result<()>;

    /// Send to one link. Relay deployments cannot address individuals and
    /// fall back to a room broadcast.
    async fn send_to(&mut self, link: LinkId, message: &SessionMessage) -> Result<()>;

    /// Send to every live link.
    async fn broadcast(&mut self, message: &SessionMessage) -> Result<()>;

    /// Wait for the next connectivity or message event. `None` means the
    /// transport was closed for good.
    async fn next_event(&mut self) -> Option<TransportEvent>;

    /// Whether the signaling layer can drop silently and needs periodic
    /// probing. True for mesh; the relay's own lifecycle events suffice.
    fn needs_probe(&self) -> bool;

    /// Check signaling-link health. Returns false when the link should be
    /// considered lost.
    async fn probe(&mut self) -> bool;

    /// Re-establish the signaling link. Idempotent: a healthy link makes
    /// this a no-op.
    async fn reconnect(&mut self) -> Result<()>;

    /// Tear down all links and the signaling connection.
    async fn close(&mut self);

    /// Number of live data links, for diagnostics.
    fn link_count(&self) -> usize;
}
