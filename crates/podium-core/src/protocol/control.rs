//! Relay/rendezvous server control frames.
//!
//! One WebSocket endpoint serves both transport strategies: room membership
//! and envelope fan-out for the relay transport, identity claim/resolve for
//! mesh rendezvous, and a ping for signaling-link probes. Envelope payloads
//! stay opaque `serde_json::Value`s here; the server relays without
//! inspecting them.

use crate::room::RoomCode;
use serde::{Deserialize, Serialize};

/// Prefix for globally addressable identities in the rendezvous directory.
pub const IDENTITY_PREFIX: &str = "podium-";

/// The identity a host claims for its room.
pub fn host_identity(room: RoomCode) -> String {
    format!("{}{}", IDENTITY_PREFIX, room)
}

/// Frames sent client -> server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerBound {
    /// Enter a relay room; subsequent envelopes for that room are delivered
    /// to this connection.
    #[serde(rename_all = "camelCase")]
    JoinRoom { room_code: RoomCode },
    /// Relay a session message to all other members of the room.
    #[serde(rename_all = "camelCase")]
    Envelope {
        room_code: RoomCode,
        message: serde_json::Value,
    },
    /// Claim a globally addressable identity, publishing a dial-back
    /// address for direct connections.
    Claim { identity: String, addr: String },
    /// Look up the address behind an identity.
    Resolve { identity: String },
    /// Signaling-link liveness probe.
    Ping,
}

/// Frames sent server -> client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientBound {
    /// A relayed session message from another room member.
    #[serde(rename_all = "camelCase")]
    Envelope {
        room_code: RoomCode,
        message: serde_json::Value,
    },
    /// Another member joined the room.
    #[serde(rename_all = "camelCase")]
    PeerJoined { room_code: RoomCode },
    /// A member left the room (disconnected).
    #[serde(rename_all = "camelCase")]
    PeerLeft { room_code: RoomCode },
    /// The claim succeeded; the identity now routes here.
    Claimed { identity: String },
    /// The identity is held by another live connection.
    IdentityTaken { identity: String },
    /// Resolution result for a `Resolve` request.
    Resolved { identity: String, addr: String },
    /// No live connection holds the requested identity.
    UnknownIdentity { identity: String },
    /// Probe answer.
    Pong,
}

impl ServerBound {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("ServerBound serialization should not fail")
    }

    /// Tolerant decode; unknown or malformed frames yield `None`.
    pub fn from_json(text: &str) -> Option<Self> {
        serde_json::from_str(text).ok()
    }
}

impl ClientBound {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("ClientBound serialization should not fail")
    }

    pub fn from_json(text: &str) -> Option<Self> {
        serde_json::from_str(text).ok()
    }
}
