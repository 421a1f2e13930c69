//! Session synchronization messages.
//!
//! JSON text frames tagged by a `type` field. Decoding is tolerant: anything
//! malformed or unrecognized yields `None` and the caller drops the frame.

use crate::state::SessionState;
use serde::{Deserialize, Serialize};

/// Maximum frame size (1 MiB) to prevent memory exhaustion from misbehaving
/// peers. Snapshots for a classroom-sized session sit far below this.
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// A message of the host/follower synchronization protocol.
///
/// Wire format examples:
/// `{"type":"joinRequest","name":"Alex"}`
/// `{"type":"syncState","state":{...}}`
/// `{"type":"submitAnswer","name":"Alex","text":"my answer"}`
/// `{"type":"resetForm"}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SessionMessage {
    /// Follower announces itself after opening a connection. The host does
    /// not admit or reject; the name is informational until the follower
    /// submits.
    JoinRequest { name: String },
    /// Full-document snapshot. Followers overwrite their replica
    /// unconditionally.
    SyncState { state: SessionState },
    /// Follower submits an answer; lands in `record_response` on the host.
    SubmitAnswer { name: String, text: String },
    /// Host tells followers to discard any unsent draft. Sent redundantly;
    /// receivers must treat duplicates as idempotent.
    ResetForm,
}

impl SessionMessage {
    /// Serialize to a JSON string for sending as a text WebSocket frame.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("SessionMessage serialization should not fail")
    }

    /// Try to parse from a text frame. Returns `None` for anything that is
    /// not a well-formed session message.
    pub fn from_json(text: &str) -> Option<Self> {
        if text.len() > MAX_MESSAGE_SIZE {
            return None;
        }
        serde_json::from_str(text).ok()
    }

    /// Serialize to a JSON value for embedding in a relay envelope.
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).expect("SessionMessage serialization should not fail")
    }

    /// Try to parse from an envelope payload.
    pub fn from_value(value: serde_json::Value) -> Option<Self> {
        serde_json::from_value(value).ok()
    }
}
