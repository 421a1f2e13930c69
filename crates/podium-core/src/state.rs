//! SessionState: The authoritative shared document and its mutators.
//!
//! Exactly one participant (the host) mutates this; every other copy is a
//! replica overwritten wholesale by snapshots. Mutators therefore never
//! merge — they compute the next full document in place.

use crate::room::RoomCode;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};

/// Key for a submitted response: submitter name plus submission timestamp.
///
/// Deterministic by design so the id survives re-serialization. Two
/// submissions from the same name within the same millisecond collide and
/// the later insert wins, consistent with last-write-wins replacement.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResponseId(String);

impl ResponseId {
    /// Derive the id for a submission.
    pub fn derive(name: &str, timestamp_ms: u64) -> Self {
        Self(format!("{}-{}", name, timestamp_ms))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ResponseId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ResponseId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ResponseId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// String form on the wire so response maps serialize as plain JSON objects
impl Serialize for ResponseId {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for ResponseId {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        Ok(Self(String::deserialize(d)?))
    }
}

/// A single submitted answer.
///
/// `score` is the graded value and only `set_score` writes it. The AI-assist
/// fields are advisory suggestions and never touch `score`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub id: ResponseId,
    pub name: String,
    pub text: String,
    pub timestamp: u64,
    #[serde(default)]
    pub score: Option<u32>,
    #[serde(default)]
    pub ai_score: Option<u32>,
    #[serde(default)]
    pub ai_feedback: Option<String>,
}

/// What followers should currently be shown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum DisplaySelection {
    #[default]
    ShowingPrompt,
    #[serde(rename_all = "camelCase")]
    ShowingResponse { response_id: ResponseId },
}

/// The authoritative session document.
///
/// Serialized whole on every propagation (there are no deltas) and written
/// whole to the local mirror. Fields are defaulted on deserialization so a
/// mirror blob from an older shape still loads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionState {
    /// Assigned at host start, reused across reconnects, replaced by
    /// "new class". Absent until hosting begins.
    pub room_code: Option<RoomCode>,
    pub prompt: String,
    /// Always >= 1; mutators clamp rather than reject.
    pub max_score: u32,
    /// Advisory to follower UIs. The host records submissions regardless.
    pub accepting: bool,
    pub responses: BTreeMap<ResponseId, Response>,
    pub display: DisplaySelection,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            room_code: None,
            prompt: String::new(),
            max_score: 1,
            accepting: false,
            responses: BTreeMap::new(),
            display: DisplaySelection::ShowingPrompt,
        }
    }
}

impl SessionState {
    /// Set the current prompt and its scoring ceiling.
    ///
    /// Opens the round: accepting flips on and the display resets to the
    /// prompt. A max score below 1 is clamped up.
    pub fn set_prompt(&mut self, text: &str, max_score: u32) {
        self.prompt = text.to_string();
        self.max_score = max_score.max(1);
        self.accepting = true;
        self.display = DisplaySelection::ShowingPrompt;
    }

    pub fn set_accepting(&mut self, accepting: bool) {
        self.accepting = accepting;
    }

    /// Update what followers are shown. A `ShowingResponse` referencing an
    /// id not yet in the mapping is stored as-is; staleness during
    /// propagation is tolerated and renderers fall back to the prompt.
    pub fn set_display(&mut self, selection: DisplaySelection) {
        self.display = selection;
    }

    /// Record a submitted answer with a fresh unscored entry.
    ///
    /// Empty (whitespace-only) text is silently ignored. The accepting flag
    /// is deliberately not checked here; it gates follower UIs only.
    pub fn record_response(&mut self, name: &str, text: &str, timestamp_ms: u64) {
        if text.trim().is_empty() {
            return;
        }
        let id = ResponseId::derive(name, timestamp_ms);
        let response = Response {
            id: id.clone(),
            name: name.to_string(),
            text: text.to_string(),
            timestamp: timestamp_ms,
            score: None,
            ai_score: None,
            ai_feedback: None,
        };
        self.responses.insert(id, response);
    }

    /// Grade a response. No-op when the id is absent. Scores clamp into
    /// `0..=max_score`.
    pub fn set_score(&mut self, id: &ResponseId, score: u32) {
        let max = self.max_score;
        if let Some(response) = self.responses.get_mut(id) {
            response.score = Some(score.min(max));
        }
    }

    /// Attach an AI-suggested score and feedback to a response. Advisory
    /// only: the graded `score` field is never written here. No-op when the
    /// id is absent.
    pub fn set_ai_assist(&mut self, id: &ResponseId, score: u32, feedback: &str) {
        if let Some(response) = self.responses.get_mut(id) {
            response.ai_score = Some(score);
            response.ai_feedback = Some(feedback.to_string());
        }
    }

    /// Clear all responses for a new round, keeping prompt, max score, and
    /// room code.
    pub fn reset_round(&mut self) {
        self.responses.clear();
        self.accepting = true;
        self.display = DisplaySelection::ShowingPrompt;
    }

    /// Discard the whole document and start over under a fresh room code.
    pub fn reset_for_new_class(&mut self, room_code: RoomCode) {
        *self = Self {
            room_code: Some(room_code),
            ..Self::default()
        };
    }
}
