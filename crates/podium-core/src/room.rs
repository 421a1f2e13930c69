//! RoomCode: Short human-typed token binding followers to a host session.
//!
//! Four uppercase alphanumeric characters internally, but parsing accepts
//! any case so codes can be read aloud and typed without shift-hunting.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RoomCodeError {
    #[error("Invalid room code: expected 4 alphanumeric chars, got {0:?}")]
    InvalidFormat(String),
}

/// Characters room codes are generated from.
const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// A short human-enterable session identifier.
///
/// Stored uppercase; comparison and parsing are case-insensitive.
///
/// # Examples
/// ```
/// use podium_core::RoomCode;
///
/// let code = RoomCode::generate();
/// assert_eq!(code.as_str().len(), 4);
///
/// let parsed: RoomCode = "ab3z".parse().unwrap();
/// assert_eq!(parsed.as_str(), "AB3Z");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RoomCode([u8; 4]);

impl RoomCode {
    /// Generate a new random room code.
    pub fn generate() -> Self {
        use rand::Rng;
        let mut rng = rand::rng();
        let mut chars = [0u8; 4];
        for c in chars.iter_mut() {
            *c = ALPHABET[rng.random_range(0..ALPHABET.len())];
        }
        Self(chars)
    }

    /// Get the canonical uppercase string form.
    pub fn as_str(&self) -> &str {
        // Generation and parsing only admit ASCII alphanumerics
        std::str::from_utf8(&self.0).unwrap_or("????")
    }
}

impl Display for RoomCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RoomCode {
    type Err = RoomCodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.len() != 4 || !trimmed.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(RoomCodeError::InvalidFormat(s.to_string()));
        }
        let mut chars = [0u8; 4];
        for (slot, c) in chars.iter_mut().zip(trimmed.bytes()) {
            *slot = c.to_ascii_uppercase();
        }
        Ok(Self(chars))
    }
}

// Serialize as the uppercase string for wire and mirror payloads
impl serde::Serialize for RoomCode {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(self.as_str())
    }
}

impl<'de> serde::Deserialize<'de> for RoomCode {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
