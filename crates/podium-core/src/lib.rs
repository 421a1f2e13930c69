//! podium-core: Shared library for host-authoritative session state sync.
//!
//! This crate provides the core functionality for:
//! - The SessionState document and its host-only mutators
//! - Room codes and response identifiers
//! - The synchronization protocol and relay/rendezvous control frames
//! - Event bus and operator log buffer for UI collaborators

pub mod clock;
pub mod events;
pub mod log;
pub mod protocol;
pub mod room;
pub mod state;
pub mod status;

pub use events::{EventBus, SessionEvent, Subscription};
pub use log::{LogBuffer, LogEntry, Severity, LOG_CAPACITY};
pub use protocol::{host_identity, ClientBound, ServerBound, SessionMessage, IDENTITY_PREFIX};
pub use room::{RoomCode, RoomCodeError};
pub use state::{DisplaySelection, Response, ResponseId, SessionState};
pub use status::ConnectionStatus;
