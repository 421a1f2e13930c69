//! Wire protocol definitions.
//!
//! Two layers share this module:
//! - Session messages: the host/follower synchronization protocol carried
//!   over whichever transport is configured.
//! - Control frames: the relay/rendezvous server contract (room join and
//!   fan-out envelopes, identity claim/resolve, liveness ping).

pub mod control;
pub mod message;

pub use control::{host_identity, ClientBound, ServerBound, IDENTITY_PREFIX};
pub use message::{SessionMessage, MAX_MESSAGE_SIZE};
