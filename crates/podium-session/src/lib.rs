//! podium-session: The session service and its transports.
//!
//! A host runs the single-writer service that owns the shared document and
//! pushes full snapshots to followers; followers replicate and submit
//! answers. Traffic travels over one of two transports, chosen at
//! configuration time: direct mesh links brokered by the rendezvous
//! directory, or fan-out through the shared relay.

pub mod config;
pub mod mirror;
pub mod registry;
pub mod service;
pub mod supervisor;
pub mod transport;

pub use config::{SessionConfig, TransportKind};
pub use mirror::{FileMirror, LocalChannel, MirrorError};
pub use service::{SessionError, SessionHandle, SessionService, JOIN_TIMEOUT};
pub use transport::{
    LinkId, MeshTransport, RelayTransport, Role, Transport, TransportError, TransportEvent,
};
