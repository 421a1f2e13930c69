//! podium-relay library: Exposes the relay server for embedding.
//!
//! This is a thin library layer over the server components, allowing
//! integration tests (and the session crate's end-to-end tests) to run an
//! in-process relay on an ephemeral port.

pub mod connection;
pub mod router;

pub use connection::{ClientConnection, ClientEvent, ClientId};
pub use router::RelayServer;
