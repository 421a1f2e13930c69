//! Session configuration.
//!
//! The transport strategy is a deployment-time choice made here, once; the
//! session never switches transports at runtime.

use crate::transport::{MeshTransport, RelayTransport, Transport};
use clap::ValueEnum;
use std::fmt::{self, Display, Formatter};
use std::path::PathBuf;

/// Which transport driver carries session traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TransportKind {
    /// Direct data links between participants, brokered by the rendezvous
    /// directory on the shared server.
    Mesh,
    /// All traffic fanned out through the shared relay server.
    Relay,
}

impl Display for TransportKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransportKind::Mesh => "mesh",
            TransportKind::Relay => "relay",
        })
    }
}

/// Configuration for one session participant.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub transport: TransportKind,
    /// Relay/rendezvous server URL.
    pub server_url: String,
    /// Address mesh hosts accept direct links on. Port 0 picks an ephemeral
    /// port; the bound address is what gets advertised.
    pub listen_addr: String,
    /// Where the durable local mirror lives.
    pub data_dir: PathBuf,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            transport: TransportKind::Relay,
            server_url: "ws://127.0.0.1:9350".to_string(),
            listen_addr: "127.0.0.1:0".to_string(),
            data_dir: PathBuf::from("."),
        }
    }
}

impl SessionConfig {
    /// Construct the configured transport driver.
    pub fn build_transport(&self) -> Box<dyn Transport> {
        match self.transport {
            TransportKind::Mesh => {
                Box::new(MeshTransport::new(&self.server_url, &self.listen_addr))
            }
            TransportKind::Relay => Box::new(RelayTransport::new(&self.server_url)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SessionConfig::default();
        assert_eq!(config.transport, TransportKind::Relay);
        assert_eq!(config.listen_addr, "127.0.0.1:0");
    }

    #[test]
    fn test_transport_kind_display() {
        assert_eq!(TransportKind::Mesh.to_string(), "mesh");
        assert_eq!(TransportKind::Relay.to_string(), "relay");
    }

    #[test]
    fn test_build_transport_matches_kind() {
        let config = SessionConfig {
            transport: TransportKind::Mesh,
            ..Default::default()
        };
        assert!(config.build_transport().needs_probe());

        let config = SessionConfig::default();
        assert!(!config.build_transport().needs_probe());
    }
}
