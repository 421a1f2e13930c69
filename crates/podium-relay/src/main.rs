//! podium-relay: Shared relay and rendezvous server.
//!
//! Serves both transport strategies of the podium session layer: room-coded
//! envelope fan-out for relay deployments and the identity directory mesh
//! deployments use to find hosts.

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use podium_relay::RelayServer;

#[derive(Parser, Debug)]
#[command(name = "podium-relay")]
#[command(about = "Relay and rendezvous server for podium sessions")]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Port to listen on
    #[arg(short, long, default_value_t = 9350)]
    port: u16,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Respects RUST_LOG, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,podium_relay=debug"
    } else {
        "info,podium_relay=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let listen_addr = format!("{}:{}", args.host, args.port);
    info!("Starting podium-relay on {}", listen_addr);

    let listener = RelayServer::bind(&listen_addr).await?;
    let server = RelayServer::new();

    server
        .serve(listener, async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await;

    info!("Shutting down");
    Ok(())
}
