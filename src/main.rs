//! Terminal Chat Server - Entry Point
//!
//! Parses arguments, binds the listener and runs the event loop until Ctrl-C.

use std::time::Duration;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use termchat::config::{DEFAULT_DRAIN_TIMEOUT, DEFAULT_HOST};
use termchat::{Server, ServerConfig};

/// Terminal chat server
#[derive(Parser, Debug)]
#[command(name = "termchat-server", version, about)]
struct Args {
    /// Port to listen on (1024 or above)
    port: u16,

    /// Address to bind
    #[arg(long, default_value = DEFAULT_HOST)]
    host: String,

    /// Milliseconds to wait for the rest of a partially received frame
    #[arg(long, default_value_t = DEFAULT_DRAIN_TIMEOUT.as_millis() as u64)]
    drain_timeout_ms: u64,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging with environment filter
    // Use RUST_LOG env var to control log level
    // e.g., RUST_LOG=debug or RUST_LOG=termchat=trace
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("termchat=info")),
        )
        .init();

    let args = Args::parse();
    let config = ServerConfig::new(args.port)
        .with_host(args.host)
        .with_drain_timeout(Duration::from_millis(args.drain_timeout_ms));

    let server = Server::bind(&config).await?;
    info!("Chat server listening on {}", server.local_addr()?);

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Ctrl-C received");
    };

    if let Err(e) = server.run_until(shutdown).await {
        error!("Server loop aborted: {}", e);
        return Err(e.into());
    }

    info!("Server closed");
    Ok(())
}
