//! Terminal Chat Client - Entry Point
//!
//! Connects to a server and relays lines between the terminal and the socket.

use std::process;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use termchat::{client, transport};

/// Terminal chat client
#[derive(Parser, Debug)]
#[command(name = "termchat", version, about)]
struct Args {
    /// Server address
    host: String,

    /// Server port (1024 or above)
    port: u16,
}

#[tokio::main]
async fn main() {
    // Logs go to stderr so they never interleave with the chat on stdout
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("termchat=warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let stream = match transport::connect(&args.host, args.port).await {
        Ok(stream) => stream,
        Err(e) => {
            eprintln!("termchat: {e}");
            process::exit(1);
        }
    };

    let code = match client::run(stream).await {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("Something went wrong. Please quit the program.\n - error: {e}");
            1
        }
    };

    println!("Goodbye!");
    // stdin may still be blocked in a read; exiting does not wait for it.
    process::exit(code);
}
