//! Terminal Chat Server Library
//!
//! A multi-user chat service over TCP using a small length-prefixed binary
//! protocol. Clients pick a unique username, then message one user or
//! everyone.
//!
//! # Features
//! - Type-tagged binary framing with a 4096 byte body limit
//! - Username registration with uniqueness checks
//! - Broadcast (`bc <message>`) and private (`<username> <message>`) delivery
//! - Arrival and departure notices
//! - Graceful shutdown with a closing notice
//!
//! # Architecture
//! A single-threaded event loop:
//! - `Transport` waits for readiness on the listener and every connection
//! - `Server` reads one frame per ready connection and dispatches it
//! - `Router` delivers through the transport, resolving names in the `ClientRegistry`
//! - No locks needed - only the loop touches client state
//!
//! # Example
//! ```ignore
//! use termchat::{Server, ServerConfig};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() {
//!     let server = Server::bind(&ServerConfig::new(8363)).await.unwrap();
//!     server.run_until(async { let _ = tokio::signal::ctrl_c().await; }).await.unwrap();
//! }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod server;
pub mod transport;
pub mod types;

// Re-export main types for convenience
pub use config::ServerConfig;
pub use error::{ChatError, ProtocolError, RegistryError, ServerError, TransportError};
pub use protocol::{decode, encode, Message, MessageKind, Received};
pub use registry::ClientRegistry;
pub use router::{Outbox, Router};
pub use server::Server;
pub use transport::{Event, Transport};
pub use types::{ConnectionId, Username, BROADCAST_TOKEN};
