//! Server configuration

use std::time::Duration;

/// Default listen port
pub const DEFAULT_PORT: u16 = 8363;

/// Default listen address (all interfaces)
pub const DEFAULT_HOST: &str = "0.0.0.0";

/// How long a peer may take to finish a frame once it has started one
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Settings for [`crate::Server::bind`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Host name or address to listen on
    pub host: String,
    /// Listen port; 0 picks an ephemeral port, 1..=1023 is refused
    pub port: u16,
    /// Upper bound on the wait for the rest of a partially received frame
    pub drain_timeout: Duration,
}

impl ServerConfig {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            ..Self::default()
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }
}
