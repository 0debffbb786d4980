//! Basic type definitions for the chat server
//!
//! Provides newtype wrappers for type safety:
//! - `ConnectionId`: server-assigned, monotonically increasing connection handle
//! - `Username`: validated `[a-z0-9_-]{3,30}` user name

use std::borrow::Borrow;

/// Target token that addresses every registered client.
pub const BROADCAST_TOKEN: &str = "bc";

/// Minimum username length in bytes
pub const USERNAME_MIN_LEN: usize = 3;

/// Maximum username length in bytes
pub const USERNAME_MAX_LEN: usize = 30;

/// Unique connection identifier (newtype pattern)
///
/// Assigned by the transport on accept. Distinct from the OS socket and never
/// reused for the lifetime of the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(pub u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Validated user name
///
/// The only way to obtain one is [`Username::parse`], so holding a value
/// means the name is well formed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Username(String);

impl Username {
    /// Parse a user name, returning `None` if it is not of the form
    /// `[a-z0-9_-]{3,30}` or equals the broadcast token.
    pub fn parse(s: &str) -> Option<Self> {
        if !(USERNAME_MIN_LEN..=USERNAME_MAX_LEN).contains(&s.len()) {
            return None;
        }
        let valid = s
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-' || b == b'_');
        if !valid || s == BROADCAST_TOKEN {
            return None;
        }
        Some(Self(s.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for Username {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for Username {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Username {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
