//! Error types for the chat server
//!
//! Fatal errors (`ServerError` and what it wraps) end the server loop.
//! `ChatError` covers user-facing rejections that are answered with a
//! `ServerMessage` and never leave the per-event handler.
//! Uses thiserror for ergonomic error definitions.

use thiserror::Error;

use crate::protocol::MAX_BODY_LEN;
use crate::types::{ConnectionId, Username, BROADCAST_TOKEN};

/// Wire protocol errors
///
/// Encoding failures mean the caller built an invalid message. Decoding
/// failures mean the frame was present but malformed; the connection is
/// still usable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Header code is not one of the known message kinds
    #[error("unknown message kind {0}")]
    UnknownKind(u8),

    /// Header claims a body larger than the protocol allows
    #[error("body length {0} exceeds the {max} byte limit", max = MAX_BODY_LEN)]
    Oversized(u64),

    /// Not enough bytes for the field being decoded
    #[error("frame truncated")]
    Truncated,

    /// Body decoded successfully but bytes were left over
    #[error("{0} trailing bytes after body")]
    TrailingBytes(usize),

    /// Boolean byte outside {0, 1}
    #[error("invalid boolean byte {0:#04x}")]
    InvalidBool(u8),

    /// String field is not valid UTF-8
    #[error("string field is not valid UTF-8")]
    InvalidUtf8,

    /// Recipient present but empty
    #[error("recipient must not be empty")]
    EmptyRecipient,
}

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    /// Ports below 1024 need elevated privileges and are refused
    #[error("port {0} is reserved (ports below 1024 are not allowed)")]
    PrivilegedPort(u16),

    /// Host name did not resolve to any address
    #[error("could not resolve {0}")]
    Unresolved(String),

    /// A non-blocking probe found no data
    #[error("operation would block")]
    WouldBlock,

    /// Handle does not refer to an open connection
    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionId),

    /// IO error (fatal)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Whether this error is the "no data yet" outcome of a probe
    pub fn would_block(&self) -> bool {
        match self {
            TransportError::WouldBlock => true,
            TransportError::Io(e) => e.kind() == std::io::ErrorKind::WouldBlock,
            _ => false,
        }
    }
}

/// Registry invariant violations
///
/// These indicate a bug in the caller and are fatal.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("connection {0} was already added")]
    AlreadyAdded(ConnectionId),

    #[error("connection {0} is not live")]
    UnknownConnection(ConnectionId),

    #[error("connection {0} is already registered")]
    AlreadyRegistered(ConnectionId),
}

/// Errors that abort the server loop
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("registry invariant violated: {0}")]
    Registry(#[from] RegistryError),

    /// The server tried to encode a message it built itself
    #[error("failed to encode outgoing message: {0}")]
    Encode(#[from] ProtocolError),
}

impl From<std::io::Error> for ServerError {
    fn from(err: std::io::Error) -> Self {
        ServerError::Transport(TransportError::Io(err))
    }
}

/// User-facing rejections
///
/// Each one is answered to the offending client only, with no state change.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChatError {
    /// Frame could not be decoded
    #[error("I couldn't quite get that. Can you say it again?")]
    Malformed,

    #[error("That's not a valid user name. Use 3 to 30 of a-z, 0-9, '-' or '_'. Try again!")]
    InvalidUsername,

    #[error("The user name {0} is taken. Try again!")]
    UsernameTaken(Username),

    #[error("Please register a user name first.")]
    NotRegistered,

    #[error("You are already registered.")]
    AlreadyRegistered,

    #[error("Can't send an empty message. Type \"<username> <message>\" or \"{bc} <message>\".", bc = BROADCAST_TOKEN)]
    EmptyMessage,

    /// Message would not fit in a frame once addressed and indented
    #[error("That message is too long. Try splitting it up.")]
    TooLong,

    #[error("Invalid user name. Try again!")]
    InvalidRecipient,

    #[error("The user {0} doesn't exist. Misspelled?")]
    UnknownRecipient(Username),
}
