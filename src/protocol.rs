//! Wire protocol definitions
//!
//! Length-prefixed, type-tagged binary frames:
//!
//! ```text
//! Header:  [1 byte kind][8 bytes big-endian body length]
//! Body:    <kind-specific, `length` bytes>
//! ```
//!
//! Strings are an 8-byte big-endian length followed by UTF-8 bytes; booleans
//! are one byte restricted to 0 or 1.

use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ChatError, ProtocolError};

/// Size of the fixed frame header
pub const HEADER_LEN: usize = 9;

/// Largest body a peer may announce
pub const MAX_BODY_LEN: usize = 4096;

/// Header code selecting the message variant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    ClientMessage = 0,
    ServerMessage = 1,
    ClientRegistration = 2,
    RegistrationSuccess = 3,
    Disconnect = 4,
}

impl TryFrom<u8> for MessageKind {
    type Error = ProtocolError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(MessageKind::ClientMessage),
            1 => Ok(MessageKind::ServerMessage),
            2 => Ok(MessageKind::ClientRegistration),
            3 => Ok(MessageKind::RegistrationSuccess),
            4 => Ok(MessageKind::Disconnect),
            other => Err(ProtocolError::UnknownKind(other)),
        }
    }
}

/// Every message exchanged between client and server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Chat line from a client, optionally pre-addressed
    ClientMessage {
        content: String,
        recipient: Option<String>,
    },
    /// Text from the server to show to the user
    ServerMessage { content: String },
    /// Username proposal from an unregistered client
    ClientRegistration { username: String },
    /// Username accepted
    RegistrationSuccess,
    /// Orderly goodbye, in either direction
    Disconnect,
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::ClientMessage { .. } => MessageKind::ClientMessage,
            Message::ServerMessage { .. } => MessageKind::ServerMessage,
            Message::ClientRegistration { .. } => MessageKind::ClientRegistration,
            Message::RegistrationSuccess => MessageKind::RegistrationSuccess,
            Message::Disconnect => MessageKind::Disconnect,
        }
    }

    /// Convenience constructor for server text
    pub fn server(content: impl Into<String>) -> Self {
        Message::ServerMessage {
            content: content.into(),
        }
    }
}

/// Convert a user-facing rejection into the reply sent to the client
impl From<ChatError> for Message {
    fn from(err: ChatError) -> Self {
        Message::server(err.to_string())
    }
}

/// Parsed frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub kind: MessageKind,
    pub length: usize,
}

/// Outcome of reading one frame from a peer
#[derive(Debug, PartialEq, Eq)]
pub enum Received {
    Message(Message),
    /// A frame arrived but could not be decoded; the stream is still usable
    Malformed(ProtocolError),
    /// Peer closed the connection
    Closed,
}

/// Encode a message into a complete frame.
///
/// The length field is reserved up front and backfilled once the body has
/// been written.
pub fn encode(message: &Message) -> Result<BytesMut, ProtocolError> {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + 64);
    buf.put_u8(message.kind() as u8);
    buf.put_u64(0);

    match message {
        Message::ClientMessage { content, recipient } => {
            put_string(&mut buf, content);
            match recipient {
                Some(r) if r.is_empty() => return Err(ProtocolError::EmptyRecipient),
                Some(r) => {
                    put_bool(&mut buf, true);
                    put_string(&mut buf, r);
                }
                None => put_bool(&mut buf, false),
            }
        }
        Message::ServerMessage { content } => put_string(&mut buf, content),
        Message::ClientRegistration { username } => put_string(&mut buf, username),
        Message::RegistrationSuccess | Message::Disconnect => {}
    }

    let body_len = buf.len() - HEADER_LEN;
    if body_len > MAX_BODY_LEN {
        return Err(ProtocolError::Oversized(body_len as u64));
    }
    buf[1..HEADER_LEN].copy_from_slice(&(body_len as u64).to_be_bytes());
    Ok(buf)
}

/// Parse a header, rejecting unknown kinds and oversize lengths.
pub fn decode_header(mut input: &[u8]) -> Result<Header, ProtocolError> {
    if input.len() < HEADER_LEN {
        return Err(ProtocolError::Truncated);
    }
    let code = input.get_u8();
    let length = input.get_u64();
    // Length is checked before the kind so an oversize frame always reports it.
    if length > MAX_BODY_LEN as u64 {
        return Err(ProtocolError::Oversized(length));
    }
    let kind = MessageKind::try_from(code)?;
    Ok(Header {
        kind,
        length: length as usize,
    })
}

/// Body length announced by a header that already passed the size check.
///
/// Used to skip the body of a frame whose kind is unknown.
pub fn declared_length(header: &[u8; HEADER_LEN]) -> usize {
    let mut length = &header[1..];
    length.get_u64() as usize
}

/// Decode a body of the given kind, requiring every byte to be consumed.
pub fn decode_body(kind: MessageKind, mut body: &[u8]) -> Result<Message, ProtocolError> {
    let message = match kind {
        MessageKind::ClientMessage => {
            let content = get_string(&mut body)?;
            let recipient = if get_bool(&mut body)? {
                let r = get_string(&mut body)?;
                if r.is_empty() {
                    return Err(ProtocolError::EmptyRecipient);
                }
                Some(r)
            } else {
                None
            };
            Message::ClientMessage { content, recipient }
        }
        MessageKind::ServerMessage => Message::ServerMessage {
            content: get_string(&mut body)?,
        },
        MessageKind::ClientRegistration => Message::ClientRegistration {
            username: get_string(&mut body)?,
        },
        MessageKind::RegistrationSuccess => Message::RegistrationSuccess,
        MessageKind::Disconnect => Message::Disconnect,
    };

    if body.has_remaining() {
        return Err(ProtocolError::TrailingBytes(body.remaining()));
    }
    Ok(message)
}

/// Decode one complete frame held in memory.
pub fn decode(frame: &[u8]) -> Result<Message, ProtocolError> {
    let header = decode_header(frame)?;
    let body = &frame[HEADER_LEN..];
    if body.len() < header.length {
        return Err(ProtocolError::Truncated);
    }
    if body.len() > header.length {
        return Err(ProtocolError::TrailingBytes(body.len() - header.length));
    }
    decode_body(header.kind, body)
}

/// Read one frame from an async reader.
///
/// A clean close before or inside a frame yields [`Received::Closed`].
pub async fn read_message<R>(reader: &mut R) -> std::io::Result<Received>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    if !read_exact_or_eof(reader, &mut header).await? {
        return Ok(Received::Closed);
    }

    let header = match decode_header(&header) {
        Ok(header) => header,
        Err(ProtocolError::UnknownKind(code)) => {
            // Keep the stream aligned: the length was already validated.
            let mut skip = vec![0u8; declared_length(&header)];
            if !read_exact_or_eof(reader, &mut skip).await? {
                return Ok(Received::Closed);
            }
            return Ok(Received::Malformed(ProtocolError::UnknownKind(code)));
        }
        Err(ProtocolError::Oversized(length)) => {
            // Skipped without buffering; the length is untrusted.
            let mut body = AsyncReadExt::take(&mut *reader, length);
            let skipped = tokio::io::copy(&mut body, &mut tokio::io::sink()).await?;
            if skipped < length {
                return Ok(Received::Closed);
            }
            return Ok(Received::Malformed(ProtocolError::Oversized(length)));
        }
        Err(e) => return Ok(Received::Malformed(e)),
    };

    let mut body = vec![0u8; header.length];
    if !read_exact_or_eof(reader, &mut body).await? {
        return Ok(Received::Closed);
    }

    Ok(match decode_body(header.kind, &body) {
        Ok(message) => Received::Message(message),
        Err(e) => Received::Malformed(e),
    })
}

/// Encode and write one message, flushing the writer.
pub async fn write_message<W>(writer: &mut W, message: &Message) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode(message)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    writer.write_all(&frame).await?;
    writer.flush().await
}

async fn read_exact_or_eof<R>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<bool>
where
    R: AsyncRead + Unpin,
{
    match reader.read_exact(buf).await {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

fn put_bool(buf: &mut BytesMut, value: bool) {
    buf.put_u8(u8::from(value));
}

fn put_string(buf: &mut BytesMut, value: &str) {
    buf.put_u64(value.len() as u64);
    buf.put_slice(value.as_bytes());
}

fn get_bool(input: &mut &[u8]) -> Result<bool, ProtocolError> {
    if !input.has_remaining() {
        return Err(ProtocolError::Truncated);
    }
    match input.get_u8() {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(ProtocolError::InvalidBool(other)),
    }
}

fn get_string(input: &mut &[u8]) -> Result<String, ProtocolError> {
    if input.remaining() < 8 {
        return Err(ProtocolError::Truncated);
    }
    let len = input.get_u64();
    if len > input.remaining() as u64 {
        return Err(ProtocolError::Truncated);
    }
    let data: &[u8] = *input;
    let (raw, rest) = data.split_at(len as usize);
    let value = std::str::from_utf8(raw)
        .map_err(|_| ProtocolError::InvalidUtf8)?
        .to_owned();
    *input = rest;
    Ok(value)
}
