//! Socket handling for the server and client
//!
//! Owns the listening socket and every accepted connection. Connections are
//! handed out by [`ConnectionId`] only; the registry and router never see a
//! socket.
//!
//! Reads are blocking by default. [`Transport::non_blocking`] returns a guard
//! that switches a connection to probe mode for the duration of one frame, so
//! a peer that has nothing to say cannot stall the loop.

use std::collections::BTreeMap;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::ops::{Deref, DerefMut};
use std::task::Poll;
use std::time::Duration;

use futures_util::future::poll_fn;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::error::{ProtocolError, TransportError};
use crate::protocol::{self, Received, HEADER_LEN};
use crate::types::ConnectionId;

/// Lowest port the server or client may use (0 still means "ephemeral")
pub const MIN_PORT: u16 = 1024;

/// Whether the next frame read waits for data or probes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    Blocking,
    NonBlocking,
}

/// Readiness reported by [`Transport::poll`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// A connection was accepted and assigned this handle
    Connected(ConnectionId),
    /// An existing connection has data (or EOF) pending
    Readable(ConnectionId),
}

/// Refuse privileged ports.
pub fn check_port(port: u16) -> Result<(), TransportError> {
    if port != 0 && port < MIN_PORT {
        return Err(TransportError::PrivilegedPort(port));
    }
    Ok(())
}

/// Resolve `host:port`, applying the port policy first.
pub async fn resolve(host: &str, port: u16) -> Result<Vec<SocketAddr>, TransportError> {
    check_port(port)?;
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| TransportError::Unresolved(format!("{host}:{port} ({e})")))?
        .collect();
    if addrs.is_empty() {
        return Err(TransportError::Unresolved(format!("{host}:{port}")));
    }
    Ok(addrs)
}

/// Connect to a server, trying every resolved address in turn.
pub async fn connect(host: &str, port: u16) -> Result<TcpStream, TransportError> {
    let mut last_err = None;
    for addr in resolve(host, port).await? {
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                debug!("Connected to {}", addr);
                return Ok(stream);
            }
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err
        .map(TransportError::Io)
        .unwrap_or_else(|| TransportError::Unresolved(format!("{host}:{port}"))))
}

/// IO error kinds that mean the peer went away rather than something broke
pub fn is_peer_gone(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
    )
}

/// One accepted client connection
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    stream: TcpStream,
    peer: SocketAddr,
    mode: ReadMode,
    drain_timeout: Duration,
}

impl Connection {
    fn new(id: ConnectionId, stream: TcpStream, peer: SocketAddr, drain_timeout: Duration) -> Self {
        Self {
            id,
            stream,
            peer,
            mode: ReadMode::Blocking,
            drain_timeout,
        }
    }

    pub fn mode(&self) -> ReadMode {
        self.mode
    }

    /// Switch to probe mode until the returned guard is dropped.
    pub fn non_blocking(&mut self) -> NonBlocking<'_> {
        self.mode = ReadMode::NonBlocking;
        NonBlocking { conn: self }
    }

    /// Write every byte. Returns `false` if the peer is gone.
    pub async fn send(&mut self, bytes: &[u8]) -> Result<bool, TransportError> {
        match self.stream.write_all(bytes).await {
            Ok(()) => Ok(true),
            Err(e) if is_peer_gone(&e) => {
                debug!("Send to {} failed, peer gone: {}", self.id, e);
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Fill `buf` completely. Returns `false` if the peer closed first.
    ///
    /// In non-blocking mode the first read is a probe and yields
    /// [`TransportError::WouldBlock`] when nothing is pending.
    pub async fn receive_exact(&mut self, buf: &mut [u8]) -> Result<bool, TransportError> {
        let mut filled = 0;
        if self.mode == ReadMode::NonBlocking && !buf.is_empty() {
            match self.stream.try_read(buf) {
                Ok(0) => return Ok(false),
                Ok(n) => filled = n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Err(TransportError::WouldBlock)
                }
                Err(e) if is_peer_gone(&e) => return Ok(false),
                Err(e) => return Err(e.into()),
            }
        }
        self.fill(&mut buf[filled..]).await
    }

    /// Read one frame.
    ///
    /// Only the first header byte is probed; once a frame has started the
    /// rest is drained, bounded by the drain timeout in non-blocking mode.
    pub async fn receive_message(&mut self) -> Result<Received, TransportError> {
        let mut header = [0u8; HEADER_LEN];
        if !self.receive_exact(&mut header).await? {
            return Ok(Received::Closed);
        }

        let header = match protocol::decode_header(&header) {
            Ok(header) => header,
            Err(ProtocolError::UnknownKind(code)) => {
                let mut skip = vec![0u8; protocol::declared_length(&header)];
                if !self.fill(&mut skip).await? {
                    return Ok(Received::Closed);
                }
                return Ok(Received::Malformed(ProtocolError::UnknownKind(code)));
            }
            Err(ProtocolError::Oversized(length)) => {
                if !self.discard(length).await? {
                    return Ok(Received::Closed);
                }
                return Ok(Received::Malformed(ProtocolError::Oversized(length)));
            }
            Err(e) => return Ok(Received::Malformed(e)),
        };

        let mut body = vec![0u8; header.length];
        if !self.fill(&mut body).await? {
            return Ok(Received::Closed);
        }

        Ok(match protocol::decode_body(header.kind, &body) {
            Ok(message) => Received::Message(message),
            Err(e) => Received::Malformed(e),
        })
    }

    async fn fill(&mut self, buf: &mut [u8]) -> Result<bool, TransportError> {
        if buf.is_empty() {
            return Ok(true);
        }
        let (id, mode, limit) = (self.id, self.mode, self.drain_timeout);
        bounded(id, mode, limit, self.stream.read_exact(buf)).await
    }

    /// Read and throw away `length` bytes without buffering them.
    ///
    /// The whole skip shares one drain timeout in non-blocking mode, however
    /// large the declared length.
    async fn discard(&mut self, length: u64) -> Result<bool, TransportError> {
        let (id, mode, limit) = (self.id, self.mode, self.drain_timeout);
        let stream = &mut self.stream;
        let skip = async move {
            let mut body = stream.take(length);
            let skipped = tokio::io::copy(&mut body, &mut tokio::io::sink()).await?;
            if skipped < length {
                return Err(io::Error::from(io::ErrorKind::UnexpectedEof));
            }
            Ok::<(), io::Error>(())
        };
        debug!("Skipping {} byte oversize body from {}", length, id);
        bounded(id, mode, limit, skip).await
    }
}

/// Finish a read that belongs to a frame already in progress.
///
/// Returns `false` if the peer went away, or if it stalled past `limit` in
/// non-blocking mode.
async fn bounded<T, F>(
    id: ConnectionId,
    mode: ReadMode,
    limit: Duration,
    read: F,
) -> Result<bool, TransportError>
where
    F: Future<Output = io::Result<T>>,
{
    let result = match mode {
        ReadMode::Blocking => read.await,
        ReadMode::NonBlocking => match tokio::time::timeout(limit, read).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    "Connection {} stalled mid-frame for {:?}, dropping it",
                    id, limit
                );
                return Ok(false);
            }
        },
    };
    match result {
        Ok(_) => Ok(true),
        Err(e) if is_peer_gone(&e) => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Scoped non-blocking mode; restores blocking mode on drop
pub struct NonBlocking<'a> {
    conn: &'a mut Connection,
}

impl Deref for NonBlocking<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn
    }
}

impl DerefMut for NonBlocking<'_> {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn
    }
}

impl Drop for NonBlocking<'_> {
    fn drop(&mut self) {
        self.conn.mode = ReadMode::Blocking;
    }
}

/// Listening socket plus every live connection
pub struct Transport {
    listener: TcpListener,
    connections: BTreeMap<ConnectionId, Connection>,
    next_id: u64,
    drain_timeout: Duration,
}

impl Transport {
    /// Bind to the configured address.
    pub async fn bind(config: &ServerConfig) -> Result<Self, TransportError> {
        let mut last_err = None;
        for addr in resolve(&config.host, config.port).await? {
            match TcpListener::bind(addr).await {
                Ok(listener) => {
                    info!("Listening on {}", listener.local_addr()?);
                    return Ok(Self {
                        listener,
                        connections: BTreeMap::new(),
                        next_id: 0,
                        drain_timeout: config.drain_timeout,
                    });
                }
                Err(e) => {
                    debug!("Bind to {} failed: {}", addr, e);
                    last_err = Some(e);
                }
            }
        }
        Err(last_err
            .map(TransportError::Io)
            .unwrap_or_else(|| TransportError::Unresolved(config.host.clone())))
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn connection(&self, id: ConnectionId) -> Result<&Connection, TransportError> {
        self.connections
            .get(&id)
            .ok_or(TransportError::UnknownConnection(id))
    }

    pub fn connection_mut(&mut self, id: ConnectionId) -> Result<&mut Connection, TransportError> {
        self.connections
            .get_mut(&id)
            .ok_or(TransportError::UnknownConnection(id))
    }

    /// Wait until the listener or any connection is readable.
    ///
    /// Every source is checked on each wake-up, so a busy connection never
    /// hides a pending accept and vice versa. New connections are accepted
    /// here and reported first.
    pub async fn poll(&mut self) -> Result<Vec<Event>, TransportError> {
        let listener = &self.listener;
        let connections = &self.connections;

        let (accepted, mut events) = poll_fn(|cx| {
            let accepted = match listener.poll_accept(cx) {
                Poll::Ready(result) => Some(result),
                Poll::Pending => None,
            };
            let mut ready = Vec::new();
            for (id, conn) in connections {
                // An error here surfaces again on the read, so report it as readable.
                if conn.stream.poll_read_ready(cx).is_ready() {
                    ready.push(Event::Readable(*id));
                }
            }
            if accepted.is_none() && ready.is_empty() {
                Poll::Pending
            } else {
                Poll::Ready((accepted, ready))
            }
        })
        .await;

        match accepted {
            Some(Ok((stream, peer))) => {
                let id = self.admit(stream, peer);
                events.insert(0, Event::Connected(id));
            }
            Some(Err(e)) if is_peer_gone(&e) => {
                warn!("Connection dropped before accept: {}", e);
            }
            Some(Err(e)) => return Err(e.into()),
            None => {}
        }

        Ok(events)
    }

    /// Send a complete frame to one connection.
    pub async fn send(&mut self, id: ConnectionId, bytes: &[u8]) -> Result<bool, TransportError> {
        self.connection_mut(id)?.send(bytes).await
    }

    /// Put a connection in probe mode for the lifetime of the guard.
    pub fn non_blocking(&mut self, id: ConnectionId) -> Result<NonBlocking<'_>, TransportError> {
        Ok(self.connection_mut(id)?.non_blocking())
    }

    /// Drop a connection, closing its socket. Returns `false` if unknown.
    pub fn close(&mut self, id: ConnectionId) -> bool {
        match self.connections.remove(&id) {
            Some(conn) => {
                debug!("Closed connection {} ({})", id, conn.peer);
                true
            }
            None => false,
        }
    }

    fn admit(&mut self, stream: TcpStream, peer: SocketAddr) -> ConnectionId {
        self.next_id += 1;
        let id = ConnectionId(self.next_id);
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Could not set TCP_NODELAY on {}: {}", id, e);
        }
        self.connections
            .insert(id, Connection::new(id, stream, peer, self.drain_timeout));
        info!("Connection {} accepted from {}", id, peer);
        id
    }
}
