//! Chat server event loop
//!
//! A single task owns the transport and the registry. Each iteration waits for
//! readiness across the listener and every connection, then handles the
//! ready sources one at a time. Nothing is shared, so no locks are needed.
//!
//! Per connection there are two states: unregistered (just accepted) and
//! registered (has a username). The only transition is a successful
//! registration; a connection leaves either state only by being removed.

use std::fmt::Write as _;
use std::future::Future;
use std::net::SocketAddr;

use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::error::{ChatError, ServerError};
use crate::protocol::{self, Message, Received, MAX_BODY_LEN};
use crate::registry::ClientRegistry;
use crate::router::Router;
use crate::transport::{Event, Transport};
use crate::types::{ConnectionId, Username, BROADCAST_TOKEN};

/// First thing a new connection hears
pub const WELCOME: &str = "Hi there! Please give us your username.";

/// Broadcast to everyone when the server stops
pub const SHUTDOWN_NOTICE: &str = "The server is shutting down. Goodbye!";

/// Roster entries stop being listed past this many bytes
const ROSTER_BUDGET: usize = MAX_BODY_LEN / 2;

/// The main chat server
///
/// Owns the listening transport and the registry of connected clients.
pub struct Server {
    transport: Transport,
    registry: ClientRegistry,
}

impl Server {
    /// Bind the listening socket
    pub async fn bind(config: &ServerConfig) -> Result<Self, ServerError> {
        Ok(Self {
            transport: Transport::bind(config).await?,
            registry: ClientRegistry::new(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.transport.local_addr()?)
    }

    /// Run until a fatal error
    pub async fn run(self) -> Result<(), ServerError> {
        self.run_until(std::future::pending()).await
    }

    /// Run the event loop until `shutdown` completes or a fatal error occurs.
    ///
    /// Shutdown is only observed between iterations. On shutdown every
    /// connection is sent a closing notice before it is dropped.
    pub async fn run_until<F>(mut self, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        info!("ChatServer started");

        loop {
            let events = tokio::select! {
                biased;
                _ = &mut shutdown => break,
                events = self.transport.poll() => events?,
            };

            for event in events {
                self.handle_event(event).await?;
            }
        }

        info!(
            "ChatServer shutting down, closing {} connections",
            self.transport.connection_count()
        );
        self.router()
            .shutdown(&Message::server(SHUTDOWN_NOTICE))
            .await
    }

    fn router(&mut self) -> Router<'_, Transport> {
        Router::new(&mut self.registry, &mut self.transport)
    }

    /// Process a single readiness event
    async fn handle_event(&mut self, event: Event) -> Result<(), ServerError> {
        match event {
            Event::Connected(id) => self.handle_connect(id).await,
            // Removed earlier in this batch (e.g. failed during a broadcast)
            Event::Readable(id) if !self.registry.contains(id) => Ok(()),
            Event::Readable(id) => {
                let Some(message) = self.receive(id).await? else {
                    return Ok(());
                };
                if self.registry.is_registered(id) {
                    self.handle_registered(id, message).await
                } else {
                    self.handle_unregistered(id, message).await
                }
            }
        }
    }

    /// Handle new client connection
    async fn handle_connect(&mut self, id: ConnectionId) -> Result<(), ServerError> {
        self.registry.add_unregistered(id)?;
        debug!("Total connections: {}", self.registry.len());
        self.router().reply(id, &Message::server(WELCOME)).await?;
        Ok(())
    }

    /// Read one frame, dealing with disconnects and garbage on the spot.
    ///
    /// Returns a message only when there is something left to dispatch.
    async fn receive(&mut self, id: ConnectionId) -> Result<Option<Message>, ServerError> {
        let received = {
            let mut conn = self.transport.non_blocking(id)?;
            conn.receive_message().await
        };

        let received = match received {
            Ok(received) => received,
            Err(e) if e.would_block() => {
                debug!("Connection {} had nothing to read", id);
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        match received {
            Received::Closed => {
                self.router().announce_departure(id, true).await?;
                Ok(None)
            }
            Received::Message(Message::Disconnect) => {
                self.router().announce_departure(id, false).await?;
                Ok(None)
            }
            Received::Malformed(e) => {
                warn!("Malformed frame from {}: {}", id, e);
                self.reject(id, ChatError::Malformed).await?;
                Ok(None)
            }
            Received::Message(message) => Ok(Some(message)),
        }
    }

    /// Handle a message from a client that has not picked a username yet
    async fn handle_unregistered(
        &mut self,
        id: ConnectionId,
        message: Message,
    ) -> Result<(), ServerError> {
        let username = match message {
            Message::ClientRegistration { username } => username,
            Message::ClientMessage { .. } => return self.reject(id, ChatError::NotRegistered).await,
            _ => return self.reject(id, ChatError::Malformed).await,
        };

        let Some(username) = Username::parse(&username) else {
            return self.reject(id, ChatError::InvalidUsername).await;
        };

        if !self.registry.register(id, username.clone())? {
            return self.reject(id, ChatError::UsernameTaken(username)).await;
        }
        info!("Connection {} registered as '{}'", id, username);

        // Nobody has heard of this user yet, so a failure here is not announced.
        let roster = self.roster(id);
        let mut router = self.router();
        if !router
            .reply_unannounced(id, &Message::RegistrationSuccess)
            .await?
        {
            return Ok(());
        }
        if !router.reply_unannounced(id, &Message::server(roster)).await? {
            return Ok(());
        }
        router
            .broadcast_except(id, &Message::server(format!("{username} is here!")))
            .await
    }

    /// Handle a message from a registered client
    async fn handle_registered(
        &mut self,
        id: ConnectionId,
        message: Message,
    ) -> Result<(), ServerError> {
        let (target, body) = match message {
            Message::ClientMessage {
                content,
                recipient: Some(recipient),
            } => (recipient, content),
            Message::ClientMessage {
                content,
                recipient: None,
            } => match content.split_once(' ') {
                Some((target, body)) => (target.to_string(), body.to_string()),
                None => return self.reject(id, ChatError::EmptyMessage).await,
            },
            Message::ClientRegistration { .. } => {
                return self.reject(id, ChatError::AlreadyRegistered).await
            }
            _ => return self.reject(id, ChatError::Malformed).await,
        };

        if body.is_empty() {
            return self.reject(id, ChatError::EmptyMessage).await;
        }

        let Some(sender) = self.registry.username_of(id).cloned() else {
            return Ok(());
        };

        if target == BROADCAST_TOKEN {
            let text = Message::server(format!("{sender} to everyone:\n{}", indent(&body)));
            if protocol::encode(&text).is_err() {
                return self.reject(id, ChatError::TooLong).await;
            }
            let mut router = self.router();
            router.broadcast_except(id, &text).await?;
            router
                .reply(id, &Message::server("Message sent to everyone."))
                .await?;
            return Ok(());
        }

        let Some(recipient_name) = Username::parse(&target) else {
            return self.reject(id, ChatError::InvalidRecipient).await;
        };
        let Some(recipient) = self.registry.lookup_by_username(recipient_name.as_str()) else {
            return self
                .reject(id, ChatError::UnknownRecipient(recipient_name))
                .await;
        };

        let text = Message::server(if recipient == id {
            format!("Note to self:\n{}", indent(&body))
        } else {
            format!("{sender} to you:\n{}", indent(&body))
        });
        if protocol::encode(&text).is_err() {
            return self.reject(id, ChatError::TooLong).await;
        }

        let mut router = self.router();
        let delivered = router.deliver_private(id, recipient, &text).await?;
        if delivered && recipient != id {
            router
                .reply(
                    id,
                    &Message::server(format!("Message sent to {recipient_name}.")),
                )
                .await?;
        }
        Ok(())
    }

    /// Tell one client what was wrong with its last message.
    async fn reject(&mut self, id: ConnectionId, err: ChatError) -> Result<(), ServerError> {
        debug!("Rejecting message from {}: {}", id, err);
        self.router().reply(id, &err.into()).await?;
        Ok(())
    }

    /// Registration confirmation with the list of active users
    fn roster(&self, me: ConnectionId) -> String {
        let mut out = String::from("Registered!\nCurrently active users:\n");
        let snapshot = self.registry.registered_snapshot();
        let total = snapshot.len();
        for (listed, (id, name)) in snapshot.into_iter().enumerate() {
            if out.len() > ROSTER_BUDGET {
                let _ = writeln!(out, " - and {} more", total - listed);
                break;
            }
            let you = if id == me { " (you)" } else { "" };
            let _ = writeln!(out, " - {name}{you}");
        }
        let _ = write!(
            out,
            "To send a message to someone, type \"<username> <your message>\"\n\
             To send a message to everyone, type \"{BROADCAST_TOKEN} <your message>\"\n\
             Happy chatting!"
        );
        out
    }
}

/// Indent every line of a chat message by two spaces
fn indent(body: &str) -> String {
    body.split('\n')
        .map(|line| format!("  {line}"))
        .collect::<Vec<_>>()
        .join("\n")
}
