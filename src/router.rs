//! Message routing
//!
//! Broadcast and private delivery on top of the registry. A send that finds
//! the peer gone never aborts the operation in progress: failed handles are
//! collected, and only once the pass is over are they removed and their
//! departure announced.

use std::collections::VecDeque;

use tracing::{debug, info, warn};

use crate::error::{ServerError, TransportError};
use crate::protocol::{self, Message};
use crate::registry::ClientRegistry;
use crate::transport::Transport;
use crate::types::{ConnectionId, Username};

/// Where routed frames go
///
/// Implemented by [`Transport`]; tests substitute an in-memory outbox.
#[allow(async_fn_in_trait)]
pub trait Outbox {
    /// Send one encoded frame. `Ok(false)` means the peer is gone.
    async fn deliver(&mut self, id: ConnectionId, frame: &[u8]) -> Result<bool, TransportError>;

    /// Release the connection behind `id`.
    fn drop_connection(&mut self, id: ConnectionId);
}

impl Outbox for Transport {
    async fn deliver(&mut self, id: ConnectionId, frame: &[u8]) -> Result<bool, TransportError> {
        self.send(id, frame).await
    }

    fn drop_connection(&mut self, id: ConnectionId) {
        self.close(id);
    }
}

/// Departure notice shown to the remaining clients
pub fn departure_notice(username: &Username, unexpected: bool) -> String {
    if unexpected {
        format!("{username} has been disconnected.")
    } else {
        format!("{username} has left.")
    }
}

/// Routes messages between registered clients
pub struct Router<'a, O: Outbox> {
    registry: &'a mut ClientRegistry,
    outbox: &'a mut O,
}

impl<'a, O: Outbox> Router<'a, O> {
    pub fn new(registry: &'a mut ClientRegistry, outbox: &'a mut O) -> Self {
        Self { registry, outbox }
    }

    /// Send to one client, removing it if the peer is gone.
    ///
    /// Returns whether the message was delivered. Handles that are no longer
    /// live are skipped.
    pub async fn reply(&mut self, to: ConnectionId, message: &Message) -> Result<bool, ServerError> {
        if !self.registry.contains(to) {
            debug!("Skipping send to departed connection {}", to);
            return Ok(false);
        }
        let frame = protocol::encode(message)?;
        if self.outbox.deliver(to, &frame).await? {
            return Ok(true);
        }
        self.depart(VecDeque::from([(to, true)])).await?;
        Ok(false)
    }

    /// Send to a client nobody has been told about yet.
    ///
    /// Like [`reply`](Self::reply), but a peer found gone is removed without
    /// a departure notice.
    pub async fn reply_unannounced(
        &mut self,
        to: ConnectionId,
        message: &Message,
    ) -> Result<bool, ServerError> {
        if !self.registry.contains(to) {
            return Ok(false);
        }
        let frame = protocol::encode(message)?;
        if self.outbox.deliver(to, &frame).await? {
            return Ok(true);
        }
        debug!("Connection {} went away before it was introduced", to);
        self.forget(to)?;
        Ok(false)
    }

    /// Deliver to every registered client except `sender`.
    pub async fn broadcast_except(
        &mut self,
        sender: ConnectionId,
        message: &Message,
    ) -> Result<(), ServerError> {
        let failed = self.fan_out(sender, message).await?;
        self.depart(failed.into_iter().map(|id| (id, true)).collect())
            .await
    }

    /// Deliver to exactly one recipient, which may be the sender itself.
    pub async fn deliver_private(
        &mut self,
        sender: ConnectionId,
        recipient: ConnectionId,
        message: &Message,
    ) -> Result<bool, ServerError> {
        if sender == recipient {
            debug!("Connection {} left itself a note", sender);
        } else {
            debug!("Private message {} -> {}", sender, recipient);
        }
        self.reply(recipient, message).await
    }

    /// Remove a client, telling the others if they knew about it.
    pub async fn announce_departure(
        &mut self,
        id: ConnectionId,
        unexpected: bool,
    ) -> Result<(), ServerError> {
        self.depart(VecDeque::from([(id, unexpected)])).await
    }

    /// Say goodbye to every live connection and drop them all.
    pub async fn shutdown(&mut self, notice: &Message) -> Result<(), ServerError> {
        let notice = protocol::encode(notice)?;
        let goodbye = protocol::encode(&Message::Disconnect)?;

        for id in self.registry.live() {
            match self.outbox.deliver(id, &notice).await {
                Ok(true) => {
                    if let Err(e) = self.outbox.deliver(id, &goodbye).await {
                        warn!("Failed to say goodbye to {}: {}", id, e);
                    }
                }
                Ok(false) => {}
                Err(e) => warn!("Failed to send closing notice to {}: {}", id, e),
            }
            self.forget(id)?;
        }
        Ok(())
    }

    fn forget(&mut self, id: ConnectionId) -> Result<(), ServerError> {
        self.registry.remove(id)?;
        self.outbox.drop_connection(id);
        Ok(())
    }

    /// Send one frame to every registered client but `except`, returning the
    /// handles whose peer turned out to be gone.
    async fn fan_out(
        &mut self,
        except: ConnectionId,
        message: &Message,
    ) -> Result<Vec<ConnectionId>, ServerError> {
        let frame = protocol::encode(message)?;
        let recipients: Vec<ConnectionId> = self
            .registry
            .registered_snapshot()
            .into_iter()
            .map(|(id, _)| id)
            .filter(|id| *id != except)
            .collect();

        let mut failed = Vec::new();
        for id in recipients {
            if !self.outbox.deliver(id, &frame).await? {
                failed.push(id);
            }
        }
        Ok(failed)
    }

    /// Work through departures one at a time. Announcing a departure can
    /// expose further dead peers; they join the queue. A handle already
    /// removed is skipped, so each client is announced at most once.
    async fn depart(&mut self, mut queue: VecDeque<(ConnectionId, bool)>) -> Result<(), ServerError> {
        while let Some((id, unexpected)) = queue.pop_front() {
            if !self.registry.contains(id) {
                continue;
            }

            if let Some(username) = self.registry.username_of(id).cloned() {
                let notice = Message::server(departure_notice(&username, unexpected));
                let failed = self.fan_out(id, &notice).await?;
                queue.extend(failed.into_iter().map(|f| (f, true)));
                info!(
                    "{} ({}) {}",
                    username,
                    id,
                    if unexpected { "disconnected" } else { "left" }
                );
            } else {
                debug!("Unregistered connection {} went away", id);
            }

            self.forget(id)?;
            debug!("Registered clients: {}", self.registry.registered_count());
        }
        Ok(())
    }
}
