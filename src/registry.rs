//! Client registry
//!
//! Tracks every live connection and, for those that completed registration,
//! the username they chose.

use std::collections::{BTreeSet, HashMap};

use crate::error::RegistryError;
use crate::types::{ConnectionId, Username};

/// Live connections and the usernames of the registered ones
///
/// INVARIANTS:
/// 1. Every entry in `names` and `ids` refers to a handle in `live`.
/// 2. Usernames are unique among registered clients.
/// 3. An unregistered handle has no entry in `names` or `ids`.
///
/// Both maps own their `Username` values; neither borrows from the other.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    live: BTreeSet<ConnectionId>,
    names: HashMap<ConnectionId, Username>,
    ids: HashMap<Username, ConnectionId>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a freshly accepted connection.
    pub fn add_unregistered(&mut self, id: ConnectionId) -> Result<(), RegistryError> {
        if !self.live.insert(id) {
            return Err(RegistryError::AlreadyAdded(id));
        }
        Ok(())
    }

    /// Attach a username to a live, unregistered connection.
    ///
    /// Returns `Ok(false)` without touching anything if the name is taken.
    pub fn register(&mut self, id: ConnectionId, username: Username) -> Result<bool, RegistryError> {
        if !self.live.contains(&id) {
            return Err(RegistryError::UnknownConnection(id));
        }
        if self.names.contains_key(&id) {
            return Err(RegistryError::AlreadyRegistered(id));
        }
        if self.ids.contains_key(&username) {
            return Ok(false);
        }

        self.ids.insert(username.clone(), id);
        self.names.insert(id, username);
        Ok(true)
    }

    pub fn lookup_by_username(&self, username: &str) -> Option<ConnectionId> {
        self.ids.get(username).copied()
    }

    pub fn username_of(&self, id: ConnectionId) -> Option<&Username> {
        self.names.get(&id)
    }

    /// Forget a connection and its registration, if any.
    pub fn remove(&mut self, id: ConnectionId) -> Result<Option<Username>, RegistryError> {
        if !self.live.remove(&id) {
            return Err(RegistryError::UnknownConnection(id));
        }
        let username = self.names.remove(&id);
        if let Some(name) = &username {
            self.ids.remove(name);
        }
        Ok(username)
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.live.contains(&id)
    }

    pub fn is_registered(&self, id: ConnectionId) -> bool {
        self.names.contains_key(&id)
    }

    /// Number of live connections
    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    pub fn registered_count(&self) -> usize {
        self.names.len()
    }

    /// Every live handle, registered or not
    pub fn live(&self) -> Vec<ConnectionId> {
        self.live.iter().copied().collect()
    }

    /// Registered clients as owned pairs, in connection order.
    pub fn registered_snapshot(&self) -> Vec<(ConnectionId, Username)> {
        self.live
            .iter()
            .filter_map(|id| self.names.get(id).map(|name| (*id, name.clone())))
            .collect()
    }
}
