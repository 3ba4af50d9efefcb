//! In-process index of live connections.
//!
//! The registry only knows about sockets held by this process; the shared
//! [`super::PresenceStore`] is the authority on who is online.

use std::collections::HashSet;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::events::PresenceEvent;

/// Frames buffered per connection before new ones are dropped.
const DEFAULT_OUTBOX_CAPACITY: usize = 64;

struct ConnectionEntry {
    user: String,
    outbox: mpsc::Sender<PresenceEvent>,
    watching: HashSet<String>,
}

pub struct ConnectionRegistry {
    connections: DashMap<String, ConnectionEntry>,
    by_user: DashMap<String, HashSet<String>>,
    /// watched user -> watching connection ids
    watchers: DashMap<String, HashSet<String>>,
    outbox_capacity: usize,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::with_outbox_capacity(DEFAULT_OUTBOX_CAPACITY)
    }

    pub fn with_outbox_capacity(outbox_capacity: usize) -> Self {
        Self {
            connections: DashMap::new(),
            by_user: DashMap::new(),
            watchers: DashMap::new(),
            outbox_capacity: outbox_capacity.max(1),
        }
    }

    /// Add a connection and return the receiving end of its outbox.
    ///
    /// Re-registering an id replaces the previous entry; its outbox closes.
    pub fn register(&self, user: &str, connection_id: &str) -> mpsc::Receiver<PresenceEvent> {
        self.unregister(connection_id);

        let (tx, rx) = mpsc::channel(self.outbox_capacity);
        self.connections.insert(
            connection_id.to_string(),
            ConnectionEntry {
                user: user.to_string(),
                outbox: tx,
                watching: HashSet::new(),
            },
        );
        self.by_user
            .entry(user.to_string())
            .or_default()
            .insert(connection_id.to_string());
        debug!(user, connection_id, "Connection registered");
        rx
    }

    /// Remove a connection. Returns its user when it was registered here.
    pub fn unregister(&self, connection_id: &str) -> Option<String> {
        let (_, entry) = self.connections.remove(connection_id)?;

        self.by_user.remove_if_mut(&entry.user, |_, conns| {
            conns.remove(connection_id);
            conns.is_empty()
        });
        for target in &entry.watching {
            self.watchers.remove_if_mut(target, |_, conns| {
                conns.remove(connection_id);
                conns.is_empty()
            });
        }
        debug!(user = %entry.user, connection_id, "Connection unregistered");
        Some(entry.user)
    }

    pub fn user_of(&self, connection_id: &str) -> Option<String> {
        self.connections
            .get(connection_id)
            .map(|entry| entry.user.clone())
    }

    pub fn connections_of(&self, user: &str) -> Vec<String> {
        self.by_user
            .get(user)
            .map(|conns| conns.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Whether `user` has a socket on this process.
    pub fn is_connected(&self, user: &str) -> bool {
        self.by_user.get(user).is_some_and(|conns| !conns.is_empty())
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Subscribe a connection to `target`'s presence changes.
    ///
    /// Both indexes are updated under the connection's entry guard, so a
    /// concurrent [`Self::unregister`] sees the watch and clears it.
    pub fn watch(&self, connection_id: &str, target: &str) -> bool {
        let Some(mut entry) = self.connections.get_mut(connection_id) else {
            return false;
        };
        entry.watching.insert(target.to_string());
        self.watchers
            .entry(target.to_string())
            .or_default()
            .insert(connection_id.to_string());
        true
    }

    pub fn unwatch(&self, connection_id: &str, target: &str) {
        if let Some(mut entry) = self.connections.get_mut(connection_id) {
            entry.watching.remove(target);
        }
        self.watchers.remove_if_mut(target, |_, conns| {
            conns.remove(connection_id);
            conns.is_empty()
        });
    }

    pub fn watchers_of(&self, user: &str) -> Vec<String> {
        self.watchers
            .get(user)
            .map(|conns| conns.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Queue a frame on one connection without waiting. A full or closed
    /// outbox drops the frame.
    pub fn send_to_connection(&self, connection_id: &str, event: PresenceEvent) -> bool {
        let Some(entry) = self.connections.get(connection_id) else {
            return false;
        };
        match entry.outbox.try_send(event) {
            Ok(()) => true,
            Err(e) => {
                trace!(connection_id, error = %e, "Dropped frame");
                false
            }
        }
    }

    /// Queue a frame on every connection of `user`; returns how many took it.
    pub fn send_to_user(&self, user: &str, event: &PresenceEvent) -> usize {
        self.connections_of(user)
            .iter()
            .filter(|conn| self.send_to_connection(conn, event.clone()))
            .count()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
