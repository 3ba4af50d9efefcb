//! Cross-process presence store.

use std::collections::BTreeSet;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::Result;
use crate::database::models::PresenceConnectionDbModel;

/// What a removal left behind for the connection's user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Removal {
    pub user_id: String,
    /// No row of any expiry remains for the user.
    pub last: bool,
}

/// Shared record of live connections, TTL-backed.
///
/// A user is online iff at least one of their connection rows has not
/// expired. Writes are last-writer-wins per connection id. Membership
/// changes report whether they created the user's first row or removed the
/// last one, atomically with the write, so exactly one caller sees each flip.
#[async_trait]
pub trait PresenceStore: Send + Sync {
    /// Insert or replace a connection. Returns `true` when the user had no
    /// other row.
    async fn upsert(&self, connection: &PresenceConnectionDbModel) -> Result<bool>;

    /// Extend a connection's TTL. Returns the owning user, or `None` when the
    /// connection is unknown or has already expired.
    async fn touch(&self, connection_id: &str, now_ms: i64, expires_at: i64)
    -> Result<Option<String>>;

    async fn owner_of(&self, connection_id: &str) -> Result<Option<String>>;

    /// Remove a connection. Only the caller that actually removed the row
    /// gets a [`Removal`].
    async fn remove(&self, connection_id: &str) -> Result<Option<Removal>>;

    /// Rows expired at `now_ms`, without removing them.
    async fn expired(&self, now_ms: i64) -> Result<Vec<PresenceConnectionDbModel>>;

    /// Remove a connection only if it is still expired at `now_ms`.
    async fn remove_expired(&self, connection_id: &str, now_ms: i64) -> Result<Option<Removal>>;

    async fn is_online(&self, user: &str, now_ms: i64) -> Result<bool>;

    async fn online_users(&self, now_ms: i64) -> Result<Vec<String>>;

    /// Drop every row owned by `node_id`, e.g. after a gateway restart.
    async fn clear_node(&self, node_id: &str) -> Result<u64>;
}

/// Single-process store for embedding and tests.
///
/// Flip reporting is exact only while callers serialize per user, as
/// [`super::PresenceService`] does.
#[derive(Debug, Default)]
pub struct MemoryPresenceStore {
    connections: DashMap<String, PresenceConnectionDbModel>,
}

impl MemoryPresenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn has_rows(&self, user: &str) -> bool {
        self.connections.iter().any(|row| row.user_id == user)
    }

    fn removal(&self, row: PresenceConnectionDbModel) -> Removal {
        Removal {
            last: !self.has_rows(&row.user_id),
            user_id: row.user_id,
        }
    }
}

#[async_trait]
impl PresenceStore for MemoryPresenceStore {
    async fn upsert(&self, connection: &PresenceConnectionDbModel) -> Result<bool> {
        let first = !self.connections.iter().any(|row| {
            row.user_id == connection.user_id && row.connection_id != connection.connection_id
        });
        self.connections
            .insert(connection.connection_id.clone(), connection.clone());
        Ok(first)
    }

    async fn touch(
        &self,
        connection_id: &str,
        now_ms: i64,
        expires_at: i64,
    ) -> Result<Option<String>> {
        Ok(self.connections.get_mut(connection_id).and_then(|mut row| {
            if row.expires_at <= now_ms {
                return None;
            }
            row.last_seen_at = now_ms;
            row.expires_at = expires_at;
            Some(row.user_id.clone())
        }))
    }

    async fn owner_of(&self, connection_id: &str) -> Result<Option<String>> {
        Ok(self
            .connections
            .get(connection_id)
            .map(|row| row.user_id.clone()))
    }

    async fn remove(&self, connection_id: &str) -> Result<Option<Removal>> {
        Ok(self
            .connections
            .remove(connection_id)
            .map(|(_, row)| self.removal(row)))
    }

    async fn expired(&self, now_ms: i64) -> Result<Vec<PresenceConnectionDbModel>> {
        Ok(self
            .connections
            .iter()
            .filter(|row| row.expires_at <= now_ms)
            .map(|row| row.value().clone())
            .collect())
    }

    async fn remove_expired(&self, connection_id: &str, now_ms: i64) -> Result<Option<Removal>> {
        Ok(self
            .connections
            .remove_if(connection_id, |_, row| row.expires_at <= now_ms)
            .map(|(_, row)| self.removal(row)))
    }

    async fn is_online(&self, user: &str, now_ms: i64) -> Result<bool> {
        Ok(self
            .connections
            .iter()
            .any(|row| row.user_id == user && row.expires_at > now_ms))
    }

    async fn online_users(&self, now_ms: i64) -> Result<Vec<String>> {
        let users: BTreeSet<String> = self
            .connections
            .iter()
            .filter(|row| row.expires_at > now_ms)
            .map(|row| row.user_id.clone())
            .collect();
        Ok(users.into_iter().collect())
    }

    async fn clear_node(&self, node_id: &str) -> Result<u64> {
        let before = self.connections.len();
        self.connections.retain(|_, row| row.node_id != node_id);
        Ok((before - self.connections.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(conn: &str, user: &str, expires_at: i64) -> PresenceConnectionDbModel {
        PresenceConnectionDbModel {
            connection_id: conn.into(),
            user_id: user.into(),
            node_id: "node-a".into(),
            connected_at: 0,
            last_seen_at: 0,
            expires_at,
        }
    }

    #[tokio::test]
    async fn test_expired_rows_are_removed_once() {
        let store = MemoryPresenceStore::new();
        assert!(store.upsert(&row("c1", "bob", 100)).await.unwrap());
        assert!(!store.upsert(&row("c2", "bob", 500)).await.unwrap());

        let expired = store.expired(100).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(
            store.remove_expired("c1", 100).await.unwrap(),
            Some(Removal { user_id: "bob".into(), last: false })
        );
        assert_eq!(store.remove_expired("c1", 100).await.unwrap(), None);
        // Not expired yet.
        assert_eq!(store.remove_expired("c2", 100).await.unwrap(), None);
        assert!(store.is_online("bob", 100).await.unwrap());
        assert!(!store.is_online("bob", 500).await.unwrap());
    }

    #[tokio::test]
    async fn test_touch_refuses_expired_rows() {
        let store = MemoryPresenceStore::new();
        store.upsert(&row("c1", "bob", 100)).await.unwrap();
        assert_eq!(store.touch("c1", 50, 200).await.unwrap().as_deref(), Some("bob"));
        assert_eq!(store.touch("c1", 250, 400).await.unwrap(), None);
        assert_eq!(
            store.remove("c1").await.unwrap(),
            Some(Removal { user_id: "bob".into(), last: true })
        );
        assert_eq!(store.remove("c1").await.unwrap(), None);
    }
}
