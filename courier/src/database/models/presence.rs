//! Shared presence model.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// One live connection as seen by the shared presence table.
///
/// A user is present iff at least one unexpired row exists for them.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct PresenceConnectionDbModel {
    pub connection_id: String,
    pub user_id: String,
    /// Gateway process holding the socket.
    pub node_id: String,
    pub connected_at: i64,
    pub last_seen_at: i64,
    pub expires_at: i64,
}
