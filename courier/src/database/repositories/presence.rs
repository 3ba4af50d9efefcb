//! Shared presence rows in `presence_connection`.
//!
//! Every gateway process points at the same table; deletes use `RETURNING`
//! so exactly one caller observes the removal of a given connection, and the
//! remaining-row count is read in the same write transaction.

use async_trait::async_trait;
use sqlx::{SqliteConnection, SqlitePool};

use crate::Result;
use crate::database::models::PresenceConnectionDbModel;
use crate::database::retry::retry_on_sqlite_busy;
use crate::presence::{PresenceStore, Removal};

pub struct SqlxPresenceStore {
    pool: SqlitePool,
}

impl SqlxPresenceStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn count_rows(conn: &mut SqliteConnection, user: &str) -> Result<i64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM presence_connection WHERE user_id = ?")
                .bind(user)
                .fetch_one(&mut *conn)
                .await?;
        Ok(count)
    }
}

#[async_trait]
impl PresenceStore for SqlxPresenceStore {
    async fn upsert(&self, connection: &PresenceConnectionDbModel) -> Result<bool> {
        retry_on_sqlite_busy("upsert_presence", || async {
            let mut tx = self.pool.begin().await?;
            sqlx::query(
                r#"
                INSERT INTO presence_connection
                    (connection_id, user_id, node_id, connected_at, last_seen_at, expires_at)
                VALUES (?, ?, ?, ?, ?, ?)
                ON CONFLICT(connection_id) DO UPDATE SET
                    user_id = excluded.user_id,
                    node_id = excluded.node_id,
                    last_seen_at = excluded.last_seen_at,
                    expires_at = excluded.expires_at
                "#,
            )
            .bind(&connection.connection_id)
            .bind(&connection.user_id)
            .bind(&connection.node_id)
            .bind(connection.connected_at)
            .bind(connection.last_seen_at)
            .bind(connection.expires_at)
            .execute(&mut *tx)
            .await?;
            let rows = Self::count_rows(&mut *tx, &connection.user_id).await?;
            tx.commit().await?;
            Ok(rows == 1)
        })
        .await
    }

    async fn touch(
        &self,
        connection_id: &str,
        now_ms: i64,
        expires_at: i64,
    ) -> Result<Option<String>> {
        let row: Option<(String,)> = retry_on_sqlite_busy("touch_presence", || async {
            let row: Option<(String,)> = sqlx::query_as(
                r#"
                UPDATE presence_connection
                SET last_seen_at = ?, expires_at = ?
                WHERE connection_id = ? AND expires_at > ?
                RETURNING user_id
                "#,
            )
            .bind(now_ms)
            .bind(expires_at)
            .bind(connection_id)
            .bind(now_ms)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        })
        .await?;
        Ok(row.map(|(user,)| user))
    }

    async fn owner_of(&self, connection_id: &str) -> Result<Option<String>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT user_id FROM presence_connection WHERE connection_id = ?")
                .bind(connection_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(user,)| user))
    }

    async fn remove(&self, connection_id: &str) -> Result<Option<Removal>> {
        retry_on_sqlite_busy("remove_presence", || async {
            let mut tx = self.pool.begin().await?;
            let row: Option<(String,)> = sqlx::query_as(
                "DELETE FROM presence_connection WHERE connection_id = ? RETURNING user_id",
            )
            .bind(connection_id)
            .fetch_optional(&mut *tx)
            .await?;
            let removal = match row {
                Some((user_id,)) => Some(Removal {
                    last: Self::count_rows(&mut *tx, &user_id).await? == 0,
                    user_id,
                }),
                None => None,
            };
            tx.commit().await?;
            Ok(removal)
        })
        .await
    }

    async fn expired(&self, now_ms: i64) -> Result<Vec<PresenceConnectionDbModel>> {
        let rows = sqlx::query_as::<_, PresenceConnectionDbModel>(
            "SELECT * FROM presence_connection WHERE expires_at <= ? ORDER BY user_id",
        )
        .bind(now_ms)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn remove_expired(&self, connection_id: &str, now_ms: i64) -> Result<Option<Removal>> {
        retry_on_sqlite_busy("sweep_presence", || async {
            let mut tx = self.pool.begin().await?;
            let row: Option<(String,)> = sqlx::query_as(
                r#"
                DELETE FROM presence_connection
                WHERE connection_id = ? AND expires_at <= ?
                RETURNING user_id
                "#,
            )
            .bind(connection_id)
            .bind(now_ms)
            .fetch_optional(&mut *tx)
            .await?;
            let removal = match row {
                Some((user_id,)) => Some(Removal {
                    last: Self::count_rows(&mut *tx, &user_id).await? == 0,
                    user_id,
                }),
                None => None,
            };
            tx.commit().await?;
            Ok(removal)
        })
        .await
    }

    async fn is_online(&self, user: &str, now_ms: i64) -> Result<bool> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT 1 FROM presence_connection WHERE user_id = ? AND expires_at > ? LIMIT 1",
        )
        .bind(user)
        .bind(now_ms)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    async fn online_users(&self, now_ms: i64) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT DISTINCT user_id FROM presence_connection WHERE expires_at > ? ORDER BY user_id",
        )
        .bind(now_ms)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(user,)| user).collect())
    }

    async fn clear_node(&self, node_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM presence_connection WHERE node_id = ?")
            .bind(node_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
