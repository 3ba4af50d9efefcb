//! Event repository (read side; writes go through [`super::IngestTxOps`]).

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::database::models::EventDbModel;
use crate::domain::Event;
use crate::{Error, Result};

#[async_trait]
pub trait EventRepository: Send + Sync {
    async fn get(&self, id: &str) -> Result<Event>;
    async fn exists(&self, id: &str) -> Result<bool>;
    async fn list_recent(&self, limit: i64) -> Result<Vec<Event>>;
    /// Delete events older than `before_ms` that no longer have queued work.
    async fn prune_before(&self, before_ms: i64) -> Result<u64>;
}

pub struct SqlxEventRepository {
    pool: SqlitePool,
}

impl SqlxEventRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EventRepository for SqlxEventRepository {
    async fn get(&self, id: &str) -> Result<Event> {
        sqlx::query_as::<_, EventDbModel>("SELECT * FROM event WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("Event", id))?
            .into_event()
    }

    async fn exists(&self, id: &str) -> Result<bool> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM event WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn list_recent(&self, limit: i64) -> Result<Vec<Event>> {
        let rows = sqlx::query_as::<_, EventDbModel>(
            "SELECT * FROM event ORDER BY ingested_at DESC LIMIT ?",
        )
        .bind(limit.max(1))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(EventDbModel::into_event).collect()
    }

    async fn prune_before(&self, before_ms: i64) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM event
            WHERE ingested_at < ?
              AND NOT EXISTS (
                SELECT 1 FROM notification n
                WHERE n.event_id = event.id AND n.status IN ('pending', 'sending')
              )
            "#,
        )
        .bind(before_ms)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
