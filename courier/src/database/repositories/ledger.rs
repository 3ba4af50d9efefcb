//! Delivery ledger repository.
//!
//! Append-only: there is no update or delete apart from retention pruning.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::Result;
use crate::database::models::{DeliveryOutcome, DeliveryRecordDbModel};
use crate::database::retry::retry_on_sqlite_busy;
use crate::domain::Channel;

#[async_trait]
pub trait DeliveryLedger: Send + Sync {
    async fn append(&self, record: &DeliveryRecordDbModel) -> Result<()>;
    async fn list_for_notification(&self, notification_id: &str)
    -> Result<Vec<DeliveryRecordDbModel>>;
    async fn list_for_event(&self, event_id: &str) -> Result<Vec<DeliveryRecordDbModel>>;
    async fn list_for_recipient(
        &self,
        recipient: &str,
        limit: i64,
    ) -> Result<Vec<DeliveryRecordDbModel>>;

    /// Total cost of successful sends on `channel` since `since_ms`.
    async fn spend_since(&self, channel: Channel, since_ms: i64) -> Result<f64>;

    async fn count_outcome_since(
        &self,
        recipient: &str,
        channel: Channel,
        outcome: DeliveryOutcome,
        since_ms: i64,
    ) -> Result<u64>;

    /// Delete records older than `before_ms`. Returns the number removed.
    async fn prune_before(&self, before_ms: i64) -> Result<u64>;
}

pub struct SqlxDeliveryLedger {
    pool: SqlitePool,
}

impl SqlxDeliveryLedger {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DeliveryLedger for SqlxDeliveryLedger {
    async fn append(&self, record: &DeliveryRecordDbModel) -> Result<()> {
        retry_on_sqlite_busy("append_delivery_record", || async {
            let mut conn = self.pool.acquire().await?;
            super::IngestTxOps::append_record(&mut conn, record).await
        })
        .await
    }

    async fn list_for_notification(
        &self,
        notification_id: &str,
    ) -> Result<Vec<DeliveryRecordDbModel>> {
        let rows = sqlx::query_as::<_, DeliveryRecordDbModel>(
            "SELECT * FROM delivery_record WHERE notification_id = ? ORDER BY created_at, attempt_no",
        )
        .bind(notification_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn list_for_event(&self, event_id: &str) -> Result<Vec<DeliveryRecordDbModel>> {
        let rows = sqlx::query_as::<_, DeliveryRecordDbModel>(
            "SELECT * FROM delivery_record WHERE event_id = ? ORDER BY created_at, recipient",
        )
        .bind(event_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn list_for_recipient(
        &self,
        recipient: &str,
        limit: i64,
    ) -> Result<Vec<DeliveryRecordDbModel>> {
        let rows = sqlx::query_as::<_, DeliveryRecordDbModel>(
            "SELECT * FROM delivery_record WHERE recipient = ? ORDER BY created_at DESC LIMIT ?",
        )
        .bind(recipient)
        .bind(limit.max(1))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn spend_since(&self, channel: Channel, since_ms: i64) -> Result<f64> {
        let (total,): (Option<f64>,) = sqlx::query_as(
            "SELECT SUM(cost) FROM delivery_record WHERE channel = ? AND outcome = 'sent' AND created_at >= ?",
        )
        .bind(channel.as_str())
        .bind(since_ms)
        .fetch_one(&self.pool)
        .await?;
        Ok(total.unwrap_or(0.0))
    }

    async fn count_outcome_since(
        &self,
        recipient: &str,
        channel: Channel,
        outcome: DeliveryOutcome,
        since_ms: i64,
    ) -> Result<u64> {
        let (count,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM delivery_record
            WHERE recipient = ? AND channel = ? AND outcome = ? AND created_at >= ?
            "#,
        )
        .bind(recipient)
        .bind(channel.as_str())
        .bind(outcome.as_str())
        .bind(since_ms)
        .fetch_one(&self.pool)
        .await?;
        Ok(count.max(0) as u64)
    }

    async fn prune_before(&self, before_ms: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM delivery_record WHERE created_at < ?")
            .bind(before_ms)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
