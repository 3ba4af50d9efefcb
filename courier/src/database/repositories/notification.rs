//! Notification queue repository.
//!
//! Leasing is a single `UPDATE ... WHERE id IN (SELECT ...) RETURNING *`
//! statement. SQLite serializes writers, so two workers can never flip the
//! same row to `sending`; each lease call stamps its rows with a fresh token
//! and every later transition must present that token.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::SqlitePool;
use tracing::debug;

use crate::database::models::{
    NotificationDbModel, NotificationStatus, NotificationStatusView, QueueStats,
};
use crate::database::retry::retry_on_sqlite_busy;
use crate::database::time::offset_ms;
use crate::domain::Channel;
use crate::{Error, Result};

/// Durable, leasable work queue of per-channel notifications.
#[async_trait]
pub trait NotificationRepository: Send + Sync {
    async fn enqueue(&self, notification: &NotificationDbModel) -> Result<()>;

    /// Claim up to `batch_size` due notifications for `channel`.
    ///
    /// A claimed row is invisible to other leases until it is acked, nacked,
    /// failed, deferred, or `lease_for` elapses. Each claim consumes an attempt.
    async fn lease(
        &self,
        channel: Channel,
        batch_size: u32,
        lease_for: Duration,
        now_ms: i64,
    ) -> Result<Vec<NotificationDbModel>>;

    /// Extend a lease that is still held and unexpired to `until_ms`.
    ///
    /// Fails with `LeaseExpired` once the lease has lapsed, even if no other
    /// worker has claimed the row yet.
    async fn renew(&self, id: &str, lease_token: &str, until_ms: i64, now_ms: i64) -> Result<()>;

    /// Mark a leased notification sent.
    async fn ack(&self, id: &str, lease_token: &str, now_ms: i64) -> Result<()>;

    /// Hand a leased notification back for a retry at `retry_at_ms`.
    ///
    /// Returns the resulting status: `Pending`, or `Failed` when no attempts
    /// remain.
    async fn nack(
        &self,
        id: &str,
        lease_token: &str,
        retry_at_ms: i64,
        error: &str,
        now_ms: i64,
    ) -> Result<NotificationStatus>;

    /// Permanently fail a leased notification.
    async fn fail(&self, id: &str, lease_token: &str, error: &str, now_ms: i64) -> Result<()>;

    /// Hand a leased notification back without consuming its attempt.
    async fn defer(
        &self,
        id: &str,
        lease_token: &str,
        until_ms: i64,
        reason: &str,
        now_ms: i64,
    ) -> Result<()>;

    /// Withdraw a notification that has not been leased yet.
    async fn cancel(&self, id: &str, now_ms: i64) -> Result<()>;

    /// Put a failed, expired or cancelled notification back in the queue with
    /// a fresh attempt budget.
    async fn requeue(&self, id: &str, now_ms: i64) -> Result<()>;

    async fn get(&self, id: &str) -> Result<NotificationDbModel>;
    async fn get_status(&self, id: &str) -> Result<NotificationStatusView>;
    async fn list_for_event(&self, event_id: &str) -> Result<Vec<NotificationDbModel>>;

    /// Notifications counting towards a recipient's rate ceiling since `since_ms`.
    async fn count_toward_rate(&self, recipient: &str, channel: Channel, since_ms: i64)
    -> Result<u64>;

    async fn stats(&self) -> Result<QueueStats>;

    /// Mark undelivered notifications past their TTL as expired.
    async fn expire_stale(&self, now_ms: i64) -> Result<u64>;

    /// Fail notifications whose lease lapsed with no attempts left.
    async fn fail_exhausted_leases(&self, now_ms: i64) -> Result<u64>;
}

/// SQLx implementation of NotificationRepository.
pub struct SqlxNotificationRepository {
    pool: SqlitePool,
}

impl SqlxNotificationRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Decide between NotFound and a state error after a guarded update hit no rows.
    async fn transition_error(&self, id: &str, to: NotificationStatus) -> Error {
        match self.get(id).await {
            Ok(row) => Error::invalid_transition(row.status, to),
            Err(e) => e,
        }
    }
}

#[async_trait]
impl NotificationRepository for SqlxNotificationRepository {
    async fn enqueue(&self, notification: &NotificationDbModel) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        super::IngestTxOps::insert_notification(&mut conn, notification).await
    }

    async fn lease(
        &self,
        channel: Channel,
        batch_size: u32,
        lease_for: Duration,
        now_ms: i64,
    ) -> Result<Vec<NotificationDbModel>> {
        if batch_size == 0 {
            return Ok(Vec::new());
        }
        let token = uuid::Uuid::new_v4().to_string();
        let lease_expires_at = offset_ms(now_ms, lease_for);

        let rows = retry_on_sqlite_busy("lease_notifications", || async {
            let rows = sqlx::query_as::<_, NotificationDbModel>(
                r#"
                UPDATE notification
                SET status = 'sending',
                    lease_token = ?,
                    lease_expires_at = ?,
                    attempts = attempts + 1,
                    updated_at = ?
                WHERE id IN (
                    SELECT id FROM notification
                    WHERE channel = ?
                      AND attempts < max_attempts
                      AND (
                        (status = 'pending' AND next_attempt_at <= ?)
                        OR (status = 'sending' AND lease_expires_at <= ?)
                      )
                      AND (expires_at IS NULL OR expires_at > ?)
                    ORDER BY priority DESC, next_attempt_at ASC, created_at ASC
                    LIMIT ?
                )
                RETURNING *
                "#,
            )
            .bind(&token)
            .bind(lease_expires_at)
            .bind(now_ms)
            .bind(channel.as_str())
            .bind(now_ms)
            .bind(now_ms)
            .bind(now_ms)
            .bind(i64::from(batch_size))
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        })
        .await?;

        if !rows.is_empty() {
            debug!(channel = %channel, count = rows.len(), "Leased notifications");
        }
        Ok(rows)
    }

    async fn renew(&self, id: &str, lease_token: &str, until_ms: i64, now_ms: i64) -> Result<()> {
        let result = retry_on_sqlite_busy("renew_lease", || async {
            Ok(sqlx::query(
                r#"
                UPDATE notification
                SET lease_expires_at = ?, updated_at = ?
                WHERE id = ? AND status = 'sending' AND lease_token = ?
                  AND lease_expires_at > ?
                "#,
            )
            .bind(until_ms)
            .bind(now_ms)
            .bind(id)
            .bind(lease_token)
            .bind(now_ms)
            .execute(&self.pool)
            .await?)
        })
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::lease_expired(id));
        }
        Ok(())
    }

    async fn ack(&self, id: &str, lease_token: &str, now_ms: i64) -> Result<()> {
        let result = retry_on_sqlite_busy("ack_notification", || async {
            Ok(sqlx::query(
                r#"
                UPDATE notification
                SET status = 'sent', lease_token = NULL, lease_expires_at = NULL,
                    last_error = NULL, updated_at = ?
                WHERE id = ? AND status = 'sending' AND lease_token = ?
                "#,
            )
            .bind(now_ms)
            .bind(id)
            .bind(lease_token)
            .execute(&self.pool)
            .await?)
        })
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::lease_expired(id));
        }
        Ok(())
    }

    async fn nack(
        &self,
        id: &str,
        lease_token: &str,
        retry_at_ms: i64,
        error: &str,
        now_ms: i64,
    ) -> Result<NotificationStatus> {
        let status: Option<(String,)> = retry_on_sqlite_busy("nack_notification", || async {
            Ok(sqlx::query_as(
                r#"
                UPDATE notification
                SET status = CASE WHEN attempts >= max_attempts THEN 'failed' ELSE 'pending' END,
                    next_attempt_at = ?, lease_token = NULL, lease_expires_at = NULL,
                    last_error = ?, updated_at = ?
                WHERE id = ? AND status = 'sending' AND lease_token = ?
                RETURNING status
                "#,
            )
            .bind(retry_at_ms)
            .bind(error)
            .bind(now_ms)
            .bind(id)
            .bind(lease_token)
            .fetch_optional(&self.pool)
            .await?)
        })
        .await?;

        let (status,) = status.ok_or_else(|| Error::lease_expired(id))?;
        NotificationStatus::parse(&status)
            .ok_or_else(|| Error::Database(format!("unknown notification status '{status}'")))
    }

    async fn fail(&self, id: &str, lease_token: &str, error: &str, now_ms: i64) -> Result<()> {
        let result = retry_on_sqlite_busy("fail_notification", || async {
            Ok(sqlx::query(
                r#"
                UPDATE notification
                SET status = 'failed', lease_token = NULL, lease_expires_at = NULL,
                    last_error = ?, updated_at = ?
                WHERE id = ? AND status = 'sending' AND lease_token = ?
                "#,
            )
            .bind(error)
            .bind(now_ms)
            .bind(id)
            .bind(lease_token)
            .execute(&self.pool)
            .await?)
        })
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::lease_expired(id));
        }
        Ok(())
    }

    async fn defer(
        &self,
        id: &str,
        lease_token: &str,
        until_ms: i64,
        reason: &str,
        now_ms: i64,
    ) -> Result<()> {
        let result = retry_on_sqlite_busy("defer_notification", || async {
            Ok(sqlx::query(
                r#"
                UPDATE notification
                SET status = 'pending', attempts = MAX(attempts - 1, 0),
                    next_attempt_at = ?, lease_token = NULL, lease_expires_at = NULL,
                    last_error = ?, updated_at = ?
                WHERE id = ? AND status = 'sending' AND lease_token = ?
                "#,
            )
            .bind(until_ms)
            .bind(reason)
            .bind(now_ms)
            .bind(id)
            .bind(lease_token)
            .execute(&self.pool)
            .await?)
        })
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::lease_expired(id));
        }
        Ok(())
    }

    async fn cancel(&self, id: &str, now_ms: i64) -> Result<()> {
        let result = sqlx::query(
            "UPDATE notification SET status = 'cancelled', updated_at = ? WHERE id = ? AND status = 'pending'",
        )
        .bind(now_ms)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self
                .transition_error(id, NotificationStatus::Cancelled)
                .await);
        }
        Ok(())
    }

    async fn requeue(&self, id: &str, now_ms: i64) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE notification
            SET status = 'pending', attempts = 0, next_attempt_at = ?,
                lease_token = NULL, lease_expires_at = NULL, last_error = NULL,
                expires_at = NULL, updated_at = ?
            WHERE id = ? AND status IN ('failed', 'expired', 'cancelled')
            "#,
        )
        .bind(now_ms)
        .bind(now_ms)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self
                .transition_error(id, NotificationStatus::Pending)
                .await);
        }
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<NotificationDbModel> {
        sqlx::query_as::<_, NotificationDbModel>("SELECT * FROM notification WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("Notification", id))
    }

    async fn get_status(&self, id: &str) -> Result<NotificationStatusView> {
        sqlx::query_as::<_, NotificationStatusView>(
            r#"
            SELECT id, recipient, channel, trigger_type, status, attempts, max_attempts,
                   next_attempt_at, last_error, updated_at
            FROM notification WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| Error::not_found("Notification", id))
    }

    async fn list_for_event(&self, event_id: &str) -> Result<Vec<NotificationDbModel>> {
        let rows = sqlx::query_as::<_, NotificationDbModel>(
            "SELECT * FROM notification WHERE event_id = ? ORDER BY recipient, channel",
        )
        .bind(event_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn count_toward_rate(
        &self,
        recipient: &str,
        channel: Channel,
        since_ms: i64,
    ) -> Result<u64> {
        let (count,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM notification
            WHERE recipient = ? AND channel = ? AND created_at >= ?
              AND status IN ('pending', 'sending', 'sent')
            "#,
        )
        .bind(recipient)
        .bind(channel.as_str())
        .bind(since_ms)
        .fetch_one(&self.pool)
        .await?;
        Ok(count.max(0) as u64)
    }

    async fn stats(&self) -> Result<QueueStats> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM notification GROUP BY status")
                .fetch_all(&self.pool)
                .await?;
        let mut stats = QueueStats::default();
        for (status, count) in rows {
            stats.record(&status, count);
        }
        Ok(stats)
    }

    async fn expire_stale(&self, now_ms: i64) -> Result<u64> {
        let result = retry_on_sqlite_busy("expire_notifications", || async {
            Ok(sqlx::query(
                r#"
                UPDATE notification
                SET status = 'expired', lease_token = NULL, lease_expires_at = NULL, updated_at = ?
                WHERE expires_at IS NOT NULL AND expires_at <= ?
                  AND (status = 'pending' OR (status = 'sending' AND lease_expires_at <= ?))
                "#,
            )
            .bind(now_ms)
            .bind(now_ms)
            .bind(now_ms)
            .execute(&self.pool)
            .await?)
        })
        .await?;
        Ok(result.rows_affected())
    }

    async fn fail_exhausted_leases(&self, now_ms: i64) -> Result<u64> {
        let result = retry_on_sqlite_busy("fail_exhausted_leases", || async {
            Ok(sqlx::query(
                r#"
                UPDATE notification
                SET status = 'failed', lease_token = NULL, lease_expires_at = NULL,
                    last_error = COALESCE(last_error, 'lease expired with no attempts left'),
                    updated_at = ?
                WHERE status = 'sending' AND lease_expires_at <= ? AND attempts >= max_attempts
                "#,
            )
            .bind(now_ms)
            .bind(now_ms)
            .execute(&self.pool)
            .await?)
        })
        .await?;
        Ok(result.rows_affected())
    }
}
