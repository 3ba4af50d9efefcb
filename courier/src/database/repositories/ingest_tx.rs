//! Transactional writes for event ingestion.
//!
//! These operate on an existing connection or transaction and never commit;
//! the caller decides the transaction boundary. Ingest writes the event, its
//! notifications and any suppression records together so a failure leaves
//! nothing behind.

use sqlx::SqliteConnection;

use crate::Result;
use crate::database::models::{DeliveryRecordDbModel, EventDbModel, NotificationDbModel};

pub struct IngestTxOps;

impl IngestTxOps {
    /// Insert an event. Returns `false` when an event with the same id was
    /// already ingested.
    pub async fn insert_event(tx: &mut SqliteConnection, event: &EventDbModel) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO event (id, event_type, actor, subjects, priority, payload, occurred_at, ingested_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(&event.id)
        .bind(&event.event_type)
        .bind(&event.actor)
        .bind(&event.subjects)
        .bind(&event.priority)
        .bind(&event.payload)
        .bind(event.occurred_at)
        .bind(event.ingested_at)
        .execute(tx)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn insert_notification(
        tx: &mut SqliteConnection,
        n: &NotificationDbModel,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO notification (
                id, event_id, recipient, trigger_type, channel, priority, payload, status,
                attempts, max_attempts, next_attempt_at, lease_token, lease_expires_at,
                last_error, expires_at, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&n.id)
        .bind(&n.event_id)
        .bind(&n.recipient)
        .bind(&n.trigger_type)
        .bind(&n.channel)
        .bind(n.priority)
        .bind(&n.payload)
        .bind(&n.status)
        .bind(n.attempts)
        .bind(n.max_attempts)
        .bind(n.next_attempt_at)
        .bind(&n.lease_token)
        .bind(n.lease_expires_at)
        .bind(&n.last_error)
        .bind(n.expires_at)
        .bind(n.created_at)
        .bind(n.updated_at)
        .execute(tx)
        .await?;
        Ok(())
    }

    pub async fn append_record(
        tx: &mut SqliteConnection,
        record: &DeliveryRecordDbModel,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO delivery_record (
                id, notification_id, event_id, recipient, channel, trigger_type,
                attempt_no, outcome, provider_response, cost, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.id)
        .bind(&record.notification_id)
        .bind(&record.event_id)
        .bind(&record.recipient)
        .bind(&record.channel)
        .bind(&record.trigger_type)
        .bind(record.attempt_no)
        .bind(&record.outcome)
        .bind(&record.provider_response)
        .bind(record.cost)
        .bind(record.created_at)
        .execute(tx)
        .await?;
        Ok(())
    }
}
