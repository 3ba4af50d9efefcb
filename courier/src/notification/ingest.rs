//! Event ingest: validate, resolve, persist in one transaction.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use super::resolver::PreferenceResolver;
use crate::Result;
use crate::database::DbPool;
use crate::database::models::EventDbModel;
use crate::database::repositories::IngestTxOps;
use crate::database::time::datetime_to_ms;
use crate::domain::{Channel, NewEvent};
use crate::utils::SharedClock;
use crate::utils::keyed_lock::KeyedLock;

/// What an accepted event turned into.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestReceipt {
    pub event_id: String,
    /// Notifications a dispatcher will pick up.
    pub queued: Vec<String>,
    pub suppressed: usize,
    /// The id was already ingested; nothing new was written.
    pub duplicate: bool,
}

pub struct EventIngest {
    pool: DbPool,
    resolver: Arc<PreferenceResolver>,
    clock: SharedClock,
    recipients: KeyedLock,
}

impl EventIngest {
    pub fn new(pool: DbPool, resolver: Arc<PreferenceResolver>, clock: SharedClock) -> Self {
        Self {
            pool,
            resolver,
            clock,
            recipients: KeyedLock::new(),
        }
    }

    /// Accept a domain event.
    ///
    /// Fails with [`crate::Error::InvalidEvent`] before anything is written.
    /// The event row, its notifications and any suppression records commit
    /// together or not at all.
    pub async fn ingest(&self, event: NewEvent) -> Result<IngestReceipt> {
        self.ingest_with(event, None).await
    }

    /// Ingest an event that must reach its recipients on `channel` only,
    /// whatever channels they enabled for the trigger.
    pub async fn ingest_on_channel(&self, event: NewEvent, channel: Channel) -> Result<IngestReceipt> {
        self.ingest_with(event, Some(channel)).await
    }

    async fn ingest_with(&self, event: NewEvent, only: Option<Channel>) -> Result<IngestReceipt> {
        let now = self.clock.now();
        let event = event.validate(now)?;

        // Rate ceilings count committed rows, so resolution for a recipient
        // must not interleave with another commit for the same recipient.
        // Keys are taken in sorted order.
        let mut keys: Vec<&str> = event.subjects.iter().map(String::as_str).collect();
        keys.sort_unstable();
        let mut guards = Vec::with_capacity(keys.len());
        for key in keys {
            guards.push(self.recipients.lock(key).await);
        }

        let resolution = match only {
            Some(channel) => self.resolver.resolve_on_channel(&event, channel, now).await?,
            None => self.resolver.resolve(&event, now).await?,
        };
        let row = EventDbModel::from_event(&event, datetime_to_ms(now))?;

        let mut tx = self.pool.begin().await?;
        if !IngestTxOps::insert_event(&mut tx, &row).await? {
            tx.rollback().await?;
            debug!(event_id = %event.id, "Event already ingested");
            return Ok(IngestReceipt {
                event_id: event.id,
                queued: Vec::new(),
                suppressed: 0,
                duplicate: true,
            });
        }
        for notification in &resolution.notifications {
            IngestTxOps::insert_notification(&mut tx, notification).await?;
        }
        for record in &resolution.records {
            IngestTxOps::append_record(&mut tx, record).await?;
        }
        tx.commit().await?;
        drop(guards);

        let queued: Vec<String> = resolution.deliverable().map(|n| n.id.clone()).collect();
        let suppressed = resolution.suppressed_count();
        info!(
            event_id = %event.id,
            trigger = %event.trigger,
            recipients = event.subjects.len(),
            queued = queued.len(),
            suppressed,
            "Event ingested"
        );

        Ok(IngestReceipt {
            event_id: event.id,
            queued,
            suppressed,
            duplicate: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use crate::config::ResolverConfig;
    use crate::database::init_memory_pool;
    use crate::database::repositories::{
        DeliveryLedger, EventRepository, NotificationRepository, SqlxDeliveryLedger,
        SqlxEventRepository, SqlxNotificationRepository,
    };
    use crate::domain::{NotificationPreference, RetryPolicy, TriggerType};
    use crate::notification::preferences::StaticPreferenceSource;
    use crate::utils::ManualClock;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    async fn ingest_with(prefs: StaticPreferenceSource) -> (EventIngest, DbPool) {
        let pool = init_memory_pool().await.unwrap();
        let resolver = PreferenceResolver::new(
            Arc::new(prefs),
            Arc::new(SqlxNotificationRepository::new(pool.clone())),
            ResolverConfig::default(),
            RetryPolicy::default(),
        );
        let clock = ManualClock::shared(Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap());
        (
            EventIngest::new(pool.clone(), Arc::new(resolver), clock),
            pool,
        )
    }

    #[tokio::test]
    async fn test_invalid_event_writes_nothing() {
        let (ingest, pool) = ingest_with(StaticPreferenceSource::new()).await;

        let err = ingest
            .ingest(NewEvent::new("new_match").with_subject("bob").with_payload(json!([1, 2])))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidEvent(_)));

        let err = ingest.ingest(NewEvent::new("no_such_trigger").with_subject("bob")).await;
        assert!(matches!(err, Err(Error::InvalidEvent(_))));

        let events = SqlxEventRepository::new(pool).list_recent(10).await.unwrap();
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn test_event_and_notifications_are_persisted_together() {
        let prefs = StaticPreferenceSource::new().with(
            "bob",
            TriggerType::NewMatch,
            NotificationPreference::new(vec![Channel::Email, Channel::Push]),
        );
        let (ingest, pool) = ingest_with(prefs).await;

        let receipt = ingest
            .ingest(
                NewEvent::new("new_match")
                    .with_actor("alice")
                    .with_subject("bob"),
            )
            .await
            .unwrap();
        assert_eq!(receipt.queued.len(), 2);
        assert!(!receipt.duplicate);

        let events = SqlxEventRepository::new(pool.clone());
        assert!(events.exists(&receipt.event_id).await.unwrap());
        let queued = SqlxNotificationRepository::new(pool)
            .list_for_event(&receipt.event_id)
            .await
            .unwrap();
        assert_eq!(queued.len(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_event_id_is_idempotent() {
        let (ingest, pool) = ingest_with(StaticPreferenceSource::new()).await;
        let event = || {
            NewEvent::new("profile_view")
                .with_id("evt-1")
                .with_actor("alice")
                .with_subject("bob")
        };

        let first = ingest.ingest(event()).await.unwrap();
        let second = ingest.ingest(event()).await.unwrap();
        assert_eq!(first.event_id, "evt-1");
        assert!(second.duplicate);
        assert!(second.queued.is_empty());

        let queued = SqlxNotificationRepository::new(pool.clone())
            .list_for_event("evt-1")
            .await
            .unwrap();
        assert_eq!(queued.len(), first.queued.len());
    }

    #[tokio::test]
    async fn test_no_channels_leaves_a_ledger_record() {
        let prefs = StaticPreferenceSource::new().with(
            "bob",
            TriggerType::NewMatch,
            NotificationPreference::new(vec![]),
        );
        let (ingest, pool) = ingest_with(prefs).await;

        let receipt = ingest
            .ingest(NewEvent::new("new_match").with_subject("bob"))
            .await
            .unwrap();
        assert!(receipt.queued.is_empty());
        assert_eq!(receipt.suppressed, 1);

        let records = SqlxDeliveryLedger::new(pool)
            .list_for_event(&receipt.event_id)
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].provider_response.as_deref(), Some("no_enabled_channels"));
    }

    #[tokio::test]
    async fn test_single_channel_ingest_ignores_enabled_channels() {
        let prefs = StaticPreferenceSource::new().with(
            "bob",
            TriggerType::NewMessage,
            NotificationPreference::new(vec![Channel::Email, Channel::Sms]),
        );
        let (ingest, pool) = ingest_with(prefs).await;

        let receipt = ingest
            .ingest_on_channel(
                NewEvent::new("new_message").with_actor("alice").with_subject("bob"),
                Channel::Push,
            )
            .await
            .unwrap();
        assert_eq!(receipt.queued.len(), 1);

        let queued = SqlxNotificationRepository::new(pool)
            .get(&receipt.queued[0])
            .await
            .unwrap();
        assert_eq!(queued.get_channel(), Some(Channel::Push));
    }
}
