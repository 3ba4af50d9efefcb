//! Channel worker loop: lease → render → send → ack/nack/fail.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::channels::{ChannelDispatcher, DeliveryError, DispatchOutcome, OutboundMessage};
use super::templates::{TemplateStore, resolve_template};
use crate::config::DispatchConfig;
use crate::database::models::{
    DeliveryOutcome, DeliveryRecordDbModel, NotificationDbModel, NotificationStatus,
};
use crate::database::repositories::{DeliveryLedger, NotificationRepository};
use crate::database::time::offset_ms;
use crate::domain::{Channel, RetryPolicy};
use crate::utils::SharedClock;
use crate::{Error, Result};

/// Counts of what one batch did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub leased: usize,
    pub sent: usize,
    pub retried: usize,
    pub failed: usize,
    pub deferred: usize,
    /// Lease lapsed or taken over before the notification was settled.
    pub lost: usize,
}

pub struct DispatchWorker {
    name: String,
    dispatcher: Arc<ChannelDispatcher>,
    queue: Arc<dyn NotificationRepository>,
    ledger: Arc<dyn DeliveryLedger>,
    templates: Arc<dyn TemplateStore>,
    clock: SharedClock,
    batch_size: u32,
    lease_for: Duration,
    poll_interval: Duration,
    retry: RetryPolicy,
}

impl DispatchWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        index: usize,
        dispatcher: Arc<ChannelDispatcher>,
        queue: Arc<dyn NotificationRepository>,
        ledger: Arc<dyn DeliveryLedger>,
        templates: Arc<dyn TemplateStore>,
        clock: SharedClock,
        config: &DispatchConfig,
    ) -> Self {
        Self {
            name: format!("{}-{}", dispatcher.channel(), index),
            dispatcher,
            queue,
            ledger,
            templates,
            clock,
            batch_size: config.batch_size,
            lease_for: config.lease_duration(),
            poll_interval: config.poll_interval(),
            retry: config.retry.clone(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn channel(&self) -> Channel {
        self.dispatcher.channel()
    }

    /// Poll until cancelled. A batch in progress always completes; leases
    /// not acknowledged by then become visible again when they lapse.
    pub async fn run(self, cancel: CancellationToken) {
        info!(worker = %self.name, provider = self.dispatcher.provider_name(), "Dispatch worker started");

        while !cancel.is_cancelled() {
            let idle = match self.run_once().await {
                Ok(report) => report.leased == 0,
                Err(e) => {
                    error!(worker = %self.name, error = %e, "Dispatch batch failed");
                    true
                }
            };
            if idle {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.poll_interval) => {}
                }
            }
        }

        info!(worker = %self.name, "Dispatch worker stopped");
    }

    /// Lease and process a single batch.
    pub async fn run_once(&self) -> Result<BatchReport> {
        let batch = self
            .queue
            .lease(
                self.channel(),
                self.batch_size,
                self.lease_for,
                self.clock.now_ms(),
            )
            .await?;

        let mut report = BatchReport {
            leased: batch.len(),
            ..Default::default()
        };
        for notification in batch {
            let id = notification.id.clone();
            match self.process(notification).await {
                Ok(Settled::Sent) => report.sent += 1,
                Ok(Settled::Retry) => report.retried += 1,
                Ok(Settled::Failed) => report.failed += 1,
                Ok(Settled::Deferred) => report.deferred += 1,
                Err(Error::LeaseExpired { .. }) => {
                    warn!(worker = %self.name, notification_id = %id, "Lease lapsed before the notification was settled");
                    report.lost += 1;
                }
                Err(e) => {
                    error!(worker = %self.name, notification_id = %id, error = %e, "Failed to settle notification");
                }
            }
        }
        if report.leased > 0 {
            debug!(worker = %self.name, ?report, "Batch complete");
        }
        Ok(report)
    }

    async fn process(&self, notification: NotificationDbModel) -> Result<Settled> {
        let token = notification
            .lease_token
            .clone()
            .ok_or_else(|| Error::lease_expired(&notification.id))?;

        // Items late in a batch may have outlived the batch lease; only send
        // while the lease is still ours, with a full lease ahead of the call.
        let now_ms = self.clock.now_ms();
        self.queue
            .renew(&notification.id, &token, offset_ms(now_ms, self.lease_for), now_ms)
            .await?;

        let outcome = match self.render(&notification).await {
            Ok(message) => self
                .dispatcher
                .deliver(&notification, &message, self.clock.now_ms())
                .await
                .unwrap_or_else(|e| {
                    DispatchOutcome::Failed(DeliveryError::transient(format!("dispatch error: {e}")))
                }),
            Err(e) => {
                DispatchOutcome::Failed(DeliveryError::transient(format!("render error: {e}")))
            }
        };

        self.settle(&notification, &token, outcome).await
    }

    async fn render(&self, notification: &NotificationDbModel) -> Result<OutboundMessage> {
        let template = resolve_template(
            self.templates.as_ref(),
            notification.get_trigger(),
            self.channel(),
        )
        .await?;
        let content = template.render(self.channel(), &notification.payload_json());
        Ok(OutboundMessage::for_notification(notification, content))
    }

    async fn settle(
        &self,
        notification: &NotificationDbModel,
        token: &str,
        outcome: DispatchOutcome,
    ) -> Result<Settled> {
        let now_ms = self.clock.now_ms();
        let id = notification.id.as_str();

        match outcome {
            DispatchOutcome::Delivered(receipt) => {
                // The send happened; record it even if the lease was lost.
                self.record(
                    DeliveryRecordDbModel::for_attempt(notification, DeliveryOutcome::Sent, now_ms)
                        .with_response(&receipt.provider_response)
                        .with_cost(receipt.cost),
                )
                .await;
                self.queue.ack(id, token, now_ms).await?;
                info!(
                    worker = %self.name,
                    notification_id = %id,
                    recipient = %notification.recipient,
                    attempt = notification.attempts,
                    "Notification sent"
                );
                Ok(Settled::Sent)
            }
            DispatchOutcome::Failed(err @ DeliveryError::Permanent { .. }) => {
                self.queue.fail(id, token, err.reason(), now_ms).await?;
                self.record(
                    DeliveryRecordDbModel::for_attempt(
                        notification,
                        DeliveryOutcome::PermanentFailure,
                        now_ms,
                    )
                    .with_response(err.reason()),
                )
                .await;
                warn!(
                    worker = %self.name,
                    notification_id = %id,
                    recipient = %notification.recipient,
                    reason = %err.reason(),
                    "Notification failed permanently"
                );
                Ok(Settled::Failed)
            }
            DispatchOutcome::Failed(err) => {
                let attempts = u32::try_from(notification.attempts).unwrap_or(u32::MAX);
                let backoff = self.retry.delay_after(attempts);
                let delay = err.retry_after().map_or(backoff, |hint| hint.max(backoff));
                let status = self
                    .queue
                    .nack(id, token, offset_ms(now_ms, delay), err.reason(), now_ms)
                    .await?;
                self.record(
                    DeliveryRecordDbModel::for_attempt(
                        notification,
                        DeliveryOutcome::TransientFailure,
                        now_ms,
                    )
                    .with_response(err.reason()),
                )
                .await;

                if status == NotificationStatus::Failed {
                    warn!(
                        worker = %self.name,
                        notification_id = %id,
                        attempts = notification.attempts,
                        reason = %err.reason(),
                        "Retries exhausted"
                    );
                    Ok(Settled::Failed)
                } else {
                    debug!(
                        worker = %self.name,
                        notification_id = %id,
                        attempt = notification.attempts,
                        retry_in_ms = delay.as_millis() as u64,
                        reason = %err.reason(),
                        "Transient failure, will retry"
                    );
                    Ok(Settled::Retry)
                }
            }
            DispatchOutcome::Deferred { until_ms, reason } => {
                self.queue.defer(id, token, until_ms, &reason, now_ms).await?;
                self.record(
                    DeliveryRecordDbModel::for_attempt(notification, DeliveryOutcome::Deferred, now_ms)
                        .with_response(&reason),
                )
                .await;
                Ok(Settled::Deferred)
            }
        }
    }

    /// Ledger writes never block settling the queue row.
    async fn record(&self, record: DeliveryRecordDbModel) {
        if let Err(e) = self.ledger.append(&record).await {
            error!(
                worker = %self.name,
                notification_id = ?record.notification_id,
                error = %e,
                "Failed to append delivery record"
            );
        }
    }
}

enum Settled {
    Sent,
    Retry,
    Failed,
    Deferred,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::clock::Clock;
    use crate::database::init_memory_pool;
    use crate::database::models::{EventDbModel, RecipientContactDbModel};
    use crate::database::repositories::{
        IngestTxOps, SqlxDeliveryLedger, SqlxNotificationRepository, SqlxRecipientDirectory,
    };
    use crate::domain::{NewEvent, Priority, TriggerType};
    use crate::notification::channels::{
        DeliveryReceipt, DeliveryResult, EmailDispatcher, ProviderAdapter,
    };
    use crate::notification::templates::BuiltinTemplates;
    use crate::utils::ManualClock;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// Replays canned results, then keeps returning the last one.
    struct ScriptedProvider {
        script: Mutex<VecDeque<DeliveryResult>>,
        sent_to: Mutex<Vec<String>>,
    }

    impl ScriptedProvider {
        fn new(script: Vec<DeliveryResult>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                sent_to: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ProviderAdapter for ScriptedProvider {
        type Destination = String;

        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn send(&self, to: &String, _message: &OutboundMessage) -> DeliveryResult {
            self.sent_to.lock().push(to.clone());
            let mut script = self.script.lock();
            if script.len() > 1 {
                script.pop_front().unwrap()
            } else {
                script.front().cloned().unwrap()
            }
        }
    }

    struct Harness {
        worker: DispatchWorker,
        queue: Arc<SqlxNotificationRepository>,
        ledger: Arc<SqlxDeliveryLedger>,
        clock: Arc<ManualClock>,
        event_id: String,
    }

    async fn harness(provider: Arc<ScriptedProvider>) -> Harness {
        let pool = init_memory_pool().await.unwrap();
        let clock = ManualClock::shared(Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap());

        let event = NewEvent::new("new_match")
            .with_subject("bob")
            .validate(clock.now())
            .unwrap();
        let mut conn = pool.acquire().await.unwrap();
        IngestTxOps::insert_event(&mut conn, &EventDbModel::from_event(&event, 0).unwrap())
            .await
            .unwrap();
        drop(conn);

        let directory = Arc::new(SqlxRecipientDirectory::new(pool.clone()));
        directory
            .upsert_contact(&RecipientContactDbModel {
                user_id: "bob".into(),
                email: Some("bob@example.com".into()),
                phone: None,
                updated_at: 0,
            })
            .await
            .unwrap();

        let queue = Arc::new(SqlxNotificationRepository::new(pool.clone()));
        let ledger = Arc::new(SqlxDeliveryLedger::new(pool));
        let dispatcher = Arc::new(ChannelDispatcher::Email(EmailDispatcher::new(
            provider,
            directory,
            Duration::from_secs(5),
        )));
        let mut config = DispatchConfig::default();
        config.retry = RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            use_jitter: false,
        };
        let worker = DispatchWorker::new(
            0,
            dispatcher,
            queue.clone(),
            ledger.clone(),
            Arc::new(BuiltinTemplates),
            clock.clone(),
            &config,
        );

        Harness {
            worker,
            queue,
            ledger,
            clock,
            event_id: event.id,
        }
    }

    async fn enqueue(h: &Harness) -> String {
        let n = NotificationDbModel::new(
            &h.event_id,
            "bob",
            TriggerType::NewMatch,
            Channel::Email,
            Priority::High,
            &serde_json::json!({"actor": "alice"}),
            3,
            h.clock.now_ms(),
        );
        h.queue.enqueue(&n).await.unwrap();
        n.id
    }

    #[tokio::test]
    async fn test_success_acks_and_records_sent() {
        let provider = ScriptedProvider::new(vec![Ok(DeliveryReceipt::new("msg-1"))]);
        let h = harness(provider.clone()).await;
        let id = enqueue(&h).await;

        let report = h.worker.run_once().await.unwrap();
        assert_eq!(report.sent, 1);
        assert_eq!(*provider.sent_to.lock(), vec!["bob@example.com".to_string()]);

        let n = h.queue.get(&id).await.unwrap();
        assert_eq!(n.get_status(), Some(NotificationStatus::Sent));
        let records = h.ledger.list_for_notification(&id).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].get_outcome(), Some(DeliveryOutcome::Sent));
        assert_eq!(records[0].provider_response.as_deref(), Some("msg-1"));
    }

    #[tokio::test]
    async fn test_transient_failures_back_off_then_fail() {
        let provider = ScriptedProvider::new(vec![Err(DeliveryError::transient("503"))]);
        let h = harness(provider.clone()).await;
        let id = enqueue(&h).await;

        assert_eq!(h.worker.run_once().await.unwrap().retried, 1);
        // Not due again until the 1s backoff has elapsed.
        assert_eq!(h.worker.run_once().await.unwrap().leased, 0);
        h.clock.advance(Duration::from_secs(1));
        assert_eq!(h.worker.run_once().await.unwrap().retried, 1);
        h.clock.advance(Duration::from_secs(2));
        assert_eq!(h.worker.run_once().await.unwrap().failed, 1);

        let n = h.queue.get(&id).await.unwrap();
        assert_eq!(n.get_status(), Some(NotificationStatus::Failed));
        assert_eq!(n.attempts, 3);
        assert_eq!(provider.sent_to.lock().len(), 3);

        let records = h.ledger.list_for_notification(&id).await.unwrap();
        assert_eq!(records.len(), 3);
        assert!(
            records
                .iter()
                .all(|r| r.get_outcome() == Some(DeliveryOutcome::TransientFailure))
        );

        // Nothing is leased after exhaustion.
        h.clock.advance(Duration::from_secs(3600));
        assert_eq!(h.worker.run_once().await.unwrap().leased, 0);
    }

    #[tokio::test]
    async fn test_retry_after_hint_extends_backoff() {
        let provider = ScriptedProvider::new(vec![
            Err(DeliveryError::Transient {
                reason: "429".into(),
                retry_after: Some(Duration::from_secs(30)),
            }),
            Ok(DeliveryReceipt::new("ok")),
        ]);
        let h = harness(provider).await;
        let id = enqueue(&h).await;

        h.worker.run_once().await.unwrap();
        h.clock.advance(Duration::from_secs(29));
        assert_eq!(h.worker.run_once().await.unwrap().leased, 0);
        h.clock.advance(Duration::from_secs(1));
        assert_eq!(h.worker.run_once().await.unwrap().sent, 1);
        assert_eq!(
            h.queue.get(&id).await.unwrap().get_status(),
            Some(NotificationStatus::Sent)
        );
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let provider = ScriptedProvider::new(vec![Err(DeliveryError::permanent("400 bad request"))]);
        let h = harness(provider.clone()).await;
        let id = enqueue(&h).await;

        assert_eq!(h.worker.run_once().await.unwrap().failed, 1);
        h.clock.advance(Duration::from_secs(3600));
        assert_eq!(h.worker.run_once().await.unwrap().leased, 0);
        assert_eq!(provider.sent_to.lock().len(), 1);

        let n = h.queue.get(&id).await.unwrap();
        assert_eq!(n.get_status(), Some(NotificationStatus::Failed));
        let records = h.ledger.list_for_notification(&id).await.unwrap();
        assert_eq!(records[0].get_outcome(), Some(DeliveryOutcome::PermanentFailure));
    }

    #[tokio::test]
    async fn test_missing_address_fails_without_calling_provider() {
        let provider = ScriptedProvider::new(vec![Ok(DeliveryReceipt::new("unused"))]);
        let h = harness(provider.clone()).await;
        let n = NotificationDbModel::new(
            &h.event_id,
            "carol",
            TriggerType::NewMatch,
            Channel::Email,
            Priority::Medium,
            &serde_json::json!({}),
            3,
            h.clock.now_ms(),
        );
        h.queue.enqueue(&n).await.unwrap();

        assert_eq!(h.worker.run_once().await.unwrap().failed, 1);
        assert!(provider.sent_to.lock().is_empty());
    }
}
