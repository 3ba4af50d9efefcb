//! Event to delivery, through ingest, the queue and the channel workers.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveTime, TimeZone, Utc};
use parking_lot::Mutex;

use courier::config::{DispatchConfig, ResolverConfig};
use courier::database::init_memory_pool;
use courier::database::models::{
    DeliveryOutcome, NotificationStatus, PushSubscriptionDbModel, RecipientContactDbModel,
};
use courier::database::repositories::{
    DeliveryLedger, NotificationRepository, SqlxDeliveryLedger, SqlxNotificationRepository,
    SqlxPreferenceRepository, SqlxRecipientDirectory,
};
use courier::domain::{
    Channel, NewEvent, NotificationPreference, QuietHours, RateCeiling, RetryPolicy, TriggerType,
};
use courier::notification::channels::{
    DeliveryReceipt, DeliveryResult, EmailDispatcher, OutboundMessage, PushDispatcher,
    RecipientDirectory, SmsDispatcher, SpendGuard,
};
use courier::notification::{
    BuiltinTemplates, ChannelDispatcher, DeliveryError, DispatchWorker, EventIngest,
    PreferenceResolver, ProviderAdapter,
};
use courier::utils::{Clock, ManualClock};

/// Records every destination and answers from a fixed rule.
struct MockProvider<D> {
    calls: Mutex<Vec<String>>,
    answer: Box<dyn Fn(&D) -> DeliveryResult + Send + Sync>,
}

impl<D> MockProvider<D> {
    fn new(answer: impl Fn(&D) -> DeliveryResult + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            answer: Box::new(answer),
        })
    }

    fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl ProviderAdapter for MockProvider<String> {
    type Destination = String;

    fn name(&self) -> &'static str {
        "mock"
    }

    async fn send(&self, to: &String, _message: &OutboundMessage) -> DeliveryResult {
        self.calls.lock().push(to.clone());
        (self.answer)(to)
    }
}

#[async_trait]
impl ProviderAdapter for MockProvider<PushSubscriptionDbModel> {
    type Destination = PushSubscriptionDbModel;

    fn name(&self) -> &'static str {
        "mock-push"
    }

    async fn send(
        &self,
        sub: &PushSubscriptionDbModel,
        _message: &OutboundMessage,
    ) -> DeliveryResult {
        self.calls.lock().push(sub.endpoint.clone());
        (self.answer)(sub)
    }
}

fn retry_policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        base_delay_ms: 1_000,
        max_delay_ms: 60_000,
        use_jitter: false,
    }
}

struct Pipeline {
    clock: Arc<ManualClock>,
    queue: Arc<SqlxNotificationRepository>,
    ledger: Arc<SqlxDeliveryLedger>,
    preferences: Arc<SqlxPreferenceRepository>,
    directory: Arc<SqlxRecipientDirectory>,
    ingest: EventIngest,
}

impl Pipeline {
    async fn new(start: DateTime<Utc>) -> Self {
        let pool = init_memory_pool().await.unwrap();
        let clock = ManualClock::shared(start);
        let queue = Arc::new(SqlxNotificationRepository::new(pool.clone()));
        let ledger = Arc::new(SqlxDeliveryLedger::new(pool.clone()));
        let preferences = Arc::new(SqlxPreferenceRepository::new(pool.clone()));
        let directory = Arc::new(SqlxRecipientDirectory::new(pool.clone()));

        let resolver = PreferenceResolver::new(
            preferences.clone(),
            queue.clone(),
            ResolverConfig::default(),
            retry_policy(),
        );
        let ingest = EventIngest::new(pool, Arc::new(resolver), clock.clone());

        Self {
            clock,
            queue,
            ledger,
            preferences,
            directory,
            ingest,
        }
    }

    async fn prefer(&self, user: &str, trigger: TriggerType, pref: NotificationPreference) {
        self.preferences
            .upsert(user, trigger, &pref, self.clock.now_ms())
            .await
            .unwrap();
    }

    async fn contact(&self, user: &str, email: Option<&str>, phone: Option<&str>) {
        self.directory
            .upsert_contact(&RecipientContactDbModel {
                user_id: user.to_string(),
                email: email.map(str::to_string),
                phone: phone.map(str::to_string),
                updated_at: self.clock.now_ms(),
            })
            .await
            .unwrap();
    }

    async fn subscribe(&self, user: &str, endpoint: &str) {
        self.directory
            .upsert_push_subscription(&PushSubscriptionDbModel {
                id: uuid::Uuid::new_v4().to_string(),
                user_id: user.to_string(),
                endpoint: endpoint.to_string(),
                p256dh: "key".to_string(),
                auth: "auth".to_string(),
                next_attempt_at: None,
                created_at: 0,
                updated_at: 0,
            })
            .await
            .unwrap();
    }

    fn worker(&self, dispatcher: ChannelDispatcher) -> DispatchWorker {
        let config = DispatchConfig {
            retry: retry_policy(),
            ..DispatchConfig::default()
        };
        self.worker_at(0, Arc::new(dispatcher), &config)
    }

    fn worker_at(
        &self,
        index: usize,
        dispatcher: Arc<ChannelDispatcher>,
        config: &DispatchConfig,
    ) -> DispatchWorker {
        DispatchWorker::new(
            index,
            dispatcher,
            self.queue.clone(),
            self.ledger.clone(),
            Arc::new(BuiltinTemplates),
            self.clock.clone(),
            config,
        )
    }

    /// Queue one new-match email for each of `count` distinct recipients.
    async fn queue_emails(&self, count: usize) {
        for i in 0..count {
            let user = format!("user-{i}");
            self.prefer(
                &user,
                TriggerType::NewMatch,
                NotificationPreference::new(vec![Channel::Email]),
            )
            .await;
            self.contact(&user, Some(&format!("{user}@example.com")), None)
                .await;
            let receipt = self.ingest.ingest(new_match("alice", &user)).await.unwrap();
            assert_eq!(receipt.queued.len(), 1);
        }
    }
}

fn new_match(actor: &str, subject: &str) -> NewEvent {
    NewEvent::new("new_match")
        .with_actor(actor)
        .with_subject(subject)
}

#[tokio::test]
async fn new_match_queues_email_and_push_for_the_subject() {
    let p = Pipeline::new(Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()).await;

    let receipt = p.ingest.ingest(new_match("alice", "bob")).await.unwrap();
    assert!(!receipt.duplicate);
    assert_eq!(receipt.queued.len(), 2);

    let mut channels: Vec<_> = p
        .queue
        .list_for_event(&receipt.event_id)
        .await
        .unwrap()
        .into_iter()
        .map(|n| {
            assert_eq!(n.recipient, "bob");
            assert_eq!(n.get_status(), Some(NotificationStatus::Pending));
            n.get_channel().unwrap()
        })
        .collect();
    channels.sort();
    assert_eq!(channels, vec![Channel::Email, Channel::Push]);
    assert_eq!(p.queue.stats().await.unwrap().pending, 2);
}

#[tokio::test]
async fn quiet_hours_follow_the_recipient_timezone() {
    // 04:00 UTC is 23:00 the previous evening in New York (EST).
    let p = Pipeline::new(Utc.with_ymd_and_hms(2026, 3, 2, 4, 0, 0).unwrap()).await;
    let quiet = QuietHours::new(
        NaiveTime::from_hms_opt(22, 0, 0).unwrap(),
        NaiveTime::from_hms_opt(8, 0, 0).unwrap(),
    )
    .with_timezone("America/New_York");
    p.prefer(
        "bob",
        TriggerType::NewMatch,
        NotificationPreference::new(vec![Channel::Push]).with_quiet_hours(quiet),
    )
    .await;

    let receipt = p.ingest.ingest(new_match("alice", "bob")).await.unwrap();
    assert!(receipt.queued.is_empty());
    assert_eq!(receipt.suppressed, 1);
    assert_eq!(p.queue.stats().await.unwrap().pending, 0);

    let history = p.ledger.list_for_recipient("bob", 10).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].get_outcome(), Some(DeliveryOutcome::Suppressed));

    // 13:00 UTC is 08:00 local: the window has closed.
    p.clock.set(Utc.with_ymd_and_hms(2026, 3, 2, 13, 0, 0).unwrap());
    let receipt = p.ingest.ingest(new_match("carol", "bob")).await.unwrap();
    assert_eq!(receipt.queued.len(), 1);
}

#[tokio::test]
async fn sixth_sms_of_the_day_is_suppressed() {
    let p = Pipeline::new(Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()).await;
    p.prefer(
        "bob",
        TriggerType::NewMessage,
        NotificationPreference::new(vec![Channel::Sms])
            .with_ceiling(Channel::Sms, RateCeiling::per_day(5)),
    )
    .await;

    for i in 0..5 {
        let receipt = p
            .ingest
            .ingest(NewEvent::new("new_message").with_actor("alice").with_subject("bob"))
            .await
            .unwrap();
        assert_eq!(receipt.queued.len(), 1, "message {i} should be queued");
        p.clock.advance(Duration::from_secs(60));
    }

    let receipt = p
        .ingest
        .ingest(NewEvent::new("new_message").with_actor("alice").with_subject("bob"))
        .await
        .unwrap();
    assert!(receipt.queued.is_empty());
    assert_eq!(receipt.suppressed, 1);

    let stats = p.queue.stats().await.unwrap();
    assert_eq!(stats.pending, 5);
    assert_eq!(stats.suppressed, 1);
}

#[tokio::test]
async fn transient_failures_end_in_failed_after_max_attempts() {
    let p = Pipeline::new(Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()).await;
    p.prefer(
        "bob",
        TriggerType::NewMatch,
        NotificationPreference::new(vec![Channel::Email]),
    )
    .await;
    p.contact("bob", Some("bob@example.com"), None).await;

    let provider = MockProvider::<String>::new(|_| {
        Err(DeliveryError::transient("provider returned 503 Service Unavailable"))
    });
    let worker = p.worker(ChannelDispatcher::Email(EmailDispatcher::new(
        provider.clone(),
        p.directory.clone(),
        Duration::from_secs(5),
    )));

    let receipt = p.ingest.ingest(new_match("alice", "bob")).await.unwrap();
    let id = receipt.queued[0].clone();

    for _ in 0..10 {
        worker.run_once().await.unwrap();
        let n = p.queue.get(&id).await.unwrap();
        assert!(n.attempts <= n.max_attempts);
        if n.get_status() == Some(NotificationStatus::Failed) {
            break;
        }
        p.clock.advance(Duration::from_secs(120));
    }

    let n = p.queue.get(&id).await.unwrap();
    assert_eq!(n.get_status(), Some(NotificationStatus::Failed));
    assert_eq!(n.attempts, 3);
    assert_eq!(provider.call_count(), 3);

    p.clock.advance(Duration::from_secs(3600));
    assert_eq!(worker.run_once().await.unwrap().leased, 0);

    let records = p.ledger.list_for_notification(&id).await.unwrap();
    assert_eq!(records.len(), 3);
    assert!(
        records
            .iter()
            .all(|r| r.get_outcome() == Some(DeliveryOutcome::TransientFailure))
    );
}

#[tokio::test]
async fn sms_spend_ceiling_defers_to_next_utc_midnight() {
    let start = Utc.with_ymd_and_hms(2026, 3, 1, 18, 30, 0).unwrap();
    let p = Pipeline::new(start).await;
    p.prefer(
        "bob",
        TriggerType::NewMessage,
        NotificationPreference::new(vec![Channel::Sms]),
    )
    .await;
    p.contact("bob", None, Some("+15551234567")).await;

    let provider = MockProvider::<String>::new(|_| Ok(DeliveryReceipt::new("sms-ok")));
    let ledger: Arc<dyn DeliveryLedger> = p.ledger.clone();
    let spend = Arc::new(SpendGuard::new(ledger, Some(0.50)));
    let worker = p.worker(ChannelDispatcher::Sms(SmsDispatcher::new(
        provider.clone(),
        p.directory.clone(),
        spend,
        0.25,
        Duration::from_secs(5),
    )));

    let mut ids = Vec::new();
    for _ in 0..3 {
        let receipt = p
            .ingest
            .ingest(NewEvent::new("new_message").with_actor("alice").with_subject("bob"))
            .await
            .unwrap();
        ids.extend(receipt.queued);
    }
    assert_eq!(ids.len(), 3);

    let report = worker.run_once().await.unwrap();
    assert_eq!(report.sent, 2);
    assert_eq!(report.deferred, 1);
    assert_eq!(provider.call_count(), 2);

    let midnight = Utc.with_ymd_and_hms(2026, 3, 2, 0, 0, 0).unwrap();
    let deferred = p
        .queue
        .stats()
        .await
        .map(|s| (s.sent, s.pending))
        .unwrap();
    assert_eq!(deferred, (2, 1));

    let mut waiting = None;
    for id in &ids {
        let n = p.queue.get(id).await.unwrap();
        if n.get_status() == Some(NotificationStatus::Pending) {
            waiting = Some(n);
        }
    }
    let waiting = waiting.unwrap();
    assert_eq!(waiting.next_attempt_at, midnight.timestamp_millis());
    // Deferral does not consume an attempt.
    assert_eq!(waiting.attempts, 0);

    // Nothing goes out before midnight.
    p.clock.set(Utc.with_ymd_and_hms(2026, 3, 1, 23, 59, 0).unwrap());
    assert_eq!(worker.run_once().await.unwrap().leased, 0);

    p.clock.set(midnight + chrono::Duration::minutes(1));
    let report = worker.run_once().await.unwrap();
    assert_eq!(report.sent, 1);
    assert_eq!(provider.call_count(), 3);
}

#[tokio::test]
async fn rejected_push_endpoint_is_removed_and_others_still_deliver() {
    let p = Pipeline::new(Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()).await;
    p.prefer(
        "bob",
        TriggerType::NewMatch,
        NotificationPreference::new(vec![Channel::Push]),
    )
    .await;
    p.subscribe("bob", "https://push.example.com/gone").await;
    p.subscribe("bob", "https://push.example.com/live").await;

    let provider = MockProvider::<PushSubscriptionDbModel>::new(|sub| {
        if sub.endpoint.ends_with("/gone") {
            Err(DeliveryError::invalid_destination("provider returned 410 Gone"))
        } else {
            Ok(DeliveryReceipt::new("201 Created"))
        }
    });
    let worker = p.worker(ChannelDispatcher::Push(PushDispatcher::new(
        provider.clone(),
        p.directory.clone(),
        Duration::from_secs(5),
    )));

    let receipt = p.ingest.ingest(new_match("alice", "bob")).await.unwrap();
    let report = worker.run_once().await.unwrap();
    assert_eq!(report.sent, 1);
    assert_eq!(provider.call_count(), 2);

    let remaining: Vec<_> = p
        .directory
        .push_subscriptions_for("bob")
        .await
        .unwrap()
        .into_iter()
        .map(|s| s.endpoint)
        .collect();
    assert_eq!(remaining, vec!["https://push.example.com/live".to_string()]);

    let n = p.queue.get(&receipt.queued[0]).await.unwrap();
    assert_eq!(n.get_status(), Some(NotificationStatus::Sent));
}

#[tokio::test]
async fn only_invalid_push_endpoints_fail_the_notification() {
    let p = Pipeline::new(Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()).await;
    p.prefer(
        "bob",
        TriggerType::NewMatch,
        NotificationPreference::new(vec![Channel::Push]),
    )
    .await;
    p.subscribe("bob", "https://push.example.com/gone").await;

    let provider = MockProvider::<PushSubscriptionDbModel>::new(|_| {
        Err(DeliveryError::invalid_destination("provider returned 404 Not Found"))
    });
    let worker = p.worker(ChannelDispatcher::Push(PushDispatcher::new(
        provider,
        p.directory.clone(),
        Duration::from_secs(5),
    )));

    let receipt = p.ingest.ingest(new_match("alice", "bob")).await.unwrap();
    let report = worker.run_once().await.unwrap();
    assert_eq!(report.failed, 1);

    assert!(p.directory.push_subscriptions_for("bob").await.unwrap().is_empty());
    let n = p.queue.get(&receipt.queued[0]).await.unwrap();
    assert_eq!(n.get_status(), Some(NotificationStatus::Failed));
    // Permanent failures are not retried.
    assert_eq!(n.attempts, 1);
}

fn assert_each_sent_once(calls: &[String], expected: usize) {
    let mut unique = calls.to_vec();
    unique.sort();
    unique.dedup();
    assert_eq!(unique.len(), expected, "every notification is sent");
    assert_eq!(calls.len(), expected, "no notification is sent twice: {calls:?}");
}

#[tokio::test]
async fn concurrent_workers_send_each_notification_once() {
    const EMAILS: usize = 24;
    let p = Pipeline::new(Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()).await;
    p.queue_emails(EMAILS).await;

    let provider = MockProvider::<String>::new(|_| Ok(DeliveryReceipt::new("250 OK")));
    let dispatcher = Arc::new(ChannelDispatcher::Email(EmailDispatcher::new(
        provider.clone(),
        p.directory.clone(),
        Duration::from_secs(5),
    )));
    let config = DispatchConfig {
        batch_size: 3,
        retry: retry_policy(),
        ..DispatchConfig::default()
    };
    let workers: Vec<_> = (0..4)
        .map(|i| p.worker_at(i, dispatcher.clone(), &config))
        .collect();

    futures::future::join_all(workers.iter().map(|worker| async {
        let mut sent = 0;
        loop {
            let report = worker.run_once().await.unwrap();
            sent += report.sent;
            if report.leased == 0 {
                break sent;
            }
        }
    }))
    .await;

    assert_each_sent_once(&provider.calls.lock(), EMAILS);
    let stats = p.queue.stats().await.unwrap();
    assert_eq!(stats.sent, EMAILS as i64);
    assert_eq!(stats.sending, 0);
}

#[tokio::test]
async fn slow_provider_never_sends_past_a_lapsed_lease() {
    const EMAILS: usize = 10;
    let start = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
    let p = Pipeline::new(start).await;
    p.queue_emails(EMAILS).await;

    // Each call takes 9s, so a batch of 10 outlives a 60s lease.
    let clock = p.clock.clone();
    let provider = MockProvider::<String>::new(move |_| {
        clock.advance(Duration::from_secs(9));
        Ok(DeliveryReceipt::new("250 OK"))
    });
    let dispatcher = Arc::new(ChannelDispatcher::Email(EmailDispatcher::new(
        provider.clone(),
        p.directory.clone(),
        Duration::from_secs(10),
    )));
    let config = DispatchConfig {
        batch_size: 10,
        lease_duration_secs: 60,
        provider_timeout_secs: 10,
        retry: retry_policy(),
        ..DispatchConfig::default()
    };
    let worker_a = p.worker_at(0, dispatcher.clone(), &config);
    let worker_b = p.worker_at(1, dispatcher, &config);

    let lapse = start + chrono::Duration::seconds(61);
    let (report_a, report_b) = tokio::join!(worker_a.run_once(), async {
        // B polls once A's batch lease has lapsed.
        while p.clock.now() < lapse {
            tokio::task::yield_now().await;
        }
        worker_b.run_once().await
    });
    let (report_a, report_b) = (report_a.unwrap(), report_b.unwrap());

    assert_eq!(report_a.leased, 10);
    assert_eq!(report_a.sent, 7);
    assert_eq!(report_a.lost, 3);
    assert_eq!(report_b.leased, 3);
    assert_eq!(report_b.sent, 3);

    assert_each_sent_once(&provider.calls.lock(), EMAILS);
    assert_eq!(p.queue.stats().await.unwrap().sent, EMAILS as i64);
}
