//! Preference resolution: event → per-recipient, per-channel notifications.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value, json};
use tracing::debug;

use super::preferences::PreferenceSource;
use crate::Result;
use crate::config::{QuietHoursPolicy, ResolverConfig};
use crate::database::models::{
    DeliveryOutcome, DeliveryRecordDbModel, NotificationDbModel, NotificationStatus,
};
use crate::database::repositories::NotificationRepository;
use crate::database::time::{datetime_to_ms, offset_ms};
use crate::domain::{Channel, Event, NotificationPreference, RetryPolicy};

/// Why a channel produced no deliverable notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum SuppressionReason {
    QuietHours,
    RateLimitExceeded,
    NoEnabledChannels,
}

/// Everything one event turns into; written atomically by ingest.
#[derive(Debug, Default)]
pub struct Resolution {
    /// Queue rows, including `suppressed` ones kept for status lookups.
    pub notifications: Vec<NotificationDbModel>,
    /// Ledger entries for suppressed or deferred work.
    pub records: Vec<DeliveryRecordDbModel>,
}

impl Resolution {
    /// Notifications a dispatcher will pick up.
    pub fn deliverable(&self) -> impl Iterator<Item = &NotificationDbModel> {
        self.notifications
            .iter()
            .filter(|n| n.get_status() == Some(NotificationStatus::Pending))
    }

    pub fn suppressed_count(&self) -> usize {
        self.records
            .iter()
            .filter(|r| r.get_outcome() == Some(DeliveryOutcome::Suppressed))
            .count()
    }
}

enum ChannelDecision {
    Deliver,
    DeferUntil(DateTime<Utc>),
    Suppress(SuppressionReason),
}

pub struct PreferenceResolver {
    preferences: Arc<dyn PreferenceSource>,
    notifications: Arc<dyn NotificationRepository>,
    config: ResolverConfig,
    retry: RetryPolicy,
}

impl PreferenceResolver {
    pub fn new(
        preferences: Arc<dyn PreferenceSource>,
        notifications: Arc<dyn NotificationRepository>,
        config: ResolverConfig,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            preferences,
            notifications,
            config,
            retry,
        }
    }

    /// Resolve `event` against each subject's current preferences.
    ///
    /// Callers must serialize resolution per recipient: rate ceilings count
    /// rows that are already committed.
    pub async fn resolve(&self, event: &Event, now: DateTime<Utc>) -> Result<Resolution> {
        self.resolve_with(event, None, now).await
    }

    /// Like [`Self::resolve`], but targets exactly `channel` regardless of
    /// the channels the recipient enabled. Quiet hours and rate ceilings
    /// still apply.
    pub async fn resolve_on_channel(
        &self,
        event: &Event,
        channel: Channel,
        now: DateTime<Utc>,
    ) -> Result<Resolution> {
        self.resolve_with(event, Some(channel), now).await
    }

    async fn resolve_with(
        &self,
        event: &Event,
        only: Option<Channel>,
        now: DateTime<Utc>,
    ) -> Result<Resolution> {
        let mut resolution = Resolution::default();
        for recipient in &event.subjects {
            let mut preference = self
                .preferences
                .get_preferences(recipient, event.trigger)
                .await?;
            if let Some(channel) = only {
                preference.channels = vec![channel];
            }
            self.resolve_recipient(event, recipient, &preference, now, &mut resolution)
                .await?;
        }
        Ok(resolution)
    }

    async fn resolve_recipient(
        &self,
        event: &Event,
        recipient: &str,
        preference: &NotificationPreference,
        now: DateTime<Utc>,
        out: &mut Resolution,
    ) -> Result<()> {
        let now_ms = datetime_to_ms(now);
        let mut channels = preference.channels.clone();
        channels.sort();
        channels.dedup();

        if channels.is_empty() {
            debug!(event_id = %event.id, recipient, "No enabled channels");
            out.records.push(
                DeliveryRecordDbModel::new(recipient, DeliveryOutcome::Suppressed, now_ms)
                    .with_event(&event.id, event.trigger.as_str())
                    .with_response(SuppressionReason::NoEnabledChannels.as_ref()),
            );
            return Ok(());
        }

        let payload = notification_payload(event, recipient);
        for channel in channels {
            let decision = self.decide(event, recipient, preference, channel, now).await?;
            let draft = NotificationDbModel::new(
                &event.id,
                recipient,
                event.trigger,
                channel,
                event.priority,
                &payload,
                self.retry.max_attempts,
                now_ms,
            );

            match decision {
                ChannelDecision::Deliver => {
                    let expires_at = self.config.notification_ttl().map(|ttl| offset_ms(now_ms, ttl));
                    out.notifications.push(draft.expiring_at(expires_at));
                }
                ChannelDecision::DeferUntil(at) => {
                    let at_ms = datetime_to_ms(at);
                    let expires_at = self.config.notification_ttl().map(|ttl| offset_ms(at_ms, ttl));
                    let notification = draft
                        .deliver_not_before(at_ms)
                        .expiring_at(expires_at)
                        .with_note(SuppressionReason::QuietHours.as_ref());
                    out.records.push(
                        DeliveryRecordDbModel::new(recipient, DeliveryOutcome::Deferred, now_ms)
                            .with_event(&event.id, event.trigger.as_str())
                            .with_channel(channel)
                            .with_notification(&notification.id)
                            .with_response(SuppressionReason::QuietHours.as_ref()),
                    );
                    out.notifications.push(notification);
                }
                ChannelDecision::Suppress(reason) => {
                    debug!(
                        event_id = %event.id,
                        recipient,
                        channel = %channel,
                        reason = %reason,
                        "Channel suppressed"
                    );
                    let notification = draft
                        .with_status(NotificationStatus::Suppressed)
                        .with_note(reason.as_ref());
                    out.records.push(
                        DeliveryRecordDbModel::new(recipient, DeliveryOutcome::Suppressed, now_ms)
                            .with_event(&event.id, event.trigger.as_str())
                            .with_channel(channel)
                            .with_notification(&notification.id)
                            .with_response(reason.as_ref()),
                    );
                    out.notifications.push(notification);
                }
            }
        }
        Ok(())
    }

    async fn decide(
        &self,
        event: &Event,
        recipient: &str,
        preference: &NotificationPreference,
        channel: Channel,
        now: DateTime<Utc>,
    ) -> Result<ChannelDecision> {
        let tz = preference
            .quiet_hours
            .as_ref()
            .map(|q| q.tz())
            .unwrap_or(chrono_tz::UTC);

        if let Some(ceiling) = preference.ceiling_for(channel) {
            let since = ceiling.window_start(now, self.config.rate_window, tz);
            let count = self
                .notifications
                .count_toward_rate(recipient, channel, datetime_to_ms(since))
                .await?;
            if ceiling.is_exceeded_by(count) {
                return Ok(ChannelDecision::Suppress(SuppressionReason::RateLimitExceeded));
            }
        }

        if let Some(quiet) = &preference.quiet_hours
            && !event.priority.bypasses_quiet_hours()
            && !quiet.is_exempt(event.trigger)
            && quiet.contains(now)
        {
            return Ok(match self.config.quiet_hours_policy {
                QuietHoursPolicy::Suppress => ChannelDecision::Suppress(SuppressionReason::QuietHours),
                QuietHoursPolicy::Defer => match quiet.window_end_after(now) {
                    Some(end) => ChannelDecision::DeferUntil(end),
                    None => ChannelDecision::Suppress(SuppressionReason::QuietHours),
                },
            });
        }

        Ok(ChannelDecision::Deliver)
    }
}

/// The event payload plus the context keys templates rely on.
fn notification_payload(event: &Event, recipient: &str) -> Value {
    let mut map = match &event.payload {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    map.insert("event_id".into(), json!(event.id));
    map.insert("trigger".into(), json!(event.trigger.as_str()));
    map.insert("recipient".into(), json!(recipient));
    map.insert("occurred_at".into(), json!(event.occurred_at.to_rfc3339()));
    if let Some(actor) = &event.actor {
        map.insert("actor".into(), json!(actor));
    }
    Value::Object(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::init_memory_pool;
    use crate::database::repositories::{IngestTxOps, SqlxNotificationRepository};
    use crate::database::models::EventDbModel;
    use crate::domain::{NewEvent, Priority, QuietHours, RateCeiling, TriggerType};
    use crate::notification::preferences::StaticPreferenceSource;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, h, m, 0).unwrap()
    }

    async fn resolver(
        prefs: StaticPreferenceSource,
        config: ResolverConfig,
    ) -> (PreferenceResolver, Arc<SqlxNotificationRepository>, crate::database::DbPool) {
        let pool = init_memory_pool().await.unwrap();
        let repo = Arc::new(SqlxNotificationRepository::new(pool.clone()));
        let resolver = PreferenceResolver::new(
            Arc::new(prefs),
            repo.clone(),
            config,
            RetryPolicy::default(),
        );
        (resolver, repo, pool)
    }

    fn event(trigger: &str, subject: &str, now: DateTime<Utc>) -> Event {
        NewEvent::new(trigger)
            .with_actor("alice")
            .with_subject(subject)
            .validate(now)
            .unwrap()
    }

    #[tokio::test]
    async fn test_new_match_fans_out_per_channel() {
        let prefs = StaticPreferenceSource::new().with(
            "bob",
            TriggerType::NewMatch,
            NotificationPreference::new(vec![Channel::Email, Channel::Push]),
        );
        let (resolver, _, _) = resolver(prefs, ResolverConfig::default()).await;

        let event = event("new_match", "bob", at(12, 0));
        let resolution = resolver.resolve(&event, at(12, 0)).await.unwrap();

        let channels: Vec<_> = resolution.deliverable().map(|n| n.channel.clone()).collect();
        assert_eq!(channels, vec!["email", "push"]);
        assert!(resolution.records.is_empty());
        let payload = resolution.notifications[0].payload_json();
        assert_eq!(payload["actor"], "alice");
        assert_eq!(payload["recipient"], "bob");
    }

    #[tokio::test]
    async fn test_quiet_hours_suppress_non_urgent() {
        let prefs = StaticPreferenceSource::new().with(
            "bob",
            TriggerType::Favorited,
            NotificationPreference::new(vec![Channel::Push]).with_quiet_hours(QuietHours::default()),
        );
        let (resolver, _, _) = resolver(prefs, ResolverConfig::default()).await;

        let resolution = resolver
            .resolve(&event("favorited", "bob", at(23, 0)), at(23, 0))
            .await
            .unwrap();
        assert_eq!(resolution.deliverable().count(), 0);
        assert_eq!(resolution.suppressed_count(), 1);
        assert_eq!(
            resolution.records[0].provider_response.as_deref(),
            Some("quiet_hours")
        );
    }

    #[tokio::test]
    async fn test_quiet_hours_defer_policy_schedules_window_end() {
        let prefs = StaticPreferenceSource::new().with(
            "bob",
            TriggerType::Favorited,
            NotificationPreference::new(vec![Channel::Push]).with_quiet_hours(QuietHours::default()),
        );
        let config = ResolverConfig {
            quiet_hours_policy: QuietHoursPolicy::Defer,
            ..Default::default()
        };
        let (resolver, _, _) = resolver(prefs, config).await;

        let resolution = resolver
            .resolve(&event("favorited", "bob", at(23, 0)), at(23, 0))
            .await
            .unwrap();
        let pending: Vec<_> = resolution.deliverable().collect();
        assert_eq!(pending.len(), 1);
        let eight_am = Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).unwrap();
        assert_eq!(pending[0].next_attempt_at, eight_am.timestamp_millis());
    }

    #[tokio::test]
    async fn test_critical_and_exempt_triggers_bypass_quiet_hours() {
        let quiet = NotificationPreference::new(vec![Channel::Email]).with_quiet_hours(QuietHours::default());
        let prefs = StaticPreferenceSource::new()
            .with("bob", TriggerType::StatusBanned, quiet.clone())
            .with("bob", TriggerType::PiiRequest, quiet.clone())
            .with("bob", TriggerType::NewMatch, quiet);
        let (resolver, _, _) = resolver(prefs, ResolverConfig::default()).await;

        for trigger in ["status_banned", "pii_request"] {
            let resolution = resolver
                .resolve(&event(trigger, "bob", at(23, 0)), at(23, 0))
                .await
                .unwrap();
            assert_eq!(resolution.deliverable().count(), 1, "{trigger}");
        }

        let urgent = NewEvent::new("new_match")
            .with_subject("bob")
            .with_priority(Priority::Critical)
            .validate(at(23, 0))
            .unwrap();
        assert_eq!(
            resolver.resolve(&urgent, at(23, 0)).await.unwrap().deliverable().count(),
            1
        );
    }

    #[tokio::test]
    async fn test_rate_ceiling_counts_committed_rows() {
        let prefs = StaticPreferenceSource::new().with(
            "bob",
            TriggerType::NewMessage,
            NotificationPreference::new(vec![Channel::Sms])
                .with_ceiling(Channel::Sms, RateCeiling::per_day(2)),
        );
        let (resolver, repo, pool) = resolver(prefs, ResolverConfig::default()).await;

        for minute in 0..3 {
            let now = at(10, minute);
            let event = event("new_message", "bob", now);
            let resolution = resolver.resolve(&event, now).await.unwrap();
            let mut tx = pool.begin().await.unwrap();
            IngestTxOps::insert_event(&mut tx, &EventDbModel::from_event(&event, now.timestamp_millis()).unwrap())
                .await
                .unwrap();
            for n in &resolution.notifications {
                IngestTxOps::insert_notification(&mut tx, n).await.unwrap();
            }
            tx.commit().await.unwrap();

            let expected_pending = if minute < 2 { 1 } else { 0 };
            assert_eq!(resolution.deliverable().count(), expected_pending, "event {minute}");
        }

        let counted = repo
            .count_toward_rate("bob", Channel::Sms, at(0, 0).timestamp_millis())
            .await
            .unwrap();
        assert_eq!(counted, 2);
    }

    #[tokio::test]
    async fn test_no_channels_leaves_ledger_only_record() {
        let prefs = StaticPreferenceSource::new().with(
            "bob",
            TriggerType::ProfileView,
            NotificationPreference::new(vec![]),
        );
        let (resolver, _, _) = resolver(prefs, ResolverConfig::default()).await;

        let resolution = resolver
            .resolve(&event("profile_view", "bob", at(12, 0)), at(12, 0))
            .await
            .unwrap();
        assert!(resolution.notifications.is_empty());
        assert_eq!(resolution.records.len(), 1);
        assert!(resolution.records[0].notification_id.is_none());
        assert_eq!(
            resolution.records[0].provider_response.as_deref(),
            Some("no_enabled_channels")
        );
    }
}
