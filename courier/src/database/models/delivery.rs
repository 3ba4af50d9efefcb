//! Delivery ledger database models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::domain::Channel;

/// What happened on a single ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryOutcome {
    Sent,
    TransientFailure,
    PermanentFailure,
    /// Not created or not attempted: quiet hours, rate ceiling, no channels.
    Suppressed,
    /// Leased but handed back without consuming an attempt (spend ceiling).
    Deferred,
}

impl DeliveryOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::TransientFailure => "transient_failure",
            Self::PermanentFailure => "permanent_failure",
            Self::Suppressed => "suppressed",
            Self::Deferred => "deferred",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sent" => Some(Self::Sent),
            "transient_failure" => Some(Self::TransientFailure),
            "permanent_failure" => Some(Self::PermanentFailure),
            "suppressed" => Some(Self::Suppressed),
            "deferred" => Some(Self::Deferred),
            _ => None,
        }
    }
}

impl std::fmt::Display for DeliveryOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Append-only ledger row. One per delivery attempt, plus one per suppression.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct DeliveryRecordDbModel {
    pub id: String,
    pub notification_id: Option<String>,
    pub event_id: Option<String>,
    pub recipient: String,
    pub channel: Option<String>,
    pub trigger_type: Option<String>,
    pub attempt_no: i64,
    pub outcome: String,
    pub provider_response: Option<String>,
    pub cost: f64,
    pub created_at: i64,
}

impl DeliveryRecordDbModel {
    pub fn new(recipient: impl Into<String>, outcome: DeliveryOutcome, now_ms: i64) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            notification_id: None,
            event_id: None,
            recipient: recipient.into(),
            channel: None,
            trigger_type: None,
            attempt_no: 0,
            outcome: outcome.as_str().to_string(),
            provider_response: None,
            cost: 0.0,
            created_at: now_ms,
        }
    }

    /// Ledger entry for an attempt on a queued notification.
    pub fn for_attempt(
        notification: &super::NotificationDbModel,
        outcome: DeliveryOutcome,
        now_ms: i64,
    ) -> Self {
        Self {
            notification_id: Some(notification.id.clone()),
            event_id: Some(notification.event_id.clone()),
            channel: Some(notification.channel.clone()),
            trigger_type: Some(notification.trigger_type.clone()),
            attempt_no: notification.attempts,
            ..Self::new(notification.recipient.clone(), outcome, now_ms)
        }
    }

    pub fn with_event(mut self, event_id: impl Into<String>, trigger_type: impl Into<String>) -> Self {
        self.event_id = Some(event_id.into());
        self.trigger_type = Some(trigger_type.into());
        self
    }

    pub fn with_channel(mut self, channel: Channel) -> Self {
        self.channel = Some(channel.as_str().to_string());
        self
    }

    pub fn with_notification(mut self, notification_id: impl Into<String>) -> Self {
        self.notification_id = Some(notification_id.into());
        self
    }

    pub fn with_response(mut self, response: impl Into<String>) -> Self {
        self.provider_response = Some(response.into());
        self
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = cost;
        self
    }

    pub fn get_outcome(&self) -> Option<DeliveryOutcome> {
        DeliveryOutcome::parse(&self.outcome)
    }
}
