//! Notification queue database models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::domain::{Channel, Priority, TriggerType};

/// Lifecycle of a queued notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationStatus {
    /// Waiting for `next_attempt_at`, leasable.
    Pending,
    /// Held by a dispatcher under a lease.
    Sending,
    Sent,
    /// Permanent failure or retries exhausted.
    Failed,
    /// Never delivered before its TTL ran out.
    Expired,
    /// Not delivered because of quiet hours or a rate ceiling.
    Suppressed,
    /// Withdrawn by an operator before it was leased.
    Cancelled,
}

impl NotificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sending => "sending",
            Self::Sent => "sent",
            Self::Failed => "failed",
            Self::Expired => "expired",
            Self::Suppressed => "suppressed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "sending" => Some(Self::Sending),
            "sent" => Some(Self::Sent),
            "failed" => Some(Self::Failed),
            "expired" => Some(Self::Expired),
            "suppressed" => Some(Self::Suppressed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Terminal states only change through an operator requeue.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Sending)
    }

    /// Terminal states an operator may put back into the queue.
    pub fn is_requeueable(&self) -> bool {
        matches!(self, Self::Failed | Self::Expired | Self::Cancelled)
    }
}

impl std::fmt::Display for NotificationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of the notification queue: a single (recipient, channel) delivery.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct NotificationDbModel {
    pub id: String,
    pub event_id: String,
    pub recipient: String,
    pub trigger_type: String,
    pub channel: String,
    pub priority: i64,
    /// JSON object: the event payload plus actor/recipient context.
    pub payload: String,
    pub status: String,
    pub attempts: i64,
    pub max_attempts: i64,
    pub next_attempt_at: i64,
    pub lease_token: Option<String>,
    pub lease_expires_at: Option<i64>,
    pub last_error: Option<String>,
    pub expires_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl NotificationDbModel {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        event_id: impl Into<String>,
        recipient: impl Into<String>,
        trigger: TriggerType,
        channel: Channel,
        priority: Priority,
        payload: &serde_json::Value,
        max_attempts: u32,
        now_ms: i64,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            event_id: event_id.into(),
            recipient: recipient.into(),
            trigger_type: trigger.to_string(),
            channel: channel.as_str().to_string(),
            priority: priority.rank(),
            payload: payload.to_string(),
            status: NotificationStatus::Pending.as_str().to_string(),
            attempts: 0,
            max_attempts: i64::from(max_attempts),
            next_attempt_at: now_ms,
            lease_token: None,
            lease_expires_at: None,
            last_error: None,
            expires_at: None,
            created_at: now_ms,
            updated_at: now_ms,
        }
    }

    pub fn with_status(mut self, status: NotificationStatus) -> Self {
        self.status = status.as_str().to_string();
        self
    }

    pub fn deliver_not_before(mut self, at_ms: i64) -> Self {
        self.next_attempt_at = at_ms;
        self
    }

    pub fn expiring_at(mut self, at_ms: Option<i64>) -> Self {
        self.expires_at = at_ms;
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.last_error = Some(note.into());
        self
    }

    pub fn get_status(&self) -> Option<NotificationStatus> {
        NotificationStatus::parse(&self.status)
    }

    pub fn get_channel(&self) -> Option<Channel> {
        Channel::parse(&self.channel)
    }

    pub fn get_trigger(&self) -> Option<TriggerType> {
        TriggerType::parse(&self.trigger_type)
    }

    pub fn get_priority(&self) -> Priority {
        Priority::from_rank(self.priority)
    }

    pub fn payload_json(&self) -> serde_json::Value {
        serde_json::from_str(&self.payload)
            .unwrap_or_else(|_| serde_json::Value::Object(Default::default()))
    }

    /// Whether the lease allows no further attempts.
    pub fn attempts_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}

/// Lightweight status view returned to pollers.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct NotificationStatusView {
    pub id: String,
    pub recipient: String,
    pub channel: String,
    pub trigger_type: String,
    pub status: String,
    pub attempts: i64,
    pub max_attempts: i64,
    pub next_attempt_at: i64,
    pub last_error: Option<String>,
    pub updated_at: i64,
}

/// Queue depth per status, for operators.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: i64,
    pub sending: i64,
    pub sent: i64,
    pub failed: i64,
    pub expired: i64,
    pub suppressed: i64,
    pub cancelled: i64,
}

impl QueueStats {
    pub fn record(&mut self, status: &str, count: i64) {
        match NotificationStatus::parse(status) {
            Some(NotificationStatus::Pending) => self.pending += count,
            Some(NotificationStatus::Sending) => self.sending += count,
            Some(NotificationStatus::Sent) => self.sent += count,
            Some(NotificationStatus::Failed) => self.failed += count,
            Some(NotificationStatus::Expired) => self.expired += count,
            Some(NotificationStatus::Suppressed) => self.suppressed += count,
            Some(NotificationStatus::Cancelled) => self.cancelled += count,
            None => {}
        }
    }
}
