//! Delivery channels.
//!
//! Each channel pairs a [`ProviderAdapter`] (the third-party boundary) with a
//! dispatcher that resolves the destination and applies channel rules:
//! - Email: HTTP mail API, HTML body
//! - SMS: HTTP SMS API, daily spend ceiling
//! - Push: Web Push (VAPID, aes128gcm), invalid endpoints removed

mod email;
mod push;
mod sms;

pub use email::{EmailDispatcher, EmailProviderConfig, HttpEmailProvider};
pub use push::{PushDispatcher, WebPushConfig, WebPushProvider};
pub use sms::{HttpSmsProvider, SmsDispatcher, SmsProviderConfig, SpendGuard};

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Serialize;

use super::templates::RenderedMessage;
use crate::Result;
use crate::database::models::{NotificationDbModel, PushSubscriptionDbModel};
use crate::domain::{Channel, Priority};

/// Classified provider failure.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DeliveryError {
    /// Worth retrying: network trouble, 5xx, rate limiting, timeouts.
    #[error("transient delivery failure: {reason}")]
    Transient {
        reason: String,
        retry_after: Option<Duration>,
    },
    /// Retrying cannot help.
    #[error("permanent delivery failure: {reason}")]
    Permanent {
        reason: String,
        /// The address, number or token itself was rejected.
        invalid_destination: bool,
    },
}

impl DeliveryError {
    pub fn transient(reason: impl Into<String>) -> Self {
        Self::Transient {
            reason: reason.into(),
            retry_after: None,
        }
    }

    pub fn permanent(reason: impl Into<String>) -> Self {
        Self::Permanent {
            reason: reason.into(),
            invalid_destination: false,
        }
    }

    pub fn invalid_destination(reason: impl Into<String>) -> Self {
        Self::Permanent {
            reason: reason.into(),
            invalid_destination: true,
        }
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent { .. })
    }

    pub fn reason(&self) -> &str {
        match self {
            Self::Transient { reason, .. } | Self::Permanent { reason, .. } => reason,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Transient { retry_after, .. } => *retry_after,
            Self::Permanent { .. } => None,
        }
    }

    /// Classify a non-success HTTP response.
    ///
    /// 408, 429 and 5xx are transient; 404/410 reject the destination; any
    /// other 4xx is permanent.
    pub fn from_status(status: StatusCode, retry_after: Option<Duration>, body: &str) -> Self {
        let reason = if body.is_empty() {
            format!("provider returned {status}")
        } else {
            format!("provider returned {status}: {body}")
        };
        match status.as_u16() {
            408 | 429 => Self::Transient {
                reason,
                retry_after,
            },
            404 | 410 => Self::invalid_destination(reason),
            400..=499 => Self::permanent(reason),
            _ => Self::Transient {
                reason,
                retry_after,
            },
        }
    }
}

impl From<reqwest::Error> for DeliveryError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return Self::transient(format!("provider request timed out: {err}"));
        }
        Self::transient(format!("provider request failed: {err}"))
    }
}

pub type DeliveryResult = std::result::Result<DeliveryReceipt, DeliveryError>;

/// What a provider reports back for an accepted message.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeliveryReceipt {
    pub provider_response: String,
    pub cost: f64,
}

impl DeliveryReceipt {
    pub fn new(provider_response: impl Into<String>) -> Self {
        Self {
            provider_response: provider_response.into(),
            cost: 0.0,
        }
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = cost;
        self
    }
}

/// Rendered content plus the routing facts a provider may need.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutboundMessage {
    pub notification_id: String,
    pub trigger_type: String,
    pub priority: Priority,
    #[serde(flatten)]
    pub content: RenderedMessage,
}

impl OutboundMessage {
    pub fn for_notification(notification: &NotificationDbModel, content: RenderedMessage) -> Self {
        Self {
            notification_id: notification.id.clone(),
            trigger_type: notification.trigger_type.clone(),
            priority: notification.get_priority(),
            content,
        }
    }
}

/// Boundary to a third-party delivery service.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    type Destination: Send + Sync;

    fn name(&self) -> &'static str;

    async fn send(&self, destination: &Self::Destination, message: &OutboundMessage)
    -> DeliveryResult;
}

/// Run a provider call under a hard timeout. Elapsing counts as transient.
pub async fn send_with_timeout<D: Send + Sync>(
    provider: &dyn ProviderAdapter<Destination = D>,
    destination: &D,
    message: &OutboundMessage,
    timeout: Duration,
) -> DeliveryResult {
    match tokio::time::timeout(timeout, provider.send(destination, message)).await {
        Ok(result) => result,
        Err(_) => Err(DeliveryError::transient(format!(
            "{} call exceeded {}ms",
            provider.name(),
            timeout.as_millis()
        ))),
    }
}

/// Where users can be reached: contact details and push subscriptions.
#[async_trait]
pub trait RecipientDirectory: Send + Sync {
    async fn email_for(&self, user: &str) -> Result<Option<String>>;
    async fn phone_for(&self, user: &str) -> Result<Option<String>>;
    /// Every subscription of `user`, throttled ones included.
    async fn push_subscriptions_for(&self, user: &str) -> Result<Vec<PushSubscriptionDbModel>>;
    async fn remove_push_subscription(&self, endpoint: &str) -> Result<()>;
    async fn throttle_push_subscription(&self, endpoint: &str, until_ms: i64) -> Result<()>;
}

/// Result of handing one leased notification to its channel.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    Delivered(DeliveryReceipt),
    Failed(DeliveryError),
    /// Not attempted; give the lease back until `until_ms`.
    Deferred { until_ms: i64, reason: String },
}

/// The fixed set of channel dispatchers.
pub enum ChannelDispatcher {
    Email(EmailDispatcher),
    Sms(SmsDispatcher),
    Push(PushDispatcher),
}

impl ChannelDispatcher {
    pub fn channel(&self) -> Channel {
        match self {
            Self::Email(_) => Channel::Email,
            Self::Sms(_) => Channel::Sms,
            Self::Push(_) => Channel::Push,
        }
    }

    pub fn provider_name(&self) -> &'static str {
        match self {
            Self::Email(d) => d.provider_name(),
            Self::Sms(d) => d.provider_name(),
            Self::Push(d) => d.provider_name(),
        }
    }

    pub async fn deliver(
        &self,
        notification: &NotificationDbModel,
        message: &OutboundMessage,
        now_ms: i64,
    ) -> Result<DispatchOutcome> {
        match self {
            Self::Email(d) => d.deliver(notification, message).await,
            Self::Sms(d) => d.deliver(notification, message, now_ms).await,
            Self::Push(d) => d.deliver(notification, message, now_ms).await,
        }
    }
}

/// Parse a `Retry-After` header given in seconds or as an HTTP date.
pub(crate) fn retry_after_delay(response: &reqwest::Response) -> Option<Duration> {
    let value = response.headers().get(reqwest::header::RETRY_AFTER)?;
    parse_retry_after(value.to_str().ok()?, chrono::Utc::now())
}

fn parse_retry_after(value: &str, now: chrono::DateTime<chrono::Utc>) -> Option<Duration> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = chrono::DateTime::parse_from_rfc2822(value).ok()?;
    (at.with_timezone(&chrono::Utc) - now).to_std().ok()
}

/// Read at most a short prefix of an error body for the ledger.
pub(crate) async fn error_body(response: reqwest::Response) -> String {
    let text = response.text().await.unwrap_or_default();
    crate::utils::text::truncate_chars(text.trim(), 500)
}
