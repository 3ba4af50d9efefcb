//! Recipient settings: preferences, contact details, templates and push
//! subscriptions.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::Result;
use crate::domain::NotificationPreference;

/// Saved preference row for (user, trigger).
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct NotificationPreferenceDbModel {
    pub user_id: String,
    pub trigger_type: String,
    pub channels: String,
    pub quiet_hours: Option<String>,
    pub rate_ceilings: String,
    pub updated_at: i64,
}

impl NotificationPreferenceDbModel {
    pub fn from_preference(
        user_id: impl Into<String>,
        trigger_type: impl Into<String>,
        preference: &NotificationPreference,
        now_ms: i64,
    ) -> Result<Self> {
        Ok(Self {
            user_id: user_id.into(),
            trigger_type: trigger_type.into(),
            channels: serde_json::to_string(&preference.channels)?,
            quiet_hours: preference
                .quiet_hours
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
            rate_ceilings: serde_json::to_string(&preference.rate_ceilings)?,
            updated_at: now_ms,
        })
    }

    pub fn to_preference(&self) -> Result<NotificationPreference> {
        Ok(NotificationPreference {
            channels: serde_json::from_str(&self.channels)?,
            quiet_hours: self
                .quiet_hours
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            rate_ceilings: serde_json::from_str(&self.rate_ceilings)?,
        })
    }
}

/// Where a user can be reached outside the app.
#[derive(Debug, Clone, Default, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct RecipientContactDbModel {
    pub user_id: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub updated_at: i64,
}

/// Message template for a (trigger, channel) pair.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct NotificationTemplateDbModel {
    pub trigger_type: String,
    pub channel: String,
    pub subject: Option<String>,
    pub body: String,
    pub max_length: Option<i64>,
    pub updated_at: i64,
}

/// A browser push endpoint registered by a user.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct PushSubscriptionDbModel {
    pub id: String,
    pub user_id: String,
    pub endpoint: String,
    pub p256dh: String,
    pub auth: String,
    /// Set while the push service is throttling this endpoint.
    pub next_attempt_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}
