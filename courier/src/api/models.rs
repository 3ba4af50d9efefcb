//! API request and response models.

use serde::{Deserialize, Serialize};

use crate::domain::NotificationPreference;

// ============================================================================
// Health
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
    pub components: Vec<ComponentHealth>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub name: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ComponentHealth {
    pub fn healthy(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: "healthy".to_string(),
            message: None,
        }
    }

    pub fn unhealthy(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: "unhealthy".to_string(),
            message: Some(message.into()),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == "healthy"
    }
}

// ============================================================================
// Notifications
// ============================================================================

/// `?limit=` on history listings.
#[derive(Debug, Clone, Deserialize)]
pub struct HistoryParams {
    #[serde(default = "default_history_limit")]
    pub limit: u32,
}

fn default_history_limit() -> u32 {
    50
}

impl HistoryParams {
    /// Clamped to 1..=500.
    pub fn effective_limit(&self) -> i64 {
        i64::from(self.limit.clamp(1, 500))
    }
}

// ============================================================================
// Users
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreferenceResponse {
    pub user: String,
    pub trigger: String,
    /// False when `preference` is the built-in default.
    pub saved: bool,
    pub preference: NotificationPreference,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateContactRequest {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
}

/// Browser `PushSubscription.toJSON()` shape.
#[derive(Debug, Clone, Deserialize)]
pub struct PushSubscriptionRequest {
    pub endpoint: String,
    pub keys: PushSubscriptionKeys,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PushSubscriptionKeys {
    pub p256dh: String,
    pub auth: String,
}

// ============================================================================
// Presence
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OnlineUsersResponse {
    pub users: Vec<String>,
    /// Connections held by this process.
    pub local_connections: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserPresenceResponse {
    pub user: String,
    pub online: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SendMessageRequest {
    pub from: String,
    pub to: String,
    pub body: String,
}

// ============================================================================
// Logging
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogFilterBody {
    pub filter: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_limit_is_clamped() {
        assert_eq!(HistoryParams { limit: 0 }.effective_limit(), 1);
        assert_eq!(HistoryParams { limit: 10_000 }.effective_limit(), 500);
        let parsed: HistoryParams = serde_json::from_str("{}").unwrap();
        assert_eq!(parsed.effective_limit(), 50);
    }

    #[test]
    fn test_push_subscription_browser_shape() {
        let req: PushSubscriptionRequest = serde_json::from_value(serde_json::json!({
            "endpoint": "https://push.example/abc",
            "keys": {"p256dh": "BPk", "auth": "xyz"}
        }))
        .unwrap();
        assert_eq!(req.keys.auth, "xyz");
    }
}
