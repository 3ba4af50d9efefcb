//! SMS channel over an HTTP SMS API, with a global daily spend ceiling.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{
    DeliveryError, DeliveryReceipt, DeliveryResult, DispatchOutcome, OutboundMessage,
    ProviderAdapter, RecipientDirectory, error_body, retry_after_delay, send_with_timeout,
};
use crate::config::env_string;
use crate::database::models::NotificationDbModel;
use crate::database::repositories::DeliveryLedger;
use crate::database::time::{datetime_to_ms, ms_to_datetime};
use crate::domain::{Channel, RatePeriod, RateWindowMode, next_utc_midnight, window_start};
use crate::utils::http_client::build_provider_client;
use crate::{Error, Result};

/// SMS API configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmsProviderConfig {
    /// Endpoint accepting `POST {from, to, body}`.
    pub api_url: String,
    pub api_key: String,
    pub from_number: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_timeout() -> u64 {
    10
}

impl SmsProviderConfig {
    /// Read `COURIER_SMS_API_URL`, `COURIER_SMS_API_KEY` and `COURIER_SMS_FROM`.
    pub fn from_env() -> Result<Option<Self>> {
        let api_url = env_string("COURIER_SMS_API_URL");
        let api_key = env_string("COURIER_SMS_API_KEY");
        let (api_url, api_key) = match (api_url, api_key) {
            (None, None) => return Ok(None),
            (Some(url), Some(key)) => (url, key),
            _ => {
                return Err(Error::config(
                    "Both COURIER_SMS_API_URL and COURIER_SMS_API_KEY must be set",
                ));
            }
        };
        url::Url::parse(&api_url)
            .map_err(|e| Error::config(format!("Invalid COURIER_SMS_API_URL: {e}")))?;
        let from_number = env_string("COURIER_SMS_FROM")
            .ok_or_else(|| Error::config("COURIER_SMS_FROM must be set with the SMS API"))?;
        Ok(Some(Self {
            api_url,
            api_key,
            from_number,
            timeout_secs: default_timeout(),
        }))
    }
}

pub struct HttpSmsProvider {
    config: SmsProviderConfig,
    client: Client,
}

impl HttpSmsProvider {
    pub fn new(config: SmsProviderConfig) -> Self {
        let client = build_provider_client(
            Duration::from_secs(config.timeout_secs),
            concat!("courier/", env!("CARGO_PKG_VERSION")),
        );
        Self { config, client }
    }
}

/// E.164: `+` followed by 8 to 15 digits.
fn is_e164(number: &str) -> bool {
    let Some(digits) = number.strip_prefix('+') else {
        return false;
    };
    (8..=15).contains(&digits.len()) && digits.bytes().all(|b| b.is_ascii_digit())
}

#[async_trait]
impl ProviderAdapter for HttpSmsProvider {
    type Destination = String;

    fn name(&self) -> &'static str {
        "sms-http"
    }

    async fn send(&self, to: &String, message: &OutboundMessage) -> DeliveryResult {
        if !is_e164(to) {
            return Err(DeliveryError::invalid_destination(format!(
                "not an E.164 number: {to}"
            )));
        }

        let response = self
            .client
            .post(&self.config.api_url)
            .bearer_auth(&self.config.api_key)
            .json(&json!({
                "from": self.config.from_number,
                "to": to,
                "body": message.content.body,
                "reference": message.notification_id,
            }))
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            let body: serde_json::Value = response.json().await.unwrap_or_default();
            let id = body
                .get("sid")
                .or_else(|| body.get("id"))
                .and_then(|v| v.as_str())
                .unwrap_or("accepted")
                .to_string();
            // Providers report price as a negative or positive decimal string.
            let cost = body
                .get("price")
                .and_then(|v| match v {
                    serde_json::Value::String(s) => s.parse::<f64>().ok(),
                    other => other.as_f64(),
                })
                .map(f64::abs)
                .unwrap_or(0.0);
            return Ok(DeliveryReceipt::new(id).with_cost(cost));
        }

        let retry_after = retry_after_delay(&response);
        let body = error_body(response).await;
        Err(DeliveryError::from_status(status, retry_after, &body))
    }
}

#[derive(Debug, Default)]
struct SpendState {
    day_start_ms: i64,
    committed: f64,
    in_flight: f64,
    refreshed_at_ms: i64,
}

/// Tracks SMS spend for the current UTC day against a global ceiling.
///
/// Committed spend is reloaded from the ledger when the day rolls over and
/// periodically, so several processes converge on the shared total.
/// Reservations made by this process count until they settle.
pub struct SpendGuard {
    ledger: Arc<dyn DeliveryLedger>,
    daily_ceiling: Option<f64>,
    refresh_every_ms: i64,
    state: Mutex<SpendState>,
}

impl SpendGuard {
    pub fn new(ledger: Arc<dyn DeliveryLedger>, daily_ceiling: Option<f64>) -> Self {
        Self {
            ledger,
            daily_ceiling: daily_ceiling.filter(|c| c.is_finite() && *c >= 0.0),
            refresh_every_ms: 60_000,
            state: Mutex::new(SpendState {
                day_start_ms: i64::MIN,
                ..Default::default()
            }),
        }
    }

    pub fn daily_ceiling(&self) -> Option<f64> {
        self.daily_ceiling
    }

    /// Reserve `cost` for a send at `now_ms`.
    ///
    /// Returns `Some(resume_at_ms)` when the ceiling would be exceeded.
    pub async fn reserve(&self, cost: f64, now_ms: i64) -> Result<Option<i64>> {
        let Some(ceiling) = self.daily_ceiling else {
            return Ok(None);
        };
        let now = ms_to_datetime(now_ms);
        let day_start_ms = datetime_to_ms(window_start(
            RatePeriod::Daily,
            now,
            RateWindowMode::Calendar,
            chrono_tz::UTC,
        ));

        let mut state = self.state.lock().await;
        if state.day_start_ms != day_start_ms {
            state.day_start_ms = day_start_ms;
            state.in_flight = 0.0;
            state.refreshed_at_ms = i64::MIN;
        }
        if now_ms.saturating_sub(state.refreshed_at_ms) >= self.refresh_every_ms {
            state.committed = self.ledger.spend_since(Channel::Sms, day_start_ms).await?;
            state.refreshed_at_ms = now_ms;
        }

        if state.committed + state.in_flight + cost > ceiling + f64::EPSILON {
            return Ok(Some(datetime_to_ms(next_utc_midnight(now))));
        }
        state.in_flight += cost;
        Ok(None)
    }

    /// Release a reservation; `charged` is what the provider actually billed
    /// (zero when the send failed).
    pub async fn settle(&self, reserved: f64, charged: f64) {
        if self.daily_ceiling.is_none() {
            return;
        }
        let mut state = self.state.lock().await;
        state.in_flight = (state.in_flight - reserved).max(0.0);
        state.committed += charged;
    }
}

pub struct SmsDispatcher {
    provider: Arc<dyn ProviderAdapter<Destination = String>>,
    directory: Arc<dyn RecipientDirectory>,
    spend: Arc<SpendGuard>,
    cost_per_message: f64,
    call_timeout: Duration,
}

impl SmsDispatcher {
    pub fn new(
        provider: Arc<dyn ProviderAdapter<Destination = String>>,
        directory: Arc<dyn RecipientDirectory>,
        spend: Arc<SpendGuard>,
        cost_per_message: f64,
        call_timeout: Duration,
    ) -> Self {
        Self {
            provider,
            directory,
            spend,
            cost_per_message,
            call_timeout,
        }
    }

    pub fn provider_name(&self) -> &'static str {
        self.provider.name()
    }

    pub(super) async fn deliver(
        &self,
        notification: &NotificationDbModel,
        message: &OutboundMessage,
        now_ms: i64,
    ) -> Result<DispatchOutcome> {
        let Some(number) = self.directory.phone_for(&notification.recipient).await? else {
            return Ok(DispatchOutcome::Failed(DeliveryError::invalid_destination(
                "recipient has no phone number",
            )));
        };

        if let Some(resume_at_ms) = self.spend.reserve(self.cost_per_message, now_ms).await? {
            info!(
                notification_id = %notification.id,
                resume_at_ms,
                "SMS daily spend ceiling reached, deferring"
            );
            return Ok(DispatchOutcome::Deferred {
                until_ms: resume_at_ms,
                reason: "sms daily spend ceiling reached".to_string(),
            });
        }

        let result =
            send_with_timeout(self.provider.as_ref(), &number, message, self.call_timeout).await;
        match result {
            Ok(mut receipt) => {
                // Unpriced receipts are charged at the configured rate.
                if receipt.cost <= 0.0 {
                    receipt.cost = self.cost_per_message;
                }
                self.spend.settle(self.cost_per_message, receipt.cost).await;
                debug!(notification_id = %notification.id, cost = receipt.cost, "SMS accepted");
                Ok(DispatchOutcome::Delivered(receipt))
            }
            Err(e) => {
                self.spend.settle(self.cost_per_message, 0.0).await;
                if e.is_permanent() {
                    warn!(notification_id = %notification.id, error = %e, "SMS rejected");
                }
                Ok(DispatchOutcome::Failed(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::init_memory_pool;
    use crate::database::models::{DeliveryOutcome, DeliveryRecordDbModel};
    use crate::database::repositories::SqlxDeliveryLedger;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_e164() {
        assert!(is_e164("+14155550100"));
        assert!(!is_e164("14155550100"));
        assert!(!is_e164("+1415-555"));
        assert!(!is_e164("+123"));
    }

    #[tokio::test]
    async fn test_spend_guard_defers_until_next_midnight() {
        let ledger = Arc::new(SqlxDeliveryLedger::new(init_memory_pool().await.unwrap()));
        let noon = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let noon_ms = noon.timestamp_millis();

        // 0.90 already spent today.
        ledger
            .append(
                &DeliveryRecordDbModel::new("bob", DeliveryOutcome::Sent, noon_ms - 1_000)
                    .with_channel(Channel::Sms)
                    .with_cost(0.90),
            )
            .await
            .unwrap();

        let guard = SpendGuard::new(ledger, Some(1.0));
        assert_eq!(guard.reserve(0.05, noon_ms).await.unwrap(), None);
        let resume = guard.reserve(0.08, noon_ms).await.unwrap();
        assert_eq!(
            resume,
            Some(Utc.with_ymd_and_hms(2026, 3, 2, 0, 0, 0).unwrap().timestamp_millis())
        );

        // A failed send frees its reservation.
        guard.settle(0.05, 0.0).await;
        assert_eq!(guard.reserve(0.08, noon_ms).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_no_ceiling_never_defers() {
        let ledger = Arc::new(SqlxDeliveryLedger::new(init_memory_pool().await.unwrap()));
        let guard = SpendGuard::new(ledger, None);
        assert_eq!(guard.reserve(1_000.0, 0).await.unwrap(), None);
    }
}
