//! Email channel over an HTTP mail API.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use super::{
    DeliveryError, DeliveryReceipt, DeliveryResult, DispatchOutcome, OutboundMessage,
    ProviderAdapter, RecipientDirectory, error_body, retry_after_delay, send_with_timeout,
};
use crate::config::env_string;
use crate::database::models::NotificationDbModel;
use crate::utils::http_client::build_provider_client;
use crate::utils::text::escape_html;
use crate::{Error, Result};

/// Mail API configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailProviderConfig {
    /// Endpoint accepting `POST {from, to, subject, html, text}`.
    pub api_url: String,
    pub api_key: String,
    pub from_address: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_timeout() -> u64 {
    15
}

impl EmailProviderConfig {
    /// Read `COURIER_EMAIL_API_URL`, `COURIER_EMAIL_API_KEY` and
    /// `COURIER_EMAIL_FROM`. Returns `None` when the channel is not configured.
    pub fn from_env() -> Result<Option<Self>> {
        let api_url = env_string("COURIER_EMAIL_API_URL");
        let api_key = env_string("COURIER_EMAIL_API_KEY");
        let (api_url, api_key) = match (api_url, api_key) {
            (None, None) => return Ok(None),
            (Some(url), Some(key)) => (url, key),
            _ => {
                return Err(Error::config(
                    "Both COURIER_EMAIL_API_URL and COURIER_EMAIL_API_KEY must be set",
                ));
            }
        };
        url::Url::parse(&api_url)
            .map_err(|e| Error::config(format!("Invalid COURIER_EMAIL_API_URL: {e}")))?;
        let from_address = env_string("COURIER_EMAIL_FROM")
            .ok_or_else(|| Error::config("COURIER_EMAIL_FROM must be set with the email API"))?;
        let timeout_secs = match env_string("COURIER_EMAIL_TIMEOUT_SECS") {
            Some(v) => v
                .parse()
                .map_err(|_| Error::config(format!("Invalid COURIER_EMAIL_TIMEOUT_SECS: {v}")))?,
            None => default_timeout(),
        };
        Ok(Some(Self {
            api_url,
            api_key,
            from_address,
            timeout_secs,
        }))
    }
}

pub struct HttpEmailProvider {
    config: EmailProviderConfig,
    client: Client,
}

impl HttpEmailProvider {
    pub fn new(config: EmailProviderConfig) -> Self {
        let client = build_provider_client(
            Duration::from_secs(config.timeout_secs),
            concat!("courier/", env!("CARGO_PKG_VERSION")),
        );
        Self { config, client }
    }

    fn build_html(message: &OutboundMessage) -> String {
        let subject = message.content.subject.as_deref().unwrap_or_default();
        let paragraphs: String = message
            .content
            .body
            .split("\n\n")
            .map(|p| format!("<p>{}</p>", escape_html(p).replace('\n', "<br>")))
            .collect();
        format!(
            r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"><title>{}</title></head>
<body style="font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif; color: #222;">
<div style="max-width: 600px; margin: 0 auto; padding: 24px;">
<h2>{}</h2>
{}
</div>
</body>
</html>"#,
            escape_html(subject),
            escape_html(subject),
            paragraphs
        )
    }
}

#[async_trait]
impl ProviderAdapter for HttpEmailProvider {
    type Destination = String;

    fn name(&self) -> &'static str {
        "email-http"
    }

    async fn send(&self, to: &String, message: &OutboundMessage) -> DeliveryResult {
        let subject = message.content.subject.clone().unwrap_or_default();
        let payload = json!({
            "from": self.config.from_address,
            "to": [to],
            "subject": subject,
            "html": Self::build_html(message),
            "text": message.content.body,
            "headers": { "X-Notification-Id": message.notification_id },
        });

        let response = self
            .client
            .post(&self.config.api_url)
            .bearer_auth(&self.config.api_key)
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            let body: serde_json::Value = response.json().await.unwrap_or_default();
            let id = body
                .get("id")
                .and_then(|v| v.as_str())
                .unwrap_or("accepted")
                .to_string();
            debug!(notification_id = %message.notification_id, provider_id = %id, "Email accepted");
            return Ok(DeliveryReceipt::new(id));
        }

        let retry_after = retry_after_delay(&response);
        let body = error_body(response).await;
        // Mail APIs answer 422 for malformed or rejected recipients.
        if status.as_u16() == 422 {
            return Err(DeliveryError::invalid_destination(format!(
                "provider rejected recipient: {body}"
            )));
        }
        Err(DeliveryError::from_status(status, retry_after, &body))
    }
}

pub struct EmailDispatcher {
    provider: Arc<dyn ProviderAdapter<Destination = String>>,
    directory: Arc<dyn RecipientDirectory>,
    call_timeout: Duration,
}

impl EmailDispatcher {
    pub fn new(
        provider: Arc<dyn ProviderAdapter<Destination = String>>,
        directory: Arc<dyn RecipientDirectory>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            provider,
            directory,
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
    ) -> Result<DispatchOutcome> {
        let Some(address) = self.directory.email_for(&notification.recipient).await? else {
            return Ok(DispatchOutcome::Failed(DeliveryError::invalid_destination(
                "recipient has no email address",
            )));
        };

        let outcome = match send_with_timeout(
            self.provider.as_ref(),
            &address,
            message,
            self.call_timeout,
        )
        .await
        {
            Ok(receipt) => DispatchOutcome::Delivered(receipt),
            Err(e) => DispatchOutcome::Failed(e),
        };
        Ok(outcome)
    }
}
