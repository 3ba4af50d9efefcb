//! Application configuration.
//!
//! Every setting has a default; `COURIER_*` environment variables (optionally
//! from a `.env` file) override them. Values that are present but unparsable
//! are rejected instead of silently ignored.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::api::server::ApiServerConfig;
use crate::database::MaintenanceConfig;
use crate::domain::{RateWindowMode, RetryPolicy};
use crate::notification::channels::{EmailProviderConfig, SmsProviderConfig, WebPushConfig};
use crate::{Error, Result};

/// Top-level configuration for the daemon.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub api: ApiServerConfig,
    pub dispatch: DispatchConfig,
    pub sms: SmsConfig,
    pub presence: PresenceConfig,
    pub resolver: ResolverConfig,
    pub maintenance: MaintenanceConfig,
    pub providers: ProviderConfigs,
    pub log_dir: PathBuf,
}

impl AppConfig {
    /// Load `.env` (if any) and read the environment over the defaults.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            database: DatabaseConfig::from_env()?,
            api: ApiServerConfig::from_env_or_default(),
            dispatch: DispatchConfig::from_env()?,
            sms: SmsConfig::from_env()?,
            presence: PresenceConfig::from_env()?,
            resolver: ResolverConfig::from_env()?,
            maintenance: MaintenanceConfig::from_env()?,
            providers: ProviderConfigs::from_env()?,
            log_dir: env_string("COURIER_LOG_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("logs")),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.dispatch.validate()?;
        self.presence.validate()?;
        if let Some(ceiling) = self.sms.daily_spend_ceiling
            && !(ceiling.is_finite() && ceiling >= 0.0)
        {
            return Err(Error::config(format!(
                "SMS daily spend ceiling must be a non-negative number, got {ceiling}"
            )));
        }
        if !(self.sms.cost_per_message.is_finite() && self.sms.cost_per_message >= 0.0) {
            return Err(Error::config("SMS cost per message must be non-negative"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite:courier.db?mode=rwc".to_string(),
            max_connections: crate::database::default_pool_size(),
        }
    }
}

impl DatabaseConfig {
    fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Some(url) = env_string("COURIER_DATABASE_URL").or_else(|| env_string("DATABASE_URL")) {
            config.url = url;
        }
        if let Some(size) = env_parse("COURIER_DB_POOL_SIZE")? {
            config.max_connections = size;
        }
        Ok(config)
    }
}

/// Channel worker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Worker loops started per channel.
    pub workers_per_channel: usize,
    pub poll_interval_ms: u64,
    pub batch_size: u32,
    /// Visibility timeout of a lease.
    pub lease_duration_secs: u64,
    /// Hard bound on a single provider call.
    pub provider_timeout_secs: u64,
    /// How long shutdown waits for in-flight batches.
    pub drain_timeout_secs: u64,
    pub retry: RetryPolicy,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            workers_per_channel: 2,
            poll_interval_ms: 1_000,
            batch_size: 10,
            lease_duration_secs: 120,
            provider_timeout_secs: 10,
            drain_timeout_secs: 30,
            retry: RetryPolicy::default(),
        }
    }
}

impl DispatchConfig {
    fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Some(v) = env_parse("COURIER_WORKERS_PER_CHANNEL")? {
            config.workers_per_channel = v;
        }
        if let Some(v) = env_parse("COURIER_POLL_INTERVAL_MS")? {
            config.poll_interval_ms = v;
        }
        if let Some(v) = env_parse("COURIER_BATCH_SIZE")? {
            config.batch_size = v;
        }
        if let Some(v) = env_parse("COURIER_LEASE_SECS")? {
            config.lease_duration_secs = v;
        }
        if let Some(v) = env_parse("COURIER_PROVIDER_TIMEOUT_SECS")? {
            config.provider_timeout_secs = v;
        }
        if let Some(v) = env_parse("COURIER_DRAIN_TIMEOUT_SECS")? {
            config.drain_timeout_secs = v;
        }
        if let Some(v) = env_parse("COURIER_MAX_ATTEMPTS")? {
            config.retry.max_attempts = v;
        }
        if let Some(v) = env_parse("COURIER_RETRY_BASE_MS")? {
            config.retry.base_delay_ms = v;
        }
        if let Some(v) = env_parse("COURIER_RETRY_MAX_MS")? {
            config.retry.max_delay_ms = v;
        }
        if let Some(v) = env_bool("COURIER_RETRY_JITTER") {
            config.retry.use_jitter = v;
        }
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::config("batch size must be at least 1"));
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::config("max attempts must be at least 1"));
        }
        let batch_budget = u64::from(self.batch_size).saturating_mul(self.provider_timeout_secs);
        if self.provider_timeout_secs == 0 || self.lease_duration_secs <= batch_budget {
            return Err(Error::config(format!(
                "lease duration ({}s) must exceed batch size x provider timeout ({}s)",
                self.lease_duration_secs, batch_budget
            )));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(self.lease_duration_secs)
    }

    pub fn provider_timeout(&self) -> Duration {
        Duration::from_secs(self.provider_timeout_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

/// SMS spend control.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmsConfig {
    /// Global ceiling per UTC day, in the provider's currency. `None` disables it.
    pub daily_spend_ceiling: Option<f64>,
    /// Charged when the provider does not report a price.
    pub cost_per_message: f64,
}

impl Default for SmsConfig {
    fn default() -> Self {
        Self {
            daily_spend_ceiling: Some(50.0),
            cost_per_message: 0.0075,
        }
    }
}

impl SmsConfig {
    fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Some(raw) = env_string("COURIER_SMS_DAILY_SPEND_CEILING") {
            config.daily_spend_ceiling = match raw.to_ascii_lowercase().as_str() {
                "none" | "off" | "unlimited" => None,
                _ => Some(raw.parse().map_err(|_| {
                    Error::config(format!("Invalid COURIER_SMS_DAILY_SPEND_CEILING: {raw}"))
                })?),
            };
        }
        if let Some(v) = env_parse("COURIER_SMS_COST_PER_MESSAGE")? {
            config.cost_per_message = v;
        }
        Ok(config)
    }
}

/// Presence timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceConfig {
    /// Interval clients are expected to heartbeat at.
    pub heartbeat_interval_secs: u64,
    /// Lifetime of a connection entry without a heartbeat.
    pub entry_ttl_secs: u64,
    pub sweep_interval_secs: u64,
    pub broadcast_capacity: usize,
    /// Identifies this gateway process in the shared presence table.
    pub node_id: String,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 15,
            // Two missed heartbeats plus grace.
            entry_ttl_secs: 45,
            sweep_interval_secs: 5,
            broadcast_capacity: 1024,
            node_id: uuid::Uuid::new_v4().to_string(),
        }
    }
}

impl PresenceConfig {
    fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Some(v) = env_parse("COURIER_HEARTBEAT_SECS")? {
            config.heartbeat_interval_secs = v;
        }
        if let Some(v) = env_parse("COURIER_PRESENCE_TTL_SECS")? {
            config.entry_ttl_secs = v;
        }
        if let Some(v) = env_parse("COURIER_PRESENCE_SWEEP_SECS")? {
            config.sweep_interval_secs = v;
        }
        if let Some(v) = env_parse("COURIER_BROADCAST_CAPACITY")? {
            config.broadcast_capacity = v;
        }
        if let Some(v) = env_string("COURIER_NODE_ID") {
            config.node_id = v;
        }
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.entry_ttl_secs <= self.heartbeat_interval_secs {
            return Err(Error::config(
                "presence TTL must be longer than the heartbeat interval",
            ));
        }
        if self.broadcast_capacity == 0 || self.sweep_interval_secs == 0 {
            return Err(Error::config(
                "broadcast capacity and sweep interval must be positive",
            ));
        }
        Ok(())
    }

    pub fn entry_ttl(&self) -> Duration {
        Duration::from_secs(self.entry_ttl_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// What the resolver does with a notification that falls in quiet hours.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, strum::EnumString, strum::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum QuietHoursPolicy {
    /// Record a `suppressed` notification.
    #[default]
    Suppress,
    /// Queue it for the end of the window.
    Defer,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolverConfig {
    pub rate_window: RateWindowMode,
    pub quiet_hours_policy: QuietHoursPolicy,
    /// Pending notifications older than this expire. `None` keeps them forever.
    pub notification_ttl_secs: Option<u64>,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            rate_window: RateWindowMode::default(),
            quiet_hours_policy: QuietHoursPolicy::default(),
            notification_ttl_secs: Some(24 * 60 * 60),
        }
    }
}

impl ResolverConfig {
    fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Some(v) = env_parse("COURIER_RATE_WINDOW")? {
            config.rate_window = v;
        }
        if let Some(v) = env_parse("COURIER_QUIET_HOURS_POLICY")? {
            config.quiet_hours_policy = v;
        }
        if let Some(v) = env_parse::<u64>("COURIER_NOTIFICATION_TTL_SECS")? {
            config.notification_ttl_secs = (v > 0).then_some(v);
        }
        Ok(config)
    }

    pub fn notification_ttl(&self) -> Option<Duration> {
        self.notification_ttl_secs.map(Duration::from_secs)
    }
}

/// Provider credentials. A channel without a provider is not dispatched.
#[derive(Debug, Clone, Default)]
pub struct ProviderConfigs {
    pub email: Option<EmailProviderConfig>,
    pub sms: Option<SmsProviderConfig>,
    pub web_push: Option<WebPushConfig>,
}

impl ProviderConfigs {
    fn from_env() -> Result<Self> {
        Ok(Self {
            email: EmailProviderConfig::from_env()?,
            sms: SmsProviderConfig::from_env()?,
            web_push: WebPushConfig::from_env()?,
        })
    }
}

pub(crate) fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub(crate) fn env_parse<T: FromStr>(key: &str) -> Result<Option<T>> {
    match env_string(key) {
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| Error::config(format!("Invalid {key}: {raw}"))),
        None => Ok(None),
    }
}

pub(crate) fn env_bool(key: &str) -> Option<bool> {
    env_string(key).map(|v| {
        matches!(
            v.to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = AppConfig {
            database: DatabaseConfig::default(),
            api: ApiServerConfig::default(),
            dispatch: DispatchConfig::default(),
            sms: SmsConfig::default(),
            presence: PresenceConfig::default(),
            resolver: ResolverConfig::default(),
            maintenance: MaintenanceConfig::default(),
            providers: ProviderConfigs::default(),
            log_dir: PathBuf::from("logs"),
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_lease_must_outlive_provider_timeout() {
        let dispatch = DispatchConfig {
            lease_duration_secs: 5,
            provider_timeout_secs: 10,
            ..Default::default()
        };
        assert!(dispatch.validate().is_err());
    }

    #[test]
    fn test_lease_must_cover_a_whole_batch() {
        let dispatch = DispatchConfig {
            batch_size: 10,
            provider_timeout_secs: 10,
            lease_duration_secs: 60,
            ..Default::default()
        };
        assert!(dispatch.validate().is_err());

        let dispatch = DispatchConfig {
            lease_duration_secs: 101,
            ..dispatch
        };
        assert!(dispatch.validate().is_ok());
    }

    #[test]
    fn test_quiet_hours_policy_parse() {
        assert_eq!("defer".parse::<QuietHoursPolicy>().unwrap(), QuietHoursPolicy::Defer);
        assert_eq!("SUPPRESS".parse::<QuietHoursPolicy>().unwrap(), QuietHoursPolicy::Suppress);
        assert!("later".parse::<QuietHoursPolicy>().is_err());
    }
}
