//! Quiet hours value object.

use chrono::{DateTime, Duration, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::domain::TriggerType;

/// Per-user window during which non-urgent notifications are held back.
///
/// `start`/`end` are local wall-clock times in `timezone`. A window whose
/// start is later than its end wraps past midnight (22:00–08:00). The window
/// is half-open: a notification at exactly `end` is deliverable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuietHours {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(with = "hhmm", default = "default_start")]
    pub start: NaiveTime,
    #[serde(with = "hhmm", default = "default_end")]
    pub end: NaiveTime,
    /// IANA zone name; unknown names fall back to UTC.
    #[serde(default = "default_timezone")]
    pub timezone: String,
    /// Triggers delivered even inside the window.
    #[serde(default = "default_exceptions")]
    pub exceptions: Vec<TriggerType>,
}

fn default_true() -> bool {
    true
}

fn default_start() -> NaiveTime {
    NaiveTime::from_hms_opt(22, 0, 0).unwrap_or(NaiveTime::MIN)
}

fn default_end() -> NaiveTime {
    NaiveTime::from_hms_opt(8, 0, 0).unwrap_or(NaiveTime::MIN)
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_exceptions() -> Vec<TriggerType> {
    vec![TriggerType::PiiRequest, TriggerType::SuspiciousLogin]
}

impl Default for QuietHours {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            start: default_start(),
            end: default_end(),
            timezone: default_timezone(),
            exceptions: default_exceptions(),
        }
    }
}

impl QuietHours {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self {
            start,
            end,
            ..Default::default()
        }
    }

    pub fn with_timezone(mut self, timezone: impl Into<String>) -> Self {
        self.timezone = timezone.into();
        self
    }

    pub fn tz(&self) -> Tz {
        self.timezone.parse().unwrap_or(Tz::UTC)
    }

    pub fn is_exempt(&self, trigger: TriggerType) -> bool {
        self.exceptions.contains(&trigger)
    }

    /// Whether `at` falls inside the window in the user's local time.
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        if !self.enabled || self.start == self.end {
            return false;
        }
        let local = at.with_timezone(&self.tz()).time();
        if self.start < self.end {
            local >= self.start && local < self.end
        } else {
            local >= self.start || local < self.end
        }
    }

    /// The instant the current window closes, if `at` is inside one.
    pub fn window_end_after(&self, at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if !self.contains(at) {
            return None;
        }
        let tz = self.tz();
        let local = at.with_timezone(&tz);
        let mut end_date = local.date_naive();
        if self.start > self.end && local.time() >= self.start {
            end_date = end_date.succ_opt()?;
        }
        let naive_end = end_date.and_time(self.end);
        let resolved = tz
            .from_local_datetime(&naive_end)
            .earliest()
            // End falls into a DST gap; the first valid instant is an hour later.
            .or_else(|| tz.from_local_datetime(&(naive_end + Duration::hours(1))).earliest())?;
        Some(resolved.with_timezone(&Utc))
    }
}

mod hhmm {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(time: &NaiveTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&time.format("%H:%M").to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveTime, D::Error> {
        let raw = String::deserialize(deserializer)?;
        NaiveTime::parse_from_str(raw.trim(), "%H:%M")
            .or_else(|_| NaiveTime::parse_from_str(raw.trim(), "%H:%M:%S"))
            .map_err(serde::de::Error::custom)
    }
}
