//! Rate ceiling value object.

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

/// Length of a rate-limit window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum RatePeriod {
    Hourly,
    Daily,
    Weekly,
}

impl RatePeriod {
    pub fn duration(&self) -> Duration {
        match self {
            Self::Hourly => Duration::hours(1),
            Self::Daily => Duration::days(1),
            Self::Weekly => Duration::weeks(1),
        }
    }
}

/// How a rate window is anchored.
///
/// `Rolling` looks back one full period from now. `Calendar` counts from the
/// start of the current hour, day or ISO week in the user's timezone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, strum::Display, strum::EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum RateWindowMode {
    Rolling,
    #[default]
    Calendar,
}

/// Maximum number of notifications per (user, channel) within a period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateCeiling {
    pub max: u32,
    pub period: RatePeriod,
}

impl RateCeiling {
    pub fn new(max: u32, period: RatePeriod) -> Self {
        Self { max, period }
    }

    pub fn per_day(max: u32) -> Self {
        Self::new(max, RatePeriod::Daily)
    }

    pub fn window_start(&self, now: DateTime<Utc>, mode: RateWindowMode, tz: Tz) -> DateTime<Utc> {
        window_start(self.period, now, mode, tz)
    }

    pub fn is_exceeded_by(&self, count: u64) -> bool {
        count >= u64::from(self.max)
    }
}

/// Start of the window containing `now`.
pub fn window_start(
    period: RatePeriod,
    now: DateTime<Utc>,
    mode: RateWindowMode,
    tz: Tz,
) -> DateTime<Utc> {
    let rolling = now - period.duration();
    if mode == RateWindowMode::Rolling {
        return rolling;
    }

    let local = now.with_timezone(&tz);
    let naive = match period {
        RatePeriod::Hourly => local
            .date_naive()
            .and_hms_opt(local.hour(), 0, 0),
        RatePeriod::Daily => local.date_naive().and_hms_opt(0, 0, 0),
        RatePeriod::Weekly => {
            let days_from_monday = i64::from(local.weekday().num_days_from_monday());
            (local.date_naive() - Duration::days(days_from_monday)).and_hms_opt(0, 0, 0)
        }
    };

    naive
        .and_then(|n| tz.from_local_datetime(&n).earliest())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(rolling)
}

/// Next UTC midnight after `now`.
pub fn next_utc_midnight(now: DateTime<Utc>) -> DateTime<Utc> {
    let tomorrow: Option<NaiveDate> = now.date_naive().succ_opt();
    tomorrow
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|n| Utc.from_utc_datetime(&n))
        .unwrap_or(now + Duration::days(1))
}
