//! Notification preferences.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::TriggerType;
use super::value_objects::{Channel, QuietHours, RateCeiling, RatePeriod};

/// Per (user, trigger) preference as returned by the settings subsystem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationPreference {
    pub channels: Vec<Channel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quiet_hours: Option<QuietHours>,
    /// Ceilings keyed by channel; channels without an entry are unlimited.
    #[serde(default)]
    pub rate_ceilings: BTreeMap<Channel, RateCeiling>,
}

impl NotificationPreference {
    pub fn new(channels: Vec<Channel>) -> Self {
        Self {
            channels,
            quiet_hours: None,
            rate_ceilings: BTreeMap::new(),
        }
    }

    /// Preference used when a user has never saved one for `trigger`.
    pub fn defaults_for(trigger: TriggerType) -> Self {
        Self {
            channels: trigger.default_channels(),
            quiet_hours: None,
            rate_ceilings: default_rate_ceilings(),
        }
    }

    pub fn with_quiet_hours(mut self, quiet_hours: QuietHours) -> Self {
        self.quiet_hours = Some(quiet_hours);
        self
    }

    pub fn with_ceiling(mut self, channel: Channel, ceiling: RateCeiling) -> Self {
        self.rate_ceilings.insert(channel, ceiling);
        self
    }

    pub fn ceiling_for(&self, channel: Channel) -> Option<RateCeiling> {
        self.rate_ceilings.get(&channel).copied()
    }
}

pub fn default_rate_ceilings() -> BTreeMap<Channel, RateCeiling> {
    BTreeMap::from([
        (Channel::Sms, RateCeiling::new(5, RatePeriod::Daily)),
        (Channel::Email, RateCeiling::new(20, RatePeriod::Daily)),
    ])
}
