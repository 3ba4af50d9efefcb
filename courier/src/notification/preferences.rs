//! Preference lookup.
//!
//! Preferences belong to the external settings subsystem; the resolver only
//! reads them through [`PreferenceSource`].

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::Result;
use crate::domain::{NotificationPreference, TriggerType};

#[async_trait]
pub trait PreferenceSource: Send + Sync {
    /// Preference for (user, trigger), falling back to the trigger defaults
    /// when the user never saved one.
    async fn get_preferences(
        &self,
        user: &str,
        trigger: TriggerType,
    ) -> Result<NotificationPreference>;
}

/// In-memory preference source for embedding and tests.
#[derive(Debug, Default)]
pub struct StaticPreferenceSource {
    entries: RwLock<HashMap<(String, TriggerType), NotificationPreference>>,
}

impl StaticPreferenceSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, user: impl Into<String>, trigger: TriggerType, pref: NotificationPreference) {
        self.entries.write().insert((user.into(), trigger), pref);
    }

    pub fn with(self, user: impl Into<String>, trigger: TriggerType, pref: NotificationPreference) -> Self {
        self.set(user, trigger, pref);
        self
    }
}

#[async_trait]
impl PreferenceSource for StaticPreferenceSource {
    async fn get_preferences(
        &self,
        user: &str,
        trigger: TriggerType,
    ) -> Result<NotificationPreference> {
        Ok(self
            .entries
            .read()
            .get(&(user.to_string(), trigger))
            .cloned()
            .unwrap_or_else(|| NotificationPreference::defaults_for(trigger)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Channel;

    #[tokio::test]
    async fn test_static_source_falls_back_to_defaults() {
        let source = StaticPreferenceSource::new().with(
            "bob",
            TriggerType::NewMatch,
            NotificationPreference::new(vec![Channel::Sms]),
        );

        let saved = source.get_preferences("bob", TriggerType::NewMatch).await.unwrap();
        assert_eq!(saved.channels, vec![Channel::Sms]);

        let fallback = source.get_preferences("carol", TriggerType::NewMatch).await.unwrap();
        assert_eq!(fallback.channels, vec![Channel::Email, Channel::Push]);
    }
}
