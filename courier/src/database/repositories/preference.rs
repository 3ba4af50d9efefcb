//! Preference repository backed by `notification_preference`.

use async_trait::async_trait;
use sqlx::SqlitePool;
use tracing::warn;

use crate::Result;
use crate::database::models::NotificationPreferenceDbModel;
use crate::domain::{NotificationPreference, TriggerType};
use crate::notification::preferences::PreferenceSource;

pub struct SqlxPreferenceRepository {
    pool: SqlitePool,
}

impl SqlxPreferenceRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get_saved(
        &self,
        user: &str,
        trigger: TriggerType,
    ) -> Result<Option<NotificationPreferenceDbModel>> {
        let row = sqlx::query_as::<_, NotificationPreferenceDbModel>(
            "SELECT * FROM notification_preference WHERE user_id = ? AND trigger_type = ?",
        )
        .bind(user)
        .bind(trigger.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn upsert(
        &self,
        user: &str,
        trigger: TriggerType,
        preference: &NotificationPreference,
        now_ms: i64,
    ) -> Result<()> {
        let row =
            NotificationPreferenceDbModel::from_preference(user, trigger.as_str(), preference, now_ms)?;
        sqlx::query(
            r#"
            INSERT INTO notification_preference
                (user_id, trigger_type, channels, quiet_hours, rate_ceilings, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(user_id, trigger_type) DO UPDATE SET
                channels = excluded.channels,
                quiet_hours = excluded.quiet_hours,
                rate_ceilings = excluded.rate_ceilings,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&row.user_id)
        .bind(&row.trigger_type)
        .bind(&row.channels)
        .bind(&row.quiet_hours)
        .bind(&row.rate_ceilings)
        .bind(row.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete(&self, user: &str, trigger: TriggerType) -> Result<()> {
        sqlx::query("DELETE FROM notification_preference WHERE user_id = ? AND trigger_type = ?")
            .bind(user)
            .bind(trigger.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl PreferenceSource for SqlxPreferenceRepository {
    async fn get_preferences(
        &self,
        user: &str,
        trigger: TriggerType,
    ) -> Result<NotificationPreference> {
        let Some(row) = self.get_saved(user, trigger).await? else {
            return Ok(NotificationPreference::defaults_for(trigger));
        };
        match row.to_preference() {
            Ok(pref) => Ok(pref),
            Err(e) => {
                warn!(
                    user = %user,
                    trigger = %trigger,
                    error = %e,
                    "Unreadable saved preference, using defaults"
                );
                Ok(NotificationPreference::defaults_for(trigger))
            }
        }
    }
}
