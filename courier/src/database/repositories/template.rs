//! Template repository backed by `notification_template`.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::Result;
use crate::database::models::NotificationTemplateDbModel;
use crate::domain::{Channel, TriggerType};
use crate::notification::templates::{Template, TemplateStore};

pub struct SqlxTemplateRepository {
    pool: SqlitePool,
}

impl SqlxTemplateRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn upsert(&self, template: &NotificationTemplateDbModel) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO notification_template (trigger_type, channel, subject, body, max_length, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(trigger_type, channel) DO UPDATE SET
                subject = excluded.subject,
                body = excluded.body,
                max_length = excluded.max_length,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&template.trigger_type)
        .bind(&template.channel)
        .bind(&template.subject)
        .bind(&template.body)
        .bind(template.max_length)
        .bind(template.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list(&self) -> Result<Vec<NotificationTemplateDbModel>> {
        let rows = sqlx::query_as::<_, NotificationTemplateDbModel>(
            "SELECT * FROM notification_template ORDER BY trigger_type, channel",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

#[async_trait]
impl TemplateStore for SqlxTemplateRepository {
    async fn find(&self, trigger: TriggerType, channel: Channel) -> Result<Option<Template>> {
        let row = sqlx::query_as::<_, NotificationTemplateDbModel>(
            "SELECT * FROM notification_template WHERE trigger_type = ? AND channel = ?",
        )
        .bind(trigger.as_str())
        .bind(channel.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(Template::from_row))
    }
}
