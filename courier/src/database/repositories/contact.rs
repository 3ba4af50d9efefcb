//! Contact details and push subscriptions.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::Result;
use crate::database::models::{PushSubscriptionDbModel, RecipientContactDbModel};
use crate::notification::channels::RecipientDirectory;

pub struct SqlxRecipientDirectory {
    pool: SqlitePool,
}

impl SqlxRecipientDirectory {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn upsert_contact(&self, contact: &RecipientContactDbModel) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO recipient_contact (user_id, email, phone, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(user_id) DO UPDATE SET
                email = excluded.email,
                phone = excluded.phone,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&contact.user_id)
        .bind(&contact.email)
        .bind(&contact.phone)
        .bind(contact.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_contact(&self, user: &str) -> Result<Option<RecipientContactDbModel>> {
        let row = sqlx::query_as::<_, RecipientContactDbModel>(
            "SELECT * FROM recipient_contact WHERE user_id = ?",
        )
        .bind(user)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Register (or re-key) a push endpoint. An endpoint belongs to exactly
    /// one user; re-registering moves it and clears any throttle.
    pub async fn upsert_push_subscription(&self, sub: &PushSubscriptionDbModel) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO push_subscription
                (id, user_id, endpoint, p256dh, auth, next_attempt_at, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, NULL, ?, ?)
            ON CONFLICT(endpoint) DO UPDATE SET
                user_id = excluded.user_id,
                p256dh = excluded.p256dh,
                auth = excluded.auth,
                next_attempt_at = NULL,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&sub.id)
        .bind(&sub.user_id)
        .bind(&sub.endpoint)
        .bind(&sub.p256dh)
        .bind(&sub.auth)
        .bind(sub.created_at)
        .bind(sub.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl RecipientDirectory for SqlxRecipientDirectory {
    async fn email_for(&self, user: &str) -> Result<Option<String>> {
        Ok(self
            .get_contact(user)
            .await?
            .and_then(|c| c.email)
            .filter(|e| !e.trim().is_empty()))
    }

    async fn phone_for(&self, user: &str) -> Result<Option<String>> {
        Ok(self
            .get_contact(user)
            .await?
            .and_then(|c| c.phone)
            .filter(|p| !p.trim().is_empty()))
    }

    async fn push_subscriptions_for(&self, user: &str) -> Result<Vec<PushSubscriptionDbModel>> {
        let rows = sqlx::query_as::<_, PushSubscriptionDbModel>(
            "SELECT * FROM push_subscription WHERE user_id = ? ORDER BY created_at",
        )
        .bind(user)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn remove_push_subscription(&self, endpoint: &str) -> Result<()> {
        sqlx::query("DELETE FROM push_subscription WHERE endpoint = ?")
            .bind(endpoint)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn throttle_push_subscription(&self, endpoint: &str, until_ms: i64) -> Result<()> {
        sqlx::query(
            "UPDATE push_subscription SET next_attempt_at = ?, updated_at = ? WHERE endpoint = ?",
        )
        .bind(until_ms)
        .bind(until_ms)
        .bind(endpoint)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
