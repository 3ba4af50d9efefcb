//! Message templates and rendering.
//!
//! Templates use `{key}` and `{key.nested}` placeholders resolved against
//! the notification payload. Placeholders with no matching value are left
//! untouched.

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::{Captures, Regex};
use serde::Serialize;
use serde_json::Value;

use crate::Result;
use crate::database::models::NotificationTemplateDbModel;
use crate::domain::{Channel, TriggerType};
use crate::utils::text::truncate_chars;

/// Default SMS body limit (one GSM segment).
pub const SMS_MAX_CHARS: usize = 160;

const PUSH_TITLE_MAX_CHARS: usize = 120;
const PUSH_BODY_MAX_CHARS: usize = 600;

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*(?:\.[A-Za-z0-9_]+)*)\}").unwrap()
});

/// A template ready to render.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    pub subject: Option<String>,
    pub body: String,
    pub max_length: Option<usize>,
}

impl Template {
    pub fn new(subject: Option<&str>, body: &str) -> Self {
        Self {
            subject: subject.map(str::to_string),
            body: body.to_string(),
            max_length: None,
        }
    }

    pub fn from_row(row: &NotificationTemplateDbModel) -> Self {
        Self {
            subject: row.subject.clone(),
            body: row.body.clone(),
            max_length: row.max_length.and_then(|n| usize::try_from(n).ok()).filter(|n| *n > 0),
        }
    }

    pub fn render(&self, channel: Channel, context: &Value) -> RenderedMessage {
        let subject = self.subject.as_deref().map(|s| render_str(s, context));
        let body = render_str(&self.body, context);

        let (subject, body) = match channel {
            Channel::Sms => (
                None,
                truncate_chars(&body, self.max_length.unwrap_or(SMS_MAX_CHARS)),
            ),
            Channel::Push => (
                subject.map(|s| truncate_chars(&s, PUSH_TITLE_MAX_CHARS)),
                truncate_chars(&body, self.max_length.unwrap_or(PUSH_BODY_MAX_CHARS)),
            ),
            Channel::Email => match self.max_length {
                Some(max) => (subject, truncate_chars(&body, max)),
                None => (subject, body),
            },
        };

        RenderedMessage { subject, body }
    }
}

/// Channel-ready content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RenderedMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    pub body: String,
}

/// Substitute placeholders in `template` from `context`.
pub fn render_str(template: &str, context: &Value) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &Captures<'_>| {
            let path = &caps[1];
            match lookup(context, path) {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Null) | None => caps[0].to_string(),
                Some(other) => other.to_string(),
            }
        })
        .into_owned()
}

fn lookup<'a>(context: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(context, |value, key| value.get(key))
}

/// Source of per-(trigger, channel) templates.
#[async_trait]
pub trait TemplateStore: Send + Sync {
    async fn find(&self, trigger: TriggerType, channel: Channel) -> Result<Option<Template>>;
}

/// Template used when the store has none for (trigger, channel).
pub fn builtin_template(trigger: TriggerType, channel: Channel) -> Template {
    let (subject, body) = match trigger {
        TriggerType::NewMatch => ("It's a match!", "{actor} is a new match for you."),
        TriggerType::MutualFavorite => (
            "You favorited each other",
            "You and {actor} favorited each other.",
        ),
        TriggerType::Favorited => ("Someone likes you", "{actor} added you to favorites."),
        TriggerType::ShortlistAdded => ("You were shortlisted", "{actor} shortlisted you."),
        TriggerType::ProfileView => ("Profile view", "{actor} viewed your profile."),
        TriggerType::NewMessage => ("New message from {actor}", "{actor} sent you a message."),
        TriggerType::UnreadMessages => ("Unread messages", "You have unread messages waiting."),
        TriggerType::PiiRequest => (
            "Contact details requested",
            "{actor} asked to see your contact details.",
        ),
        TriggerType::PiiGranted => (
            "Request approved",
            "{actor} shared their contact details with you.",
        ),
        TriggerType::PiiDenied => ("Request declined", "{actor} declined your request."),
        TriggerType::PiiExpiring => (
            "Access expiring",
            "Your access to {actor}'s contact details expires soon.",
        ),
        TriggerType::SuspiciousLogin => (
            "Security alert: new sign-in",
            "We noticed a sign-in to your account. If this wasn't you, reset your password now.",
        ),
        TriggerType::StatusSuspended => (
            "Your account has been suspended",
            "Your account has been suspended. Contact support for details.",
        ),
        TriggerType::StatusBanned => (
            "Your account has been closed",
            "Your account has been permanently closed.",
        ),
        TriggerType::StatusReactivated => (
            "Welcome back",
            "Your account is active again.",
        ),
        TriggerType::WeeklyDigest => ("Your weekly digest", "Here is what happened this week."),
    };

    let max_length = (channel == Channel::Sms).then_some(SMS_MAX_CHARS);
    Template {
        subject: Some(subject.to_string()),
        body: body.to_string(),
        max_length,
    }
}

/// Generic template for triggers nobody wrote copy for.
pub fn fallback_template() -> Template {
    Template::new(
        Some("New {trigger} notification"),
        "You have a new {trigger} notification.",
    )
}

/// Resolve the template for (trigger, channel): store first, built-in second.
pub async fn resolve_template(
    store: &dyn TemplateStore,
    trigger: Option<TriggerType>,
    channel: Channel,
) -> Result<Template> {
    let Some(trigger) = trigger else {
        return Ok(fallback_template());
    };
    if let Some(template) = store.find(trigger, channel).await? {
        return Ok(template);
    }
    Ok(builtin_template(trigger, channel))
}

/// Store with no saved templates; everything resolves to built-ins.
#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinTemplates;

#[async_trait]
impl TemplateStore for BuiltinTemplates {
    async fn find(&self, _trigger: TriggerType, _channel: Channel) -> Result<Option<Template>> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_render_flat_and_nested() {
        let ctx = json!({"actor": "alice", "match": {"firstName": "Bob", "age": 31}});
        assert_eq!(
            render_str("{actor} likes {match.firstName} ({match.age})", &ctx),
            "alice likes Bob (31)"
        );
    }

    #[test]
    fn test_missing_values_are_left_in_place() {
        let ctx = json!({"actor": null});
        assert_eq!(render_str("hi {actor} {who.knows}", &ctx), "hi {actor} {who.knows}");
        assert_eq!(render_str("{ not a placeholder }", &ctx), "{ not a placeholder }");
    }

    #[test]
    fn test_sms_is_truncated_and_has_no_subject() {
        let template = Template::new(Some("ignored"), "{msg}");
        let ctx = json!({"msg": "x".repeat(400)});
        let rendered = template.render(Channel::Sms, &ctx);
        assert!(rendered.subject.is_none());
        assert_eq!(rendered.body.chars().count(), SMS_MAX_CHARS);
    }

    #[test]
    fn test_template_max_length_overrides_default() {
        let row = NotificationTemplateDbModel {
            trigger_type: "new_match".into(),
            channel: "sms".into(),
            subject: None,
            body: "{actor} matched with you".into(),
            max_length: Some(10),
            updated_at: 0,
        };
        let rendered = Template::from_row(&row).render(Channel::Sms, &json!({"actor": "alice"}));
        assert_eq!(rendered.body.chars().count(), 10);
    }

    #[test]
    fn test_fallback_subject() {
        let rendered = fallback_template().render(Channel::Email, &json!({"trigger": "poke"}));
        assert_eq!(rendered.subject.as_deref(), Some("New poke notification"));
    }

    #[tokio::test]
    async fn test_resolve_prefers_builtin_when_store_is_empty() {
        let template = resolve_template(&BuiltinTemplates, Some(TriggerType::NewMatch), Channel::Email)
            .await
            .unwrap();
        let rendered = template.render(Channel::Email, &json!({"actor": "alice"}));
        assert_eq!(rendered.body, "alice is a new match for you.");
    }
}
