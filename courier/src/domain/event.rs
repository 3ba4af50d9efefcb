//! Domain events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use super::{Priority, TriggerType};
use crate::{Error, Result};

const MAX_ID_LEN: usize = 128;
const MAX_SUBJECTS: usize = 500;

/// An event as submitted by a collaborator, before validation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    /// Users implicated by the event. Accepts a single `subject` string too.
    #[serde(default, alias = "subject", deserialize_with = "one_or_many")]
    pub subjects: Vec<String>,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub occurred_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
}

impl NewEvent {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            payload: Value::Object(Default::default()),
            ..Default::default()
        }
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subjects.push(subject.into());
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Validate shape and normalize into an immutable [`Event`].
    ///
    /// Assigns a fresh id when none was supplied and stamps `occurred_at`
    /// with `now` when absent.
    pub fn validate(self, now: DateTime<Utc>) -> Result<Event> {
        let trigger = TriggerType::parse(&self.event_type).ok_or_else(|| {
            Error::invalid_event(format!("unknown event type '{}'", self.event_type))
        })?;

        let id = match self.id.map(|id| id.trim().to_string()) {
            Some(id) if id.is_empty() => {
                return Err(Error::invalid_event("event id must not be blank"));
            }
            Some(id) if id.len() > MAX_ID_LEN => {
                return Err(Error::invalid_event("event id is too long"));
            }
            Some(id) => id,
            None => uuid::Uuid::new_v4().to_string(),
        };

        let actor = match self.actor.map(|a| a.trim().to_string()) {
            Some(a) if a.is_empty() => None,
            other => other,
        };

        let mut subjects: Vec<String> = Vec::with_capacity(self.subjects.len());
        for subject in self.subjects {
            let subject = subject.trim();
            if subject.is_empty() {
                return Err(Error::invalid_event("subject must not be blank"));
            }
            if !subjects.iter().any(|s| s == subject) {
                subjects.push(subject.to_string());
            }
        }
        if subjects.is_empty() {
            return Err(Error::invalid_event("event has no subject"));
        }
        if subjects.len() > MAX_SUBJECTS {
            return Err(Error::invalid_event(format!(
                "event has {} subjects, limit is {}",
                subjects.len(),
                MAX_SUBJECTS
            )));
        }

        let payload = match self.payload {
            Value::Null => Value::Object(Default::default()),
            Value::Object(map) => Value::Object(map),
            other => {
                return Err(Error::invalid_event(format!(
                    "payload must be a JSON object, got {}",
                    json_kind(&other)
                )));
            }
        };

        Ok(Event {
            id,
            trigger,
            actor,
            subjects,
            priority: self.priority.unwrap_or_else(|| trigger.default_priority()),
            payload,
            occurred_at: self.occurred_at.unwrap_or(now),
        })
    }
}

/// A validated, immutable domain event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    pub id: String,
    pub trigger: TriggerType,
    pub actor: Option<String>,
    pub subjects: Vec<String>,
    pub priority: Priority,
    pub payload: Value,
    pub occurred_at: DateTime<Utc>,
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn one_or_many<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match Option::<OneOrMany>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(OneOrMany::One(s)) => vec![s],
        Some(OneOrMany::Many(v)) => v,
    })
}
