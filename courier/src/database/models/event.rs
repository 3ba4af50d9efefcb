//! Event database model.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::database::time::{datetime_to_ms, ms_to_datetime};
use crate::domain::{Event, Priority, TriggerType};
use crate::{Error, Result};

/// Immutable record of an ingested event.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct EventDbModel {
    pub id: String,
    pub event_type: String,
    pub actor: Option<String>,
    /// JSON array of user ids.
    pub subjects: String,
    pub priority: String,
    /// JSON object.
    pub payload: String,
    pub occurred_at: i64,
    pub ingested_at: i64,
}

impl EventDbModel {
    pub fn from_event(event: &Event, ingested_at: i64) -> Result<Self> {
        Ok(Self {
            id: event.id.clone(),
            event_type: event.trigger.to_string(),
            actor: event.actor.clone(),
            subjects: serde_json::to_string(&event.subjects)?,
            priority: event.priority.as_str().to_string(),
            payload: serde_json::to_string(&event.payload)?,
            occurred_at: datetime_to_ms(event.occurred_at),
            ingested_at,
        })
    }

    pub fn into_event(self) -> Result<Event> {
        let trigger = TriggerType::parse(&self.event_type).ok_or_else(|| {
            Error::Database(format!(
                "event {} has unknown type '{}'",
                self.id, self.event_type
            ))
        })?;
        Ok(Event {
            id: self.id,
            trigger,
            actor: self.actor,
            subjects: serde_json::from_str(&self.subjects)?,
            priority: Priority::parse(&self.priority).unwrap_or_default(),
            payload: serde_json::from_str(&self.payload)?,
            occurred_at: ms_to_datetime(self.occurred_at),
        })
    }
}
