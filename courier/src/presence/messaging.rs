//! Direct messages: live delivery when the recipient is connected here,
//! otherwise a single queued push notification.

use std::sync::Arc;

use serde::Serialize;
use serde_json::json;
use tracing::{debug, warn};

use super::broadcaster::PresenceBroadcaster;
use super::events::PresenceEvent;
use super::registry::ConnectionRegistry;
use crate::domain::{Channel, NewEvent};
use crate::notification::EventIngest;
use crate::utils::SharedClock;
use crate::utils::text::truncate_chars;

/// Characters of the message body carried in the push preview.
const PREVIEW_CHARS: usize = 120;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MessageOutcome {
    /// Handed to at least one live connection.
    Delivered { message_id: String, connections: usize },
    /// Recipient offline; a push notification was queued (or recorded as
    /// suppressed, in which case `notification_id` is `None`).
    QueuedPush {
        message_id: String,
        notification_id: Option<String>,
    },
    /// Neither path accepted the message.
    Failed { message_id: String, reason: String },
}

impl MessageOutcome {
    pub fn message_id(&self) -> &str {
        match self {
            Self::Delivered { message_id, .. }
            | Self::QueuedPush { message_id, .. }
            | Self::Failed { message_id, .. } => message_id,
        }
    }
}

pub struct DirectMessenger {
    registry: Arc<ConnectionRegistry>,
    broadcaster: Arc<PresenceBroadcaster>,
    ingest: Arc<EventIngest>,
    clock: SharedClock,
}

impl DirectMessenger {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        broadcaster: Arc<PresenceBroadcaster>,
        ingest: Arc<EventIngest>,
        clock: SharedClock,
    ) -> Self {
        Self {
            registry,
            broadcaster,
            ingest,
            clock,
        }
    }

    /// Send `body` from `from` to `to`. Never returns an error to the sender.
    pub async fn send_direct_message(&self, from: &str, to: &str, body: &str) -> MessageOutcome {
        let message_id = uuid::Uuid::new_v4().to_string();
        let now_ms = self.clock.now_ms();

        let frame = PresenceEvent::DirectMessage {
            id: message_id.clone(),
            from: from.to_string(),
            to: to.to_string(),
            body: body.to_string(),
            sent_at: now_ms,
        };
        let connections = self.registry.send_to_user(to, &frame);
        if connections > 0 {
            self.broadcaster.publish(PresenceEvent::MessageDelivered {
                id: message_id.clone(),
                from: from.to_string(),
                to: to.to_string(),
                at: now_ms,
            });
            debug!(message_id = %message_id, to, connections, "Direct message delivered live");
            return MessageOutcome::Delivered {
                message_id,
                connections,
            };
        }

        let event = NewEvent::new("new_message")
            .with_actor(from)
            .with_subject(to)
            .with_payload(json!({
                "message_id": message_id,
                "preview": truncate_chars(body, PREVIEW_CHARS),
            }));
        match self.ingest.ingest_on_channel(event, Channel::Push).await {
            Ok(receipt) => {
                debug!(message_id = %message_id, to, "Recipient offline, push queued");
                MessageOutcome::QueuedPush {
                    message_id,
                    notification_id: receipt.queued.into_iter().next(),
                }
            }
            Err(e) => {
                warn!(message_id = %message_id, to, error = %e, "Direct message fallback failed");
                MessageOutcome::Failed {
                    message_id,
                    reason: e.to_string(),
                }
            }
        }
    }
}
