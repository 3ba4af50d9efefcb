//! Frames published to connected clients.

use serde::{Deserialize, Serialize};

/// Everything the gateway pushes down a client connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PresenceEvent {
    /// A watched user came online or went offline.
    PresenceChanged {
        user: String,
        online: bool,
        at: i64,
    },
    /// A direct message for the connection's user.
    DirectMessage {
        id: String,
        from: String,
        to: String,
        body: String,
        sent_at: i64,
    },
    /// Tells the sender a direct message reached a live connection.
    MessageDelivered {
        id: String,
        from: String,
        to: String,
        at: i64,
    },
}

impl PresenceEvent {
    pub fn presence_changed(user: impl Into<String>, online: bool, at: i64) -> Self {
        Self::PresenceChanged {
            user: user.into(),
            online,
            at,
        }
    }

    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PresenceChanged { .. } => "presence_changed",
            Self::DirectMessage { .. } => "direct_message",
            Self::MessageDelivered { .. } => "message_delivered",
        }
    }
}

/// Frames a client may send over the gateway socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Heartbeat,
    Watch { user: String },
    Unwatch { user: String },
    Message { to: String, body: String },
}
