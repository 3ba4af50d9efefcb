//! Trigger catalogue.
//!
//! A trigger type is the category of domain event that can produce a
//! notification. Ingested events carry one of these as their `type`.

use serde::{Deserialize, Serialize};

use super::value_objects::{Channel, Priority};

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    NewMatch,
    MutualFavorite,
    Favorited,
    ShortlistAdded,
    ProfileView,
    NewMessage,
    UnreadMessages,
    PiiRequest,
    PiiGranted,
    PiiDenied,
    PiiExpiring,
    SuspiciousLogin,
    StatusSuspended,
    StatusBanned,
    StatusReactivated,
    WeeklyDigest,
}

impl TriggerType {
    pub fn as_str(&self) -> &str {
        self.as_ref()
    }

    pub fn parse(s: &str) -> Option<Self> {
        s.trim().parse().ok()
    }

    /// Severity used when the event does not carry an explicit priority.
    pub fn default_priority(&self) -> Priority {
        match self {
            Self::SuspiciousLogin | Self::StatusBanned | Self::StatusSuspended => {
                Priority::Critical
            }
            Self::NewMatch
            | Self::MutualFavorite
            | Self::NewMessage
            | Self::PiiRequest
            | Self::PiiGranted
            | Self::StatusReactivated => Priority::High,
            Self::Favorited
            | Self::ShortlistAdded
            | Self::UnreadMessages
            | Self::PiiDenied
            | Self::PiiExpiring => Priority::Medium,
            Self::ProfileView | Self::WeeklyDigest => Priority::Low,
        }
    }

    /// Channels enabled for a recipient who never saved preferences.
    pub fn default_channels(&self) -> Vec<Channel> {
        match self {
            Self::NewMatch => vec![Channel::Email, Channel::Push],
            Self::NewMessage => vec![Channel::Sms, Channel::Push],
            Self::PiiRequest => vec![Channel::Email, Channel::Sms],
            Self::SuspiciousLogin | Self::StatusBanned | Self::StatusSuspended => {
                vec![Channel::Email, Channel::Sms]
            }
            Self::WeeklyDigest | Self::StatusReactivated => vec![Channel::Email],
            _ => vec![Channel::Push],
        }
    }
}
