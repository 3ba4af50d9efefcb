//! Priority value object.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Delivery priority of a notification.
///
/// Dispatchers lease higher priorities first. `Critical` notifications ignore
/// the recipient's quiet hours.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl Priority {
    /// Convert to database string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    /// Parse from database string representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Some(Self::Low),
            "medium" | "normal" => Some(Self::Medium),
            "high" => Some(Self::High),
            "critical" | "urgent" => Some(Self::Critical),
            _ => None,
        }
    }

    /// Numeric rank stored alongside queued rows (higher = leased first).
    pub fn rank(&self) -> i64 {
        match self {
            Self::Low => 0,
            Self::Medium => 1,
            Self::High => 2,
            Self::Critical => 3,
        }
    }

    pub fn from_rank(rank: i64) -> Self {
        match rank {
            i64::MIN..=0 => Self::Low,
            1 => Self::Medium,
            2 => Self::High,
            _ => Self::Critical,
        }
    }

    /// Whether notifications at this priority are delivered during quiet hours.
    pub fn bypasses_quiet_hours(&self) -> bool {
        matches!(self, Self::Critical)
    }
}

impl PartialOrd for Priority {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Priority {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank().cmp(&other.rank())
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| format!("Invalid priority: {}", s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::High > Priority::Medium);
        assert!(Priority::Medium > Priority::Low);
    }

    #[test]
    fn test_priority_parse_aliases() {
        assert_eq!(Priority::parse("HIGH"), Some(Priority::High));
        assert_eq!(Priority::parse("normal"), Some(Priority::Medium));
        assert_eq!(Priority::parse("urgent"), Some(Priority::Critical));
        assert_eq!(Priority::parse("whenever"), None);
    }

    #[test]
    fn test_rank_round_trip_clamps() {
        assert_eq!(Priority::from_rank(-4), Priority::Low);
        assert_eq!(Priority::from_rank(9), Priority::Critical);
        assert_eq!(Priority::from_rank(Priority::High.rank()), Priority::High);
    }

    #[test]
    fn test_only_critical_bypasses_quiet_hours() {
        assert!(Priority::Critical.bypasses_quiet_hours());
        assert!(!Priority::High.bypasses_quiet_hours());
    }

    #[test]
    fn test_priority_serialization() {
        let json = serde_json::to_string(&Priority::Critical).unwrap();
        assert_eq!(json, "\"critical\"");
        let parsed: Priority = serde_json::from_str("\"low\"").unwrap();
        assert_eq!(parsed, Priority::Low);
    }
}
