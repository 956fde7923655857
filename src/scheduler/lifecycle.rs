//! Watch lifecycle state machine.
//!
//! `pending → active ⇄ paused`, with terminal `cancelled` and
//! `completed`. Transition legality lives here so it can be tested
//! without a scheduler or a database.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatchState {
    Pending,
    Active,
    Paused,
    Cancelled,
    Completed,
}

impl WatchState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Cancelled => "cancelled",
            Self::Completed => "completed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(Self::Pending),
            "active" => Some(Self::Active),
            "paused" => Some(Self::Paused),
            "cancelled" => Some(Self::Cancelled),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }

    /// Cancelled and completed watches never check again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Completed)
    }

    pub fn can_transition_to(self, next: WatchState) -> bool {
        match (self, next) {
            (Self::Pending, Self::Active) => true,
            (Self::Active, Self::Paused) => true,
            (Self::Paused, Self::Active) => true,
            // Any non-terminal state can be cancelled or completed.
            (from, Self::Cancelled | Self::Completed) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for WatchState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Epoch second at which a watch should next fire, given the moment a
/// check was dispatched (or the watch resumed).
pub fn next_due_epoch(from: DateTime<Utc>, interval_seconds: u64) -> i64 {
    (from + Duration::seconds(interval_seconds as i64)).timestamp()
}
