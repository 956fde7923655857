use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::listings::models::{Listing, PropertyCategory, QualityTier};

/// Immutable snapshot of a watch's search parameters, taken at watch
/// creation (or last edit) time. Stored as a JSON document in the
/// criteria table and referenced by id from the watch; never copied
/// mutably.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Criteria {
    /// Location tags the watch accepts. Must be non-empty; the
    /// matching engine restricts to these before scoring anything.
    pub locations: Vec<String>,
    pub price_floor: Decimal,
    pub price_ceiling: Decimal,
    pub min_bedrooms: u32,
    pub min_bathrooms: Decimal,
    /// Acceptable property categories; empty accepts all.
    #[serde(default)]
    pub categories: Vec<PropertyCategory>,
    /// Acceptable quality tiers; empty accepts all.
    #[serde(default)]
    pub quality_tiers: Vec<QualityTier>,
    /// Minimum acceptable score. When absent the engine falls back to
    /// the configured default threshold.
    #[serde(default)]
    pub min_score: Option<u8>,
    /// Framing tag for downstream notifications. Never consulted by
    /// scoring or filtering.
    #[serde(default)]
    pub strategy: Option<String>,
}

/// A listing that passed a watch's filters at or above threshold but
/// has not yet been persisted to the ledger.
#[derive(Debug, Clone)]
pub struct MatchCandidate {
    pub watch_id: i64,
    pub listing: Listing,
    pub score: u8,
    pub reasons: Vec<String>,
}

/// External-sync state of a persisted match. Only the Sync Dispatcher
/// ever moves a match out of `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Pending,
    Synced,
    Failed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Synced => "synced",
            Self::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(Self::Pending),
            "synced" => Some(Self::Synced),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_criteria_roundtrip_with_defaults() {
        let json = r#"{
            "locations": ["austin-tx"],
            "price_floor": "600000",
            "price_ceiling": "1200000",
            "min_bedrooms": 3,
            "min_bathrooms": "2"
        }"#;
        let criteria: Criteria = serde_json::from_str(json).expect("should parse");
        assert_eq!(criteria.locations, vec!["austin-tx".to_string()]);
        assert_eq!(criteria.price_floor, dec!(600000));
        assert!(criteria.categories.is_empty());
        assert!(criteria.min_score.is_none());
        assert!(criteria.strategy.is_none());
    }

    #[test]
    fn test_sync_status_roundtrip() {
        for status in [SyncStatus::Pending, SyncStatus::Synced, SyncStatus::Failed] {
            assert_eq!(SyncStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(SyncStatus::parse("bogus"), None);
    }
}
