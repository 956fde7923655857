use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Our domain representation of one listing from the snapshot feed.
///
/// Only the identifier and location tag are guaranteed; every other
/// field may be absent upstream. A missing field degrades the scoring
/// factor that needs it to zero instead of rejecting the record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Listing {
    pub id: String,
    pub location: String,
    pub address: Option<String>,
    pub price: Option<Decimal>,
    pub bedrooms: Option<u32>,
    pub bathrooms: Option<Decimal>,
    pub area_sqm: Option<Decimal>,
    pub days_on_market: Option<i64>,
    pub price_per_sqm: Option<Decimal>,
    /// Market-average price-per-area for this location tag,
    /// precomputed by the feed. Never derived here.
    pub market_avg_price_per_sqm: Option<Decimal>,
    pub category: Option<PropertyCategory>,
    pub quality: Option<QualityTier>,
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PropertyCategory {
    House,
    Apartment,
    Townhouse,
    Condo,
    Land,
    #[serde(untagged)]
    Other(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum QualityTier {
    Excellent,
    Good,
    Fair,
    Poor,
}

impl std::fmt::Display for QualityTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Excellent => write!(f, "excellent"),
            Self::Good => write!(f, "good"),
            Self::Fair => write!(f, "fair"),
            Self::Poor => write!(f, "poor"),
        }
    }
}

impl Listing {
    /// Best human-readable handle for notifications and CRM payloads.
    pub fn summary(&self) -> String {
        match &self.address {
            Some(address) => format!("{} ({})", address, self.location),
            None => format!("listing {} ({})", self.id, self.location),
        }
    }
}
