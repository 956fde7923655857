//! Listing snapshot acquisition.
//!
//! The engine treats the listing universe as an opaque, periodically
//! refreshed read-only feed behind the `SnapshotProvider` trait. The
//! bundled implementation pulls a JSON batch over HTTP and converts
//! liberally-typed raw records into domain listings, skipping (and
//! counting) anything unusable.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::config::SnapshotConfig;
use crate::listings::models::{Listing, PropertyCategory, QualityTier};

/// A missing or unreadable snapshot. Recoverable: the affected watch
/// skips its cycle rather than failing.
#[derive(Debug, Error)]
#[error("listing snapshot unavailable: {0}")]
pub struct SnapshotError(pub String);

/// Point-in-time batch of the known listing universe.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub listings: Vec<Listing>,
    /// Malformed feed records dropped during conversion.
    pub skipped_records: usize,
    pub fetched_at: DateTime<Utc>,
}

#[async_trait]
pub trait SnapshotProvider: Send + Sync {
    async fn fetch(&self) -> Result<Snapshot, SnapshotError>;
}

pub struct HttpSnapshotProvider {
    http: reqwest::Client,
    feed_url: String,
}

impl HttpSnapshotProvider {
    pub fn new(config: &SnapshotConfig) -> Result<Self, SnapshotError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .build()
            .map_err(|e| SnapshotError(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            http,
            feed_url: config.feed_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl SnapshotProvider for HttpSnapshotProvider {
    #[instrument(skip(self))]
    async fn fetch(&self) -> Result<Snapshot, SnapshotError> {
        let resp = self
            .http
            .get(&self.feed_url)
            .send()
            .await
            .map_err(|e| SnapshotError(format!("HTTP error: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            return Err(SnapshotError(format!("feed returned {status}")));
        }

        let raw: Vec<RawListing> = resp
            .json()
            .await
            .map_err(|e| SnapshotError(format!("deserialization error: {e}")))?;

        let snapshot = convert_batch(raw);
        info!(
            listings = snapshot.listings.len(),
            skipped = snapshot.skipped_records,
            "Listing snapshot fetched"
        );
        Ok(snapshot)
    }
}

/// Lightweight feed record for direct deserialization. Feeds are
/// inconsistent about which fields they populate, so everything is
/// optional here and validated during conversion.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawListing {
    id: Option<String>,
    location: Option<String>,
    address: Option<String>,
    price: Option<Decimal>,
    bedrooms: Option<u32>,
    bathrooms: Option<Decimal>,
    area_sqm: Option<Decimal>,
    days_on_market: Option<i64>,
    price_per_sqm: Option<Decimal>,
    market_avg_price_per_sqm: Option<Decimal>,
    category: Option<PropertyCategory>,
    quality: Option<QualityTier>,
    url: Option<String>,
}

fn convert_batch(raw: Vec<RawListing>) -> Snapshot {
    let total = raw.len();
    let listings: Vec<Listing> = raw.into_iter().filter_map(convert_raw).collect();
    let skipped = total - listings.len();

    Snapshot {
        listings,
        skipped_records: skipped,
        fetched_at: Utc::now(),
    }
}

/// Convert a raw feed record to a domain listing.
///
/// Id and location tag are mandatory; a record without them cannot be
/// matched or deduplicated and is dropped. Price-per-area is derived
/// from price and area when the feed omits it.
fn convert_raw(raw: RawListing) -> Option<Listing> {
    let id = raw.id.filter(|v| !v.trim().is_empty());
    let location = raw.location.filter(|v| !v.trim().is_empty());

    let (id, location) = match (id, location) {
        (Some(id), Some(location)) => (id, location),
        _ => {
            warn!("Skipping malformed listing record (missing id or location)");
            return None;
        }
    };

    let price_per_sqm = raw.price_per_sqm.or_else(|| match (raw.price, raw.area_sqm) {
        (Some(price), Some(area)) if area > Decimal::ZERO => Some(price / area),
        _ => None,
    });

    Some(Listing {
        id,
        location,
        address: raw.address,
        price: raw.price,
        bedrooms: raw.bedrooms,
        bathrooms: raw.bathrooms,
        area_sqm: raw.area_sqm,
        days_on_market: raw.days_on_market,
        price_per_sqm,
        market_avg_price_per_sqm: raw.market_avg_price_per_sqm,
        category: raw.category,
        quality: raw.quality,
        url: raw.url,
    })
}
