//! Listing scoring.
//!
//! Pure additive point model over independent factors. No I/O,
//! deterministic for fixed inputs, unit-testable in isolation. Each
//! factor appends a human-readable reason only when it contributes a
//! nonzero score, in evaluation order.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::listings::models::Listing;
use crate::matching::models::Criteria;

const LOCATION_POINTS: u8 = 30;
const PRICE_POINTS: u8 = 25;
const SIZE_POINTS: u8 = 20;
const TIME_FULL_POINTS: u8 = 15;
const TIME_PARTIAL_POINTS: u8 = 10;
const PRICE_PER_AREA_POINTS: u8 = 10;

const TIME_FULL_DAYS: i64 = 30;
const TIME_PARTIAL_DAYS: i64 = 14;

/// A listing priced at or below this fraction of the market-average
/// price-per-area counts as a bargain.
const PRICE_PER_AREA_ADVANTAGE: Decimal = dec!(0.85);

/// Score plus the ordered reasons that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScoreBreakdown {
    pub score: u8,
    pub reasons: Vec<String>,
}

/// Score a listing against a watch's criteria.
///
/// The factor weights sum to 100, so the total is capped by
/// construction. A listing missing the field a factor needs simply
/// contributes 0 for that factor; it is never a hard scoring failure.
pub fn score(listing: &Listing, criteria: &Criteria) -> ScoreBreakdown {
    let mut total: u8 = 0;
    let mut reasons = Vec::new();

    // Location match
    if criteria.locations.contains(&listing.location) {
        total += LOCATION_POINTS;
        reasons.push(format!("Located in {}", listing.location));
    }

    // Price in range
    if let Some(price) = listing.price {
        if price >= criteria.price_floor && price <= criteria.price_ceiling {
            total += PRICE_POINTS;
            reasons.push(format!(
                "Price {} within {}-{} budget",
                price, criteria.price_floor, criteria.price_ceiling
            ));
        }
    }

    // Size requirement
    if let (Some(bedrooms), Some(bathrooms)) = (listing.bedrooms, listing.bathrooms) {
        if bedrooms >= criteria.min_bedrooms
            && bathrooms >= criteria.min_bathrooms
        {
            total += SIZE_POINTS;
            reasons.push(format!(
                "{bedrooms} bedrooms and {bathrooms} bathrooms meet size requirements"
            ));
        }
    }

    // Time on market as a motivation signal
    if let Some(days) = listing.days_on_market {
        if days >= TIME_FULL_DAYS {
            total += TIME_FULL_POINTS;
            reasons.push(format!("On market {days} days, seller likely motivated"));
        } else if days >= TIME_PARTIAL_DAYS {
            total += TIME_PARTIAL_POINTS;
            reasons.push(format!("On market {days} days, above typical turnover"));
        }
    }

    // Price-per-area advantage against the location's market average
    if let (Some(ppa), Some(avg)) = (listing.price_per_sqm, listing.market_avg_price_per_sqm) {
        if avg > Decimal::ZERO && ppa <= PRICE_PER_AREA_ADVANTAGE * avg {
            total += PRICE_PER_AREA_POINTS;
            reasons.push(format!(
                "Price per sqm {} beats the area average {}",
                ppa.round_dp(0),
                avg.round_dp(0)
            ));
        }
    }

    ScoreBreakdown { score: total, reasons }
}
