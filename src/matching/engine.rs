//! Per-watch evaluation pipeline.
//!
//! Pulls the current listing snapshot, restricts it to the watch's
//! locations before anything expensive runs, applies the hard filters,
//! scores the survivors, drops everything below threshold, and
//! deduplicates against the match ledger. Output ordering is
//! deterministic: descending score, ties by listing id ascending.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, instrument, warn};

use crate::db::store::{Store, Watch};
use crate::listings::models::Listing;
use crate::listings::provider::SnapshotProvider;
use crate::matching::models::{Criteria, MatchCandidate};
use crate::scoring::engine::score;

pub struct MatchEngine {
    store: Store,
    provider: Arc<dyn SnapshotProvider>,
    /// Threshold for criteria that don't carry their own.
    default_min_score: u8,
}

/// Result of one watch evaluation.
#[derive(Debug, Default)]
pub struct Evaluation {
    pub candidates: Vec<MatchCandidate>,
    pub skipped_records: usize,
    /// The snapshot could not be read; the cycle was skipped rather
    /// than failed.
    pub snapshot_missing: bool,
    /// Criteria strategy tag, passed through for notification framing.
    pub strategy: Option<String>,
}

impl MatchEngine {
    pub fn new(store: Store, provider: Arc<dyn SnapshotProvider>, default_min_score: u8) -> Self {
        Self {
            store,
            provider,
            default_min_score,
        }
    }

    #[instrument(skip(self, watch), fields(watch_id = watch.id))]
    pub async fn evaluate(&self, watch: &Watch) -> Result<Evaluation> {
        let criteria = self
            .store
            .get_criteria(watch.criteria_id)
            .await?
            .with_context(|| format!("Criteria {} not found for watch {}", watch.criteria_id, watch.id))?;

        let snapshot = match self.provider.fetch().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(error = %e, "Snapshot unavailable, skipping cycle");
                return Ok(Evaluation {
                    snapshot_missing: true,
                    ..Evaluation::default()
                });
            }
        };

        let threshold = criteria.min_score.unwrap_or(self.default_min_score);

        let mut candidates: Vec<MatchCandidate> = snapshot
            .listings
            .into_iter()
            .filter(|listing| criteria.locations.contains(&listing.location))
            .filter(|listing| passes_filters(listing, &criteria))
            .filter_map(|listing| {
                let breakdown = score(&listing, &criteria);
                if breakdown.score >= threshold {
                    Some(MatchCandidate {
                        watch_id: watch.id,
                        listing,
                        score: breakdown.score,
                        reasons: breakdown.reasons,
                    })
                } else {
                    None
                }
            })
            .collect();

        // Deduplicate against the ledger: a (watch, listing) pair
        // matches at most once, ever.
        let already_matched = self.store.matched_listing_ids(watch.id).await?;
        candidates.retain(|c| !already_matched.contains(&c.listing.id));

        candidates.sort_by(|a, b| {
            b.score
                .cmp(&a.score)
                .then_with(|| a.listing.id.cmp(&b.listing.id))
        });

        info!(
            candidates = candidates.len(),
            skipped = snapshot.skipped_records,
            threshold,
            "Evaluation complete"
        );

        Ok(Evaluation {
            candidates,
            skipped_records: snapshot.skipped_records,
            snapshot_missing: false,
            strategy: criteria.strategy,
        })
    }
}

/// Hard filters applied before scoring. A filter only rejects when the
/// field is present and out of bounds; a listing missing the field
/// passes and simply earns no points for the matching factor.
fn passes_filters(listing: &Listing, criteria: &Criteria) -> bool {
    if let Some(price) = listing.price {
        if price < criteria.price_floor || price > criteria.price_ceiling {
            return false;
        }
    }

    if let Some(bedrooms) = listing.bedrooms {
        if bedrooms < criteria.min_bedrooms {
            return false;
        }
    }

    if let Some(bathrooms) = listing.bathrooms {
        if bathrooms < criteria.min_bathrooms {
            return false;
        }
    }

    if !criteria.categories.is_empty() {
        if let Some(category) = &listing.category {
            if !criteria.categories.contains(category) {
                return false;
            }
        }
    }

    if !criteria.quality_tiers.is_empty() {
        if let Some(quality) = listing.quality {
            if !criteria.quality_tiers.contains(&quality) {
                return false;
            }
        }
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    use crate::db::store::MatchRecord;
    use crate::listings::models::PropertyCategory;
    use crate::listings::provider::{Snapshot, SnapshotError};
    use crate::matching::models::SyncStatus;
    use crate::scheduler::lifecycle::WatchState;

    struct StubProvider {
        listings: Vec<Listing>,
        skipped: usize,
        fail: bool,
    }

    #[async_trait]
    impl SnapshotProvider for StubProvider {
        async fn fetch(&self) -> Result<Snapshot, SnapshotError> {
            if self.fail {
                return Err(SnapshotError("stub outage".to_string()));
            }
            Ok(Snapshot {
                listings: self.listings.clone(),
                skipped_records: self.skipped,
                fetched_at: Utc::now(),
            })
        }
    }

    fn listing(id: &str, location: &str, days_on_market: i64) -> Listing {
        Listing {
            id: id.to_string(),
            location: location.to_string(),
            address: None,
            price: Some(dec!(875000)),
            bedrooms: Some(3),
            bathrooms: Some(dec!(2.5)),
            area_sqm: Some(dec!(210)),
            days_on_market: Some(days_on_market),
            price_per_sqm: Some(dec!(4165)),
            market_avg_price_per_sqm: Some(dec!(4900)),
            category: Some(PropertyCategory::House),
            quality: None,
            url: None,
        }
    }

    fn criteria() -> Criteria {
        Criteria {
            locations: vec!["austin-tx".to_string()],
            price_floor: dec!(600000),
            price_ceiling: dec!(1200000),
            min_bedrooms: 3,
            min_bathrooms: dec!(2),
            categories: Vec::new(),
            quality_tiers: Vec::new(),
            min_score: Some(80),
            strategy: None,
        }
    }

    async fn engine_with(
        listings: Vec<Listing>,
        fail: bool,
    ) -> (MatchEngine, Store, Watch) {
        let store = Store::new(":memory:").await.unwrap();
        let criteria_id = store.insert_criteria(&criteria()).await.unwrap();
        let watch_id = store
            .insert_watch("owner-1", criteria_id, WatchState::Active, 3600, Some(0))
            .await
            .unwrap();
        let watch = store.get_watch(watch_id).await.unwrap().unwrap();

        let provider = Arc::new(StubProvider {
            listings,
            skipped: 0,
            fail,
        });
        let engine = MatchEngine::new(store.clone(), provider, 80);
        (engine, store, watch)
    }

    #[tokio::test]
    async fn test_evaluate_orders_by_score_then_id() {
        // 45 days on market scores 100; 5 days scores 85.
        let listings = vec![
            listing("L3", "austin-tx", 5),
            listing("L2", "austin-tx", 45),
            listing("L1", "austin-tx", 45),
        ];
        let (engine, _store, watch) = engine_with(listings, false).await;

        let eval = engine.evaluate(&watch).await.unwrap();
        let ids: Vec<&str> = eval.candidates.iter().map(|c| c.listing.id.as_str()).collect();
        assert_eq!(ids, vec!["L1", "L2", "L3"]);
        assert_eq!(eval.candidates[0].score, 100);
        assert_eq!(eval.candidates[2].score, 85);
    }

    #[tokio::test]
    async fn test_evaluate_applies_location_and_threshold() {
        let mut below_threshold = listing("L2", "austin-tx", 5);
        // Lose price-per-area advantage as well: 85 - 10 = 75 < 80.
        below_threshold.price_per_sqm = Some(dec!(4800));

        let listings = vec![
            listing("L1", "austin-tx", 45),
            listing("L9", "denver-co", 45),
            below_threshold,
        ];
        let (engine, _store, watch) = engine_with(listings, false).await;

        let eval = engine.evaluate(&watch).await.unwrap();
        assert_eq!(eval.candidates.len(), 1);
        assert_eq!(eval.candidates[0].listing.id, "L1");
    }

    #[tokio::test]
    async fn test_evaluate_hard_filters() {
        let mut too_expensive = listing("L2", "austin-tx", 45);
        too_expensive.price = Some(dec!(1500000));
        let mut too_small = listing("L3", "austin-tx", 45);
        too_small.bedrooms = Some(2);
        let mut wrong_category = listing("L4", "austin-tx", 45);
        wrong_category.category = Some(PropertyCategory::Land);

        let (engine, store, watch) = engine_with(
            vec![
                listing("L1", "austin-tx", 45),
                too_expensive,
                too_small,
                wrong_category,
            ],
            false,
        )
        .await;

        // Restrict categories on the stored criteria.
        let mut c = criteria();
        c.categories = vec![PropertyCategory::House];
        let criteria_id = store.insert_criteria(&c).await.unwrap();
        let watch_id = store
            .insert_watch("owner-2", criteria_id, WatchState::Active, 3600, Some(0))
            .await
            .unwrap();
        let strict_watch = store.get_watch(watch_id).await.unwrap().unwrap();

        let eval = engine.evaluate(&strict_watch).await.unwrap();
        assert_eq!(eval.candidates.len(), 1);
        assert_eq!(eval.candidates[0].listing.id, "L1");

        // The original watch has no category restriction: the Land
        // listing survives filtering there.
        let eval = engine.evaluate(&watch).await.unwrap();
        let ids: Vec<&str> = eval.candidates.iter().map(|c| c.listing.id.as_str()).collect();
        assert_eq!(ids, vec!["L1", "L4"]);
    }

    #[tokio::test]
    async fn test_evaluate_dedups_against_ledger() {
        let (engine, store, watch) = engine_with(vec![listing("L1", "austin-tx", 45)], false).await;

        let eval = engine.evaluate(&watch).await.unwrap();
        assert_eq!(eval.candidates.len(), 1);

        // Persist the candidate the way the dispatcher would.
        store
            .insert_match_if_absent(&MatchRecord {
                id: None,
                watch_id: watch.id,
                listing_id: "L1".to_string(),
                score: 100,
                reasons: "[]".to_string(),
                sync_status: SyncStatus::Pending.as_str().to_string(),
                external_ref: None,
                created_at: None,
            })
            .await
            .unwrap();

        // Second run with the ledger updated: nothing new.
        let eval = engine.evaluate(&watch).await.unwrap();
        assert!(eval.candidates.is_empty());
    }

    #[tokio::test]
    async fn test_evaluate_snapshot_unavailable_is_recoverable() {
        let (engine, _store, watch) = engine_with(Vec::new(), true).await;

        let eval = engine.evaluate(&watch).await.unwrap();
        assert!(eval.snapshot_missing);
        assert!(eval.candidates.is_empty());
    }

    #[tokio::test]
    async fn test_missing_fields_pass_filters() {
        let sparse = Listing {
            id: "L1".to_string(),
            location: "austin-tx".to_string(),
            address: None,
            price: None,
            bedrooms: None,
            bathrooms: None,
            area_sqm: None,
            days_on_market: None,
            price_per_sqm: None,
            market_avg_price_per_sqm: None,
            category: None,
            quality: None,
            url: None,
        };
        // Passes every filter, but only scores 30 for location: below
        // threshold, so no candidate.
        assert!(passes_filters(&sparse, &criteria()));

        let (engine, _store, watch) = engine_with(vec![sparse], false).await;
        let eval = engine.evaluate(&watch).await.unwrap();
        assert!(eval.candidates.is_empty());
    }
}
