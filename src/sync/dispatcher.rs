//! Match sync dispatch.
//!
//! Takes the new-match candidates for one watch, persists each to the
//! ledger first (insert-if-absent, so the per-pair uniqueness invariant
//! holds even under races), then performs the idempotent, rate-limited,
//! retried CRM write and records the outcome back on the match. A
//! failure on one candidate never aborts the rest of the batch.

use std::sync::Arc;

use tracing::{debug, error, info, instrument, warn};

use crate::config::RateLimitConfig;
use crate::db::store::{MatchRecord, Store, Watch};
use crate::matching::models::{MatchCandidate, SyncStatus};
use crate::notify::NotifyClient;
use crate::sync::crm::{idempotency_key, CrmClient, PipelineRecord};
use crate::sync::limiter::SharedLimiter;
use crate::sync::retry::RetrySchedule;

pub struct SyncDispatcher {
    store: Store,
    crm: Arc<CrmClient>,
    limiter: SharedLimiter,
    retry_config: RateLimitConfig,
    notifier: Arc<NotifyClient>,
}

/// Outcome of dispatching one candidate.
#[derive(Debug)]
pub struct DispatchOutcome {
    pub listing_id: String,
    pub status: SyncStatus,
    pub external_ref: Option<String>,
    /// CRM attempts made, including the successful one.
    pub attempts: u32,
}

impl SyncDispatcher {
    pub fn new(
        store: Store,
        crm: Arc<CrmClient>,
        limiter: SharedLimiter,
        retry_config: RateLimitConfig,
        notifier: Arc<NotifyClient>,
    ) -> Self {
        Self {
            store,
            crm,
            limiter,
            retry_config,
            notifier,
        }
    }

    /// Dispatch candidates in the order the matching engine produced
    /// them (descending score). Returns one outcome per candidate that
    /// was newly recorded in the ledger; already-matched pairs are
    /// skipped silently.
    #[instrument(skip(self, watch, candidates, strategy), fields(watch_id = watch.id, candidates = candidates.len()))]
    pub async fn dispatch(
        &self,
        watch: &Watch,
        candidates: &[MatchCandidate],
        strategy: Option<&str>,
    ) -> Vec<DispatchOutcome> {
        let mut outcomes = Vec::new();

        for candidate in candidates {
            let reasons = match serde_json::to_string(&candidate.reasons) {
                Ok(reasons) => reasons,
                Err(e) => {
                    warn!(listing_id = %candidate.listing.id, error = %e, "Failed to encode reasons, skipping candidate");
                    continue;
                }
            };

            let record = MatchRecord {
                id: None,
                watch_id: watch.id,
                listing_id: candidate.listing.id.clone(),
                score: candidate.score as i64,
                reasons,
                sync_status: SyncStatus::Pending.as_str().to_string(),
                external_ref: None,
                created_at: None,
            };

            let match_id = match self.store.insert_match_if_absent(&record).await {
                Ok(Some(id)) => id,
                Ok(None) => {
                    // Ledger conflict: a concurrent run got here first.
                    // Already matched, nothing to sync.
                    debug!(listing_id = %candidate.listing.id, "Match already in ledger, skipping");
                    continue;
                }
                Err(e) => {
                    warn!(listing_id = %candidate.listing.id, error = %e, "Ledger insert failed, skipping candidate");
                    continue;
                }
            };

            let outcome = self.sync_one(watch, candidate, match_id, strategy).await;
            outcomes.push(outcome);
        }

        outcomes
    }

    /// Push one match to the CRM, retrying transient failures until
    /// the schedule is exhausted.
    async fn sync_one(
        &self,
        watch: &Watch,
        candidate: &MatchCandidate,
        match_id: i64,
        strategy: Option<&str>,
    ) -> DispatchOutcome {
        let payload = PipelineRecord::from_candidate(candidate, strategy);
        let key = idempotency_key(watch.id, &candidate.listing.id);
        let summary = candidate.listing.summary();

        let mut schedule = RetrySchedule::new(&self.retry_config);
        let mut attempts: u32 = 0;

        loop {
            // Shared, process-wide limiter: blocks until the window
            // has capacity rather than dropping or erroring.
            self.limiter.until_ready().await;
            attempts += 1;

            match self.crm.create_pipeline_record(&payload, &key).await {
                Ok(reference) => {
                    if let Err(e) = self
                        .store
                        .update_match_sync(match_id, SyncStatus::Synced, Some(&reference))
                        .await
                    {
                        warn!(match_id, error = %e, "Failed to record synced status");
                    }

                    info!(
                        match_id,
                        listing_id = %candidate.listing.id,
                        external_ref = %reference,
                        score = candidate.score,
                        attempts,
                        "Match synced to CRM"
                    );

                    if let Err(e) = self
                        .notifier
                        .match_synced(watch.id, &summary, candidate.score, &reference, strategy)
                        .await
                    {
                        warn!(error = %e, "Failed to send match notification");
                    }

                    return DispatchOutcome {
                        listing_id: candidate.listing.id.clone(),
                        status: SyncStatus::Synced,
                        external_ref: Some(reference),
                        attempts,
                    };
                }
                Err(e) if e.is_transient() => {
                    match schedule.next_delay(e.retry_after()) {
                        Some(delay) => {
                            warn!(
                                match_id,
                                listing_id = %candidate.listing.id,
                                attempt = attempts,
                                backoff_ms = delay.as_millis() as u64,
                                error = %e,
                                "Transient CRM failure, retrying"
                            );
                            tokio::time::sleep(delay).await;
                        }
                        None => {
                            return self
                                .mark_failed(watch, candidate, match_id, attempts, &e.to_string())
                                .await;
                        }
                    }
                }
                Err(e) => {
                    // Non-transient rejection: no retry.
                    return self
                        .mark_failed(watch, candidate, match_id, attempts, &e.to_string())
                        .await;
                }
            }
        }
    }

    async fn mark_failed(
        &self,
        watch: &Watch,
        candidate: &MatchCandidate,
        match_id: i64,
        attempts: u32,
        error_msg: &str,
    ) -> DispatchOutcome {
        error!(
            match_id,
            listing_id = %candidate.listing.id,
            attempts,
            error = %error_msg,
            "Match sync failed, surfacing for alerting"
        );

        if let Err(e) = self
            .store
            .update_match_sync(match_id, SyncStatus::Failed, None)
            .await
        {
            warn!(match_id, error = %e, "Failed to record failed status");
        }

        if let Err(e) = self
            .notifier
            .sync_failed(watch.id, &candidate.listing.summary(), error_msg)
            .await
        {
            warn!(error = %e, "Failed to send failure notification");
        }

        DispatchOutcome {
            listing_id: candidate.listing.id.clone(),
            status: SyncStatus::Failed,
            external_ref: None,
            attempts,
        }
    }
}
