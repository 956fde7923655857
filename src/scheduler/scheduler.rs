//! Recurring per-watch scheduling.
//!
//! One scheduler owns the set of watches and their due times. Each due
//! watch's pipeline (evaluate → dispatch) runs as its own task so slow
//! external calls never stall the loop; a semaphore bounds how many
//! pipelines run at once, and a per-watch in-flight flag guarantees no
//! two concurrent runs for the same watch. A single watch failing, or
//! timing out, never halts the scheduler.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, error, info, instrument, warn};

use crate::config::SchedulerConfig;
use crate::db::store::{Store, Watch};
use crate::matching::engine::MatchEngine;
use crate::matching::models::{Criteria, SyncStatus};
use crate::scheduler::lifecycle::{next_due_epoch, WatchState};
use crate::sync::dispatcher::SyncDispatcher;

pub struct Scheduler {
    store: Store,
    engine: Arc<MatchEngine>,
    dispatcher: Arc<SyncDispatcher>,
    config: SchedulerConfig,
    /// Bounded worker pool for pipeline runs.
    slots: Arc<Semaphore>,
    /// Watch ids with a pipeline run currently in flight.
    in_flight: Arc<Mutex<HashSet<i64>>>,
}

/// What one pipeline run accomplished, for counters and logging.
#[derive(Debug, Default)]
struct RunSummary {
    snapshot_missing: bool,
    candidates: usize,
    synced: usize,
    failed: usize,
    skipped_records: usize,
}

impl Scheduler {
    pub fn new(
        store: Store,
        engine: Arc<MatchEngine>,
        dispatcher: Arc<SyncDispatcher>,
        config: SchedulerConfig,
    ) -> Self {
        let slots = Arc::new(Semaphore::new(config.max_concurrent_checks.max(1)));
        Self {
            store,
            engine,
            dispatcher,
            config,
            slots,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    // --- Watch lifecycle operations ---

    /// Register a new watch: criteria are snapshotted, the watch is
    /// created pending and immediately activated with next-due = now,
    /// so the first check fires on the next tick.
    pub async fn create_watch(
        &self,
        owner: &str,
        criteria: Criteria,
        interval_seconds: Option<u64>,
    ) -> Result<Watch> {
        let criteria_id = self.store.insert_criteria(&criteria).await?;
        let interval = interval_seconds.unwrap_or(self.config.check_interval_seconds);

        let id = self
            .store
            .insert_watch(owner, criteria_id, WatchState::Pending, interval as i64, None)
            .await?;

        self.store.set_watch_state(id, WatchState::Active).await?;
        self.store.set_next_due(id, Utc::now().timestamp()).await?;

        info!(watch_id = id, owner, interval_s = interval, "Watch created and scheduled");

        self.store
            .get_watch(id)
            .await?
            .context("Watch vanished right after creation")
    }

    /// Suspend future checks. Next-due bookkeeping is preserved.
    pub async fn pause(&self, id: i64) -> Result<()> {
        let current = self.current_state(id).await?;
        if !current.can_transition_to(WatchState::Paused) {
            bail!("Cannot pause watch {id} from state {current}");
        }
        self.store.set_watch_state(id, WatchState::Paused).await?;
        info!(watch_id = id, "Watch paused");
        Ok(())
    }

    /// Resume checks; next-due is recomputed relative to resume time.
    pub async fn resume(&self, id: i64) -> Result<()> {
        let watch = self.get_watch(id).await?;
        let current = watch
            .lifecycle_state()
            .with_context(|| format!("Corrupt state for watch {id}"))?;
        if !current.can_transition_to(WatchState::Active) {
            bail!("Cannot resume watch {id} from state {current}");
        }
        self.store.set_watch_state(id, WatchState::Active).await?;
        self.store
            .set_next_due(id, next_due_epoch(Utc::now(), watch.check_interval_s as u64))
            .await?;
        info!(watch_id = id, "Watch resumed");
        Ok(())
    }

    /// Stop the watch for good. Idempotent: cancelling an already
    /// cancelled watch is a no-op. An in-flight run is not preempted;
    /// it finishes and persists, but no further runs are scheduled.
    pub async fn cancel(&self, id: i64) -> Result<()> {
        self.finish_lifecycle(id, WatchState::Cancelled).await
    }

    /// Terminal success: same effect as cancel with a distinct reason.
    pub async fn complete(&self, id: i64) -> Result<()> {
        self.finish_lifecycle(id, WatchState::Completed).await
    }

    async fn finish_lifecycle(&self, id: i64, target: WatchState) -> Result<()> {
        let current = self.current_state(id).await?;
        if current == target {
            debug!(watch_id = id, state = %target, "Watch already in target state");
            return Ok(());
        }
        if !current.can_transition_to(target) {
            bail!("Cannot move watch {id} from state {current} to {target}");
        }
        self.store.set_watch_state(id, target).await?;
        info!(watch_id = id, state = %target, "Watch reached terminal state");
        Ok(())
    }

    async fn get_watch(&self, id: i64) -> Result<Watch> {
        self.store
            .get_watch(id)
            .await?
            .with_context(|| format!("Watch {id} not found"))
    }

    async fn current_state(&self, id: i64) -> Result<WatchState> {
        self.get_watch(id)
            .await?
            .lifecycle_state()
            .with_context(|| format!("Corrupt state for watch {id}"))
    }

    // --- Check scheduling ---

    /// One pass over the due watches. Fires a pipeline task per due
    /// watch that is not already running, and returns how many fired.
    #[instrument(skip(self))]
    pub async fn tick(&self) -> Result<usize> {
        let now = Utc::now();
        let due = self.store.get_due_watches(now.timestamp()).await?;
        let mut dispatched = 0;

        for watch in due {
            if !self.in_flight.lock().await.insert(watch.id) {
                debug!(watch_id = watch.id, "Previous run still in flight, skipping fire");
                continue;
            }

            // Regardless of how the run ends, the check counts and the
            // next fire moves out by one interval.
            let next_due = next_due_epoch(now, watch.check_interval_s as u64);
            if let Err(e) = self
                .store
                .mark_check_dispatched(watch.id, now.timestamp(), next_due)
                .await
            {
                warn!(watch_id = watch.id, error = %e, "Failed to mark check dispatched");
                self.in_flight.lock().await.remove(&watch.id);
                continue;
            }

            dispatched += 1;
            self.spawn_run(watch);
        }

        Ok(dispatched)
    }

    fn spawn_run(&self, watch: Watch) {
        let store = self.store.clone();
        let engine = self.engine.clone();
        let dispatcher = self.dispatcher.clone();
        let slots = self.slots.clone();
        let in_flight = self.in_flight.clone();
        let run_timeout = Duration::from_secs(self.config.run_timeout_seconds);

        tokio::spawn(async move {
            // The semaphore never closes, so acquire cannot fail.
            let _permit = match slots.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    in_flight.lock().await.remove(&watch.id);
                    return;
                }
            };

            let watch_id = watch.id;
            let outcome =
                tokio::time::timeout(run_timeout, run_pipeline(&engine, &dispatcher, &watch)).await;

            match outcome {
                Ok(Ok(summary)) if summary.snapshot_missing => {
                    info!(watch_id, "Listing data unavailable, cycle skipped");
                    if let Err(e) = store.record_check_failure(watch_id).await {
                        warn!(watch_id, error = %e, "Failed to record check failure");
                    }
                }
                Ok(Ok(summary)) => {
                    info!(
                        watch_id,
                        candidates = summary.candidates,
                        synced = summary.synced,
                        failed = summary.failed,
                        skipped_records = summary.skipped_records,
                        "Check complete"
                    );
                    let produced = (summary.synced + summary.failed) as i64;
                    if let Err(e) = store
                        .record_check_success(watch_id, Utc::now().timestamp(), produced)
                        .await
                    {
                        warn!(watch_id, error = %e, "Failed to record check success");
                    }
                }
                Ok(Err(e)) => {
                    error!(watch_id, error = %e, "Pipeline run failed");
                    if let Err(e) = store.record_check_failure(watch_id).await {
                        warn!(watch_id, error = %e, "Failed to record check failure");
                    }
                }
                Err(_) => {
                    warn!(
                        watch_id,
                        timeout_s = run_timeout.as_secs(),
                        "Pipeline run timed out, abandoning"
                    );
                    if let Err(e) = store.record_check_failure(watch_id).await {
                        warn!(watch_id, error = %e, "Failed to record check failure");
                    }
                }
            }

            in_flight.lock().await.remove(&watch_id);
        });
    }
}

/// Evaluate one watch and dispatch whatever came out. Errors here are
/// the watch's problem, not the scheduler's.
async fn run_pipeline(
    engine: &MatchEngine,
    dispatcher: &SyncDispatcher,
    watch: &Watch,
) -> Result<RunSummary> {
    let evaluation = engine.evaluate(watch).await?;

    if evaluation.snapshot_missing {
        return Ok(RunSummary {
            snapshot_missing: true,
            ..RunSummary::default()
        });
    }

    if evaluation.skipped_records > 0 {
        warn!(
            watch_id = watch.id,
            skipped = evaluation.skipped_records,
            "Snapshot contained malformed listing records"
        );
    }

    let outcomes = dispatcher
        .dispatch(watch, &evaluation.candidates, evaluation.strategy.as_deref())
        .await;

    let synced = outcomes
        .iter()
        .filter(|o| o.status == SyncStatus::Synced)
        .count();
    let failed = outcomes.len() - synced;

    Ok(RunSummary {
        snapshot_missing: false,
        candidates: evaluation.candidates.len(),
        synced,
        failed,
        skipped_records: evaluation.skipped_records,
    })
}
