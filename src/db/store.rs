use std::collections::HashSet;
use std::str::FromStr;

use anyhow::{Context, Result};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{FromRow, SqlitePool};

use crate::matching::models::{Criteria, SyncStatus};
use crate::scheduler::lifecycle::WatchState;

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

/// One continuously-running search. Timestamps used for due-time
/// arithmetic are epoch seconds; display timestamps stay RFC 3339.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Watch {
    pub id: i64,
    pub owner: String,
    pub criteria_id: i64,
    pub state: String,
    pub check_interval_s: i64,
    pub created_at: Option<String>,
    pub last_checked_at: Option<i64>,
    pub last_success_at: Option<i64>,
    pub next_due_at: Option<i64>,
    pub checks_performed: i64,
    pub matches_produced: i64,
    pub failed_checks: i64,
}

impl Watch {
    pub fn lifecycle_state(&self) -> Option<WatchState> {
        WatchState::parse(&self.state)
    }
}

/// Durable record that a listing satisfied a watch. At most one row
/// per (watch_id, listing_id), enforced by a UNIQUE constraint.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct MatchRecord {
    pub id: Option<i64>,
    pub watch_id: i64,
    pub listing_id: String,
    pub score: i64,
    /// JSON array of ordered reason strings.
    pub reasons: String,
    pub sync_status: String,
    pub external_ref: Option<String>,
    pub created_at: Option<String>,
}

impl Store {
    /// Create a Store from an existing pool (for sharing between the
    /// scheduler, dispatcher, and health reporting).
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Get a reference to the underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn new(database_path: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{database_path}"))
            .context("Invalid database path")?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        // An in-memory database exists per connection; cap the pool at
        // one so every caller sees the same schema.
        let max_connections = if database_path == ":memory:" { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .context("Failed to connect to SQLite database")?;

        let store = Self { pool };
        store.migrate().await?;

        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        let migration_sql = include_str!("../../migrations/001_init.sql");
        // Execute each statement separately (sqlx doesn't support multiple statements in one call)
        for statement in migration_sql.split(';') {
            let trimmed = statement.trim();
            if !trimmed.is_empty() {
                sqlx::query(trimmed)
                    .execute(&self.pool)
                    .await
                    .with_context(|| format!("Failed to execute migration: {trimmed}"))?;
            }
        }
        Ok(())
    }

    // --- Criteria operations ---

    pub async fn insert_criteria(&self, criteria: &Criteria) -> Result<i64> {
        let payload =
            serde_json::to_string(criteria).context("Failed to serialize criteria")?;
        let result = sqlx::query("INSERT INTO criteria (payload) VALUES (?)")
            .bind(payload)
            .execute(&self.pool)
            .await
            .context("Failed to insert criteria")?;
        Ok(result.last_insert_rowid())
    }

    pub async fn get_criteria(&self, id: i64) -> Result<Option<Criteria>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT payload FROM criteria WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .context("Failed to fetch criteria")?;

        match row {
            Some((payload,)) => {
                let criteria = serde_json::from_str(&payload)
                    .with_context(|| format!("Corrupt criteria payload for id {id}"))?;
                Ok(Some(criteria))
            }
            None => Ok(None),
        }
    }

    // --- Watch operations ---

    pub async fn insert_watch(
        &self,
        owner: &str,
        criteria_id: i64,
        state: WatchState,
        check_interval_s: i64,
        next_due_at: Option<i64>,
    ) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO watches (owner, criteria_id, state, check_interval_s, next_due_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(owner)
        .bind(criteria_id)
        .bind(state.as_str())
        .bind(check_interval_s)
        .bind(next_due_at)
        .execute(&self.pool)
        .await
        .context("Failed to insert watch")?;

        Ok(result.last_insert_rowid())
    }

    pub async fn get_watch(&self, id: i64) -> Result<Option<Watch>> {
        let watch = sqlx::query_as::<_, Watch>("SELECT * FROM watches WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch watch")?;
        Ok(watch)
    }

    /// Active watches whose next-due time has passed.
    pub async fn get_due_watches(&self, now_epoch: i64) -> Result<Vec<Watch>> {
        let watches = sqlx::query_as::<_, Watch>(
            "SELECT * FROM watches
             WHERE state = 'active' AND next_due_at IS NOT NULL AND next_due_at <= ?
             ORDER BY next_due_at",
        )
        .bind(now_epoch)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch due watches")?;
        Ok(watches)
    }

    pub async fn set_watch_state(&self, id: i64, state: WatchState) -> Result<()> {
        sqlx::query("UPDATE watches SET state = ? WHERE id = ?")
            .bind(state.as_str())
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to update watch state")?;
        Ok(())
    }

    pub async fn set_next_due(&self, id: i64, next_due_at: i64) -> Result<()> {
        sqlx::query("UPDATE watches SET next_due_at = ? WHERE id = ?")
            .bind(next_due_at)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to update watch next-due time")?;
        Ok(())
    }

    /// Bookkeeping at check-fire time: regardless of how the run ends,
    /// the check counter increments and the next-due time advances.
    pub async fn mark_check_dispatched(
        &self,
        id: i64,
        now_epoch: i64,
        next_due_at: i64,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE watches
             SET checks_performed = checks_performed + 1,
                 last_checked_at = ?,
                 next_due_at = ?
             WHERE id = ?",
        )
        .bind(now_epoch)
        .bind(next_due_at)
        .bind(id)
        .execute(&self.pool)
        .await
        .context("Failed to mark check dispatched")?;
        Ok(())
    }

    pub async fn record_check_success(
        &self,
        id: i64,
        now_epoch: i64,
        matches_produced: i64,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE watches
             SET last_success_at = ?,
                 matches_produced = matches_produced + ?
             WHERE id = ?",
        )
        .bind(now_epoch)
        .bind(matches_produced)
        .bind(id)
        .execute(&self.pool)
        .await
        .context("Failed to record check success")?;
        Ok(())
    }

    pub async fn record_check_failure(&self, id: i64) -> Result<()> {
        sqlx::query("UPDATE watches SET failed_checks = failed_checks + 1 WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to record check failure")?;
        Ok(())
    }

    pub async fn count_watches_in_state(&self, state: WatchState) -> Result<i64> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM watches WHERE state = ?")
            .bind(state.as_str())
            .fetch_one(&self.pool)
            .await
            .context("Failed to count watches")?;
        Ok(row.0)
    }

    // --- Match ledger operations ---

    /// Atomic insert-if-absent keyed by (watch_id, listing_id).
    /// Returns the new row id, or `None` when the pair already exists;
    /// a duplicate race reads as already-matched, never an error.
    pub async fn insert_match_if_absent(&self, record: &MatchRecord) -> Result<Option<i64>> {
        let result = sqlx::query(
            "INSERT INTO matches (watch_id, listing_id, score, reasons, sync_status)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT (watch_id, listing_id) DO NOTHING",
        )
        .bind(record.watch_id)
        .bind(&record.listing_id)
        .bind(record.score)
        .bind(&record.reasons)
        .bind(&record.sync_status)
        .execute(&self.pool)
        .await
        .context("Failed to insert match")?;

        if result.rows_affected() == 0 {
            Ok(None)
        } else {
            Ok(Some(result.last_insert_rowid()))
        }
    }

    /// Listing ids already matched for a watch, for deduplication.
    pub async fn matched_listing_ids(&self, watch_id: i64) -> Result<HashSet<String>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT listing_id FROM matches WHERE watch_id = ?")
                .bind(watch_id)
                .fetch_all(&self.pool)
                .await
                .context("Failed to fetch matched listing ids")?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    pub async fn update_match_sync(
        &self,
        id: i64,
        status: SyncStatus,
        external_ref: Option<&str>,
    ) -> Result<()> {
        sqlx::query("UPDATE matches SET sync_status = ?, external_ref = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(external_ref)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to update match sync status")?;
        Ok(())
    }

    pub async fn get_matches_for_watch(&self, watch_id: i64) -> Result<Vec<MatchRecord>> {
        let matches = sqlx::query_as::<_, MatchRecord>(
            "SELECT * FROM matches WHERE watch_id = ? ORDER BY id",
        )
        .bind(watch_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch matches for watch")?;
        Ok(matches)
    }

    /// Matches whose sync exhausted retries. Resyncing these is an
    /// explicit recovery action, never automatic re-matching.
    pub async fn get_failed_matches(&self) -> Result<Vec<MatchRecord>> {
        let matches = sqlx::query_as::<_, MatchRecord>(
            "SELECT * FROM matches WHERE sync_status = 'failed' ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch failed matches")?;
        Ok(matches)
    }
}
