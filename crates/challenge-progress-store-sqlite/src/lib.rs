//! SQLite-backed storage for per-user challenge goal progress.
//!
//! [`ProgressStore`] owns a bounded connection pool and runs every call in
//! its own transaction. [`ProgressTx`] exposes the same operations inside a
//! caller-owned transaction, plus the row-locked read and the claim workflow.

use std::sync::Arc;

use challenge_progress_core::{
    format_timestamp, validate_increments, validate_updates, Assignment, BatchOutcome, Clock,
    OpContext, ProgressFilter, ProgressIncrement, ProgressRecord, ProgressUpdate, SystemClock,
};

mod batch;
mod bench;
mod claim;
mod config;
mod error;
mod gate;
mod pool;
mod rows;
mod schema;
mod tx;

pub use batch::MAX_VALUES_BATCH_ROWS;
pub use bench::{
    run_benchmark, BenchmarkBatchResult, BenchmarkConfig, BenchmarkReport, BenchmarkThresholds,
};
pub use config::StoreConfig;
pub use error::{StoreError, StoreResult};
pub use pool::PoolStatus;
pub use schema::PROGRESS_MIGRATION_VERSION;
pub use tx::{ProgressTx, TxState};

use crate::error::DuringOperation;
use crate::pool::{acquire, InterruptGuard, SqlitePool};

/// Reads and writes shared by the pooled store and an open transaction.
///
/// Batch writes skip claimed rows and rows switched off by the assignment
/// gate; skipped rows are reported through [`BatchOutcome`], never as errors.
/// Empty batches return immediately without touching the database.
pub trait ProgressRepository {
    fn get_progress(
        &self,
        ctx: &OpContext,
        user_id: &str,
        goal_id: &str,
    ) -> StoreResult<Option<ProgressRecord>>;

    /// Rows ordered by `created_at`, then `goal_id`.
    fn get_user_progress(
        &self,
        ctx: &OpContext,
        user_id: &str,
        filter: &ProgressFilter,
    ) -> StoreResult<Vec<ProgressRecord>>;

    fn get_goals_by_ids(
        &self,
        ctx: &OpContext,
        user_id: &str,
        goal_ids: &[String],
    ) -> StoreResult<Vec<ProgressRecord>>;

    fn upsert_progress(&self, ctx: &OpContext, update: &ProgressUpdate) -> StoreResult<BatchOutcome>;

    /// Staged path: load into a temporary table, then merge with one statement.
    /// Duplicate keys in the batch resolve to the last entry.
    fn bulk_upsert(&self, ctx: &OpContext, updates: &[ProgressUpdate]) -> StoreResult<BatchOutcome>;

    /// Same semantics as [`ProgressRepository::bulk_upsert`] through one
    /// multi-row `VALUES` statement, bounded by [`MAX_VALUES_BATCH_ROWS`].
    fn bulk_upsert_values(
        &self,
        ctx: &OpContext,
        updates: &[ProgressUpdate],
    ) -> StoreResult<BatchOutcome>;

    fn increment_progress(
        &self,
        ctx: &OpContext,
        increment: &ProgressIncrement,
    ) -> StoreResult<BatchOutcome>;

    /// Adds each delta atomically. A daily increment applies at most once per
    /// UTC calendar day, judged by the row's last update.
    fn bulk_increment(
        &self,
        ctx: &OpContext,
        increments: &[ProgressIncrement],
    ) -> StoreResult<BatchOutcome>;

    /// Seeds rows that do not exist yet; existing rows are left as they are.
    fn bulk_insert(&self, ctx: &OpContext, records: &[ProgressRecord]) -> StoreResult<BatchOutcome>;

    fn set_active(&self, ctx: &OpContext, assignment: &Assignment) -> StoreResult<()>;

    /// # Errors
    /// Returns [`StoreError::CannotClaim`] unless the row is active, completed and unclaimed.
    fn mark_claimed(&self, ctx: &OpContext, user_id: &str, goal_id: &str) -> StoreResult<()>;
}

pub struct ProgressStore {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
    config: StoreConfig,
}

impl std::fmt::Debug for ProgressStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressStore")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ProgressStore {
    /// # Errors
    /// Returns an error when the config is invalid or the pool cannot open its
    /// first connections.
    pub fn open(config: &StoreConfig) -> StoreResult<Self> {
        config.validate()?;
        let pool = pool::build_pool(config)?;
        tracing::debug!(
            db_path = %config.db_path.display(),
            max_open_conns = config.max_open_conns,
            "progress store opened"
        );
        Ok(Self {
            pool,
            clock: Arc::new(SystemClock),
            config: config.clone(),
        })
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// # Errors
    /// Returns an error when the schema cannot be applied.
    pub fn migrate(&self) -> StoreResult<()> {
        let conn = acquire(&self.pool, &OpContext::background(), "migrate")?;
        let applied_at = format_timestamp(self.clock.now())?;
        schema::migrate(&conn, &applied_at)
    }

    /// Installed schema version, `None` before the first migration.
    ///
    /// # Errors
    /// Returns an error when the database cannot be read.
    pub fn schema_version(&self, ctx: &OpContext) -> StoreResult<Option<i64>> {
        self.read(ctx, "schema version", schema::schema_version)
    }

    /// Round-trips a trivial statement through a pooled connection.
    ///
    /// # Errors
    /// Returns an error when no connection can be checked out or the probe fails.
    pub fn health(&self, ctx: &OpContext) -> StoreResult<()> {
        self.read(ctx, "health", |conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
                .during("health")
                .map(|_| ())
        })
    }

    #[must_use]
    pub fn pool_status(&self) -> PoolStatus {
        pool::pool_status(&self.pool, &self.config)
    }

    /// # Errors
    /// Returns an error when no connection is available or the write lock
    /// cannot be taken within the busy timeout.
    pub fn begin_transaction(&self, ctx: &OpContext) -> StoreResult<ProgressTx> {
        ProgressTx::begin(&self.pool, Arc::clone(&self.clock), ctx)
    }

    /// Claims a completed goal: lock, check, mark and commit as one unit.
    /// Of two concurrent claims for the same goal exactly one succeeds.
    ///
    /// # Errors
    /// Returns [`StoreError::CannotClaim`] when the goal is missing, inactive,
    /// not completed, or already claimed.
    pub fn claim(&self, ctx: &OpContext, user_id: &str, goal_id: &str) -> StoreResult<ProgressRecord> {
        self.with_transaction(ctx, |tx| tx.claim(ctx, user_id, goal_id))
    }

    /// Runs `op` inside a fresh transaction, committing on `Ok` and rolling
    /// back on `Err`.
    ///
    /// # Errors
    /// Returns the error from `op`, or from begin/commit.
    pub fn with_transaction<T>(
        &self,
        ctx: &OpContext,
        op: impl FnOnce(&ProgressTx) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let mut tx = self.begin_transaction(ctx)?;
        match op(&tx) {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback() {
                    tracing::warn!(error = %rollback_err, "rollback after failed operation failed");
                }
                Err(err)
            }
        }
    }

    fn read<T>(
        &self,
        ctx: &OpContext,
        operation: &'static str,
        op: impl FnOnce(&rusqlite::Connection) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let conn = acquire(&self.pool, ctx, operation)?;
        let _guard = InterruptGuard::install(&conn, ctx);
        op(&conn)
    }
}

impl ProgressRepository for ProgressStore {
    fn get_progress(
        &self,
        ctx: &OpContext,
        user_id: &str,
        goal_id: &str,
    ) -> StoreResult<Option<ProgressRecord>> {
        self.read(ctx, "get progress", |conn| rows::get_one(conn, user_id, goal_id))
    }

    fn get_user_progress(
        &self,
        ctx: &OpContext,
        user_id: &str,
        filter: &ProgressFilter,
    ) -> StoreResult<Vec<ProgressRecord>> {
        self.read(ctx, "list progress", |conn| rows::get_many(conn, user_id, filter))
    }

    fn get_goals_by_ids(
        &self,
        ctx: &OpContext,
        user_id: &str,
        goal_ids: &[String],
    ) -> StoreResult<Vec<ProgressRecord>> {
        if goal_ids.is_empty() {
            return Ok(Vec::new());
        }
        self.read(ctx, "get goals by ids", |conn| {
            rows::get_by_ids(conn, user_id, goal_ids)
        })
    }

    fn upsert_progress(&self, ctx: &OpContext, update: &ProgressUpdate) -> StoreResult<BatchOutcome> {
        update.validate()?;
        self.with_transaction(ctx, |tx| tx.upsert_progress(ctx, update))
    }

    fn bulk_upsert(&self, ctx: &OpContext, updates: &[ProgressUpdate]) -> StoreResult<BatchOutcome> {
        if updates.is_empty() {
            return Ok(BatchOutcome::default());
        }
        validate_updates(updates)?;
        self.with_transaction(ctx, |tx| tx.bulk_upsert(ctx, updates))
    }

    fn bulk_upsert_values(
        &self,
        ctx: &OpContext,
        updates: &[ProgressUpdate],
    ) -> StoreResult<BatchOutcome> {
        if updates.is_empty() {
            return Ok(BatchOutcome::default());
        }
        validate_updates(updates)?;
        self.with_transaction(ctx, |tx| tx.bulk_upsert_values(ctx, updates))
    }

    fn increment_progress(
        &self,
        ctx: &OpContext,
        increment: &ProgressIncrement,
    ) -> StoreResult<BatchOutcome> {
        self.bulk_increment(ctx, std::slice::from_ref(increment))
    }

    fn bulk_increment(
        &self,
        ctx: &OpContext,
        increments: &[ProgressIncrement],
    ) -> StoreResult<BatchOutcome> {
        if increments.is_empty() {
            return Ok(BatchOutcome::default());
        }
        validate_increments(increments)?;
        self.with_transaction(ctx, |tx| tx.bulk_increment(ctx, increments))
    }

    fn bulk_insert(&self, ctx: &OpContext, records: &[ProgressRecord]) -> StoreResult<BatchOutcome> {
        if records.is_empty() {
            return Ok(BatchOutcome::default());
        }
        for record in records {
            record.validate()?;
        }
        self.with_transaction(ctx, |tx| tx.bulk_insert(ctx, records))
    }

    fn set_active(&self, ctx: &OpContext, assignment: &Assignment) -> StoreResult<()> {
        assignment.validate()?;
        self.with_transaction(ctx, |tx| tx.set_active(ctx, assignment))
    }

    fn mark_claimed(&self, ctx: &OpContext, user_id: &str, goal_id: &str) -> StoreResult<()> {
        self.with_transaction(ctx, |tx| tx.mark_claimed(ctx, user_id, goal_id))
    }
}
