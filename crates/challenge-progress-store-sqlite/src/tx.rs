use std::sync::Arc;

use challenge_progress_core::{
    validate_increments, validate_updates, Assignment, BatchOutcome, Clock, OpContext,
    ProgressError, ProgressFilter, ProgressIncrement, ProgressRecord, ProgressUpdate,
};
use rusqlite::Connection;
use serde::Serialize;
use time::OffsetDateTime;

use crate::error::{DuringOperation, StoreError, StoreResult};
use crate::pool::{acquire, InterruptGuard, PooledConn, SqlitePool};
use crate::{batch, claim, gate, rows, ProgressRepository};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TxState {
    Active,
    Committed,
    RolledBack,
}

/// A write transaction holding one pooled connection.
///
/// Every operation runs on that connection, so reads observe this
/// transaction's own writes. Dropping an active transaction rolls it back.
pub struct ProgressTx {
    conn: PooledConn,
    clock: Arc<dyn Clock>,
    state: TxState,
}

impl std::fmt::Debug for ProgressTx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressTx")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl ProgressTx {
    /// `BEGIN IMMEDIATE` takes the write lock up front, so a later read in
    /// this transaction cannot be invalidated by another writer.
    pub(crate) fn begin(
        pool: &SqlitePool,
        clock: Arc<dyn Clock>,
        ctx: &OpContext,
    ) -> StoreResult<Self> {
        let conn = acquire(pool, ctx, "begin transaction")?;
        {
            let _guard = InterruptGuard::install(&conn, ctx);
            conn.execute_batch("BEGIN IMMEDIATE")
                .during("begin transaction")?;
        }
        Ok(Self {
            conn,
            clock,
            state: TxState::Active,
        })
    }

    #[must_use]
    pub fn state(&self) -> TxState {
        self.state
    }

    /// # Errors
    /// Always returns [`StoreError::TransactionMisuse`]; transactions do not nest.
    pub fn begin_transaction(&self, _ctx: &OpContext) -> StoreResult<ProgressTx> {
        Err(StoreError::TransactionMisuse(
            "cannot begin a transaction inside an existing transaction".to_string(),
        ))
    }

    /// Reads the row while this transaction holds the database write lock.
    ///
    /// # Errors
    /// Returns an error when the transaction is finished or the read fails.
    pub fn get_progress_for_update(
        &self,
        ctx: &OpContext,
        user_id: &str,
        goal_id: &str,
    ) -> StoreResult<Option<ProgressRecord>> {
        self.run(ctx, |conn, _| rows::get_one(conn, user_id, goal_id))
    }

    /// Claims a completed goal inside this transaction. Nothing is durable
    /// until [`ProgressTx::commit`].
    ///
    /// # Errors
    /// Returns [`StoreError::CannotClaim`] when the goal is missing, inactive,
    /// not completed, or already claimed.
    pub fn claim(&self, ctx: &OpContext, user_id: &str, goal_id: &str) -> StoreResult<ProgressRecord> {
        self.run(ctx, |conn, now| claim::claim_locked(conn, now, user_id, goal_id))
    }

    /// # Errors
    /// Returns [`StoreError::TransactionMisuse`] when the transaction is not
    /// active, or a database error when the commit itself fails.
    pub fn commit(&mut self) -> StoreResult<()> {
        self.ensure_active("commit")?;
        if self.conn.is_autocommit() {
            self.state = TxState::RolledBack;
            return Err(StoreError::TransactionMisuse(
                "commit after the database rolled the transaction back".to_string(),
            ));
        }
        self.conn
            .execute_batch("COMMIT")
            .during("commit transaction")?;
        self.state = TxState::Committed;
        Ok(())
    }

    /// # Errors
    /// Returns [`StoreError::TransactionMisuse`] when the transaction is not active.
    pub fn rollback(&mut self) -> StoreResult<()> {
        self.ensure_active("rollback")?;
        self.state = TxState::RolledBack;
        if self.conn.is_autocommit() {
            return Ok(());
        }
        self.conn
            .execute_batch("ROLLBACK")
            .during("rollback transaction")
    }

    fn ensure_active(&self, operation: &str) -> StoreResult<()> {
        match self.state {
            TxState::Active => Ok(()),
            TxState::Committed => Err(StoreError::TransactionMisuse(format!(
                "{operation} called on a committed transaction"
            ))),
            TxState::RolledBack => Err(StoreError::TransactionMisuse(format!(
                "{operation} called on a rolled back transaction"
            ))),
        }
    }

    /// Runs `op` on the transaction's connection with cancellation installed
    /// and a single clock reading.
    pub(crate) fn run<T>(
        &self,
        ctx: &OpContext,
        op: impl FnOnce(&Connection, OffsetDateTime) -> StoreResult<T>,
    ) -> StoreResult<T> {
        self.ensure_active("operation")?;
        if ctx.is_done() {
            return Err(StoreError::Canceled {
                operation: "transaction operation",
            });
        }
        let _guard = InterruptGuard::install(&self.conn, ctx);
        op(&self.conn, self.clock.now())
    }
}

impl Drop for ProgressTx {
    fn drop(&mut self) {
        if self.state != TxState::Active || self.conn.is_autocommit() {
            return;
        }
        if let Err(err) = self.conn.execute_batch("ROLLBACK") {
            tracing::warn!(error = %err, "failed to roll back abandoned transaction");
        }
    }
}

impl ProgressRepository for ProgressTx {
    fn get_progress(
        &self,
        ctx: &OpContext,
        user_id: &str,
        goal_id: &str,
    ) -> StoreResult<Option<ProgressRecord>> {
        self.run(ctx, |conn, _| rows::get_one(conn, user_id, goal_id))
    }

    fn get_user_progress(
        &self,
        ctx: &OpContext,
        user_id: &str,
        filter: &ProgressFilter,
    ) -> StoreResult<Vec<ProgressRecord>> {
        self.run(ctx, |conn, _| rows::get_many(conn, user_id, filter))
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
        self.run(ctx, |conn, _| rows::get_by_ids(conn, user_id, goal_ids))
    }

    fn upsert_progress(&self, ctx: &OpContext, update: &ProgressUpdate) -> StoreResult<BatchOutcome> {
        update.validate()?;
        let applied = self.run(ctx, |conn, now| {
            batch::values_upsert(conn, now, std::slice::from_ref(update))
        })?;
        Ok(BatchOutcome { requested: 1, applied })
    }

    fn bulk_upsert(&self, ctx: &OpContext, updates: &[ProgressUpdate]) -> StoreResult<BatchOutcome> {
        if updates.is_empty() {
            return Ok(BatchOutcome::default());
        }
        validate_updates(updates)?;
        let applied = self.run(ctx, |conn, now| batch::staged_upsert(conn, now, updates))?;
        Ok(BatchOutcome {
            requested: updates.len(),
            applied,
        })
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
        let applied = self.run(ctx, |conn, now| batch::values_upsert(conn, now, updates))?;
        Ok(BatchOutcome {
            requested: updates.len(),
            applied,
        })
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
        let applied = self.run(ctx, |conn, now| batch::bulk_increment(conn, now, increments))?;
        Ok(BatchOutcome {
            requested: increments.len(),
            applied,
        })
    }

    fn bulk_insert(&self, ctx: &OpContext, records: &[ProgressRecord]) -> StoreResult<BatchOutcome> {
        if records.is_empty() {
            return Ok(BatchOutcome::default());
        }
        for record in records {
            record.validate()?;
        }
        let applied = self.run(ctx, |conn, _| batch::insert_missing(conn, records))?;
        Ok(BatchOutcome {
            requested: records.len(),
            applied,
        })
    }

    fn set_active(&self, ctx: &OpContext, assignment: &Assignment) -> StoreResult<()> {
        assignment.validate()?;
        self.run(ctx, |conn, now| gate::set_active(conn, now, assignment))
    }

    fn mark_claimed(&self, ctx: &OpContext, user_id: &str, goal_id: &str) -> StoreResult<()> {
        if user_id.trim().is_empty() || goal_id.trim().is_empty() {
            return Err(ProgressError::Validation(
                "user_id and goal_id MUST be provided".to_string(),
            )
            .into());
        }
        self.run(ctx, |conn, now| claim::mark_claimed(conn, now, user_id, goal_id))
    }
}
