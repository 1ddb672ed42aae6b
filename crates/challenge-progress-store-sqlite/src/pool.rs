use challenge_progress_core::OpContext;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use serde::Serialize;

use crate::config::StoreConfig;
use crate::error::{StoreError, StoreResult};

pub(crate) type SqlitePool = r2d2::Pool<SqliteConnectionManager>;
pub(crate) type PooledConn = r2d2::PooledConnection<SqliteConnectionManager>;

/// VM instructions between cancellation checks.
const INTERRUPT_CHECK_INTERVAL: i32 = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub max_open_conns: u32,
    pub open_conns: u32,
    pub idle_conns: u32,
    pub in_use_conns: u32,
}

pub(crate) fn build_pool(config: &StoreConfig) -> StoreResult<SqlitePool> {
    let busy_timeout = config.busy_timeout;
    let manager = SqliteConnectionManager::file(&config.db_path).with_init(move |conn| {
        conn.busy_timeout(busy_timeout)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;",
        )
    });

    r2d2::Pool::builder()
        .max_size(config.max_open_conns)
        .min_idle(Some(config.max_idle_conns))
        .max_lifetime(Some(config.conn_max_lifetime))
        .idle_timeout(Some(config.conn_max_idle_time))
        .connection_timeout(config.acquire_timeout)
        .build(manager)
        .map_err(|source| StoreError::Pool {
            operation: "open pool",
            source,
        })
}

pub(crate) fn pool_status(pool: &SqlitePool, config: &StoreConfig) -> PoolStatus {
    let state = pool.state();
    PoolStatus {
        max_open_conns: config.max_open_conns,
        open_conns: state.connections,
        idle_conns: state.idle_connections,
        in_use_conns: state.connections.saturating_sub(state.idle_connections),
    }
}

/// Checks out a connection, waiting no longer than the context allows.
pub(crate) fn acquire(
    pool: &SqlitePool,
    ctx: &OpContext,
    operation: &'static str,
) -> StoreResult<PooledConn> {
    if ctx.is_done() {
        return Err(StoreError::Canceled { operation });
    }

    let checked_out = match ctx.remaining() {
        Some(remaining) => pool.get_timeout(remaining.min(pool.connection_timeout())),
        None => pool.get(),
    };

    checked_out.map_err(|source| {
        if ctx.is_done() {
            StoreError::Canceled { operation }
        } else {
            StoreError::Pool { operation, source }
        }
    })
}

/// Interrupts statements on `conn` once `ctx` is canceled or past its deadline.
/// The handler is removed when the guard drops.
pub(crate) struct InterruptGuard<'c> {
    conn: &'c Connection,
}

impl<'c> InterruptGuard<'c> {
    pub(crate) fn install(conn: &'c Connection, ctx: &OpContext) -> Self {
        let watched = ctx.clone();
        conn.progress_handler(INTERRUPT_CHECK_INTERVAL, Some(move || watched.is_done()));
        Self { conn }
    }
}

impl Drop for InterruptGuard<'_> {
    fn drop(&mut self) {
        self.conn.progress_handler(0, None::<fn() -> bool>);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn must<T>(result: StoreResult<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn memory_config(max_open_conns: u32) -> StoreConfig {
        StoreConfig {
            max_open_conns,
            max_idle_conns: 0,
            acquire_timeout: Duration::from_millis(100),
            ..StoreConfig::with_path(":memory:")
        }
    }

    #[test]
    fn canceled_context_never_reaches_the_pool() {
        let pool = must(build_pool(&memory_config(1)));
        let ctx = OpContext::background();
        ctx.cancel();
        assert!(matches!(
            acquire(&pool, &ctx, "health"),
            Err(StoreError::Canceled { operation: "health" })
        ));
    }

    #[test]
    fn exhausted_pool_reports_pool_error() {
        let pool = must(build_pool(&memory_config(1)));
        let ctx = OpContext::background();
        let held = must(acquire(&pool, &ctx, "hold"));
        assert!(matches!(
            acquire(&pool, &ctx, "second"),
            Err(StoreError::Pool { operation: "second", .. })
        ));
        let status = pool_status(&pool, &memory_config(1));
        assert_eq!(status.in_use_conns, 1);
        drop(held);
    }

    #[test]
    fn expired_deadline_while_waiting_reports_canceled() {
        let pool = must(build_pool(&memory_config(1)));
        let held = must(acquire(&pool, &OpContext::background(), "hold"));
        let ctx = OpContext::with_timeout(Duration::from_millis(20));
        assert!(matches!(
            acquire(&pool, &ctx, "wait"),
            Err(StoreError::Canceled { operation: "wait" })
        ));
        drop(held);
    }

    #[test]
    fn interrupt_guard_aborts_long_statement() {
        let pool = must(build_pool(&memory_config(1)));
        let conn = must(acquire(&pool, &OpContext::background(), "interrupt"));
        let ctx = OpContext::background();
        ctx.cancel();

        let result = {
            let _guard = InterruptGuard::install(&conn, &ctx);
            conn.query_row(
                "WITH RECURSIVE n(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM n WHERE x < 10000000)
                 SELECT count(*) FROM n",
                [],
                |row| row.get::<_, i64>(0),
            )
        };
        let err = match result {
            Ok(count) => panic!("statement should have been interrupted, counted {count}"),
            Err(err) => StoreError::database("count", err),
        };
        assert!(matches!(err, StoreError::Canceled { operation: "count" }));

        let after: i64 = match conn.query_row("SELECT 1", [], |row| row.get(0)) {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        };
        assert_eq!(after, 1);
    }
}
