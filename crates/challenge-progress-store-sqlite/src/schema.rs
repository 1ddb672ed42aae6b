use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{DuringOperation, StoreError, StoreResult};

pub const PROGRESS_MIGRATION_VERSION: i64 = 1;

pub(crate) const PROGRESS_TABLE: &str = "user_goal_progress";

pub(crate) const PROGRESS_COLUMNS: &[&str] = &[
    "user_id",
    "goal_id",
    "challenge_id",
    "namespace",
    "progress",
    "status",
    "completed_at",
    "claimed_at",
    "created_at",
    "updated_at",
    "is_active",
    "assigned_at",
    "expires_at",
];

const SCHEMA_PROGRESS_V1: &str = r"
CREATE TABLE IF NOT EXISTS user_goal_progress (
  user_id TEXT NOT NULL CHECK (length(trim(user_id)) > 0),
  goal_id TEXT NOT NULL CHECK (length(trim(goal_id)) > 0),
  challenge_id TEXT NOT NULL CHECK (length(trim(challenge_id)) > 0),
  namespace TEXT NOT NULL CHECK (length(trim(namespace)) > 0),
  progress INTEGER NOT NULL DEFAULT 0
    CHECK (typeof(progress) = 'integer' AND progress >= 0),
  status TEXT NOT NULL DEFAULT 'not_started'
    CHECK (status IN ('not_started', 'in_progress', 'completed', 'claimed')),
  completed_at TEXT,
  claimed_at TEXT,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  is_active INTEGER NOT NULL DEFAULT 1 CHECK (is_active IN (0, 1)),
  assigned_at TEXT,
  expires_at TEXT,
  PRIMARY KEY (user_id, goal_id),
  CHECK (claimed_at IS NULL OR completed_at IS NOT NULL)
) WITHOUT ROWID;

CREATE TRIGGER IF NOT EXISTS trg_user_goal_progress_no_delete
BEFORE DELETE ON user_goal_progress
BEGIN
  SELECT RAISE(FAIL, 'user_goal_progress rows are never deleted');
END;

CREATE TRIGGER IF NOT EXISTS trg_user_goal_progress_claimed_is_terminal
BEFORE UPDATE OF status ON user_goal_progress
WHEN OLD.status = 'claimed' AND NEW.status != 'claimed'
BEGIN
  SELECT RAISE(ABORT, 'claimed is a terminal status');
END;

CREATE INDEX IF NOT EXISTS idx_user_goal_progress_user_challenge
  ON user_goal_progress(user_id, challenge_id);
CREATE INDEX IF NOT EXISTS idx_user_goal_progress_user_active
  ON user_goal_progress(user_id, is_active);
";

pub(crate) fn migrate(conn: &Connection, applied_at: &str) -> StoreResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL
        );",
    )
    .during("ensure schema_migrations")?;

    if table_exists(conn, PROGRESS_TABLE)? {
        ensure_table_has_columns(conn, PROGRESS_TABLE, PROGRESS_COLUMNS)?;
    }

    conn.execute_batch(SCHEMA_PROGRESS_V1)
        .during("apply progress schema")?;

    let inserted = conn
        .execute(
            "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
            params![PROGRESS_MIGRATION_VERSION, applied_at],
        )
        .during("register progress schema migration")?;

    if inserted > 0 {
        tracing::info!(version = PROGRESS_MIGRATION_VERSION, "applied progress schema");
    }
    Ok(())
}

pub(crate) fn schema_version(conn: &Connection) -> StoreResult<Option<i64>> {
    if !table_exists(conn, "schema_migrations")? {
        return Ok(None);
    }
    conn.query_row("SELECT MAX(version) FROM schema_migrations", [], |row| {
        row.get::<_, Option<i64>>(0)
    })
    .during("read schema version")
}

pub(crate) fn table_exists(conn: &Connection, table_name: &str) -> StoreResult<bool> {
    let exists = conn
        .query_row(
            "SELECT 1
             FROM sqlite_master
             WHERE type = 'table' AND name = ?1
             LIMIT 1",
            params![table_name],
            |_| Ok(()),
        )
        .optional()
        .during("query sqlite_master")?
        .is_some();

    Ok(exists)
}

fn ensure_table_has_columns(conn: &Connection, table_name: &str, columns: &[&str]) -> StoreResult<()> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table_name})"))
        .during("inspect table_info")?;
    let available = stmt
        .query_map([], |row| row.get::<_, String>(1))
        .during("inspect table_info")?
        .collect::<rusqlite::Result<Vec<_>>>()
        .during("inspect table_info")?;

    for required in columns {
        if !available.iter().any(|candidate| candidate == required) {
            return Err(StoreError::Database {
                operation: "migrate",
                source: rusqlite::Error::InvalidColumnName(format!(
                    "{table_name}.{required} is missing from an existing table"
                )),
            });
        }
    }

    Ok(())
}
