use std::collections::BTreeMap;

use challenge_progress_core::{
    coalesce_increments, format_timestamp, utc_date, ProgressError, ProgressIncrement,
    ProgressRecord, ProgressUpdate,
};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection};
use time::OffsetDateTime;

use crate::error::{DuringOperation, StoreResult};

/// Largest batch the value-list upsert binds in one statement.
pub const MAX_VALUES_BATCH_ROWS: usize = 4_000;

const VALUES_PER_ROW: usize = 7;

const STAGING_TABLE_DDL: &str = "
DROP TABLE IF EXISTS temp.progress_staging;
CREATE TEMP TABLE progress_staging (
  user_id TEXT NOT NULL,
  goal_id TEXT NOT NULL,
  challenge_id TEXT NOT NULL,
  namespace TEXT NOT NULL,
  progress INTEGER NOT NULL,
  status TEXT NOT NULL,
  completed_at TEXT,
  PRIMARY KEY (user_id, goal_id)
);";

// Claimed rows and rows switched off by the assignment gate are left untouched.
const UPSERT_GUARD: &str = "
ON CONFLICT(user_id, goal_id) DO UPDATE SET
  progress = excluded.progress,
  status = excluded.status,
  completed_at = COALESCE(user_goal_progress.completed_at, excluded.completed_at),
  updated_at = excluded.updated_at
WHERE user_goal_progress.status != 'claimed'
  AND user_goal_progress.is_active = 1";

const INCREMENT_MERGE_SQL: &str = "
INSERT INTO user_goal_progress (
  user_id, goal_id, challenge_id, namespace,
  progress, status, completed_at, created_at, updated_at
)
SELECT
  batch.user_id, batch.goal_id, batch.challenge_id, batch.namespace,
  batch.next_progress,
  CASE WHEN batch.next_progress >= batch.target_value THEN 'completed' ELSE 'in_progress' END,
  CASE WHEN batch.next_progress >= batch.target_value THEN ?2 ELSE NULL END,
  ?2,
  ?2
FROM (
  SELECT
    input.user_id, input.goal_id, input.challenge_id, input.namespace, input.target_value,
    COALESCE(existing.progress, 0) + input.delta + CASE
      WHEN input.daily_delta IS NULL THEN 0
      WHEN existing.status != 'not_started'
        AND substr(existing.updated_at, 1, 10) = ?3 THEN 0
      ELSE input.daily_delta
    END AS next_progress
  FROM (
    SELECT
      json_extract(value, '$.user_id') AS user_id,
      json_extract(value, '$.goal_id') AS goal_id,
      json_extract(value, '$.challenge_id') AS challenge_id,
      json_extract(value, '$.namespace') AS namespace,
      json_extract(value, '$.delta') AS delta,
      json_extract(value, '$.daily_delta') AS daily_delta,
      json_extract(value, '$.target_value') AS target_value
    FROM json_each(?1)
  ) AS input
  LEFT JOIN user_goal_progress AS existing
    ON existing.user_id = input.user_id AND existing.goal_id = input.goal_id
) AS batch
WHERE true";

fn merge_sql(source: &str) -> String {
    format!(
        "INSERT INTO user_goal_progress (
           user_id, goal_id, challenge_id, namespace,
           progress, status, completed_at, created_at, updated_at
         )
         SELECT
           user_id, goal_id, challenge_id, namespace, progress, status,
           CASE WHEN status = 'completed' THEN COALESCE(completed_at, ?1) ELSE completed_at END,
           ?1,
           ?1
         FROM {source}
         WHERE true
         {UPSERT_GUARD}"
    )
}

/// Temporary staging table scoped to the enclosing transaction; dropped with the guard.
struct StagingTable<'c> {
    conn: &'c Connection,
}

impl<'c> StagingTable<'c> {
    fn create(conn: &'c Connection) -> StoreResult<Self> {
        conn.execute_batch(STAGING_TABLE_DDL)
            .during("create staging table")?;
        Ok(Self { conn })
    }

    /// Duplicate keys replace the earlier staged row.
    fn load(&self, updates: &[ProgressUpdate]) -> StoreResult<()> {
        let mut stmt = self
            .conn
            .prepare(
                "INSERT OR REPLACE INTO temp.progress_staging (
                   user_id, goal_id, challenge_id, namespace, progress, status, completed_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )
            .during("load staging rows")?;

        for update in updates {
            let completed_at = update.completed_at.map(format_timestamp).transpose()?;
            stmt.execute(params![
                update.user_id,
                update.goal_id,
                update.challenge_id,
                update.namespace,
                update.progress,
                update.status.as_str(),
                completed_at,
            ])
            .during("load staging rows")?;
        }
        Ok(())
    }
}

impl Drop for StagingTable<'_> {
    fn drop(&mut self) {
        if let Err(err) = self
            .conn
            .execute_batch("DROP TABLE IF EXISTS temp.progress_staging")
        {
            tracing::warn!(error = %err, "failed to drop progress staging table");
        }
    }
}

/// Stage every row, then merge them with one statement. Returns rows inserted or updated.
pub(crate) fn staged_upsert(
    conn: &Connection,
    now: OffsetDateTime,
    updates: &[ProgressUpdate],
) -> StoreResult<usize> {
    let now_text = format_timestamp(now)?;
    let staging = StagingTable::create(conn)?;
    staging.load(updates)?;
    let applied = conn
        .execute(&merge_sql("temp.progress_staging"), params![now_text])
        .during("merge staged progress")?;
    drop(staging);

    tracing::debug!(requested = updates.len(), applied, "staged upsert merged");
    Ok(applied)
}

/// One multi-row `VALUES` statement. Slower than staging for large batches.
pub(crate) fn values_upsert(
    conn: &Connection,
    now: OffsetDateTime,
    updates: &[ProgressUpdate],
) -> StoreResult<usize> {
    if updates.len() > MAX_VALUES_BATCH_ROWS {
        return Err(ProgressError::Validation(format!(
            "value-list upsert accepts at most {MAX_VALUES_BATCH_ROWS} rows, got {}",
            updates.len()
        ))
        .into());
    }

    let rows = last_per_key(updates);
    let mut bound = Vec::with_capacity(1 + rows.len() * VALUES_PER_ROW);
    bound.push(Value::Text(format_timestamp(now)?));

    let mut tuples = Vec::with_capacity(rows.len());
    for (index, update) in rows.iter().enumerate() {
        let base = 2 + index * VALUES_PER_ROW;
        let placeholders: Vec<String> = (base..base + VALUES_PER_ROW)
            .map(|position| format!("?{position}"))
            .collect();
        tuples.push(format!("({})", placeholders.join(", ")));

        bound.push(Value::Text(update.user_id.clone()));
        bound.push(Value::Text(update.goal_id.clone()));
        bound.push(Value::Text(update.challenge_id.clone()));
        bound.push(Value::Text(update.namespace.clone()));
        bound.push(Value::Integer(update.progress));
        bound.push(Value::Text(update.status.as_str().to_string()));
        bound.push(match update.completed_at {
            Some(completed_at) => Value::Text(format_timestamp(completed_at)?),
            None => Value::Null,
        });
    }

    let sql = format!(
        "WITH batch(user_id, goal_id, challenge_id, namespace, progress, status, completed_at)
           AS (VALUES {})
         {}",
        tuples.join(", "),
        merge_sql("batch")
    );
    let applied = conn
        .execute(&sql, params_from_iter(bound))
        .during("value-list upsert")?;

    tracing::debug!(requested = updates.len(), applied, "value-list upsert merged");
    Ok(applied)
}

/// Applies every increment in one statement, with the daily window keyed on `now`'s UTC date.
pub(crate) fn bulk_increment(
    conn: &Connection,
    now: OffsetDateTime,
    increments: &[ProgressIncrement],
) -> StoreResult<usize> {
    let merged = coalesce_increments(increments);
    let payload = serde_json::to_string(&merged).map_err(|err| {
        ProgressError::Validation(format!("failed to encode increment batch: {err}"))
    })?;
    let now_text = format_timestamp(now)?;
    let today = utc_date(now)?;

    let applied = conn
        .execute(
            &format!("{INCREMENT_MERGE_SQL}{UPSERT_GUARD}"),
            params![payload, now_text, today],
        )
        .during("bulk increment")?;

    tracing::debug!(
        requested = increments.len(),
        distinct = merged.len(),
        applied,
        "bulk increment applied"
    );
    Ok(applied)
}

/// Inserts rows that do not exist yet; existing rows are never touched.
pub(crate) fn insert_missing(conn: &Connection, records: &[ProgressRecord]) -> StoreResult<usize> {
    let mut stmt = conn
        .prepare(
            "INSERT INTO user_goal_progress (
               user_id, goal_id, challenge_id, namespace, progress, status,
               completed_at, claimed_at, created_at, updated_at,
               is_active, assigned_at, expires_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
             ON CONFLICT(user_id, goal_id) DO NOTHING",
        )
        .during("bulk insert")?;

    let optional = |value: Option<OffsetDateTime>| value.map(format_timestamp).transpose();
    let mut applied = 0;
    for record in records {
        applied += stmt
            .execute(params![
                record.user_id,
                record.goal_id,
                record.challenge_id,
                record.namespace,
                record.progress,
                record.status.as_str(),
                optional(record.completed_at)?,
                optional(record.claimed_at)?,
                format_timestamp(record.created_at)?,
                format_timestamp(record.updated_at)?,
                record.is_active,
                optional(record.assigned_at)?,
                optional(record.expires_at)?,
            ])
            .during("bulk insert")?;
    }

    tracing::debug!(requested = records.len(), applied, "bulk insert finished");
    Ok(applied)
}

fn last_per_key(updates: &[ProgressUpdate]) -> Vec<&ProgressUpdate> {
    let mut latest: BTreeMap<(&str, &str), usize> = BTreeMap::new();
    for (index, update) in updates.iter().enumerate() {
        latest.insert((update.user_id.as_str(), update.goal_id.as_str()), index);
    }
    let mut keep: Vec<usize> = latest.into_values().collect();
    keep.sort_unstable();
    keep.into_iter().map(|index| &updates[index]).collect()
}

#[cfg(test)]
mod tests {
    use challenge_progress_core::GoalStatus;
    use time::macros::datetime;

    use super::*;
    use crate::schema;

    fn must<T>(result: StoreResult<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn migrated_conn_in_transaction() -> Connection {
        let conn = match Connection::open_in_memory() {
            Ok(conn) => conn,
            Err(err) => panic!("test failure: {err}"),
        };
        must(schema::migrate(&conn, "2026-02-07T00:00:00.000000Z"));
        if let Err(err) = conn.execute_batch("BEGIN IMMEDIATE") {
            panic!("test setup failed: {err}");
        }
        conn
    }

    fn staging_table_exists(conn: &Connection) -> bool {
        match conn.query_row(
            "SELECT COUNT(*) FROM sqlite_temp_master WHERE name = 'progress_staging'",
            [],
            |row| row.get::<_, i64>(0),
        ) {
            Ok(count) => count > 0,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn update(goal_id: &str, progress: i64) -> ProgressUpdate {
        ProgressUpdate {
            user_id: "u1".to_string(),
            goal_id: goal_id.to_string(),
            challenge_id: "c1".to_string(),
            namespace: "ns".to_string(),
            progress,
            status: GoalStatus::InProgress,
            completed_at: None,
        }
    }

    #[test]
    fn last_per_key_keeps_final_occurrence_in_order() {
        let updates = vec![update("g1", 1), update("g2", 2), update("g1", 3)];
        let kept: Vec<(&str, i64)> = last_per_key(&updates)
            .into_iter()
            .map(|item| (item.goal_id.as_str(), item.progress))
            .collect();
        assert_eq!(kept, vec![("g2", 2), ("g1", 3)]);
    }

    #[test]
    fn staging_table_is_dropped_after_successful_merge() {
        let conn = migrated_conn_in_transaction();
        let now = datetime!(2026-02-07 12:00:00 UTC);

        let applied = must(staged_upsert(&conn, now, &[update("g1", 1), update("g2", 2)]));
        assert_eq!(applied, 2);
        assert!(!staging_table_exists(&conn));

        assert_eq!(must(staged_upsert(&conn, now, &[update("g1", 5)])), 1);
        assert!(!staging_table_exists(&conn));
    }

    #[test]
    fn staging_table_is_dropped_when_merge_fails() {
        let conn = migrated_conn_in_transaction();
        let mut blank_user = update("g1", 1);
        blank_user.user_id = "  ".to_string();

        let result = staged_upsert(&conn, datetime!(2026-02-07 12:00:00 UTC), &[blank_user]);
        assert!(result.is_err(), "blank user id should violate the table CHECK");
        assert!(!staging_table_exists(&conn));

        let applied = must(staged_upsert(
            &conn,
            datetime!(2026-02-07 12:00:01 UTC),
            &[update("g1", 1)],
        ));
        assert_eq!(applied, 1);
    }

    #[test]
    fn merge_sql_guards_claimed_and_inactive_rows() {
        let sql = merge_sql("batch");
        assert!(sql.contains("user_goal_progress.status != 'claimed'"));
        assert!(sql.contains("user_goal_progress.is_active = 1"));
        assert!(sql.contains("FROM batch"));
    }
}
