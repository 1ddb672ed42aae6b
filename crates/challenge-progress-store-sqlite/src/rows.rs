use challenge_progress_core::{
    parse_timestamp, GoalStatus, ProgressError, ProgressFilter, ProgressRecord,
};
use rusqlite::{params, Connection, OptionalExtension, Row};
use time::OffsetDateTime;

use crate::error::{DuringOperation, StoreResult};

const SELECT_PROGRESS: &str = "SELECT user_id, goal_id, challenge_id, namespace, progress, status,
        completed_at, claimed_at, created_at, updated_at, is_active, assigned_at, expires_at
 FROM user_goal_progress";

pub(crate) fn get_one(
    conn: &Connection,
    user_id: &str,
    goal_id: &str,
) -> StoreResult<Option<ProgressRecord>> {
    conn.prepare_cached(&format!(
        "{SELECT_PROGRESS} WHERE user_id = ?1 AND goal_id = ?2"
    ))
    .during("get progress")?
    .query_row(params![user_id, goal_id], parse_progress_row)
    .optional()
    .during("get progress")
}

pub(crate) fn get_many(
    conn: &Connection,
    user_id: &str,
    filter: &ProgressFilter,
) -> StoreResult<Vec<ProgressRecord>> {
    let mut stmt = conn
        .prepare_cached(&format!(
            "{SELECT_PROGRESS}
             WHERE user_id = ?1
               AND (?2 IS NULL OR challenge_id = ?2)
               AND (?3 = 0 OR is_active = 1)
             ORDER BY created_at ASC, goal_id ASC"
        ))
        .during("list progress")?;
    let rows = stmt
        .query_map(
            params![user_id, filter.challenge_id.as_deref(), filter.active_only],
            parse_progress_row,
        )
        .during("list progress")?;
    collect_rows(rows, "list progress")
}

pub(crate) fn get_by_ids(
    conn: &Connection,
    user_id: &str,
    goal_ids: &[String],
) -> StoreResult<Vec<ProgressRecord>> {
    if goal_ids.is_empty() {
        return Ok(Vec::new());
    }
    let ids = serde_json::to_string(goal_ids)
        .map_err(|err| ProgressError::Validation(format!("failed to encode goal ids: {err}")))?;

    let mut stmt = conn
        .prepare_cached(&format!(
            "{SELECT_PROGRESS}
             WHERE user_id = ?1
               AND goal_id IN (SELECT value FROM json_each(?2))
             ORDER BY created_at ASC, goal_id ASC"
        ))
        .during("get goals by ids")?;
    let rows = stmt
        .query_map(params![user_id, ids], parse_progress_row)
        .during("get goals by ids")?;
    collect_rows(rows, "get goals by ids")
}

fn parse_progress_row(row: &Row<'_>) -> rusqlite::Result<ProgressRecord> {
    let status_raw: String = row.get(5)?;
    let status = GoalStatus::parse(&status_raw).ok_or_else(|| {
        to_sql_error(
            5,
            ProgressError::Validation(format!("unknown goal status {status_raw}")),
        )
    })?;

    Ok(ProgressRecord {
        user_id: row.get(0)?,
        goal_id: row.get(1)?,
        challenge_id: row.get(2)?,
        namespace: row.get(3)?,
        progress: row.get(4)?,
        status,
        completed_at: optional_timestamp(row, 6)?,
        claimed_at: optional_timestamp(row, 7)?,
        created_at: required_timestamp(row, 8)?,
        updated_at: required_timestamp(row, 9)?,
        is_active: row.get(10)?,
        assigned_at: optional_timestamp(row, 11)?,
        expires_at: optional_timestamp(row, 12)?,
    })
}

fn required_timestamp(row: &Row<'_>, index: usize) -> rusqlite::Result<OffsetDateTime> {
    let raw: String = row.get(index)?;
    parse_timestamp(&raw).map_err(|err| to_sql_error(index, err))
}

fn optional_timestamp(row: &Row<'_>, index: usize) -> rusqlite::Result<Option<OffsetDateTime>> {
    row.get::<_, Option<String>>(index)?
        .map(|raw| parse_timestamp(&raw).map_err(|err| to_sql_error(index, err)))
        .transpose()
}

#[allow(clippy::needless_pass_by_value)]
fn to_sql_error(index: usize, err: ProgressError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            err.to_string(),
        )),
    )
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&Row<'_>) -> rusqlite::Result<T>>,
    operation: &'static str,
) -> StoreResult<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row.during(operation)?);
    }
    Ok(values)
}
