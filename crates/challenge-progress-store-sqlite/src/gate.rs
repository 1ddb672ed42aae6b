use challenge_progress_core::{format_timestamp, Assignment};
use rusqlite::{params, Connection};
use time::OffsetDateTime;

use crate::error::{DuringOperation, StoreResult};

/// Creates the row if missing. `assigned_at` moves only when switching on;
/// progress and status are never touched, claimed rows included.
pub(crate) fn set_active(
    conn: &Connection,
    now: OffsetDateTime,
    assignment: &Assignment,
) -> StoreResult<()> {
    let now_text = format_timestamp(now)?;
    conn.prepare_cached(
        "INSERT INTO user_goal_progress (
           user_id, goal_id, challenge_id, namespace, progress, status,
           is_active, assigned_at, created_at, updated_at
         ) VALUES (
           ?1, ?2, ?3, ?4, 0, 'not_started',
           ?5, CASE WHEN ?5 = 1 THEN ?6 ELSE NULL END, ?6, ?6
         )
         ON CONFLICT(user_id, goal_id) DO UPDATE SET
           is_active = excluded.is_active,
           assigned_at = CASE
             WHEN excluded.is_active = 1 THEN excluded.updated_at
             ELSE user_goal_progress.assigned_at
           END,
           updated_at = excluded.updated_at",
    )
    .during("set goal active")?
    .execute(params![
        assignment.user_id,
        assignment.goal_id,
        assignment.challenge_id,
        assignment.namespace,
        assignment.active,
        now_text,
    ])
    .during("set goal active")?;

    tracing::debug!(
        user_id = %assignment.user_id,
        goal_id = %assignment.goal_id,
        active = assignment.active,
        "assignment gate updated"
    );
    Ok(())
}
