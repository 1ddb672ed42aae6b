use challenge_progress_core::{format_timestamp, GoalStatus, ProgressRecord};
use rusqlite::{params, Connection};
use time::OffsetDateTime;

use crate::error::{DuringOperation, StoreError, StoreResult};
use crate::rows;

/// Conditional transition `completed -> claimed`. Zero rows changed means the
/// goal was not claimable at the moment the statement ran.
pub(crate) fn mark_claimed(
    conn: &Connection,
    now: OffsetDateTime,
    user_id: &str,
    goal_id: &str,
) -> StoreResult<()> {
    let now_text = format_timestamp(now)?;
    let changed = conn
        .prepare_cached(
            "UPDATE user_goal_progress
             SET status = 'claimed',
                 claimed_at = ?3,
                 completed_at = COALESCE(completed_at, ?3),
                 updated_at = ?3
             WHERE user_id = ?1
               AND goal_id = ?2
               AND status = 'completed'
               AND claimed_at IS NULL
               AND is_active = 1",
        )
        .during("mark claimed")?
        .execute(params![user_id, goal_id, now_text])
        .during("mark claimed")?;

    if changed == 0 {
        return Err(cannot_claim(
            user_id,
            goal_id,
            "goal is not completed, already claimed, or inactive",
        ));
    }
    Ok(())
}

/// Read, check and mark inside a transaction that already holds the write lock.
pub(crate) fn claim_locked(
    conn: &Connection,
    now: OffsetDateTime,
    user_id: &str,
    goal_id: &str,
) -> StoreResult<ProgressRecord> {
    let Some(record) = rows::get_one(conn, user_id, goal_id)? else {
        return Err(cannot_claim(user_id, goal_id, "no progress recorded for goal"));
    };
    if let Some(reason) = rejection_reason(&record) {
        return Err(cannot_claim(user_id, goal_id, reason));
    }

    mark_claimed(conn, now, user_id, goal_id)?;

    let claimed = rows::get_one(conn, user_id, goal_id)?
        .ok_or_else(|| cannot_claim(user_id, goal_id, "progress row vanished during claim"))?;
    tracing::info!(user_id, goal_id, "goal claimed");
    Ok(claimed)
}

fn rejection_reason(record: &ProgressRecord) -> Option<&'static str> {
    if record.is_claimed() {
        return Some("goal already claimed");
    }
    if !record.is_active {
        return Some("goal is not active");
    }
    if record.status != GoalStatus::Completed {
        return Some("goal is not completed");
    }
    None
}

fn cannot_claim(user_id: &str, goal_id: &str, reason: &'static str) -> StoreError {
    tracing::warn!(user_id, goal_id, reason, "claim rejected");
    StoreError::CannotClaim {
        user_id: user_id.to_string(),
        goal_id: goal_id.to_string(),
        reason,
    }
}
