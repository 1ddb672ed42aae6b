use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use time::macros::format_description;
use time::{Duration, OffsetDateTime, PrimitiveDateTime, UtcOffset};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ProgressError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("configuration error: {0}")]
    Configuration(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum GoalStatus {
    NotStarted,
    InProgress,
    Completed,
    Claimed,
}

impl GoalStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Claimed => "claimed",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "not_started" => Some(Self::NotStarted),
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            "claimed" => Some(Self::Claimed),
            _ => None,
        }
    }

    /// Status an incremented counter lands in: a threshold crossing, not a cap.
    #[must_use]
    pub fn for_progress(progress: i64, target_value: u32) -> Self {
        if progress >= i64::from(target_value) {
            Self::Completed
        } else {
            Self::InProgress
        }
    }
}

impl Display for GoalStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ProgressKey {
    pub user_id: String,
    pub goal_id: String,
}

impl ProgressKey {
    #[must_use]
    pub fn new(user_id: impl Into<String>, goal_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            goal_id: goal_id.into(),
        }
    }
}

impl Display for ProgressKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.user_id, self.goal_id)
    }
}

/// One row of `user_goal_progress`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProgressRecord {
    pub user_id: String,
    pub goal_id: String,
    pub challenge_id: String,
    pub namespace: String,
    pub progress: i64,
    pub status: GoalStatus,
    #[serde(with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub claimed_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    pub is_active: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub assigned_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
}

impl ProgressRecord {
    /// A fresh, untouched assignment row as used for initial seeding.
    #[must_use]
    pub fn assigned(
        user_id: impl Into<String>,
        goal_id: impl Into<String>,
        challenge_id: impl Into<String>,
        namespace: impl Into<String>,
        is_active: bool,
        now: OffsetDateTime,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            goal_id: goal_id.into(),
            challenge_id: challenge_id.into(),
            namespace: namespace.into(),
            progress: 0,
            status: GoalStatus::NotStarted,
            completed_at: None,
            claimed_at: None,
            created_at: now,
            updated_at: now,
            is_active,
            assigned_at: is_active.then_some(now),
            expires_at: None,
        }
    }

    #[must_use]
    pub fn key(&self) -> ProgressKey {
        ProgressKey::new(self.user_id.clone(), self.goal_id.clone())
    }

    #[must_use]
    pub fn is_completed(&self) -> bool {
        matches!(self.status, GoalStatus::Completed | GoalStatus::Claimed)
    }

    #[must_use]
    pub fn is_claimed(&self) -> bool {
        self.status == GoalStatus::Claimed
    }

    #[must_use]
    pub fn can_claim(&self) -> bool {
        self.is_active && self.status == GoalStatus::Completed && self.claimed_at.is_none()
    }

    #[must_use]
    pub fn meets_target(&self, target_value: u32) -> bool {
        self.progress >= i64::from(target_value)
    }

    /// Checks the record-level invariants that the schema also enforces.
    ///
    /// # Errors
    /// Returns [`ProgressError::Validation`] when identity fields are blank,
    /// progress is negative, or `claimed_at` is set without `completed_at`.
    pub fn validate(&self) -> Result<(), ProgressError> {
        validate_identity(
            &self.user_id,
            &self.goal_id,
            &self.challenge_id,
            &self.namespace,
        )?;

        if self.progress < 0 {
            return Err(ProgressError::Validation(
                "progress MUST be >= 0".to_string(),
            ));
        }

        if self.claimed_at.is_some() && self.completed_at.is_none() {
            return Err(ProgressError::Validation(
                "claimed_at requires completed_at".to_string(),
            ));
        }

        Ok(())
    }
}

/// Absolute progress write used by the bulk upsert paths.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProgressUpdate {
    pub user_id: String,
    pub goal_id: String,
    pub challenge_id: String,
    pub namespace: String,
    pub progress: i64,
    pub status: GoalStatus,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
}

impl ProgressUpdate {
    /// Validates an upsert tuple before it is staged.
    ///
    /// # Errors
    /// Returns [`ProgressError::Validation`] when identity fields are blank,
    /// progress is negative, or the tuple tries to write `claimed`.
    pub fn validate(&self) -> Result<(), ProgressError> {
        validate_identity(
            &self.user_id,
            &self.goal_id,
            &self.challenge_id,
            &self.namespace,
        )?;

        if self.progress < 0 {
            return Err(ProgressError::Validation(format!(
                "progress MUST be >= 0 for {}:{}",
                self.user_id, self.goal_id
            )));
        }

        if self.status == GoalStatus::Claimed {
            return Err(ProgressError::Validation(format!(
                "status claimed is only reachable through claim for {}:{}",
                self.user_id, self.goal_id
            )));
        }

        Ok(())
    }
}

/// Atomic increment request; `daily` limits it to one application per UTC day.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProgressIncrement {
    pub user_id: String,
    pub goal_id: String,
    pub challenge_id: String,
    pub namespace: String,
    pub delta: u32,
    pub target_value: u32,
    #[serde(default, alias = "is_daily_increment")]
    pub daily: bool,
}

impl ProgressIncrement {
    /// # Errors
    /// Returns [`ProgressError::Validation`] when identity fields are blank.
    pub fn validate(&self) -> Result<(), ProgressError> {
        validate_identity(
            &self.user_id,
            &self.goal_id,
            &self.challenge_id,
            &self.namespace,
        )
    }
}

/// Assignment gate toggle for one (user, goal) pair.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Assignment {
    pub user_id: String,
    pub goal_id: String,
    pub challenge_id: String,
    pub namespace: String,
    pub active: bool,
}

impl Assignment {
    /// # Errors
    /// Returns [`ProgressError::Validation`] when identity fields are blank.
    pub fn validate(&self) -> Result<(), ProgressError> {
        validate_identity(
            &self.user_id,
            &self.goal_id,
            &self.challenge_id,
            &self.namespace,
        )
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProgressFilter {
    pub challenge_id: Option<String>,
    pub active_only: bool,
}

impl ProgressFilter {
    #[must_use]
    pub fn challenge(challenge_id: impl Into<String>) -> Self {
        Self {
            challenge_id: Some(challenge_id.into()),
            active_only: false,
        }
    }

    #[must_use]
    pub fn active_only(mut self) -> Self {
        self.active_only = true;
        self
    }
}

/// Reporting for a batch write; skipped claimed or inactive rows are not errors.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BatchOutcome {
    pub requested: usize,
    pub applied: usize,
}

impl BatchOutcome {
    #[must_use]
    pub fn skipped(&self) -> usize {
        self.requested.saturating_sub(self.applied)
    }
}

/// Validates every entry of an upsert batch.
///
/// # Errors
/// Returns the first [`ProgressError::Validation`] found.
pub fn validate_updates(updates: &[ProgressUpdate]) -> Result<(), ProgressError> {
    updates.iter().try_for_each(ProgressUpdate::validate)
}

/// Validates every entry of an increment batch.
///
/// # Errors
/// Returns the first [`ProgressError::Validation`] found.
pub fn validate_increments(increments: &[ProgressIncrement]) -> Result<(), ProgressError> {
    increments.iter().try_for_each(ProgressIncrement::validate)
}

/// One key's share of an increment batch after repeated entries are folded.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CoalescedIncrement {
    pub user_id: String,
    pub goal_id: String,
    pub challenge_id: String,
    pub namespace: String,
    /// Sum of the non-daily deltas; always applied.
    pub delta: u64,
    /// Delta of the last daily entry; applied at most once per UTC day.
    pub daily_delta: Option<u32>,
    pub target_value: u32,
}

/// Folds repeated keys of one increment batch into a single request per key.
///
/// Non-daily deltas add up and the daily part is tracked on its own, so mixing
/// both kinds for one key neither drops regular deltas nor lifts the daily
/// window. The last entry decides `target_value`; `challenge_id` and
/// `namespace` come from the first entry since they are immutable once the
/// row exists. First-occurrence order is preserved.
#[must_use]
pub fn coalesce_increments(increments: &[ProgressIncrement]) -> Vec<CoalescedIncrement> {
    let mut positions: BTreeMap<(&str, &str), usize> = BTreeMap::new();
    let mut merged: Vec<CoalescedIncrement> = Vec::with_capacity(increments.len());

    for increment in increments {
        let key = (increment.user_id.as_str(), increment.goal_id.as_str());
        let index = match positions.get(&key) {
            Some(&index) => index,
            None => {
                positions.insert(key, merged.len());
                merged.push(CoalescedIncrement {
                    user_id: increment.user_id.clone(),
                    goal_id: increment.goal_id.clone(),
                    challenge_id: increment.challenge_id.clone(),
                    namespace: increment.namespace.clone(),
                    delta: 0,
                    daily_delta: None,
                    target_value: increment.target_value,
                });
                merged.len() - 1
            }
        };

        let slot = &mut merged[index];
        if increment.daily {
            slot.daily_delta = Some(increment.delta);
        } else {
            slot.delta = slot.delta.saturating_add(u64::from(increment.delta));
        }
        slot.target_value = increment.target_value;
    }

    merged
}

fn validate_identity(
    user_id: &str,
    goal_id: &str,
    challenge_id: &str,
    namespace: &str,
) -> Result<(), ProgressError> {
    for (field, value) in [
        ("user_id", user_id),
        ("goal_id", goal_id),
        ("challenge_id", challenge_id),
        ("namespace", namespace),
    ] {
        if value.trim().is_empty() {
            return Err(ProgressError::Validation(format!(
                "{field} MUST be provided"
            )));
        }
    }
    Ok(())
}

/// Source of "now" for every write. One statement uses one reading.
pub trait Clock: Send + Sync {
    fn now(&self) -> OffsetDateTime;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        now_utc()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<OffsetDateTime>,
}

impl ManualClock {
    #[must_use]
    pub fn new(start: OffsetDateTime) -> Self {
        Self {
            now: Mutex::new(start.to_offset(UtcOffset::UTC)),
        }
    }

    pub fn set(&self, value: OffsetDateTime) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = value.to_offset(UtcOffset::UTC);
    }

    pub fn advance(&self, by: Duration) {
        let mut guard = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *guard += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> OffsetDateTime {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Cancellation and deadline token carried by every store operation.
///
/// Clones share the cancel flag, so canceling any clone aborts work started
/// with the others.
#[derive(Debug, Clone, Default)]
pub struct OpContext {
    canceled: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl OpContext {
    #[must_use]
    pub fn background() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_timeout(timeout: std::time::Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    #[must_use]
    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            canceled: Arc::new(AtomicBool::new(false)),
            deadline: Some(deadline),
        }
    }

    /// Derives a context that shares this one's cancel flag and expires no
    /// later than either deadline.
    #[must_use]
    pub fn child_with_timeout(&self, timeout: std::time::Duration) -> Self {
        let candidate = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(existing) if existing < candidate => existing,
            _ => candidate,
        };
        Self {
            canceled: Arc::clone(&self.canceled),
            deadline: Some(deadline),
        }
    }

    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.deadline
            .is_some_and(|deadline| Instant::now() >= deadline)
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.is_canceled() || self.is_expired()
    }

    /// Time left before the deadline, `None` when there is no deadline.
    #[must_use]
    pub fn remaining(&self) -> Option<std::time::Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }
}

/// Formats a timestamp in the fixed-width UTC storage layout
/// `YYYY-MM-DDTHH:MM:SS.ffffffZ`.
///
/// # Errors
/// Returns [`ProgressError::Validation`] when formatting fails.
pub fn format_timestamp(value: OffsetDateTime) -> Result<String, ProgressError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(format_description!(
            "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:6]Z"
        ))
        .map_err(|err| ProgressError::Validation(format!("failed to format timestamp: {err}")))
}

/// Parses the storage layout written by [`format_timestamp`].
///
/// # Errors
/// Returns [`ProgressError::Validation`] when the value does not match it.
pub fn parse_timestamp(value: &str) -> Result<OffsetDateTime, ProgressError> {
    PrimitiveDateTime::parse(
        value,
        format_description!(
            "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:6]Z"
        ),
    )
    .map(PrimitiveDateTime::assume_utc)
    .map_err(|err| ProgressError::Validation(format!("invalid stored timestamp {value}: {err}")))
}

/// UTC calendar date as `YYYY-MM-DD`; the daily-increment dedup key.
///
/// # Errors
/// Returns [`ProgressError::Validation`] when formatting fails.
pub fn utc_date(value: OffsetDateTime) -> Result<String, ProgressError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(format_description!("[year]-[month]-[day]"))
        .map_err(|err| ProgressError::Validation(format!("failed to format date: {err}")))
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`ProgressError::Validation`] when parsing fails or an input
/// timestamp is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, ProgressError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| ProgressError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(ProgressError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn must_utc(value: &str) -> OffsetDateTime {
        must_ok(parse_rfc3339_utc(value))
    }

    fn increment(goal_id: &str, delta: u32, daily: bool) -> ProgressIncrement {
        ProgressIncrement {
            user_id: "u1".to_string(),
            goal_id: goal_id.to_string(),
            challenge_id: "winter".to_string(),
            namespace: "game".to_string(),
            delta,
            target_value: 10,
            daily,
        }
    }

    fn update(status: GoalStatus) -> ProgressUpdate {
        ProgressUpdate {
            user_id: "u1".to_string(),
            goal_id: "g1".to_string(),
            challenge_id: "winter".to_string(),
            namespace: "game".to_string(),
            progress: 3,
            status,
            completed_at: None,
        }
    }

    #[test]
    fn status_round_trips_through_storage_strings() {
        for status in [
            GoalStatus::NotStarted,
            GoalStatus::InProgress,
            GoalStatus::Completed,
            GoalStatus::Claimed,
        ] {
            assert_eq!(GoalStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(GoalStatus::parse("done"), None);
    }

    #[test]
    fn completion_is_a_threshold_not_a_cap() {
        assert_eq!(GoalStatus::for_progress(9, 10), GoalStatus::InProgress);
        assert_eq!(GoalStatus::for_progress(10, 10), GoalStatus::Completed);
        assert_eq!(GoalStatus::for_progress(25, 10), GoalStatus::Completed);
    }

    #[test]
    fn upsert_cannot_write_claimed_status() {
        let err = match update(GoalStatus::Claimed).validate() {
            Ok(()) => panic!("claimed status should be rejected"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("only reachable through claim"));
        must_ok(update(GoalStatus::Completed).validate());
    }

    #[test]
    fn blank_identity_fields_are_rejected() {
        let mut bad = update(GoalStatus::InProgress);
        bad.namespace = "  ".to_string();
        let err = match bad.validate() {
            Ok(()) => panic!("blank namespace should be rejected"),
            Err(err) => err,
        };
        assert_eq!(
            err,
            ProgressError::Validation("namespace MUST be provided".to_string())
        );
    }

    #[test]
    fn negative_progress_is_rejected() {
        let mut bad = update(GoalStatus::InProgress);
        bad.progress = -1;
        assert!(bad.validate().is_err());
    }

    #[test]
    fn record_rejects_claim_without_completion() {
        let now = must_utc("2026-02-07T12:00:00Z");
        let mut record = ProgressRecord::assigned("u1", "g1", "winter", "game", true, now);
        must_ok(record.validate());
        record.claimed_at = Some(now);
        assert!(record.validate().is_err());
    }

    #[test]
    fn can_claim_requires_active_completed_unclaimed() {
        let now = must_utc("2026-02-07T12:00:00Z");
        let mut record = ProgressRecord::assigned("u1", "g1", "winter", "game", true, now);
        assert!(!record.can_claim());
        record.status = GoalStatus::Completed;
        record.completed_at = Some(now);
        assert!(record.can_claim());
        record.is_active = false;
        assert!(!record.can_claim());
        record.is_active = true;
        record.status = GoalStatus::Claimed;
        record.claimed_at = Some(now);
        assert!(!record.can_claim());
        assert!(record.is_completed());
        assert!(record.is_claimed());
    }

    #[test]
    fn assigned_rows_carry_assignment_time_only_when_active() {
        let now = must_utc("2026-02-07T12:00:00Z");
        let active = ProgressRecord::assigned("u1", "g1", "winter", "game", true, now);
        let inactive = ProgressRecord::assigned("u1", "g2", "winter", "game", false, now);
        assert_eq!(active.assigned_at, Some(now));
        assert_eq!(inactive.assigned_at, None);
        assert_eq!(active.status, GoalStatus::NotStarted);
    }

    #[test]
    fn coalesce_sums_regular_deltas_per_key() {
        let merged = coalesce_increments(&[
            increment("g1", 2, false),
            increment("g2", 1, false),
            increment("g1", 3, false),
        ]);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].goal_id, "g1");
        assert_eq!(merged[0].delta, 5);
        assert_eq!(merged[1].goal_id, "g2");
        assert_eq!(merged[1].delta, 1);
    }

    #[test]
    fn coalesce_applies_daily_entries_once() {
        let merged = coalesce_increments(&[
            increment("g1", 1, true),
            increment("g1", 1, true),
            increment("g1", 1, true),
        ]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].delta, 0);
        assert_eq!(merged[0].daily_delta, Some(1));
    }

    #[test]
    fn coalesce_keeps_regular_and_daily_parts_apart() {
        for order in [
            [increment("g1", 3, false), increment("g1", 1, true)],
            [increment("g1", 1, true), increment("g1", 3, false)],
        ] {
            let merged = coalesce_increments(&order);
            assert_eq!(merged.len(), 1);
            assert_eq!(merged[0].delta, 3);
            assert_eq!(merged[0].daily_delta, Some(1));
        }
    }

    #[test]
    fn storage_timestamps_are_fixed_width_and_round_trip() {
        let value = must_utc("2026-02-07T23:59:59.5Z");
        let formatted = must_ok(format_timestamp(value));
        assert_eq!(formatted, "2026-02-07T23:59:59.500000Z");
        assert_eq!(must_ok(parse_timestamp(&formatted)), value);

        let whole = must_ok(format_timestamp(must_utc("2026-02-07T00:00:00Z")));
        assert_eq!(whole.len(), formatted.len());
    }

    #[test]
    fn utc_date_uses_utc_even_for_offset_inputs() {
        let late_evening_west = must_ok(OffsetDateTime::parse(
            "2026-02-07T20:00:00-05:00",
            &time::format_description::well_known::Rfc3339,
        ));
        assert_eq!(must_ok(utc_date(late_evening_west)), "2026-02-08");
    }

    #[test]
    fn parse_rfc3339_rejects_non_utc() {
        assert!(parse_rfc3339_utc("2026-02-07T12:00:00+02:00").is_err());
    }

    #[test]
    fn manual_clock_moves_only_when_told() {
        let clock = ManualClock::new(must_utc("2026-02-07T23:00:00Z"));
        assert_eq!(clock.now(), must_utc("2026-02-07T23:00:00Z"));
        clock.advance(Duration::hours(2));
        assert_eq!(clock.now(), must_utc("2026-02-08T01:00:00Z"));
        clock.set(must_utc("2026-03-01T00:00:00Z"));
        assert_eq!(clock.now(), must_utc("2026-03-01T00:00:00Z"));
    }

    #[test]
    fn cancel_is_shared_between_clones() {
        let ctx = OpContext::background();
        let child = ctx.child_with_timeout(std::time::Duration::from_secs(60));
        assert!(!child.is_done());
        ctx.cancel();
        assert!(child.is_canceled());
        assert!(child.is_done());
    }

    #[test]
    fn child_deadline_never_extends_parent() {
        let parent = OpContext::with_timeout(std::time::Duration::from_millis(10));
        let child = parent.child_with_timeout(std::time::Duration::from_secs(60));
        assert_eq!(child.deadline(), parent.deadline());
        assert!(OpContext::background().remaining().is_none());
    }

    #[test]
    fn expired_deadline_reports_done() {
        let ctx = OpContext::with_deadline(Instant::now());
        assert!(ctx.is_expired());
        assert!(ctx.is_done());
        assert_eq!(ctx.remaining(), Some(std::time::Duration::ZERO));
    }

    #[test]
    fn batch_outcome_reports_skips() {
        let outcome = BatchOutcome {
            requested: 5,
            applied: 3,
        };
        assert_eq!(outcome.skipped(), 2);
    }
}
