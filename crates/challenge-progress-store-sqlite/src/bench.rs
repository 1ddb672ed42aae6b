use std::path::PathBuf;
use std::time::{Duration, Instant};

use challenge_progress_core::{
    format_timestamp, now_utc, GoalStatus, OpContext, ProgressError, ProgressIncrement,
    ProgressUpdate,
};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::config::StoreConfig;
use crate::error::StoreResult;
use crate::{ProgressRepository, ProgressStore, MAX_VALUES_BATCH_ROWS};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BenchmarkConfig {
    pub batch_sizes: Vec<usize>,
    pub repetitions: usize,
}

impl Default for BenchmarkConfig {
    fn default() -> Self {
        Self {
            batch_sizes: vec![100, 500, 2_000],
            repetitions: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkThresholds {
    pub staged_p95_ms_max: f64,
    pub values_p95_ms_max: f64,
    pub increment_p95_ms_max: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkBatchResult {
    pub batch_size: usize,
    pub staged_p50_ms: f64,
    pub staged_p95_ms: f64,
    pub values_p50_ms: f64,
    pub values_p95_ms: f64,
    pub increment_p50_ms: f64,
    pub increment_p95_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkReport {
    pub contract_version: String,
    pub generated_at: String,
    pub repetitions: usize,
    pub batches: Vec<BenchmarkBatchResult>,
    pub thresholds: Option<BenchmarkThresholds>,
    pub within_thresholds: bool,
    pub violations: Vec<String>,
}

/// Times the staged upsert, the value-list upsert and the bulk increment
/// against fresh temporary databases.
///
/// # Errors
/// Returns an error when the config is empty or any timed operation fails.
pub fn run_benchmark(
    config: &BenchmarkConfig,
    thresholds: Option<BenchmarkThresholds>,
) -> StoreResult<BenchmarkReport> {
    if config.batch_sizes.is_empty() {
        return Err(ProgressError::Validation(
            "benchmark config must include at least one batch size".to_string(),
        )
        .into());
    }
    if config.repetitions == 0 {
        return Err(ProgressError::Validation("benchmark repetitions must be >= 1".to_string()).into());
    }
    if let Some(&too_large) = config
        .batch_sizes
        .iter()
        .find(|&&size| size == 0 || size > MAX_VALUES_BATCH_ROWS)
    {
        return Err(ProgressError::Validation(format!(
            "benchmark batch size {too_large} must be between 1 and {MAX_VALUES_BATCH_ROWS}"
        ))
        .into());
    }

    let ctx = OpContext::background();
    let mut batch_results = Vec::new();

    for &batch_size in &config.batch_sizes {
        let mut staged_samples_ms = Vec::new();
        let mut values_samples_ms = Vec::new();
        let mut increment_samples_ms = Vec::new();

        for repetition in 0..config.repetitions {
            let db_path = scratch_path(batch_size, repetition);
            let store = ProgressStore::open(&StoreConfig {
                max_open_conns: 2,
                max_idle_conns: 1,
                ..StoreConfig::with_path(&db_path)
            })?;
            store.migrate()?;

            let staged = benchmark_updates("staged", batch_size);
            let start = Instant::now();
            store.bulk_upsert(&ctx, &staged)?;
            staged_samples_ms.push(elapsed_ms(start.elapsed()));

            let values = benchmark_updates("values", batch_size);
            let start = Instant::now();
            store.bulk_upsert_values(&ctx, &values)?;
            values_samples_ms.push(elapsed_ms(start.elapsed()));

            let increments = benchmark_increments(batch_size);
            let start = Instant::now();
            store.bulk_increment(&ctx, &increments)?;
            increment_samples_ms.push(elapsed_ms(start.elapsed()));

            drop(store);
            remove_database_files(&db_path);
        }

        batch_results.push(BenchmarkBatchResult {
            batch_size,
            staged_p50_ms: percentile(&staged_samples_ms, 0.50),
            staged_p95_ms: percentile(&staged_samples_ms, 0.95),
            values_p50_ms: percentile(&values_samples_ms, 0.50),
            values_p95_ms: percentile(&values_samples_ms, 0.95),
            increment_p50_ms: percentile(&increment_samples_ms, 0.50),
            increment_p95_ms: percentile(&increment_samples_ms, 0.95),
        });
    }

    let mut violations = Vec::new();
    if let Some(limit) = &thresholds {
        for batch in &batch_results {
            for (label, observed, max) in [
                ("staged_p95_ms", batch.staged_p95_ms, limit.staged_p95_ms_max),
                ("values_p95_ms", batch.values_p95_ms, limit.values_p95_ms_max),
                ("increment_p95_ms", batch.increment_p95_ms, limit.increment_p95_ms_max),
            ] {
                if observed > max {
                    violations.push(format!(
                        "batch_size={} {label}={observed} exceeds max={max}",
                        batch.batch_size
                    ));
                }
            }
        }
    }

    Ok(BenchmarkReport {
        contract_version: "progress_benchmark_report.v1".to_string(),
        generated_at: format_timestamp(now_utc())?,
        repetitions: config.repetitions,
        batches: batch_results,
        thresholds,
        within_thresholds: violations.is_empty(),
        violations,
    })
}

fn scratch_path(batch_size: usize, repetition: usize) -> PathBuf {
    std::env::temp_dir().join(format!(
        "progress-bench-{batch_size}-{repetition}-{}.sqlite3",
        Ulid::new()
    ))
}

fn remove_database_files(db_path: &std::path::Path) {
    for suffix in ["", "-wal", "-shm"] {
        let mut path = db_path.as_os_str().to_owned();
        path.push(suffix);
        let _ = std::fs::remove_file(PathBuf::from(path));
    }
}

fn benchmark_updates(prefix: &str, batch_size: usize) -> Vec<ProgressUpdate> {
    (0..batch_size)
        .map(|index| ProgressUpdate {
            user_id: format!("bench-user-{}", index % 50),
            goal_id: format!("{prefix}-goal-{index}"),
            challenge_id: "bench-challenge".to_string(),
            namespace: "bench".to_string(),
            progress: i64::try_from(index % 10).unwrap_or_default(),
            status: GoalStatus::InProgress,
            completed_at: None,
        })
        .collect()
}

fn benchmark_increments(batch_size: usize) -> Vec<ProgressIncrement> {
    (0..batch_size)
        .map(|index| ProgressIncrement {
            user_id: format!("bench-user-{}", index % 50),
            goal_id: format!("staged-goal-{index}"),
            challenge_id: "bench-challenge".to_string(),
            namespace: "bench".to_string(),
            delta: 1,
            target_value: 10,
            daily: index % 7 == 0,
        })
        .collect()
}

fn elapsed_ms(elapsed: Duration) -> f64 {
    elapsed.as_secs_f64() * 1_000.0
}

#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
fn percentile(values: &[f64], percentile_rank: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }

    let mut sorted = values.to_vec();
    sorted.sort_by(|lhs, rhs| lhs.partial_cmp(rhs).unwrap_or(std::cmp::Ordering::Equal));

    let position = (percentile_rank * sorted.len() as f64).ceil() as usize;
    let index = position.saturating_sub(1).min(sorted.len() - 1);
    sorted[index]
}
