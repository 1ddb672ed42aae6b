//! `gp`: command-line access to the challenge progress store.
//!
//! Every command prints pretty JSON on stdout. Failures are rendered by
//! [`error_envelope`] so callers can tell claim rejections apart from
//! infrastructure errors.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use challenge_progress_core::{
    now_utc, Assignment, BatchOutcome, OpContext, ProgressFilter, ProgressIncrement,
    ProgressRecord, ProgressUpdate,
};
use challenge_progress_store_sqlite::{
    run_benchmark, BenchmarkConfig, BenchmarkReport, BenchmarkThresholds, PoolStatus,
    ProgressRepository, ProgressStore, StoreConfig, StoreError,
};
use serde::Serialize;

pub const DEFAULT_LOG_FILTER: &str = "challenge_progress=info";

#[derive(Debug, Parser)]
#[command(name = "gp")]
#[command(about = "Challenge goal progress store")]
pub struct Cli {
    /// Database file; falls back to `DB_PATH`, then `./challenge_progress.sqlite3`.
    #[arg(long)]
    db: Option<PathBuf>,

    #[command(flatten)]
    pool: PoolArgs,

    /// Abort the command once this many milliseconds have passed.
    #[arg(long)]
    timeout_ms: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Args)]
pub struct PoolArgs {
    #[arg(long)]
    max_open_conns: Option<u32>,
    #[arg(long)]
    max_idle_conns: Option<u32>,
    #[arg(long)]
    acquire_timeout_ms: Option<u64>,
    #[arg(long)]
    busy_timeout_ms: Option<u64>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Migrate,
    Health,
    Get(KeyArgs),
    List(ListArgs),
    Upsert(UpsertArgs),
    Increment(InputArgs),
    Seed(InputArgs),
    SetActive(SetActiveArgs),
    Claim(KeyArgs),
    Benchmark {
        #[command(subcommand)]
        command: BenchmarkCommand,
    },
}

#[derive(Debug, Args)]
pub struct KeyArgs {
    #[arg(long)]
    user: String,
    #[arg(long)]
    goal: String,
}

#[derive(Debug, Args)]
pub struct ListArgs {
    #[arg(long)]
    user: String,
    #[arg(long)]
    challenge: Option<String>,
    #[arg(long)]
    active_only: bool,
    /// Restrict to these goal ids.
    #[arg(long = "goal")]
    goals: Vec<String>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum UpsertMode {
    Staged,
    Values,
}

#[derive(Debug, Args)]
pub struct UpsertArgs {
    #[command(flatten)]
    input: InputArgs,
    #[arg(long, value_enum, default_value_t = UpsertMode::Staged)]
    mode: UpsertMode,
}

/// A JSON array, read from a file or given inline.
#[derive(Debug, Args)]
#[group(required = true, multiple = false)]
pub struct InputArgs {
    #[arg(long)]
    file: Option<PathBuf>,
    #[arg(long)]
    json: Option<String>,
}

#[derive(Debug, Args)]
pub struct SetActiveArgs {
    #[arg(long)]
    user: String,
    #[arg(long)]
    goal: String,
    #[arg(long)]
    challenge: String,
    #[arg(long)]
    namespace: String,
    #[arg(long, action = clap::ArgAction::Set)]
    active: bool,
}

#[derive(Debug, Subcommand)]
pub enum BenchmarkCommand {
    Run(BenchmarkRunArgs),
}

#[derive(Debug, Args)]
pub struct BenchmarkRunArgs {
    #[arg(long = "batch-size")]
    batch_sizes: Vec<usize>,
    #[arg(long, default_value_t = 3)]
    repetitions: usize,
    #[arg(long)]
    staged_p95_max_ms: Option<f64>,
    #[arg(long)]
    values_p95_max_ms: Option<f64>,
    #[arg(long)]
    increment_p95_max_ms: Option<f64>,
    #[arg(long)]
    output: Option<PathBuf>,
    /// Print the report as JSON instead of a table.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Serialize)]
struct BatchPayload {
    requested: usize,
    applied: usize,
    skipped: usize,
}

impl From<BatchOutcome> for BatchPayload {
    fn from(outcome: BatchOutcome) -> Self {
        Self {
            requested: outcome.requested,
            applied: outcome.applied,
            skipped: outcome.skipped(),
        }
    }
}

#[derive(Debug, Serialize)]
struct HealthPayload {
    status: &'static str,
    schema_version: Option<i64>,
    pool: PoolStatus,
}

#[derive(Debug, Serialize)]
struct ErrorPayload<'a> {
    code: &'a str,
    message: String,
}

/// # Errors
/// Returns an error when configuration is invalid, the store cannot be opened,
/// or the command fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    let Cli {
        db,
        pool,
        timeout_ms,
        command,
    } = cli;

    if let Command::Benchmark { command } = command {
        return run_benchmark_command(command);
    }

    let config = store_config(StoreConfig::from_env(), db, &pool);
    let ctx = timeout_ms.map_or_else(OpContext::background, |millis| {
        OpContext::with_timeout(Duration::from_millis(millis))
    });
    run_progress_with_config(&config, &ctx, command)
}

/// Opens the store described by `config`, migrates it, and runs `command`.
///
/// # Errors
/// Returns an error when the store cannot be opened or the command fails.
pub fn run_progress_with_config(config: &StoreConfig, ctx: &OpContext, command: Command) -> Result<()> {
    tracing::debug!(db_path = %config.db_path.display(), "opening progress store");
    let store = ProgressStore::open(config)
        .with_context(|| format!("failed to open progress store {}", config.db_path.display()))?;
    store.migrate().context("failed to migrate progress schema")?;
    run_progress(&store, ctx, command)
}

/// # Errors
/// Returns an error when the command fails.
pub fn run_progress(store: &ProgressStore, ctx: &OpContext, command: Command) -> Result<()> {
    match command {
        Command::Migrate => print_json(&serde_json::json!({
            "schema_version": store.schema_version(ctx)?,
        })),
        Command::Health => {
            store.health(ctx)?;
            print_json(&HealthPayload {
                status: "ok",
                schema_version: store.schema_version(ctx)?,
                pool: store.pool_status(),
            })
        }
        Command::Get(args) => {
            let record = store.get_progress(ctx, &args.user, &args.goal)?;
            print_json(&record)
        }
        Command::List(args) => {
            let records = if args.goals.is_empty() {
                let filter = ProgressFilter {
                    challenge_id: args.challenge,
                    active_only: args.active_only,
                };
                store.get_user_progress(ctx, &args.user, &filter)?
            } else {
                store.get_goals_by_ids(ctx, &args.user, &args.goals)?
            };
            print_json(&records)
        }
        Command::Upsert(args) => {
            let updates: Vec<ProgressUpdate> = read_input(&args.input)?;
            let outcome = match args.mode {
                UpsertMode::Staged => store.bulk_upsert(ctx, &updates)?,
                UpsertMode::Values => store.bulk_upsert_values(ctx, &updates)?,
            };
            print_json(&BatchPayload::from(outcome))
        }
        Command::Increment(input) => {
            let increments: Vec<ProgressIncrement> = read_input(&input)?;
            let outcome = store.bulk_increment(ctx, &increments)?;
            print_json(&BatchPayload::from(outcome))
        }
        Command::Seed(input) => {
            let assignments: Vec<Assignment> = read_input(&input)?;
            let now = now_utc();
            let records: Vec<ProgressRecord> = assignments
                .into_iter()
                .map(|item| {
                    ProgressRecord::assigned(
                        item.user_id,
                        item.goal_id,
                        item.challenge_id,
                        item.namespace,
                        item.active,
                        now,
                    )
                })
                .collect();
            let outcome = store.bulk_insert(ctx, &records)?;
            print_json(&BatchPayload::from(outcome))
        }
        Command::SetActive(args) => {
            let assignment = Assignment {
                user_id: args.user,
                goal_id: args.goal,
                challenge_id: args.challenge,
                namespace: args.namespace,
                active: args.active,
            };
            store.set_active(ctx, &assignment)?;
            let record = store.get_progress(ctx, &assignment.user_id, &assignment.goal_id)?;
            print_json(&record)
        }
        Command::Claim(args) => {
            let record = store.claim(ctx, &args.user, &args.goal)?;
            print_json(&record)
        }
        Command::Benchmark { command } => run_benchmark_command(command),
    }
}

/// Renders a failure as `{"code": ..., "message": ...}`.
#[must_use]
pub fn error_envelope(err: &anyhow::Error) -> String {
    let code = err
        .downcast_ref::<StoreError>()
        .map_or("CLI_ERROR", StoreError::code);
    let payload = ErrorPayload {
        code,
        message: format!("{err:#}"),
    };
    serde_json::to_string_pretty(&payload)
        .unwrap_or_else(|_| format!("{{\"code\":\"{code}\",\"message\":\"{err}\"}}"))
}

fn store_config(base: StoreConfig, db: Option<PathBuf>, pool: &PoolArgs) -> StoreConfig {
    StoreConfig {
        db_path: db.unwrap_or(base.db_path),
        max_open_conns: pool.max_open_conns.unwrap_or(base.max_open_conns),
        max_idle_conns: pool.max_idle_conns.unwrap_or(base.max_idle_conns),
        acquire_timeout: pool
            .acquire_timeout_ms
            .map_or(base.acquire_timeout, Duration::from_millis),
        busy_timeout: pool
            .busy_timeout_ms
            .map_or(base.busy_timeout, Duration::from_millis),
        ..base
    }
}

fn read_input<T: serde::de::DeserializeOwned>(input: &InputArgs) -> Result<Vec<T>> {
    let raw = match (&input.file, &input.json) {
        (Some(path), None) => std::fs::read_to_string(path)
            .with_context(|| format!("failed to read input file {}", path.display()))?,
        (None, Some(inline)) => inline.clone(),
        _ => return Err(anyhow!("exactly one of --file or --json is required")),
    };
    serde_json::from_str(&raw).context("input must be a JSON array of objects")
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn run_benchmark_command(command: BenchmarkCommand) -> Result<()> {
    match command {
        BenchmarkCommand::Run(args) => {
            let defaults = BenchmarkConfig::default();
            let config = BenchmarkConfig {
                batch_sizes: if args.batch_sizes.is_empty() {
                    defaults.batch_sizes
                } else {
                    args.batch_sizes
                },
                repetitions: args.repetitions,
            };

            let thresholds = match (
                args.staged_p95_max_ms,
                args.values_p95_max_ms,
                args.increment_p95_max_ms,
            ) {
                (Some(staged), Some(values), Some(increment)) => Some(BenchmarkThresholds {
                    staged_p95_ms_max: staged,
                    values_p95_ms_max: values,
                    increment_p95_ms_max: increment,
                }),
                (None, None, None) => None,
                _ => {
                    return Err(anyhow!(
                        "benchmark thresholds require all of --staged-p95-max-ms, --values-p95-max-ms, --increment-p95-max-ms"
                    ))
                }
            };

            // Each repetition uses its own temporary database; --db is not touched.
            let report = run_benchmark(&config, thresholds)?;

            if let Some(path) = args.output {
                let serialized = serde_json::to_string_pretty(&report)?;
                std::fs::write(&path, serialized).with_context(|| {
                    format!("failed writing benchmark report to {}", path.display())
                })?;
            }

            if args.json {
                print_json(&report)?;
            } else {
                print_benchmark_report(&report);
            }

            if !report.within_thresholds {
                return Err(anyhow!(
                    "benchmark thresholds violated: {}",
                    report.violations.join("; ")
                ));
            }
            Ok(())
        }
    }
}

fn print_benchmark_report(report: &BenchmarkReport) {
    println!(
        "contract={} generated_at={} repetitions={} within_thresholds={}",
        report.contract_version,
        report.generated_at,
        report.repetitions,
        if report.within_thresholds { "yes" } else { "no" }
    );
    println!(
        "{:<10} {:<12} {:<12} {:<12} {:<12} {:<14} {:<14}",
        "batch", "staged_p50", "staged_p95", "values_p50", "values_p95", "increment_p50", "increment_p95"
    );
    println!("{}", "-".repeat(92));
    for item in &report.batches {
        println!(
            "{:<10} {:<12.3} {:<12.3} {:<12.3} {:<12.3} {:<14.3} {:<14.3}",
            item.batch_size,
            item.staged_p50_ms,
            item.staged_p95_ms,
            item.values_p50_ms,
            item.values_p95_ms,
            item.increment_p50_ms,
            item.increment_p95_ms
        );
    }

    if !report.violations.is_empty() {
        println!("violations={}", report.violations.join(" | "));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        match Cli::try_parse_from(args) {
            Ok(cli) => cli,
            Err(err) => panic!("failed to parse {args:?}: {err}"),
        }
    }

    #[test]
    fn flags_override_environment_config() {
        let cli = parse(&[
            "gp",
            "--db",
            "/tmp/flag.sqlite3",
            "--max-open-conns",
            "3",
            "--busy-timeout-ms",
            "250",
            "health",
        ]);
        let base = StoreConfig {
            max_idle_conns: 2,
            ..StoreConfig::with_path("/tmp/env.sqlite3")
        };
        let config = store_config(base, cli.db, &cli.pool);
        assert_eq!(config.db_path, PathBuf::from("/tmp/flag.sqlite3"));
        assert_eq!(config.max_open_conns, 3);
        assert_eq!(config.max_idle_conns, 2);
        assert_eq!(config.busy_timeout, Duration::from_millis(250));
    }

    #[test]
    fn upsert_requires_exactly_one_input_source() {
        assert!(Cli::try_parse_from(["gp", "upsert"]).is_err());
        assert!(Cli::try_parse_from(["gp", "upsert", "--json", "[]", "--file", "x.json"]).is_err());
        let cli = parse(&["gp", "upsert", "--json", "[]", "--mode", "values"]);
        assert!(matches!(
            cli.command,
            Command::Upsert(UpsertArgs {
                mode: UpsertMode::Values,
                ..
            })
        ));
    }

    #[test]
    fn set_active_takes_explicit_bool() {
        let cli = parse(&[
            "gp",
            "set-active",
            "--user",
            "u1",
            "--goal",
            "g1",
            "--challenge",
            "c1",
            "--namespace",
            "ns",
            "--active",
            "false",
        ]);
        match cli.command {
            Command::SetActive(args) => assert!(!args.active),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn error_envelope_carries_store_code() {
        let err = anyhow::Error::new(StoreError::CannotClaim {
            user_id: "u1".to_string(),
            goal_id: "g1".to_string(),
            reason: "goal already claimed",
        })
        .context("claim failed");
        let envelope: serde_json::Value = match serde_json::from_str(&error_envelope(&err)) {
            Ok(value) => value,
            Err(err) => panic!("envelope is not JSON: {err}"),
        };
        assert_eq!(envelope["code"], "GOAL_NOT_CLAIMABLE");
        assert!(envelope["message"]
            .as_str()
            .is_some_and(|message| message.contains("goal already claimed")));

        let plain = error_envelope(&anyhow!("boom"));
        assert!(plain.contains("CLI_ERROR"));
    }
}
