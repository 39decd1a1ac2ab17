//! Operational tool for the event dead-letter queue: inspect what failed
//! and re-enqueue it into the outbox.
//!
//! Exit codes: 0 success, 1 invalid arguments, 2 database unreachable,
//! 3 partial success (some events failed to re-enqueue).

use adit::dispatch::{replay_dlq, ReplayFilter};
use adit::store::{ensure_schema, OutboxStore, PgOutboxStore, StoreError};
use chrono::Utc;
use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use std::collections::BTreeMap;
use std::process::ExitCode;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "replay-dlq", version, about = "Inspect and replay dead-lettered events")]
struct Args {
    /// Postgres connection string; defaults to $DATABASE_URL.
    #[arg(long)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Count DLQ entries, grouped by kind.
    Stats {
        /// Only entries of this kind.
        #[arg(long)]
        kind: Option<String>,
        /// Only entries that failed within this window (e.g. 90s, 30m, 12h, 7d).
        #[arg(long)]
        since: Option<String>,
    },
    /// Re-enqueue DLQ entries into the outbox under fresh idempotency keys.
    Replay {
        /// Only entries that failed within this window (e.g. 90s, 30m, 12h, 7d).
        #[arg(long)]
        since: String,
        /// Only entries of this kind.
        #[arg(long)]
        kind: Option<String>,
        /// Maximum number of entries to replay.
        #[arg(long)]
        limit: Option<usize>,
        /// Report what would be replayed without touching the outbox.
        #[arg(long)]
        dry_run: bool,
    },
}

/// Parse "90s" / "30m" / "12h" / "7d" into a duration.
fn parse_window(raw: &str) -> Result<Duration, String> {
    let raw = raw.trim();
    let (digits, unit) = raw.split_at(raw.len().saturating_sub(1));
    let value: u64 = digits
        .parse()
        .map_err(|_| format!("invalid duration '{}': expected <number><s|m|h|d>", raw))?;
    let seconds = match unit {
        "s" => value,
        "m" => value * 60,
        "h" => value * 3_600,
        "d" => value * 86_400,
        _ => return Err(format!("invalid duration unit in '{}': expected s, m, h, or d", raw)),
    };
    Ok(Duration::from_secs(seconds))
}

fn exit_code_for(err: &StoreError) -> ExitCode {
    match err {
        StoreError::Unavailable(_) => ExitCode::from(2),
        _ => ExitCode::from(3),
    }
}

async fn connect(database_url: Option<String>) -> Result<PgOutboxStore, ExitCode> {
    let url = match database_url.or_else(|| std::env::var("DATABASE_URL").ok()) {
        Some(url) => url,
        None => {
            eprintln!("error: no database url; pass --database-url or set DATABASE_URL");
            return Err(ExitCode::from(1));
        }
    };
    let pool = match PgPoolOptions::new()
        .max_connections(2)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&url)
        .await
    {
        Ok(pool) => pool,
        Err(err) => {
            eprintln!("error: database unreachable: {}", err);
            return Err(ExitCode::from(2));
        }
    };
    if let Err(err) = ensure_schema(&pool).await {
        eprintln!("error: schema bootstrap failed: {}", err);
        return Err(ExitCode::from(2));
    }
    Ok(PgOutboxStore::new(pool))
}

async fn stats(
    store: &PgOutboxStore,
    kind: Option<String>,
    since: Option<String>,
) -> Result<ExitCode, ExitCode> {
    let failed_since = match since.as_deref().map(parse_window).transpose() {
        Ok(window) => window.and_then(|w| {
            Utc::now().checked_sub_signed(chrono::Duration::from_std(w).ok()?)
        }),
        Err(msg) => {
            eprintln!("error: {}", msg);
            return Err(ExitCode::from(1));
        }
    };

    let entries = match store.dlq_list(failed_since, kind.as_deref(), usize::MAX).await {
        Ok(entries) => entries,
        Err(err) => {
            eprintln!("error: {}", err);
            return Err(exit_code_for(&err));
        }
    };

    let mut by_kind: BTreeMap<String, (usize, usize)> = BTreeMap::new();
    for entry in &entries {
        let slot = by_kind.entry(entry.kind.clone()).or_default();
        slot.0 += 1;
        if entry.replayed_at.is_some() {
            slot.1 += 1;
        }
    }

    println!("{} dead-lettered event(s)", entries.len());
    for (kind, (total, replayed)) in by_kind {
        println!("  {:<40} {:>6} total, {:>6} replayed", kind, total, replayed);
    }
    Ok(ExitCode::SUCCESS)
}

async fn replay(
    store: &PgOutboxStore,
    since: String,
    kind: Option<String>,
    limit: Option<usize>,
    dry_run: bool,
) -> Result<ExitCode, ExitCode> {
    let window = match parse_window(&since) {
        Ok(window) => window,
        Err(msg) => {
            eprintln!("error: {}", msg);
            return Err(ExitCode::from(1));
        }
    };
    let failed_since = chrono::Duration::from_std(window)
        .ok()
        .and_then(|w| Utc::now().checked_sub_signed(w));

    let filter = ReplayFilter { failed_since, kind, limit, dry_run };
    match replay_dlq(store, &filter).await {
        Ok(report) => {
            if dry_run {
                println!("{} matching event(s); dry run, nothing re-enqueued", report.matched);
            } else {
                println!(
                    "{} matched, {} re-enqueued, {} failed",
                    report.matched, report.requeued, report.failed
                );
            }
            if report.failed > 0 {
                Ok(ExitCode::from(3))
            } else {
                Ok(ExitCode::SUCCESS)
            }
        }
        Err(err) => {
            eprintln!("error: {}", err);
            Err(exit_code_for(&err))
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            // Help and version requests are success, not usage errors.
            if err.use_stderr() {
                let _ = err.print();
                return ExitCode::from(1);
            }
            let _ = err.print();
            return ExitCode::SUCCESS;
        }
    };

    let store = match connect(args.database_url).await {
        Ok(store) => store,
        Err(code) => return code,
    };

    let result = match args.command {
        Command::Stats { kind, since } => stats(&store, kind, since).await,
        Command::Replay { since, kind, limit, dry_run } => {
            replay(&store, since, kind, limit, dry_run).await
        }
    };
    match result {
        Ok(code) | Err(code) => code,
    }
}
