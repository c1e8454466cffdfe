//! tokenledger-service — the operational binary for the token registry.
//!
//! Startup sequence:
//!   1. Open (or create) the registry database
//!   2. Build the ledger engine over it
//!   3. Run the expiry sweeper on its interval (reverse lapsed holds)
//!   4. Run the retention sweeper on its interval (archive + purge old rows)
//!
//! `--sweep-once` / `--purge-once` run a single pass and print the summary
//! as JSON, for cron-style operation.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};

use tokenledger_core::constants::{
    PURGE_DEFAULT_LIMIT, PURGE_DEFAULT_OLDER_THAN_DAYS, SWEEP_DEFAULT_LIMIT,
};
use tokenledger_engine::LedgerEngine;
use tokenledger_store::{RegistryDb, RegistryStore};
use tokenledger_sweeper::{ExpirySweeper, PurgeOptions, RetentionSweeper};

#[derive(Parser, Debug)]
#[command(
    name = "tokenledger-service",
    version,
    about = "Token registry sweepers — hold expiry and record retention"
)]
struct Args {
    /// Directory for the registry database.
    #[arg(long, default_value = "~/.tokenledger/data")]
    data_dir: PathBuf,

    /// Seconds between expiry sweeps.
    #[arg(long, default_value_t = 60)]
    sweep_interval_secs: u64,

    /// Only reverse holds expired at least this many seconds ago.
    #[arg(long, default_value_t = 0)]
    expired_for_secs: i64,

    /// Maximum holds reversed per sweep.
    #[arg(long, default_value_t = SWEEP_DEFAULT_LIMIT)]
    sweep_batch_size: usize,

    /// Seconds between retention passes.
    #[arg(long, default_value_t = 86_400)]
    purge_interval_secs: u64,

    /// Records older than this many days are purge candidates.
    #[arg(long, default_value_t = PURGE_DEFAULT_OLDER_THAN_DAYS)]
    purge_older_than_days: i64,

    /// Maximum rows examined per retention pass.
    #[arg(long, default_value_t = PURGE_DEFAULT_LIMIT)]
    purge_limit: usize,

    /// Actually archive and delete. Without this flag retention runs dry.
    #[arg(long)]
    purge: bool,

    /// Skip the archive copy before deleting.
    #[arg(long)]
    no_archive: bool,

    /// Wall-clock budget per retention pass, in seconds.
    #[arg(long)]
    purge_max_secs: Option<u64>,

    /// Run one expiry sweep, print the summary, exit.
    #[arg(long)]
    sweep_once: bool,

    /// Run one retention pass, print the summary, exit.
    #[arg(long)]
    purge_once: bool,
}

impl Args {
    fn purge_options(&self) -> PurgeOptions {
        PurgeOptions {
            older_than_days: self.purge_older_than_days,
            limit: self.purge_limit,
            dry_run: !self.purge,
            archive: !self.no_archive,
            max_seconds: self.purge_max_secs,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tokenledger=debug".parse().unwrap()),
        )
        .init();

    let args = Args::parse();
    info!("tokenledger service starting");

    // ── Registry database ─────────────────────────────────────────────────────
    let data_dir = expand_tilde(&args.data_dir);
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("creating data dir {}", data_dir.display()))?;
    let db: Arc<dyn RegistryStore> = Arc::new(
        RegistryDb::open(&data_dir).context("opening registry database")?,
    );

    // ── Engine + sweepers ─────────────────────────────────────────────────────
    let engine = Arc::new(LedgerEngine::new(db));
    let expiry = ExpirySweeper::new(Arc::clone(&engine));
    let retention = RetentionSweeper::new(Arc::clone(&engine));

    // ── One-shot modes ────────────────────────────────────────────────────────
    if args.sweep_once {
        let summary = expiry
            .process_expired_holds(args.expired_for_secs, args.sweep_batch_size)
            .context("expiry sweep")?;
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }
    if args.purge_once {
        let summary = retention
            .purge_old_registry_records(args.purge_options())
            .context("retention pass")?;
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    // ── Interval loops ────────────────────────────────────────────────────────
    let mut sweep_tick = tokio::time::interval(Duration::from_secs(args.sweep_interval_secs.max(1)));
    let mut purge_tick = tokio::time::interval(Duration::from_secs(args.purge_interval_secs.max(1)));
    // The first tick of each interval fires immediately; that first sweep
    // doubles as a startup health check of the store.
    info!(
        sweep_interval_secs = args.sweep_interval_secs,
        purge_interval_secs = args.purge_interval_secs,
        dry_run = !args.purge,
        "service ready"
    );

    loop {
        tokio::select! {
            _ = sweep_tick.tick() => {
                match expiry.process_expired_holds(args.expired_for_secs, args.sweep_batch_size) {
                    Ok(summary) if summary.processed > 0 => info!(
                        reversed = summary.reversed,
                        already_processed = summary.already_processed,
                        failed = summary.failed,
                        "expiry sweep"
                    ),
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "expiry sweep failed"),
                }
            }
            _ = purge_tick.tick() => {
                match retention.purge_old_registry_records(args.purge_options()) {
                    Ok(summary) => info!(
                        scanned = summary.scanned,
                        candidates = summary.candidates,
                        deleted = summary.deleted,
                        dry_run = summary.dry_run,
                        "retention pass"
                    ),
                    Err(e) => warn!(error = %e, "retention pass failed"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received");
                break;
            }
        }
    }

    Ok(())
}

/// Expand a leading `~` to the user's home directory (`HOME` or `USERPROFILE`).
fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(stripped) = path.strip_prefix("~") {
        if let Ok(home) = std::env::var("HOME").or_else(|_| std::env::var("USERPROFILE")) {
            return PathBuf::from(home).join(stripped);
        }
    }
    path.to_path_buf()
}
