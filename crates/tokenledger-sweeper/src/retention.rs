//! Retention sweeper: archive and delete old registry records.
//!
//! The only component allowed to scan the primary table — production read
//! paths stay on the secondary indexes. Archive-before-delete: a candidate
//! is copied to the archive table first, and a failed archive write leaves
//! the source row intact.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use serde_json::json;
use tracing::info;

use tokenledger_core::constants::{
    PURGE_DEFAULT_ARCHIVE, PURGE_DEFAULT_DRY_RUN, PURGE_DEFAULT_LIMIT,
    PURGE_DEFAULT_OLDER_THAN_DAYS,
};
use tokenledger_core::error::{codes, LedgerError};
use tokenledger_core::time;
use tokenledger_core::transaction::Transaction;
use tokenledger_engine::LedgerEngine;
use tokenledger_store::RegistryStore;

/// Knobs for one purge pass. Defaults are deliberately conservative:
/// dry-run, archiving on.
#[derive(Clone, Debug)]
pub struct PurgeOptions {
    pub older_than_days: i64,
    pub limit: usize,
    pub dry_run: bool,
    pub archive: bool,
    /// Wall-clock budget; the pass stops early once exceeded.
    pub max_seconds: Option<u64>,
}

impl Default for PurgeOptions {
    fn default() -> Self {
        Self {
            older_than_days: PURGE_DEFAULT_OLDER_THAN_DAYS,
            limit: PURGE_DEFAULT_LIMIT,
            dry_run: PURGE_DEFAULT_DRY_RUN,
            archive: PURGE_DEFAULT_ARCHIVE,
            max_seconds: None,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PurgeSummary {
    pub scanned: usize,
    pub candidates: usize,
    pub archived: usize,
    pub deleted: usize,
    pub dry_run: bool,
    pub cutoff_iso: String,
    pub duration_seconds: f64,
}

pub struct RetentionSweeper {
    engine: Arc<LedgerEngine>,
}

impl RetentionSweeper {
    pub fn new(engine: Arc<LedgerEngine>) -> Self {
        Self { engine }
    }

    /// One purge pass over up to `opts.limit` rows.
    pub fn purge_old_registry_records(
        &self,
        opts: PurgeOptions,
    ) -> Result<PurgeSummary, LedgerError> {
        let started = Instant::now();
        let now = self.engine.clock().now();
        let cutoff = now - chrono::Duration::days(opts.older_than_days.max(0));
        let cutoff_iso = time::to_iso(cutoff);

        let page = self
            .engine
            .store()
            .scan(opts.limit, None)
            .map_err(|e| self.purge_failure("scan", &e.to_string(), &cutoff_iso))?;
        let scanned = page.records.len();

        let candidates: Vec<Transaction> = page
            .records
            .into_iter()
            .filter(|tx| match time::parse_iso(&tx.created_at) {
                Some(created) => created < cutoff,
                // An unreadable createdAt is never grounds for deletion.
                None => false,
            })
            .collect();

        let mut summary = PurgeSummary {
            scanned,
            candidates: candidates.len(),
            archived: 0,
            deleted: 0,
            dry_run: opts.dry_run,
            cutoff_iso: cutoff_iso.clone(),
            duration_seconds: 0.0,
        };

        if !opts.dry_run {
            for tx in &candidates {
                if opts.archive {
                    // Archive first; a failed copy aborts before any delete.
                    self.engine.store().put_archive(tx).map_err(|e| {
                        self.purge_failure("archive", &e.to_string(), &cutoff_iso)
                    })?;
                    summary.archived += 1;
                }
                self.engine
                    .store()
                    .delete(&tx.id)
                    .map_err(|e| self.purge_failure("delete", &e.to_string(), &cutoff_iso))?;
                summary.deleted += 1;

                if let Some(budget) = opts.max_seconds {
                    if started.elapsed().as_secs() >= budget {
                        info!(
                            flag = "TOKENS",
                            action = "purge_old_registry_records",
                            deleted = summary.deleted,
                            "wall-clock budget exhausted; stopping early"
                        );
                        break;
                    }
                }
            }
        }

        summary.duration_seconds = started.elapsed().as_secs_f64();
        info!(
            flag = "TOKENS",
            action = "purge_old_registry_records",
            scanned = summary.scanned,
            candidates = summary.candidates,
            archived = summary.archived,
            deleted = summary.deleted,
            dry_run = summary.dry_run,
            cutoff = %summary.cutoff_iso,
            "purge pass complete"
        );
        Ok(summary)
    }

    fn purge_failure(&self, stage: &str, message: &str, cutoff_iso: &str) -> LedgerError {
        let err = LedgerError::Storage {
            op: "purge_old_registry_records",
            code: codes::PURGE_OLD_REGISTRY_RECORDS_ERROR,
            message: format!("{stage}: {message}"),
        };
        self.engine.sink().add_error(
            &err.to_string(),
            err.code(),
            &json!({ "stage": stage, "cutoff": cutoff_iso }),
        );
        err
    }
}
