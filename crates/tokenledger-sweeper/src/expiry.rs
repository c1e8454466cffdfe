//! Expiry sweeper: find expired open holds and reverse them.
//!
//! A hold that reaches its deadline without a capture returns its reserved
//! tokens by transitioning to `reversed`. The sweeper rides the same
//! conditional-update protocol as every other hold mutation, so racing a
//! concurrent capture is safe: exactly one side wins the row, the other
//! counts the outcome. Re-running over holds reversed by an earlier pass
//! counts them as already processed rather than reversing twice.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use tokenledger_core::error::{codes, LedgerError};
use tokenledger_core::time;
use tokenledger_core::transaction::{HoldState, Transaction, TransactionType};
use tokenledger_engine::{HoldSelector, LedgerEngine};
use tokenledger_store::{IndexQuery, QueryOptions, RegistryStore};

/// Result of one `find_expired_holds` query, with observability counters.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FindExpiredResult {
    #[serde(skip)]
    pub holds: Vec<Transaction>,
    /// Every HOLD row past the cutoff, whatever its state.
    pub total_expired: usize,
    /// The subset still open.
    pub open_expired: usize,
    /// Open holds actually returned (capped by `limit`).
    pub returned: usize,
}

/// One hold the sweeper could not process.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepFailure {
    pub hold_id: String,
    pub user_id: String,
    pub ref_id: String,
    pub error: String,
}

#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessExpiredSummary {
    pub processed: usize,
    pub reversed: usize,
    pub already_processed: usize,
    pub failed: usize,
    pub errors: Vec<SweepFailure>,
    pub duration_ms: u64,
}

pub struct ExpirySweeper {
    engine: Arc<LedgerEngine>,
}

impl ExpirySweeper {
    pub fn new(engine: Arc<LedgerEngine>) -> Self {
        Self { engine }
    }

    /// Expired open holds, oldest deadline first, up to `limit`.
    ///
    /// `expired_for_seconds` pushes the cutoff back: only holds expired at
    /// least that long ago qualify. Rows with no state are reported to the
    /// error sink and excluded.
    pub fn find_expired_holds(
        &self,
        expired_for_seconds: i64,
        limit: usize,
    ) -> Result<FindExpiredResult, LedgerError> {
        let expired = self.expired_hold_rows(expired_for_seconds, codes::FIND_EXPIRED_HOLDS_ERROR)?;

        let total_expired = expired.len();
        let mut open = Vec::new();
        for hold in expired {
            match hold.state {
                Some(HoldState::Open) => open.push(hold),
                Some(_) => {}
                None => self.report_missing_state(&hold),
            }
        }
        let open_expired = open.len();
        open.truncate(limit);

        info!(
            flag = "TOKENS",
            action = "find_expired_holds",
            total_expired,
            open_expired,
            returned = open.len(),
            "expired hold scan complete"
        );
        Ok(FindExpiredResult { returned: open.len(), holds: open, total_expired, open_expired })
    }

    /// Reverse every expired hold, tallying per-row outcomes. One failing
    /// hold never stops the batch.
    pub fn process_expired_holds(
        &self,
        expired_for_seconds: i64,
        batch_size: usize,
    ) -> Result<ProcessExpiredSummary, LedgerError> {
        let started = Instant::now();
        let expired =
            self.expired_hold_rows(expired_for_seconds, codes::PROCESS_EXPIRED_HOLDS_ERROR)?;

        let mut summary = ProcessExpiredSummary::default();
        for hold in expired.iter().take(batch_size) {
            match hold.state {
                None => {
                    self.report_missing_state(hold);
                    continue;
                }
                // Terminal either way: nothing left to reverse.
                Some(HoldState::Captured) | Some(HoldState::Reversed) => {
                    summary.processed += 1;
                    summary.already_processed += 1;
                }
                Some(HoldState::Open) => {
                    summary.processed += 1;
                    match self.engine.reverse_held_tokens(HoldSelector::ById(hold.id.clone())) {
                        Ok(outcome) if outcome.reversed_count == 1 => summary.reversed += 1,
                        Ok(outcome) if outcome.already_reversed => summary.already_processed += 1,
                        Ok(_) => {
                            // Lost the conditional update to a concurrent
                            // actor between our read and the write.
                            summary.failed += 1;
                            summary.errors.push(failure(hold, "ConditionalCheckFailed"));
                        }
                        Err(e) => {
                            warn!(
                                flag = "TOKENS",
                                action = "process_expired_holds",
                                hold_id = %hold.id,
                                error = %e,
                                "failed to reverse expired hold"
                            );
                            summary.failed += 1;
                            summary.errors.push(failure(hold, e.code()));
                        }
                    }
                }
            }
        }

        summary.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            flag = "TOKENS",
            action = "process_expired_holds",
            processed = summary.processed,
            reversed = summary.reversed,
            already_processed = summary.already_processed,
            failed = summary.failed,
            duration_ms = summary.duration_ms,
            "expired hold sweep complete"
        );
        Ok(summary)
    }

    /// Every HOLD row whose `expiresAt` is at least `expired_for_seconds`
    /// in the past, off the global expiry index.
    fn expired_hold_rows(
        &self,
        expired_for_seconds: i64,
        code: &'static str,
    ) -> Result<Vec<Transaction>, LedgerError> {
        let cutoff = time::to_iso(
            self.engine.clock().now() - chrono::Duration::seconds(expired_for_seconds.max(0)),
        );
        self.engine
            .store()
            .query(
                &IndexQuery::ByExpiresBefore { cutoff_iso: cutoff.clone() },
                &QueryOptions::with_type(TransactionType::Hold),
            )
            .map_err(|e| {
                let err = LedgerError::Storage {
                    op: "expired_hold_rows",
                    code,
                    message: e.to_string(),
                };
                self.engine
                    .sink()
                    .add_error(&err.to_string(), err.code(), &json!({ "cutoff": cutoff }));
                err
            })
    }

    fn report_missing_state(&self, hold: &Transaction) {
        self.engine.sink().add_error(
            &format!("expired hold {} has no state field", hold.id),
            codes::EXPIRED_HOLD_MISSING_STATE,
            &json!({
                "transactionId": hold.id.as_str(),
                "userId": hold.user_id,
                "refId": hold.ref_id,
            }),
        );
    }
}

fn failure(hold: &Transaction, error: &str) -> SweepFailure {
    SweepFailure {
        hold_id: hold.id.as_str().to_string(),
        user_id: hold.user_id.clone(),
        ref_id: hold.ref_id.clone(),
        error: error.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokenledger_core::time::ManualClock;
    use tokenledger_engine::{CaptureSummary, HoldOptions};
    use tokenledger_store::{RegistryDb, RegistryStore};

    const T0: &str = "2025-01-01T00:00:00.000Z";

    fn setup(name: &str) -> (Arc<LedgerEngine>, Arc<ManualClock>, Arc<RegistryDb>) {
        let dir = std::env::temp_dir().join(format!("tokenledger_sweeper_test_{}", name));
        let _ = std::fs::remove_dir_all(&dir);
        let db = Arc::new(RegistryDb::open(&dir).expect("open temp db"));
        let clock = Arc::new(ManualClock::at_iso(T0));
        let store: Arc<dyn RegistryStore> = db.clone();
        let engine = Arc::new(LedgerEngine::new(store).with_clock(clock.clone()));
        engine.credit_paid_tokens("u1", 100, None, None).unwrap();
        (engine, clock, db)
    }

    fn hold(engine: &LedgerEngine, amount: i64, secs: i64) -> tokenledger_core::types::TransactionId {
        engine
            .hold_tokens(
                "u1",
                amount,
                "m",
                HoldOptions { expires_after_secs: Some(secs), ..Default::default() },
            )
            .unwrap()
            .id
    }

    #[test]
    fn sweep_reverses_expired_hold_and_is_idempotent() {
        let (engine, clock, _) = setup("idempotent");
        let sweeper = ExpirySweeper::new(engine.clone());
        hold(&engine, 10, 300);
        assert_eq!(engine.get_user_balance("u1").unwrap().paid_tokens, 90);

        clock.advance_secs(301);
        let first = sweeper.process_expired_holds(0, 10).unwrap();
        assert_eq!(first.processed, 1);
        assert_eq!(first.reversed, 1);
        assert_eq!(first.failed, 0);
        assert_eq!(engine.get_user_balance("u1").unwrap().paid_tokens, 100);

        let second = sweeper.process_expired_holds(0, 10).unwrap();
        assert_eq!(second.processed, 1);
        assert_eq!(second.reversed, 0);
        assert_eq!(second.already_processed, 1);
    }

    #[test]
    fn unexpired_holds_stay_untouched() {
        let (engine, clock, _) = setup("not_yet");
        let sweeper = ExpirySweeper::new(engine.clone());
        hold(&engine, 10, 3_600);
        clock.advance_secs(600);

        let found = sweeper.find_expired_holds(0, 100).unwrap();
        assert_eq!(found.returned, 0);
        assert_eq!(found.total_expired, 0);

        let summary = sweeper.process_expired_holds(0, 10).unwrap();
        assert_eq!(summary.processed, 0);
        assert_eq!(engine.get_user_balance("u1").unwrap().paid_tokens, 90);
    }

    #[test]
    fn expired_for_seconds_pushes_the_cutoff_back() {
        let (engine, clock, _) = setup("grace");
        let sweeper = ExpirySweeper::new(engine.clone());
        hold(&engine, 10, 300);
        clock.advance_secs(360);

        // Expired 60s ago: not yet expired "for 120 seconds".
        assert_eq!(sweeper.find_expired_holds(120, 100).unwrap().returned, 0);
        assert_eq!(sweeper.find_expired_holds(30, 100).unwrap().returned, 1);
    }

    #[test]
    fn captured_holds_count_as_already_processed() {
        let (engine, clock, _) = setup("captured");
        let sweeper = ExpirySweeper::new(engine.clone());
        let id = hold(&engine, 10, 300);
        let captured = engine
            .capture_held_tokens(tokenledger_engine::HoldSelector::ById(id))
            .unwrap();
        assert_eq!(captured, CaptureSummary { captured_count: 1, already_captured: false });

        clock.advance_secs(301);
        let found = sweeper.find_expired_holds(0, 100).unwrap();
        assert_eq!(found.total_expired, 1);
        assert_eq!(found.open_expired, 0);

        let summary = sweeper.process_expired_holds(0, 10).unwrap();
        assert_eq!(summary.processed, 1);
        assert_eq!(summary.already_processed, 1);
        assert_eq!(summary.failed, 0);
        // The capture stands; no tokens came back.
        assert_eq!(engine.get_user_balance("u1").unwrap().paid_tokens, 90);
    }

    #[test]
    fn batch_size_caps_one_pass() {
        let (engine, clock, _) = setup("batch");
        let sweeper = ExpirySweeper::new(engine.clone());
        for _ in 0..3 {
            hold(&engine, 5, 300);
        }
        clock.advance_secs(301);

        let first = sweeper.process_expired_holds(0, 2).unwrap();
        assert_eq!(first.processed, 2);
        assert_eq!(first.reversed, 2);

        let second = sweeper.process_expired_holds(0, 10).unwrap();
        assert_eq!(second.reversed, 1);
        assert_eq!(second.already_processed, 2);
        assert_eq!(engine.get_user_balance("u1").unwrap().paid_tokens, 100);
    }

    #[test]
    fn missing_state_rows_are_reported_and_skipped() {
        let (engine, clock, db) = setup("missing_state");
        let sweeper = ExpirySweeper::new(engine.clone());
        let id = hold(&engine, 10, 300);
        let mut corrupt = engine.store().get(&id).unwrap().unwrap();
        corrupt.state = None;
        db.delete(&id).unwrap();
        db.put(&corrupt).unwrap();

        clock.advance_secs(301);
        let found = sweeper.find_expired_holds(0, 100).unwrap();
        assert_eq!(found.total_expired, 1);
        assert_eq!(found.open_expired, 0);
        assert_eq!(found.returned, 0);

        let summary = sweeper.process_expired_holds(0, 10).unwrap();
        assert_eq!(summary.processed, 0);
        assert_eq!(summary.failed, 0);
    }
}
