//! End-to-end smoke test for the token ledger.
//!
//! Drives the full lifecycle against a real sled-backed store: grants,
//! spends, a tip, a hold that captures, a hold that lapses and is swept,
//! and a retention pass over the aged records.
//!
//! Run with:
//!   cargo test -p tokenledger-service --test smoke

use std::path::PathBuf;
use std::sync::Arc;

use tokenledger_core::time::{parse_iso, ManualClock};
use tokenledger_engine::{
    DeductOptions, HoldOptions, HoldSelector, LedgerEngine, TransferOptions,
};
use tokenledger_store::{RegistryDb, RegistryStore};
use tokenledger_sweeper::{ExpirySweeper, PurgeOptions, RetentionSweeper};

// ── Fixture ───────────────────────────────────────────────────────────────────

struct LedgerGuard {
    data_dir: PathBuf,
}

impl Drop for LedgerGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.data_dir);
    }
}

fn fresh_ledger(name: &str) -> (Arc<LedgerEngine>, Arc<ManualClock>, LedgerGuard) {
    let data_dir = std::env::temp_dir().join(format!("tokenledger_smoke_{}", name));
    let _ = std::fs::remove_dir_all(&data_dir);
    let db: Arc<dyn RegistryStore> = Arc::new(RegistryDb::open(&data_dir).expect("open db"));
    let clock = Arc::new(ManualClock::at_iso("2025-01-01T00:00:00.000Z"));
    let engine = Arc::new(LedgerEngine::new(db).with_clock(clock.clone()));
    (engine, clock, LedgerGuard { data_dir })
}

// ── The whole lifecycle in one sitting ────────────────────────────────────────

#[test]
fn full_ledger_lifecycle() {
    let (engine, clock, _guard) = fresh_ledger("lifecycle");
    let expiry = ExpirySweeper::new(Arc::clone(&engine));
    let retention = RetentionSweeper::new(Arc::clone(&engine));

    // Fan buys 100 tokens and receives a creator-scoped free grant.
    engine.credit_paid_tokens("fan", 100, Some("purchase".into()), None).unwrap();
    engine
        .credit_free_tokens("fan", "creator", 10, None, None, None)
        .unwrap();

    let balance = engine.get_user_balance("fan").unwrap();
    assert_eq!(balance.paid_tokens, 100);
    assert_eq!(balance.total_free_tokens, 10);

    // Unlock a post: free tokens burn before paid ones.
    let debit = engine
        .deduct_tokens(
            "fan",
            15,
            "creator",
            DeductOptions { ref_id: Some("post-1".into()), ..Default::default() },
        )
        .unwrap();
    assert_eq!(debit.free_beneficiary_consumed, 10);
    assert_eq!(debit.amount, 5);

    // Tip the creator.
    engine
        .transfer_tokens("fan", "creator", 20, TransferOptions::default())
        .unwrap();
    assert_eq!(engine.get_user_balance("creator").unwrap().paid_tokens, 20);
    assert_eq!(engine.get_user_earnings("creator").unwrap().total_received, 20);

    // Reserve tokens for a live stream, then capture when it ends.
    engine
        .hold_tokens(
            "fan",
            30,
            "creator",
            HoldOptions { ref_id: Some("stream-1".into()), expires_after_secs: Some(600), ..Default::default() },
        )
        .unwrap();
    assert_eq!(engine.get_user_balance("fan").unwrap().paid_tokens, 45);
    let captured = engine
        .capture_held_tokens(HoldSelector::ByRefId("stream-1".into()))
        .unwrap();
    assert_eq!(captured.captured_count, 1);
    assert_eq!(engine.get_user_balance("fan").unwrap().paid_tokens, 45);

    // A second reservation lapses and the sweeper returns it.
    engine
        .hold_tokens(
            "fan",
            25,
            "creator",
            HoldOptions { ref_id: Some("stream-2".into()), expires_after_secs: Some(300), ..Default::default() },
        )
        .unwrap();
    assert_eq!(engine.get_user_balance("fan").unwrap().paid_tokens, 20);

    clock.advance_secs(301);
    let swept = expiry.process_expired_holds(0, 100).unwrap();
    assert_eq!(swept.reversed, 1);
    assert_eq!(swept.failed, 0);
    assert_eq!(engine.get_user_balance("fan").unwrap().paid_tokens, 45);

    // A year and a day later, retention archives the aged records.
    clock.set(parse_iso("2026-01-02T00:05:01.000Z").unwrap());
    let dry = retention
        .purge_old_registry_records(PurgeOptions::default())
        .unwrap();
    assert!(dry.dry_run);
    assert!(dry.candidates > 0);

    let purged = retention
        .purge_old_registry_records(PurgeOptions { dry_run: false, ..Default::default() })
        .unwrap();
    assert_eq!(purged.deleted, purged.candidates);
    assert_eq!(purged.archived, purged.deleted);

    // Everything predates the cutoff: the registry is empty again.
    assert!(engine.get_user_transaction_history("fan", None).unwrap().is_empty());
}

#[test]
fn sweeper_and_spender_agree_under_interleaving() {
    // A capture that lands before the sweep wins the row; the sweep then
    // counts it as already processed instead of double-reversing.
    let (engine, clock, _guard) = fresh_ledger("interleave");
    let expiry = ExpirySweeper::new(Arc::clone(&engine));

    engine.credit_paid_tokens("fan", 50, None, None).unwrap();
    engine
        .hold_tokens(
            "fan",
            50,
            "creator",
            HoldOptions { ref_id: Some("pay-1".into()), expires_after_secs: Some(300), ..Default::default() },
        )
        .unwrap();

    clock.advance_secs(400);
    // The capture arrives late but before the sweeper.
    engine
        .capture_held_tokens(HoldSelector::ByRefId("pay-1".into()))
        .unwrap();

    let swept = expiry.process_expired_holds(0, 100).unwrap();
    assert_eq!(swept.reversed, 0);
    assert_eq!(swept.already_processed, 1);
    assert_eq!(engine.get_user_balance("fan").unwrap().paid_tokens, 0);
}
