//! Spend operations: deduct, transfer (tip), credit wrappers and the admin
//! adjustment — everything built on projector + splitter + writer.

use serde_json::{json, Map, Value};
use tracing::info;

use tokenledger_core::constants::{FAR_FUTURE_EXPIRY, SYSTEM_BENEFICIARY_ID};
use tokenledger_core::error::{codes, LedgerError};
use tokenledger_core::transaction::{NewTransaction, SpendBreakdown, Transaction, TransactionType};
use tokenledger_core::types::Amount;

use crate::split::{plan_split, usable_total, validate_sufficient_tokens};
use crate::LedgerEngine;

/// Optional knobs for [`LedgerEngine::deduct_tokens`].
#[derive(Clone, Debug, Default)]
pub struct DeductOptions {
    pub ref_id: Option<String>,
    pub purpose: Option<String>,
    pub metadata: Option<Value>,
}

/// Optional knobs for [`LedgerEngine::transfer_tokens`]. Callers may pass
/// arbitrary extra keys through `metadata`; the engine keeps them verbatim.
#[derive(Clone, Debug, Default)]
pub struct TransferOptions {
    pub ref_id: Option<String>,
    pub purpose: Option<String>,
    pub note: Option<String>,
    pub is_anonymous: bool,
    pub metadata: Option<Value>,
}

/// Caller metadata as a mutable object, preserving non-object payloads.
fn metadata_object(metadata: Option<Value>) -> Map<String, Value> {
    match metadata {
        Some(Value::Object(map)) => map,
        Some(other) => {
            let mut map = Map::new();
            map.insert("data".to_string(), other);
            map
        }
        None => Map::new(),
    }
}

impl LedgerEngine {
    /// Whether `user_id` can currently cover `amount` toward
    /// `beneficiary_id`. Advisory only — the spend paths re-check.
    pub fn validate_sufficient_tokens(
        &self,
        user_id: &str,
        amount: Amount,
        beneficiary_id: &str,
    ) -> Result<bool, LedgerError> {
        let balance =
            self.balance_with_code(user_id, "validate_sufficient_tokens", codes::GET_USER_BALANCE_ERROR)?;
        Ok(validate_sufficient_tokens(&balance, amount, beneficiary_id))
    }

    /// Spend `amount` from `user_id` toward `beneficiary_id`, drawing free
    /// buckets first. Writes one `DEBIT` whose `amount` is the paid portion.
    pub fn deduct_tokens(
        &self,
        user_id: &str,
        amount: Amount,
        beneficiary_id: &str,
        opts: DeductOptions,
    ) -> Result<Transaction, LedgerError> {
        let ctx = json!({ "userId": user_id, "beneficiaryId": beneficiary_id, "amount": amount });
        if user_id.trim().is_empty() {
            return Err(self.fail(LedgerError::MissingUserId, ctx));
        }
        if beneficiary_id.is_empty() {
            return Err(self.fail(LedgerError::MissingBeneficiary, ctx));
        }
        if amount <= 0 {
            return Err(self.fail(LedgerError::InvalidAmount { amount }, ctx));
        }

        let balance = self.balance_with_code(user_id, "deduct_tokens", codes::DEDUCT_TOKENS_ERROR)?;
        if !validate_sufficient_tokens(&balance, amount, beneficiary_id) {
            return Err(self.fail(
                LedgerError::InsufficientTokens {
                    need: amount,
                    have: usable_total(&balance, beneficiary_id),
                },
                ctx,
            ));
        }
        let plan = plan_split(&balance, amount, beneficiary_id)
            .map_err(|e| self.fail(e, ctx.clone()))?;

        let mut metadata = metadata_object(opts.metadata);
        metadata.insert(
            "breakdown".to_string(),
            serde_json::to_value(SpendBreakdown {
                beneficiary_specific_free: plan.beneficiary_free,
                system_free: plan.system_free,
                paid: plan.paid,
            })
            .unwrap_or(Value::Null),
        );

        let mut request = NewTransaction::new(user_id, TransactionType::Debit, plan.paid);
        request.beneficiary_id = Some(beneficiary_id.to_string());
        request.purpose = opts.purpose;
        request.ref_id = opts.ref_id;
        request.metadata = Some(Value::Object(metadata));
        request.free_beneficiary_consumed = plan.beneficiary_free;
        request.free_system_consumed = plan.system_free;

        let record = self.build_record(request)?;
        self.persist_record(&record, "deduct_tokens", codes::DEDUCT_TOKENS_ERROR)?;
        Ok(record)
    }

    /// Tip `amount` from `sender_id` to `beneficiary_id`. One `TIP` row is
    /// written; its `amount` (the paid portion) is also what the receiver's
    /// balance aggregates.
    pub fn transfer_tokens(
        &self,
        sender_id: &str,
        beneficiary_id: &str,
        amount: Amount,
        opts: TransferOptions,
    ) -> Result<Transaction, LedgerError> {
        let ctx = json!({ "userId": sender_id, "beneficiaryId": beneficiary_id, "amount": amount });
        if sender_id.trim().is_empty() {
            return Err(self.fail(LedgerError::MissingUserId, ctx));
        }
        if beneficiary_id.is_empty() {
            return Err(self.fail(LedgerError::MissingBeneficiary, ctx));
        }
        if sender_id == beneficiary_id {
            return Err(self.fail(LedgerError::SelfTransfer, ctx));
        }
        if amount <= 0 {
            return Err(self.fail(LedgerError::InvalidAmount { amount }, ctx));
        }

        let balance =
            self.balance_with_code(sender_id, "transfer_tokens", codes::TRANSFER_TOKENS_ERROR)?;
        if !validate_sufficient_tokens(&balance, amount, beneficiary_id) {
            return Err(self.fail(
                LedgerError::InsufficientTokens {
                    need: amount,
                    have: usable_total(&balance, beneficiary_id),
                },
                ctx,
            ));
        }
        let plan = plan_split(&balance, amount, beneficiary_id)
            .map_err(|e| self.fail(e, ctx.clone()))?;

        let mut metadata = metadata_object(opts.metadata);
        if let Some(note) = opts.note {
            metadata.insert("note".to_string(), Value::String(note));
        }
        metadata.insert("isAnonymous".to_string(), Value::Bool(opts.is_anonymous));
        metadata.insert(
            "breakdown".to_string(),
            serde_json::to_value(SpendBreakdown {
                beneficiary_specific_free: plan.beneficiary_free,
                system_free: plan.system_free,
                paid: plan.paid,
            })
            .unwrap_or(Value::Null),
        );
        metadata.insert("totalTipAmount".to_string(), json!(amount));

        let mut request = NewTransaction::new(sender_id, TransactionType::Tip, plan.paid);
        request.beneficiary_id = Some(beneficiary_id.to_string());
        request.purpose = opts.purpose;
        request.ref_id = opts.ref_id;
        request.metadata = Some(Value::Object(metadata));
        request.free_beneficiary_consumed = plan.beneficiary_free;
        request.free_system_consumed = plan.system_free;

        let record = self.build_record(request)?;
        self.persist_record(&record, "transfer_tokens", codes::TRANSFER_TOKENS_ERROR)?;
        info!(
            flag = "TOKENS",
            action = "transfer_tokens",
            sender = %sender_id,
            beneficiary = %beneficiary_id,
            total = amount,
            paid_portion = record.amount,
            "tip transferred"
        );
        Ok(record)
    }

    /// Grant purchased tokens. The bucketless credit: fungible, never expires.
    pub fn credit_paid_tokens(
        &self,
        user_id: &str,
        amount: Amount,
        purpose: Option<String>,
        metadata: Option<Value>,
    ) -> Result<Transaction, LedgerError> {
        if amount <= 0 {
            return Err(self.fail(
                LedgerError::InvalidAmount { amount },
                json!({ "userId": user_id }),
            ));
        }
        let mut request = NewTransaction::new(user_id, TransactionType::CreditPaid, amount);
        request.beneficiary_id = Some(SYSTEM_BENEFICIARY_ID.to_string());
        request.purpose = purpose;
        request.metadata = metadata;
        self.add_transaction(request)
    }

    /// Grant free tokens tied to `beneficiary_id`'s bucket, optionally
    /// expiring. Metadata mirrors the record expiry as `tokenExpiresAt`.
    pub fn credit_free_tokens(
        &self,
        user_id: &str,
        beneficiary_id: &str,
        amount: Amount,
        expires_at: Option<String>,
        purpose: Option<String>,
        metadata: Option<Value>,
    ) -> Result<Transaction, LedgerError> {
        let ctx = json!({ "userId": user_id, "beneficiaryId": beneficiary_id });
        if beneficiary_id.is_empty() {
            return Err(self.fail(LedgerError::MissingBeneficiary, ctx));
        }
        if amount <= 0 {
            return Err(self.fail(LedgerError::InvalidAmount { amount }, ctx));
        }

        let resolved_expiry = expires_at
            .clone()
            .filter(|e| !e.is_empty())
            .unwrap_or_else(|| FAR_FUTURE_EXPIRY.to_string());
        let mut meta = metadata_object(metadata);
        meta.insert("tokenExpiresAt".to_string(), Value::String(resolved_expiry.clone()));

        let mut request = NewTransaction::new(user_id, TransactionType::CreditFree, amount);
        request.beneficiary_id = Some(beneficiary_id.to_string());
        request.purpose = Some(purpose.unwrap_or_else(|| "free_grant".to_string()));
        request.expires_at = Some(resolved_expiry);
        request.metadata = Some(Value::Object(meta));
        self.add_transaction(request)
    }

    /// Admin convenience: positive `delta` credits paid tokens, negative
    /// `delta` deducts against the system bucket. Both record who and why.
    pub fn adjust_user_tokens_admin(
        &self,
        user_id: &str,
        delta: Amount,
        adjusted_by: &str,
        reason: &str,
    ) -> Result<Transaction, LedgerError> {
        if delta == 0 {
            return Err(self.fail(
                LedgerError::InvalidAmount { amount: delta },
                json!({ "userId": user_id, "adjustedBy": adjusted_by }),
            ));
        }
        let metadata = json!({ "adjustedBy": adjusted_by, "reason": reason });
        if delta > 0 {
            self.credit_paid_tokens(
                user_id,
                delta,
                Some("admin_adjustment".to_string()),
                Some(metadata),
            )
        } else {
            self.deduct_tokens(
                user_id,
                -delta,
                SYSTEM_BENEFICIARY_ID,
                DeductOptions {
                    purpose: Some("admin_adjustment".to_string()),
                    metadata: Some(metadata),
                    ..Default::default()
                },
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::engine;

    #[test]
    fn deduct_against_paid_only() {
        let (engine, _) = engine("spend_paid_only");
        engine.credit_paid_tokens("u1", 100, None, None).unwrap();

        let debit = engine.deduct_tokens("u1", 30, "m", DeductOptions::default()).unwrap();
        assert_eq!(debit.transaction_type, TransactionType::Debit);
        assert_eq!(debit.amount, 30);
        assert_eq!(debit.free_beneficiary_consumed, 0);
        assert_eq!(debit.free_system_consumed, 0);

        assert_eq!(engine.get_user_balance("u1").unwrap().paid_tokens, 70);
    }

    #[test]
    fn deduct_drains_free_buckets_first() {
        let (engine, _) = engine("spend_split");
        engine.credit_paid_tokens("u1", 5, None, None).unwrap();
        engine.credit_free_tokens("u1", "alice", 3, None, None, None).unwrap();
        engine
            .credit_free_tokens("u1", SYSTEM_BENEFICIARY_ID, 2, None, None, None)
            .unwrap();

        let debit = engine.deduct_tokens("u1", 7, "alice", DeductOptions::default()).unwrap();
        assert_eq!(debit.amount, 2);
        assert_eq!(debit.free_beneficiary_consumed, 3);
        assert_eq!(debit.free_system_consumed, 2);
        assert_eq!(debit.requested_amount(), 7);

        let balance = engine.get_user_balance("u1").unwrap();
        assert_eq!(balance.paid_tokens, 3);
        assert_eq!(balance.total_free_tokens, 0);

        let breakdown = debit.metadata_value().unwrap()["breakdown"].clone();
        assert_eq!(breakdown["beneficiarySpecificFree"], 3);
        assert_eq!(breakdown["systemFree"], 2);
        assert_eq!(breakdown["paid"], 2);
    }

    #[test]
    fn deduct_insufficient_fails_before_writing() {
        let (engine, _) = engine("spend_insufficient");
        engine.credit_paid_tokens("u1", 5, None, None).unwrap();
        let err = engine.deduct_tokens("u1", 6, "m", DeductOptions::default()).unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientTokens { need: 6, have: 5 }));

        // No DEBIT row landed.
        let history = engine.get_user_transaction_history("u1", None).unwrap();
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn transfer_moves_paid_and_records_metadata() {
        let (engine, _) = engine("spend_tip");
        engine.credit_paid_tokens("a", 10, None, None).unwrap();

        let tip = engine
            .transfer_tokens(
                "a",
                "b",
                5,
                TransferOptions {
                    ref_id: Some("R".into()),
                    purpose: Some("tip".into()),
                    note: Some("nice work".into()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(tip.transaction_type, TransactionType::Tip);
        assert_eq!(tip.user_id, "a");
        assert_eq!(tip.beneficiary_id, "b");
        assert_eq!(tip.amount, 5);

        assert_eq!(engine.get_user_balance("a").unwrap().paid_tokens, 5);
        assert_eq!(engine.get_user_balance("b").unwrap().paid_tokens, 5);

        let meta = tip.metadata_value().unwrap();
        assert_eq!(meta["note"], "nice work");
        assert_eq!(meta["isAnonymous"], false);
        assert_eq!(meta["totalTipAmount"], 5);
    }

    #[test]
    fn self_transfer_fails_before_any_read() {
        let (engine, _) = engine("spend_self_tip");
        // No balance seeded: if the guard ran after the read this would be
        // InsufficientTokens instead of SelfTransfer.
        let err = engine
            .transfer_tokens("a", "a", 5, TransferOptions::default())
            .unwrap_err();
        assert!(matches!(err, LedgerError::SelfTransfer));
    }

    #[test]
    fn repeated_ref_id_writes_independent_tips() {
        let (engine, _) = engine("spend_tip_refid");
        engine.credit_paid_tokens("a", 10, None, None).unwrap();
        let opts = || TransferOptions { ref_id: Some("R".into()), ..Default::default() };
        let t1 = engine.transfer_tokens("a", "b", 2, opts()).unwrap();
        let t2 = engine.transfer_tokens("a", "b", 2, opts()).unwrap();
        assert_ne!(t1.id, t2.id);
        assert_eq!(engine.get_user_balance("b").unwrap().paid_tokens, 4);
    }

    #[test]
    fn credit_validation() {
        let (engine, _) = engine("spend_credit_validation");
        assert!(matches!(
            engine.credit_paid_tokens("u1", 0, None, None).unwrap_err(),
            LedgerError::InvalidAmount { amount: 0 }
        ));
        assert!(matches!(
            engine.credit_free_tokens("u1", "", 5, None, None, None).unwrap_err(),
            LedgerError::MissingBeneficiary
        ));
        assert!(matches!(
            engine.credit_free_tokens("u1", "alice", -1, None, None, None).unwrap_err(),
            LedgerError::InvalidAmount { amount: -1 }
        ));
    }

    #[test]
    fn credit_free_mirrors_expiry_into_metadata() {
        let (engine, _) = engine("spend_free_expiry");
        let grant = engine
            .credit_free_tokens(
                "u1",
                "alice",
                5,
                Some("2025-06-01T00:00:00.000Z".into()),
                None,
                None,
            )
            .unwrap();
        assert_eq!(grant.purpose, "free_grant");
        assert_eq!(grant.expires_at, "2025-06-01T00:00:00.000Z");
        assert_eq!(
            grant.metadata_value().unwrap()["tokenExpiresAt"],
            "2025-06-01T00:00:00.000Z"
        );

        let open_ended = engine.credit_free_tokens("u1", "alice", 5, None, None, None).unwrap();
        assert_eq!(open_ended.expires_at, FAR_FUTURE_EXPIRY);
    }

    #[test]
    fn sufficiency_check_counts_all_sources() {
        let (engine, _) = engine("spend_sufficiency");
        engine.credit_paid_tokens("u1", 2, None, None).unwrap();
        engine.credit_free_tokens("u1", "alice", 3, None, None, None).unwrap();
        assert!(engine.validate_sufficient_tokens("u1", 5, "alice").unwrap());
        assert!(!engine.validate_sufficient_tokens("u1", 6, "alice").unwrap());
        // Alice's bucket is invisible to spends toward bob.
        assert!(!engine.validate_sufficient_tokens("u1", 3, "bob").unwrap());
        assert!(engine.validate_sufficient_tokens("u1", 0, "bob").unwrap());
    }

    #[test]
    fn admin_adjustment_both_directions() {
        let (engine, _) = engine("spend_admin");
        let credit = engine
            .adjust_user_tokens_admin("u1", 50, "ops-jane", "refund for outage")
            .unwrap();
        assert_eq!(credit.transaction_type, TransactionType::CreditPaid);
        assert_eq!(credit.purpose, "admin_adjustment");
        assert_eq!(credit.metadata_value().unwrap()["adjustedBy"], "ops-jane");

        let debit = engine
            .adjust_user_tokens_admin("u1", -20, "ops-jane", "clawback")
            .unwrap();
        assert_eq!(debit.transaction_type, TransactionType::Debit);
        assert_eq!(engine.get_user_balance("u1").unwrap().paid_tokens, 30);

        assert!(matches!(
            engine.adjust_user_tokens_admin("u1", 0, "ops-jane", "noop").unwrap_err(),
            LedgerError::InvalidAmount { amount: 0 }
        ));
    }
}
