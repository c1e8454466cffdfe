//! Balance projection.
//!
//! A balance is a fold over two streams: every record owned by the user,
//! plus the tips the user received (read off the beneficiary index). Free
//! grants are bucketed per beneficiary; expired grants are skipped whole.
//! Negative residue in a bucket (over-consumption under the documented
//! race) stays visible in the map for diagnostics but never counts toward
//! the usable total.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;

use tokenledger_core::constants::SYSTEM_BENEFICIARY_ID;
use tokenledger_core::error::{codes, LedgerError};
use tokenledger_core::time;
use tokenledger_core::transaction::{HoldState, Transaction, TransactionType};
use tokenledger_core::types::Amount;

use tokenledger_store::{IndexQuery, QueryOptions, RegistryStore};

use crate::LedgerEngine;

/// Projected token position of one user.
#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Balance {
    pub paid_tokens: Amount,
    pub free_tokens_per_beneficiary: HashMap<String, Amount>,
    pub total_free_tokens: Amount,
}

impl Balance {
    /// Free tokens available in one bucket; absent buckets read as zero.
    pub fn free_for(&self, beneficiary_id: &str) -> Amount {
        self.free_tokens_per_beneficiary
            .get(beneficiary_id)
            .copied()
            .unwrap_or(0)
    }
}

impl LedgerEngine {
    /// Project the current balance for `user_id`.
    pub fn get_user_balance(&self, user_id: &str) -> Result<Balance, LedgerError> {
        self.balance_with_code(user_id, "get_user_balance", codes::GET_USER_BALANCE_ERROR)
    }

    /// Balance projection reporting store failures under the calling
    /// operation's taxonomy code.
    pub(crate) fn balance_with_code(
        &self,
        user_id: &str,
        op: &'static str,
        code: &'static str,
    ) -> Result<Balance, LedgerError> {
        if user_id.trim().is_empty() {
            return Err(self.fail(LedgerError::MissingUserId, json!({})));
        }
        let ctx = json!({ "userId": user_id });

        let own = self
            .store()
            .query(
                &IndexQuery::ByUser { user_id: user_id.to_string() },
                &QueryOptions::default(),
            )
            .map_err(|e| self.storage_failure(op, code, e, ctx.clone()))?;

        let tips_received = self
            .store()
            .query(
                &IndexQuery::ByBeneficiary { beneficiary_id: user_id.to_string() },
                &QueryOptions::with_type(TransactionType::Tip),
            )
            .map_err(|e| self.storage_failure(op, code, e, ctx))?;

        Ok(project(user_id, &own, &tips_received, self.clock().now()))
    }
}

/// Fold the two record streams into a [`Balance`].
pub(crate) fn project(
    user_id: &str,
    own: &[Transaction],
    tips_received: &[Transaction],
    now: DateTime<Utc>,
) -> Balance {
    let mut paid: Amount = 0;
    let mut buckets: HashMap<String, Amount> = HashMap::new();

    for tx in own {
        match tx.transaction_type {
            TransactionType::CreditPaid => paid += tx.amount,
            TransactionType::CreditFree => {
                if !time::is_past(&tx.expires_at, now) {
                    *buckets.entry(tx.beneficiary_id.clone()).or_insert(0) += tx.amount;
                }
            }
            TransactionType::Debit | TransactionType::Tip => {
                paid -= tx.amount;
                consume_free(&mut buckets, tx);
            }
            TransactionType::Hold => match tx.state {
                Some(HoldState::Open) | Some(HoldState::Captured) => {
                    paid -= tx.amount;
                    consume_free(&mut buckets, tx);
                }
                // Reversed holds returned the reservation; stateless hold
                // rows are corruption and must not move the balance.
                Some(HoldState::Reversed) | None => {}
            },
        }
    }

    for tx in tips_received {
        if tx.transaction_type == TransactionType::Tip && tx.user_id != user_id {
            paid += tx.amount;
        }
    }

    let total_free = buckets.values().filter(|v| **v > 0).sum();
    Balance {
        paid_tokens: paid,
        free_tokens_per_beneficiary: buckets,
        total_free_tokens: total_free,
    }
}

fn consume_free(buckets: &mut HashMap<String, Amount>, tx: &Transaction) {
    if tx.free_beneficiary_consumed != 0 {
        *buckets.entry(tx.beneficiary_id.clone()).or_insert(0) -= tx.free_beneficiary_consumed;
    }
    if tx.free_system_consumed != 0 {
        *buckets.entry(SYSTEM_BENEFICIARY_ID.to_string()).or_insert(0) -= tx.free_system_consumed;
    }
}
