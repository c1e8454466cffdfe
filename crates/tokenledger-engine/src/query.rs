//! Read-side query operations: history, summaries, tip views, earnings and
//! correlation lookups. None of these scan — every path goes through a
//! secondary index.

use serde::Serialize;
use serde_json::json;

use tokenledger_core::error::{codes, LedgerError};
use tokenledger_core::time;
use tokenledger_core::transaction::{HoldState, Transaction, TransactionType};
use tokenledger_core::types::{Amount, TransactionId};

use tokenledger_store::{IndexQuery, QueryOptions, RegistryStore};

use crate::balance::Balance;
use crate::LedgerEngine;

/// Balance plus the hold exposure operators ask about first.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenSummary {
    pub balance: Balance,
    pub open_hold_count: usize,
    /// Total requested amount currently reserved by open holds.
    pub tokens_on_hold: Amount,
}

/// One free grant about to lapse.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpiringGrant {
    pub transaction_id: TransactionId,
    pub beneficiary_id: String,
    pub amount: Amount,
    pub expires_at: String,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpiringTokensWarning {
    pub expiring: Vec<ExpiringGrant>,
    pub total_expiring: Amount,
}

#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Earnings {
    pub total_received: Amount,
    pub tip_count: usize,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpendingByRef {
    pub records: Vec<Transaction>,
    pub total_spent: Amount,
}

impl LedgerEngine {
    /// A user's records, newest first, optionally capped.
    pub fn get_user_transaction_history(
        &self,
        user_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<Transaction>, LedgerError> {
        if user_id.trim().is_empty() {
            return Err(self.fail(LedgerError::MissingUserId, json!({})));
        }
        self.store()
            .query(
                &IndexQuery::ByUser { user_id: user_id.to_string() },
                &QueryOptions { newest_first: true, limit, ..Default::default() },
            )
            .map_err(|e| {
                self.storage_failure(
                    "get_user_transaction_history",
                    codes::GET_TRANSACTION_HISTORY_ERROR,
                    e,
                    json!({ "userId": user_id }),
                )
            })
    }

    /// Balance plus open-hold exposure.
    pub fn get_user_token_summary(&self, user_id: &str) -> Result<TokenSummary, LedgerError> {
        let balance =
            self.balance_with_code(user_id, "get_user_token_summary", codes::GET_TOKEN_SUMMARY_ERROR)?;
        let open_holds = self
            .store()
            .query(
                &IndexQuery::ByUser { user_id: user_id.to_string() },
                &QueryOptions {
                    filter_type: Some(TransactionType::Hold),
                    filter_state: Some(HoldState::Open),
                    ..Default::default()
                },
            )
            .map_err(|e| {
                self.storage_failure(
                    "get_user_token_summary",
                    codes::GET_TOKEN_SUMMARY_ERROR,
                    e,
                    json!({ "userId": user_id }),
                )
            })?;
        let tokens_on_hold = open_holds.iter().map(Transaction::requested_amount).sum();
        Ok(TokenSummary { balance, open_hold_count: open_holds.len(), tokens_on_hold })
    }

    /// Free grants that will lapse within `within_seconds` of now.
    pub fn get_expiring_tokens_warning(
        &self,
        user_id: &str,
        within_seconds: i64,
    ) -> Result<ExpiringTokensWarning, LedgerError> {
        if user_id.trim().is_empty() {
            return Err(self.fail(LedgerError::MissingUserId, json!({})));
        }
        let now = self.clock().now();
        let grants = self
            .store()
            .query(
                &IndexQuery::ByUserExpiresBetween {
                    user_id: user_id.to_string(),
                    from_iso: time::to_iso(now),
                    to_iso: time::offset_iso(now, within_seconds.max(0)),
                },
                &QueryOptions::with_type(TransactionType::CreditFree),
            )
            .map_err(|e| {
                self.storage_failure(
                    "get_expiring_tokens_warning",
                    codes::GET_EXPIRING_TOKENS_ERROR,
                    e,
                    json!({ "userId": user_id, "withinSeconds": within_seconds }),
                )
            })?;

        let expiring: Vec<ExpiringGrant> = grants
            .iter()
            .map(|tx| ExpiringGrant {
                transaction_id: tx.id.clone(),
                beneficiary_id: tx.beneficiary_id.clone(),
                amount: tx.amount,
                expires_at: tx.expires_at.clone(),
            })
            .collect();
        let total_expiring = expiring.iter().map(|g| g.amount).sum();
        Ok(ExpiringTokensWarning { expiring, total_expiring })
    }

    /// Tips where `user_id` is the beneficiary, newest first.
    pub fn get_tips_received(
        &self,
        user_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<Transaction>, LedgerError> {
        self.store()
            .query(
                &IndexQuery::ByBeneficiary { beneficiary_id: user_id.to_string() },
                &QueryOptions {
                    filter_type: Some(TransactionType::Tip),
                    newest_first: true,
                    limit,
                    ..Default::default()
                },
            )
            .map_err(|e| {
                self.storage_failure(
                    "get_tips_received",
                    codes::GET_TIPS_ERROR,
                    e,
                    json!({ "userId": user_id }),
                )
            })
    }

    /// Tips sent by `user_id`, newest first.
    pub fn get_tips_sent(
        &self,
        user_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<Transaction>, LedgerError> {
        self.store()
            .query(
                &IndexQuery::ByUser { user_id: user_id.to_string() },
                &QueryOptions {
                    filter_type: Some(TransactionType::Tip),
                    newest_first: true,
                    limit,
                    ..Default::default()
                },
            )
            .map_err(|e| {
                self.storage_failure(
                    "get_tips_sent",
                    codes::GET_TIPS_ERROR,
                    e,
                    json!({ "userId": user_id }),
                )
            })
    }

    /// Tips received inside `[from_iso, to_iso]` (inclusive). Rows whose
    /// `createdAt` does not parse are skipped rather than guessed at.
    pub fn get_tips_received_by_date_range(
        &self,
        user_id: &str,
        from_iso: &str,
        to_iso: &str,
    ) -> Result<Vec<Transaction>, LedgerError> {
        let ctx = json!({ "userId": user_id, "from": from_iso, "to": to_iso });
        let from = time::parse_iso(from_iso)
            .ok_or_else(|| self.fail(LedgerError::InvalidInstant(from_iso.to_string()), ctx.clone()))?;
        let to = time::parse_iso(to_iso)
            .ok_or_else(|| self.fail(LedgerError::InvalidInstant(to_iso.to_string()), ctx))?;

        let tips = self.get_tips_received(user_id, None)?;
        Ok(tips
            .into_iter()
            .filter(|tx| match time::parse_iso(&tx.created_at) {
                Some(created) => created >= from && created <= to,
                None => false,
            })
            .collect())
    }

    /// Lifetime tip earnings for `user_id`.
    pub fn get_user_earnings(&self, user_id: &str) -> Result<Earnings, LedgerError> {
        let tips = self
            .store()
            .query(
                &IndexQuery::ByBeneficiary { beneficiary_id: user_id.to_string() },
                &QueryOptions::with_type(TransactionType::Tip),
            )
            .map_err(|e| {
                self.storage_failure(
                    "get_user_earnings",
                    codes::GET_USER_EARNINGS_ERROR,
                    e,
                    json!({ "userId": user_id }),
                )
            })?;
        Ok(Earnings {
            total_received: tips.iter().map(|tx| tx.amount).sum(),
            tip_count: tips.len(),
        })
    }

    /// What a user has spent against one external correlation id. Reversed
    /// holds returned their reservation and do not count.
    pub fn get_user_spending_by_ref_id(
        &self,
        user_id: &str,
        ref_id: &str,
    ) -> Result<SpendingByRef, LedgerError> {
        let records = self.get_transactions_by_ref_id(user_id, ref_id)?;
        let spends: Vec<Transaction> = records
            .into_iter()
            .filter(|tx| match tx.transaction_type {
                TransactionType::Debit | TransactionType::Tip => true,
                TransactionType::Hold => matches!(
                    tx.state,
                    Some(HoldState::Open) | Some(HoldState::Captured)
                ),
                _ => false,
            })
            .collect();
        let total_spent = spends.iter().map(Transaction::requested_amount).sum();
        Ok(SpendingByRef { records: spends, total_spent })
    }

    /// Single-record lookup by primary key.
    pub fn get_transaction_by_id(
        &self,
        id: &TransactionId,
    ) -> Result<Option<Transaction>, LedgerError> {
        self.store().get(id).map_err(|e| {
            self.storage_failure(
                "get_transaction_by_id",
                codes::GET_TRANSACTION_ERROR,
                e,
                json!({ "transactionId": id.as_str() }),
            )
        })
    }

    /// All of a user's records carrying one external correlation id.
    pub fn get_transactions_by_ref_id(
        &self,
        user_id: &str,
        ref_id: &str,
    ) -> Result<Vec<Transaction>, LedgerError> {
        if user_id.trim().is_empty() {
            return Err(self.fail(LedgerError::MissingUserId, json!({})));
        }
        self.store()
            .query(
                &IndexQuery::ByUserRef {
                    user_id: user_id.to_string(),
                    ref_id: ref_id.to_string(),
                },
                &QueryOptions::default(),
            )
            .map_err(|e| {
                self.storage_failure(
                    "get_transactions_by_ref_id",
                    codes::GET_TRANSACTION_ERROR,
                    e,
                    json!({ "userId": user_id, "refId": ref_id }),
                )
            })
    }
}
