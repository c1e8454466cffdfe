//! Transaction writer: normalization, type-specific invariants, one put.
//!
//! Defaulting order matters and is part of the record contract:
//! purpose ← type name, beneficiary ← system bucket, refId ← `no_ref_<id>`,
//! expiresAt ← far-future sentinel, createdAt ← now, version ← 1, and HOLD
//! rows always start `open` regardless of caller input. Metadata serializes
//! before the store is touched, so a bad payload never leaves a partial row.

use serde_json::{json, Value};
use tracing::info;

use tokenledger_core::constants::{FAR_FUTURE_EXPIRY, NO_REF_PREFIX, SYSTEM_BENEFICIARY_ID};
use tokenledger_core::error::{codes, LedgerError};
use tokenledger_core::id::new_transaction_id;
use tokenledger_core::transaction::{HoldState, NewTransaction, Transaction, TransactionType};

use tokenledger_store::RegistryStore;

use crate::LedgerEngine;

impl LedgerEngine {
    /// Construct and persist one immutable ledger record.
    pub fn add_transaction(&self, request: NewTransaction) -> Result<Transaction, LedgerError> {
        let record = self.build_record(request)?;
        self.persist_record(&record, "add_transaction", codes::ADD_TRANSACTION_ERROR)?;
        Ok(record)
    }

    /// Validation and normalization without touching the store.
    pub(crate) fn build_record(&self, request: NewTransaction) -> Result<Transaction, LedgerError> {
        if request.user_id.trim().is_empty() {
            return Err(self.fail(LedgerError::MissingUserId, json!({})));
        }
        if request.amount < 0 {
            return Err(self.fail(
                LedgerError::NegativeAmount { amount: request.amount },
                json!({ "userId": request.user_id }),
            ));
        }

        let id = new_transaction_id();
        let purpose = request
            .purpose
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| request.transaction_type.as_wire_str().to_string());
        let beneficiary_id = request
            .beneficiary_id
            .filter(|b| !b.is_empty())
            .unwrap_or_else(|| SYSTEM_BENEFICIARY_ID.to_string());
        let ref_id = request
            .ref_id
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| format!("{NO_REF_PREFIX}{id}"));
        let expires_at = request
            .expires_at
            .filter(|e| !e.is_empty())
            .unwrap_or_else(|| FAR_FUTURE_EXPIRY.to_string());

        let metadata = match request.metadata {
            Some(value) => serde_json::to_string(&value).map_err(|e| {
                self.fail(
                    LedgerError::MetadataSerialization(e.to_string()),
                    json!({ "userId": request.user_id, "transactionType": request.transaction_type.as_wire_str() }),
                )
            })?,
            None => "{}".to_string(),
        };

        // HOLD rows open regardless of caller input; nothing else carries state.
        let state = match request.transaction_type {
            TransactionType::Hold => Some(HoldState::Open),
            _ => None,
        };

        Ok(Transaction {
            id,
            user_id: request.user_id,
            beneficiary_id,
            transaction_type: request.transaction_type,
            amount: request.amount,
            purpose,
            ref_id,
            expires_at,
            created_at: self.clock().now_iso(),
            metadata,
            version: 1,
            state,
            free_beneficiary_consumed: request.free_beneficiary_consumed,
            free_system_consumed: request.free_system_consumed,
        })
    }

    /// Put the record, wrapping store failures in the caller's taxonomy code.
    pub(crate) fn persist_record(
        &self,
        record: &Transaction,
        op: &'static str,
        code: &'static str,
    ) -> Result<(), LedgerError> {
        self.store().put(record).map_err(|e| {
            self.storage_failure(op, code, e, json!({ "transactionId": record.id.as_str() }))
        })?;
        info!(
            flag = "TOKENS",
            action = op,
            tx_id = %record.id,
            user_id = %record.user_id,
            tx_type = %record.transaction_type,
            amount = record.amount,
            "transaction recorded"
        );
        Ok(())
    }
}
