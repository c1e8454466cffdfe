//! The single persisted entity of the ledger.
//!
//! One [`Transaction`] row per balance change. Credits, debits and tips are
//! write-once; `HOLD` rows additionally carry a [`HoldState`] and a version
//! counter mutated in place by the hold engine. Field names serialize in
//! camelCase to stay compatible with records already on disk.
//!
//! Fields added after the first release use `#[serde(default)]` so older
//! rows keep deserializing without migration.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::LedgerError;
use crate::types::{Amount, TransactionId, Version};

// ── Serde default helpers ────────────────────────────────────────────────────

fn default_version() -> Version {
    1
}

// ── TransactionType ──────────────────────────────────────────────────────────

/// Record type. Wire strings are the exact uppercase names.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionType {
    #[serde(rename = "CREDIT_PAID")]
    CreditPaid,
    #[serde(rename = "CREDIT_FREE")]
    CreditFree,
    #[serde(rename = "DEBIT")]
    Debit,
    #[serde(rename = "HOLD")]
    Hold,
    #[serde(rename = "TIP")]
    Tip,
}

impl TransactionType {
    pub fn as_wire_str(&self) -> &'static str {
        match self {
            TransactionType::CreditPaid => "CREDIT_PAID",
            TransactionType::CreditFree => "CREDIT_FREE",
            TransactionType::Debit => "DEBIT",
            TransactionType::Hold => "HOLD",
            TransactionType::Tip => "TIP",
        }
    }

    /// Parse a wire string; unknown values are an input error.
    pub fn parse(s: &str) -> Result<Self, LedgerError> {
        match s {
            "CREDIT_PAID" => Ok(TransactionType::CreditPaid),
            "CREDIT_FREE" => Ok(TransactionType::CreditFree),
            "DEBIT" => Ok(TransactionType::Debit),
            "HOLD" => Ok(TransactionType::Hold),
            "TIP" => Ok(TransactionType::Tip),
            other => Err(LedgerError::InvalidTransactionType(other.to_string())),
        }
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_wire_str())
    }
}

// ── HoldState ────────────────────────────────────────────────────────────────

/// Lifecycle state of a `HOLD` row. Exact lowercase strings on the wire.
/// Transitions: `open → captured` or `open → reversed`, both terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HoldState {
    Open,
    Captured,
    Reversed,
}

impl HoldState {
    pub fn as_wire_str(&self) -> &'static str {
        match self {
            HoldState::Open => "open",
            HoldState::Captured => "captured",
            HoldState::Reversed => "reversed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "open" => Some(HoldState::Open),
            "captured" => Some(HoldState::Captured),
            "reversed" => Some(HoldState::Reversed),
            _ => None,
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, HoldState::Open)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_open()
    }
}

impl fmt::Display for HoldState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_wire_str())
    }
}

// ── Transaction ──────────────────────────────────────────────────────────────

/// One persisted ledger record.
///
/// For `DEBIT`/`TIP`/`HOLD` rows, `amount` is the paid portion only; the
/// free-bucket portions live in `free_beneficiary_consumed` and
/// `free_system_consumed`, and the three always sum to the caller's
/// requested spend at write time.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub id: TransactionId,
    pub user_id: String,
    pub beneficiary_id: String,
    pub transaction_type: TransactionType,
    pub amount: Amount,
    pub purpose: String,
    pub ref_id: String,
    /// ISO instant; the far-future sentinel means "never expires".
    pub expires_at: String,
    pub created_at: String,
    /// Opaque JSON string. The engine reads/writes only `auditTrail` and the
    /// breakdown fields; everything else passes through verbatim.
    pub metadata: String,
    #[serde(default = "default_version")]
    pub version: Version,
    /// Present only on `HOLD` rows; null everywhere else.
    #[serde(default)]
    pub state: Option<HoldState>,
    #[serde(default)]
    pub free_beneficiary_consumed: Amount,
    #[serde(default)]
    pub free_system_consumed: Amount,
}

impl Transaction {
    pub fn is_hold(&self) -> bool {
        self.transaction_type == TransactionType::Hold
    }

    /// Total the caller asked to spend when this row was written.
    pub fn requested_amount(&self) -> Amount {
        self.amount + self.free_beneficiary_consumed + self.free_system_consumed
    }

    /// Parse the metadata string. `None` when absent or malformed — metadata
    /// parse failures never fail a read path, the raw string stays available.
    pub fn metadata_value(&self) -> Option<serde_json::Value> {
        if self.metadata.is_empty() {
            return None;
        }
        serde_json::from_str(&self.metadata).ok()
    }

    /// Typed view of the hold audit trail; empty when absent or malformed.
    pub fn audit_trail(&self) -> Vec<AuditEntry> {
        self.metadata_value()
            .and_then(|v| v.get("auditTrail").cloned())
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default()
    }
}

// ── NewTransaction ───────────────────────────────────────────────────────────

/// Write request accepted by the transaction writer. Optional fields default
/// per the writer's normalization rules.
#[derive(Clone, Debug)]
pub struct NewTransaction {
    pub user_id: String,
    pub beneficiary_id: Option<String>,
    pub transaction_type: TransactionType,
    pub amount: Amount,
    pub purpose: Option<String>,
    pub ref_id: Option<String>,
    pub expires_at: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub state: Option<HoldState>,
    pub free_beneficiary_consumed: Amount,
    pub free_system_consumed: Amount,
}

impl NewTransaction {
    pub fn new<S: Into<String>>(user_id: S, transaction_type: TransactionType, amount: Amount) -> Self {
        Self {
            user_id: user_id.into(),
            beneficiary_id: None,
            transaction_type,
            amount,
            purpose: None,
            ref_id: None,
            expires_at: None,
            metadata: None,
            state: None,
            free_beneficiary_consumed: 0,
            free_system_consumed: 0,
        }
    }
}

// ── Audit trail ──────────────────────────────────────────────────────────────

/// Audit status verbs carried in hold audit entries.
pub mod audit_status {
    pub const HOLD: &str = "HOLD";
    pub const CAPTURED: &str = "CAPTURED";
    pub const REVERSED: &str = "REVERSED";
    pub const EXTENDED: &str = "EXTENDED";
}

/// Audit action labels carried in hold audit entries.
pub mod audit_action {
    pub const HOLD_CREATED: &str = "Token hold created";
    pub const CAPTURED: &str = "Held tokens captured";
    pub const REVERSED: &str = "Held tokens reversed";
    pub const EXTENDED: &str = "Hold expiry extended";
}

/// Split of a spend across the three sources, as recorded in metadata.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpendBreakdown {
    pub beneficiary_specific_free: Amount,
    pub system_free: Amount,
    pub paid: Amount,
}

/// Breakdown recorded on the hold-created audit entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HoldBreakdown {
    pub beneficiary_free_consumed: Amount,
    pub system_free_consumed: Amount,
    pub paid_portion_held: Amount,
}

/// One append-only entry in a hold's `auditTrail`. Exactly one entry is
/// appended per successful state transition or extension; failed conditional
/// updates append nothing.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub timestamp: String,
    pub action: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub breakdown: Option<HoldBreakdown>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hold_expires_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry_after_seconds: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extended_by_seconds: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_expires_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_expires_at: Option<String>,
}
