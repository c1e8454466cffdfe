use thiserror::Error;

use crate::types::Amount;

/// Error-sink codes that are not carried by a [`LedgerError`] variant:
/// integrity signals are reported without failing the caller, and
/// infrastructure codes scope a wrapped storage failure to the operation
/// that hit it.
pub mod codes {
    // Integrity (diagnostic only)
    pub const HOLD_MISSING_STATE: &str = "HOLD_MISSING_STATE";
    pub const EXPIRED_HOLD_MISSING_STATE: &str = "EXPIRED_HOLD_MISSING_STATE";

    // Infrastructure, per operation
    pub const ADD_TRANSACTION_ERROR: &str = "ADD_TRANSACTION_ERROR";
    pub const GET_USER_BALANCE_ERROR: &str = "GET_USER_BALANCE_ERROR";
    pub const GET_TOKEN_SUMMARY_ERROR: &str = "GET_TOKEN_SUMMARY_ERROR";
    pub const DEDUCT_TOKENS_ERROR: &str = "DEDUCT_TOKENS_ERROR";
    pub const TRANSFER_TOKENS_ERROR: &str = "TRANSFER_TOKENS_ERROR";
    pub const HOLD_TOKENS_ERROR: &str = "HOLD_TOKENS_ERROR";
    pub const CAPTURE_HELD_TOKENS_ERROR: &str = "CAPTURE_HELD_TOKENS_ERROR";
    pub const REVERSE_HELD_TOKENS_ERROR: &str = "REVERSE_HELD_TOKENS_ERROR";
    pub const EXTEND_EXPIRY_ERROR: &str = "EXTEND_EXPIRY_ERROR";
    pub const ADJUST_USER_TOKENS_ERROR: &str = "ADJUST_USER_TOKENS_ERROR";
    pub const FIND_EXPIRED_HOLDS_ERROR: &str = "FIND_EXPIRED_HOLDS_ERROR";
    pub const PROCESS_EXPIRED_HOLDS_ERROR: &str = "PROCESS_EXPIRED_HOLDS_ERROR";
    pub const PURGE_OLD_REGISTRY_RECORDS_ERROR: &str = "PURGE_OLD_REGISTRY_RECORDS_ERROR";
    pub const GET_TRANSACTION_HISTORY_ERROR: &str = "GET_TRANSACTION_HISTORY_ERROR";
    pub const GET_EXPIRING_TOKENS_ERROR: &str = "GET_EXPIRING_TOKENS_ERROR";
    pub const GET_TIPS_ERROR: &str = "GET_TIPS_ERROR";
    pub const GET_USER_EARNINGS_ERROR: &str = "GET_USER_EARNINGS_ERROR";
    pub const GET_SPENDING_BY_REF_ERROR: &str = "GET_SPENDING_BY_REF_ERROR";
    pub const GET_TRANSACTION_ERROR: &str = "GET_TRANSACTION_ERROR";
}

#[derive(Debug, Error)]
pub enum LedgerError {
    // ── Input errors ─────────────────────────────────────────────────────────
    #[error("userId is required")]
    MissingUserId,

    #[error("unknown transaction type: {0}")]
    InvalidTransactionType(String),

    #[error("amount must be a non-negative integer; got {amount}")]
    NegativeAmount { amount: Amount },

    #[error("amount must be a positive integer; got {amount}")]
    InvalidAmount { amount: Amount },

    #[error("a transactionId or refId is required")]
    MissingIdentifier,

    #[error("beneficiaryId is required")]
    MissingBeneficiary,

    #[error("sender and beneficiary must differ")]
    SelfTransfer,

    #[error("hold timeout must be between {min} and {max} seconds; got {seconds}")]
    InvalidHoldTimeout { seconds: i64, min: i64, max: i64 },

    #[error("not a valid ISO-8601 instant: {0}")]
    InvalidInstant(String),

    // ── Business errors ──────────────────────────────────────────────────────
    #[error("insufficient tokens: need {need}, have {have} usable")]
    InsufficientTokens { need: Amount, have: Amount },

    #[error("insufficient paid tokens: need {need}, have {have}")]
    InsufficientPaidTokens { need: Amount, have: Amount },

    #[error("an open hold already exists for refId {0}")]
    DuplicateHoldRefId(String),

    #[error("hold {0} is already captured")]
    AlreadyCaptured(String),

    #[error("hold {0} is already reversed")]
    AlreadyReversed(String),

    #[error("hold {0} was already captured or reversed")]
    AlreadyProcessed(String),

    #[error("No held tokens found for {0}")]
    NoHeldTokens(String),

    #[error("transaction not found: {0}")]
    TransactionNotFound(String),

    #[error(
        "extension rejected: total duration would reach {would_be_secs}s, \
         exceeding maximum of {max_total_secs}s"
    )]
    ExceedsMaxDuration {
        would_be_secs: i64,
        max_total_secs: i64,
    },

    // ── Infrastructure ───────────────────────────────────────────────────────
    #[error("metadata is not serializable: {0}")]
    MetadataSerialization(String),

    #[error("failed to extend hold expiry: {0}")]
    ExtendExpiry(String),

    #[error("storage failure during {op}: {message}")]
    Storage {
        op: &'static str,
        code: &'static str,
        message: String,
    },
}

impl LedgerError {
    /// Taxonomy code reported alongside this error to the error sink.
    pub fn code(&self) -> &'static str {
        use LedgerError::*;
        match self {
            MissingUserId | NegativeAmount { .. } | SelfTransfer | InvalidInstant(_) => {
                "INVALID_TRANSACTION_PAYLOAD"
            }
            InvalidTransactionType(_) => "INVALID_TRANSACTION_TYPE",
            InvalidAmount { .. } => "INVALID_AMOUNT",
            MissingIdentifier | MissingBeneficiary => "MISSING_IDENTIFIER",
            InvalidHoldTimeout { .. } => "INVALID_HOLD_TIMEOUT",
            InsufficientTokens { .. } => "INSUFFICIENT_TOKENS",
            InsufficientPaidTokens { .. } => "INSUFFICIENT_PAID_TOKENS",
            DuplicateHoldRefId(_) => "DUPLICATE_HOLD_REFID",
            AlreadyCaptured(_) => "ALREADY_CAPTURED",
            AlreadyReversed(_) => "ALREADY_REVERSED",
            AlreadyProcessed(_) => "ALREADY_PROCESSED",
            NoHeldTokens(_) => "NO_HELD_TOKENS",
            TransactionNotFound(_) => "TRANSACTION_NOT_FOUND",
            ExceedsMaxDuration { .. } | ExtendExpiry(_) => codes::EXTEND_EXPIRY_ERROR,
            MetadataSerialization(_) => codes::ADD_TRANSACTION_ERROR,
            Storage { code, .. } => code,
        }
    }
}
