//! The store gateway trait and its query/error vocabulary.

use thiserror::Error;

use tokenledger_core::transaction::{HoldState, Transaction, TransactionType};
use tokenledger_core::types::{TransactionId, Version};

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum StoreError {
    /// The conditional predicate did not hold against the current row.
    /// Distinguishable by kind per the gateway contract; callers branch on
    /// [`StoreError::is_conditional_check_failed`].
    #[error("ConditionalCheckFailed: the row changed under the condition")]
    ConditionalCheckFailed,

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    pub fn is_conditional_check_failed(&self) -> bool {
        matches!(self, StoreError::ConditionalCheckFailed)
    }
}

// ── Queries ──────────────────────────────────────────────────────────────────

/// One of the secondary-index read paths the engine demands.
#[derive(Clone, Debug)]
pub enum IndexQuery {
    /// All records for a user, ordered by `createdAt`.
    ByUser { user_id: String },
    /// All records naming a beneficiary, ordered by `createdAt`.
    ByBeneficiary { beneficiary_id: String },
    /// Records for a user with a given external correlation id.
    ByUserRef { user_id: String, ref_id: String },
    /// Records with a correlation id in a given hold state. `state: None`
    /// addresses rows with no state at all (corruption candidates).
    ByRefState { ref_id: String, state: Option<HoldState> },
    /// Records with a correlation id of a given type.
    ByRefType { ref_id: String, transaction_type: TransactionType },
    /// A user's records with `expiresAt` inside `[from_iso, to_iso]`.
    ByUserExpiresBetween { user_id: String, from_iso: String, to_iso: String },
    /// Global view: every record with `expiresAt <= cutoff_iso`, ordered by
    /// expiry. Used by the expiry sweeper.
    ByExpiresBefore { cutoff_iso: String },
}

/// Filter and shaping options accompanying any index query.
#[derive(Clone, Debug, Default)]
pub struct QueryOptions {
    pub filter_type: Option<TransactionType>,
    pub filter_state: Option<HoldState>,
    pub limit: Option<usize>,
    /// Reverse the index order (newest first for the createdAt indexes).
    pub newest_first: bool,
}

impl QueryOptions {
    pub fn with_type(transaction_type: TransactionType) -> Self {
        Self { filter_type: Some(transaction_type), ..Self::default() }
    }

    pub fn with_limit(limit: usize) -> Self {
        Self { limit: Some(limit), ..Self::default() }
    }
}

// ── Scan ─────────────────────────────────────────────────────────────────────

/// One page of a primary-table scan. `last_key` feeds the next page; `None`
/// means the table is exhausted.
#[derive(Clone, Debug)]
pub struct ScanPage {
    pub records: Vec<Transaction>,
    pub last_key: Option<TransactionId>,
}

// ── Conditional updates ──────────────────────────────────────────────────────

/// Server-side predicate for an in-place hold mutation: the row must still
/// carry `expected_version` and `expected_state` at write time.
#[derive(Clone, Copy, Debug)]
pub struct UpdateCondition {
    pub expected_version: Version,
    pub expected_state: HoldState,
}

// ── Gateway ──────────────────────────────────────────────────────────────────

/// Narrow surface over the backing store. Everything the engine and the
/// sweepers do goes through these seven calls.
pub trait RegistryStore: Send + Sync {
    /// Persist a new record (unconditional single-row put).
    fn put(&self, tx: &Transaction) -> Result<(), StoreError>;

    /// Fetch one record by primary key.
    fn get(&self, id: &TransactionId) -> Result<Option<Transaction>, StoreError>;

    /// Read from a secondary index, applying `opts` filters and limit.
    fn query(&self, query: &IndexQuery, opts: &QueryOptions) -> Result<Vec<Transaction>, StoreError>;

    /// Replace the row with `updated` only if `condition` still holds.
    /// Fails with [`StoreError::ConditionalCheckFailed`] otherwise.
    fn update_conditional(
        &self,
        updated: &Transaction,
        condition: UpdateCondition,
    ) -> Result<(), StoreError>;

    /// Delete one record by primary key.
    fn delete(&self, id: &TransactionId) -> Result<(), StoreError>;

    /// Page through the primary table. Only the retention sweeper scans;
    /// production read paths must use `query`.
    fn scan(&self, limit: usize, start_after: Option<&TransactionId>) -> Result<ScanPage, StoreError>;

    /// Copy a record into the archive table (retention, archive-before-delete).
    fn put_archive(&self, tx: &Transaction) -> Result<(), StoreError>;
}
