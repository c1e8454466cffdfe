//! ─── Token Ledger Constants ─────────────────────────────────────────────────
//!
//! Shared fixed values: the system beneficiary bucket, the far-future expiry
//! sentinel, hold timeout bounds, purge defaults and the store tree names.

// ── Beneficiary buckets ──────────────────────────────────────────────────────

/// Well-known beneficiary id for non-creator-specific free grants.
/// Case-sensitive; all bucket lookups compare exactly.
pub const SYSTEM_BENEFICIARY_ID: &str = "system";

// ── Expiry ───────────────────────────────────────────────────────────────────

/// ISO instant treated as "never expires". Kept byte-identical to the value
/// already present on disk so old records keep folding correctly.
pub const FAR_FUTURE_EXPIRY: &str = "9999-12-31T23:59:59.999Z";

// ── Holds ────────────────────────────────────────────────────────────────────

/// Minimum hold lifetime in seconds.
pub const HOLD_TIMEOUT_MIN_SECS: i64 = 300;

/// Maximum hold lifetime in seconds.
pub const HOLD_TIMEOUT_MAX_SECS: i64 = 3_600;

/// Default hold lifetime when the caller does not specify one.
pub const HOLD_TIMEOUT_DEFAULT_SECS: i64 = 1_800;

// ── Retention ────────────────────────────────────────────────────────────────

/// Records older than this many days are purge candidates.
pub const PURGE_DEFAULT_OLDER_THAN_DAYS: i64 = 365;

/// Maximum rows examined per purge pass.
pub const PURGE_DEFAULT_LIMIT: usize = 1_000;

/// Purge runs as a dry run unless explicitly told otherwise.
pub const PURGE_DEFAULT_DRY_RUN: bool = true;

/// Purge archives before deleting unless explicitly told otherwise.
pub const PURGE_DEFAULT_ARCHIVE: bool = true;

// ── Sweeper ──────────────────────────────────────────────────────────────────

/// Maximum expired holds returned per sweep query.
pub const SWEEP_DEFAULT_LIMIT: usize = 1_000;

// ── Store tables ─────────────────────────────────────────────────────────────

/// Primary record table.
pub const TOKEN_REGISTRY_TABLE: &str = "token_registry";

/// Archive table populated by the retention sweeper before deletion.
pub const TOKEN_REGISTRY_ARCHIVE_TABLE: &str = "token_registry_archive";

// ── Secondary indexes ────────────────────────────────────────────────────────

pub const INDEX_USER_CREATED: &str = "idx_user_created";
pub const INDEX_BENEFICIARY_CREATED: &str = "idx_beneficiary_created";
pub const INDEX_USER_REF: &str = "idx_user_ref";
pub const INDEX_REF_STATE: &str = "idx_ref_state";
pub const INDEX_REF_TYPE: &str = "idx_ref_type";
pub const INDEX_USER_EXPIRES: &str = "idx_user_expires";

/// Global view of all records ordered by `expiresAt`, used by the expiry
/// sweeper instead of fanning out per user.
pub const INDEX_EXPIRES: &str = "idx_expires";

// ── Ref defaults ─────────────────────────────────────────────────────────────

/// Prefix for the auto-filled `refId` of records written without one.
pub const NO_REF_PREFIX: &str = "no_ref_";
