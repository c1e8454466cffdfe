use serde::{Deserialize, Serialize};
use std::fmt;

/// Token amount in whole tokens. Request amounts are validated non-negative;
/// projected balances may go negative under the documented read-modify-write
/// race, so the signed width is deliberate.
pub type Amount = i64;

/// Record version. 1 for immutable rows; incremented on every in-place hold
/// mutation and used as the conditional-write guard.
pub type Version = u32;

// ── TransactionId ────────────────────────────────────────────────────────────

/// Unique identifier of one ledger record: 16 random bytes, hex-encoded.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransactionId(pub String);

impl TransactionId {
    pub fn new<S: Into<String>>(s: S) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TransactionId({})", self.0)
    }
}

impl From<&str> for TransactionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TransactionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}
