//! tokenledger-sweeper — background hygiene for the token registry.
//!
//! Two sweepers, both idempotent and safe to cancel mid-batch (every write
//! is a single conditional row update or an archive-then-delete pair):
//!
//! - [`expiry::ExpirySweeper`] reverses holds whose deadline passed without
//!   a capture.
//! - [`retention::RetentionSweeper`] archives and deletes records past the
//!   retention threshold, under a wall-clock budget.

pub mod expiry;
pub mod retention;

pub use expiry::{ExpirySweeper, FindExpiredResult, ProcessExpiredSummary, SweepFailure};
pub use retention::{PurgeOptions, PurgeSummary, RetentionSweeper};
