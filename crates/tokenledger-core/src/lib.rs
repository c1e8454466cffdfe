//! tokenledger-core — shared domain types for the token ledger.
//!
//! The ledger is append-only at the transaction grain: every balance change
//! is one immutable [`transaction::Transaction`] row, balances are
//! projections over a user's stream, and holds are the only records that
//! mutate in place (under optimistic concurrency, see the engine crate).

pub mod constants;
pub mod error;
pub mod id;
pub mod time;
pub mod transaction;
pub mod types;
