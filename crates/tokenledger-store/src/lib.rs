//! tokenledger-store — narrow storage surface for the token registry.
//!
//! [`gateway::RegistryStore`] is the only store API the engine sees:
//! `put`, `get`, `query` over the secondary indexes, `update_conditional`,
//! `delete` and paginated `scan`. [`sled_store::RegistryDb`] implements it
//! over sled trees; conditional updates are compare-and-swap over the
//! serialized record, so a concurrent mutation fails the swap exactly when
//! the guarded row changed.

pub mod gateway;
pub mod sled_store;

pub use gateway::{IndexQuery, QueryOptions, RegistryStore, ScanPage, StoreError, UpdateCondition};
pub use sled_store::RegistryDb;
