//! tokenledger-engine — the ledger engine proper.
//!
//! Every public operation follows the same shape: validate inputs, read
//! current state (a balance projection or a single record), compute the
//! change, write through the store gateway, return a DTO. The engine holds
//! no in-process locks; concurrent hold mutations are arbitrated by the
//! store's conditional update on `(version, state)`.
//!
//! Balance reads are eventually consistent and the deduct/transfer/hold
//! paths perform read-modify-write at the user-aggregate level without a
//! store transaction: two concurrent spends can both pass the sufficiency
//! check. Balances are projections, so operators can detect the condition
//! after the fact; hold creation by refId is the one place with an
//! interlock (the duplicate-refId existence check).

use std::sync::Arc;

use serde_json::Value;

use tokenledger_core::error::LedgerError;
use tokenledger_core::time::{Clock, SystemClock};
use tokenledger_store::{RegistryStore, StoreError};

pub mod balance;
pub mod hold;
pub mod query;
pub mod sink;
pub mod spend;
pub mod split;
pub mod writer;

pub use balance::Balance;
pub use hold::{CaptureSummary, ExtendRequest, HoldOptions, HoldSelector, ReverseSummary};
pub use query::{Earnings, ExpiringTokensWarning, SpendingByRef, TokenSummary};
pub use sink::{ErrorSink, TracingErrorSink};
pub use split::SplitPlan;
pub use spend::{DeductOptions, TransferOptions};

/// The ledger engine: all public token operations hang off this.
pub struct LedgerEngine {
    store: Arc<dyn RegistryStore>,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn ErrorSink>,
}

impl LedgerEngine {
    pub fn new(store: Arc<dyn RegistryStore>) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            sink: Arc::new(TracingErrorSink),
        }
    }

    /// Replace the wall clock (tests pin time this way).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the error sink collaborator.
    pub fn with_sink(mut self, sink: Arc<dyn ErrorSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn store(&self) -> &Arc<dyn RegistryStore> {
        &self.store
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    pub fn sink(&self) -> &dyn ErrorSink {
        self.sink.as_ref()
    }

    /// Report `err` to the error sink and hand it back for propagation.
    /// Every public operation funnels its failures through here so the sink
    /// always sees the taxonomy code next to the human-readable message.
    pub(crate) fn fail(&self, err: LedgerError, context: Value) -> LedgerError {
        self.sink.add_error(&err.to_string(), err.code(), &context);
        err
    }

    /// Wrap a store failure in the reporting code of the operation that hit
    /// it. The underlying message is preserved and propagated.
    pub(crate) fn storage_failure(
        &self,
        op: &'static str,
        code: &'static str,
        source: StoreError,
        context: Value,
    ) -> LedgerError {
        self.fail(
            LedgerError::Storage { op, code, message: source.to_string() },
            context,
        )
    }
}
