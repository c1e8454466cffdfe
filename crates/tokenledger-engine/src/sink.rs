//! Error sink collaborator.
//!
//! The sink is best-effort by construction: `add_error` is infallible, so a
//! broken sink can never propagate into a caller's result.

use serde_json::Value;
use tracing::error;

/// Receives every reported failure with its taxonomy code and context.
pub trait ErrorSink: Send + Sync {
    fn add_error(&self, message: &str, code: &str, context: &Value);
}

/// Default sink: structured `tracing` error events.
pub struct TracingErrorSink;

impl ErrorSink for TracingErrorSink {
    fn add_error(&self, message: &str, code: &str, context: &Value) {
        error!(flag = "TOKENS", code, context = %context, "{message}");
    }
}
