//! Accountant-facing facade
//!
//! Relays a transport call to the engine and its outcome back, unchanged.
//! Holds no state of its own.

use crate::{Error, Ledger};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Structured error returned over the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReply {
    /// Error kind name, e.g. `QuantityMismatch`
    pub kind: String,
    /// Stable numeric code
    pub code: u16,
    /// Human-readable message
    pub message: String,
}

impl From<&Error> for ErrorReply {
    fn from(err: &Error) -> Self {
        Self {
            kind: err.kind().as_str().to_string(),
            code: err.code(),
            message: err.to_string(),
        }
    }
}

/// Methods exported to accountants
#[derive(Debug, Clone)]
pub struct AccountantExport {
    ledger: Ledger,
}

impl AccountantExport {
    /// Wrap an engine
    pub fn new(ledger: Ledger) -> Self {
        Self { ledger }
    }

    /// Forward a variadic list of postings as one batch
    pub async fn post(&self, postings: Vec<Value>) -> Result<bool, ErrorReply> {
        self.ledger
            .post_json(&postings)
            .await
            .map(|()| true)
            .map_err(|e| ErrorReply::from(&e))
    }

    /// Liveness probe for the watchdog
    pub fn ping(&self) -> &'static str {
        "pong"
    }

    /// Engine metrics in Prometheus text format
    pub fn metrics(&self) -> Result<String, ErrorReply> {
        self.ledger.metrics().export().map_err(|e| {
            tracing::error!(error = %e, "Failed to encode metrics");
            ErrorReply::from(&Error::Internal("metrics unavailable".to_string()))
        })
    }
}
