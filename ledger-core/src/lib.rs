//! Exchange Ledger Core
//!
//! Atomic posting-commit engine for a double-entry exchange ledger.
//!
//! # Architecture
//!
//! - **Posting groups**: postings sharing a uid are correlated before any check runs
//! - **Per-uid serialization**: one commit attempt per uid at a time, distinct uids in parallel
//! - **Atomic commit**: postings and journal land in one RocksDB write batch or not at all
//! - **Single outcome**: every contributing caller receives the same result exactly once
//!
//! # Invariants
//!
//! - Value conservation: Σ(credits) == Σ(debits) for every journal
//! - Completeness: a group is validated only once its declared count is reached
//! - Liveness: every submitted posting eventually gets exactly one answer

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, missing_debug_implementations)]

pub mod config;
pub mod error;
pub mod export;
pub mod group;
pub mod ledger;
pub mod metrics;
pub mod rpc;
pub mod schema;
pub mod storage;
pub mod types;

// Re-exports
pub use config::Config;
pub use error::{Error, ErrorKind, Result, StoreError};
pub use export::{AccountantExport, ErrorReply};
pub use group::{PostingGroup, Waiter};
pub use ledger::Ledger;
pub use metrics::Metrics;
pub use storage::{RocksStore, Store, StoreTransaction, TransactionScope};
pub use types::{Direction, Journal, JournalHeader, Posting, PostingRecord};
