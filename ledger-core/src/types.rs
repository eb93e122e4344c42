//! Core types for the ledger
//!
//! Quantities are unsigned integers in the smallest unit of the contract, so
//! the balance check is exact integer arithmetic.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Side of a posting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Value leaves the account
    Debit,
    /// Value enters the account
    Credit,
}

impl Direction {
    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Debit => "debit",
            Direction::Credit => "credit",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One leg of a transaction, as submitted by an accountant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Posting {
    /// Transaction correlation id
    pub uid: String,

    /// Declared total number of postings in the transaction
    pub count: u32,

    /// Transaction category; shared by all postings of a transaction
    #[serde(rename = "type")]
    pub posting_type: String,

    /// Account owner
    pub username: String,

    /// Contract ticker
    pub contract: String,

    /// Quantity in the contract's smallest unit
    pub quantity: u64,

    /// Debit or credit
    pub direction: Direction,

    /// Free text
    #[serde(default)]
    pub note: Option<String>,

    /// Microseconds since Unix epoch
    #[serde(default)]
    pub timestamp: Option<i64>,
}

impl Posting {
    /// Build a posting stamped with the current time unless `timestamp` is
    /// given. `uid` and `count` are attached with [`Posting::with_uid`].
    pub fn new(
        posting_type: impl Into<String>,
        username: impl Into<String>,
        contract: impl Into<String>,
        quantity: u64,
        direction: Direction,
        note: Option<String>,
        timestamp: Option<i64>,
    ) -> Self {
        Self {
            uid: String::new(),
            count: 1,
            posting_type: posting_type.into(),
            username: username.into(),
            contract: contract.into(),
            quantity,
            direction,
            note,
            timestamp: Some(timestamp.unwrap_or_else(now_micros)),
        }
    }

    /// Attach transaction correlation id and declared count
    pub fn with_uid(mut self, uid: impl Into<String>, count: u32) -> Self {
        self.uid = uid.into();
        self.count = count;
        self
    }

    /// Signed contribution to the balance check (credits positive)
    pub fn signed_quantity(&self) -> i128 {
        match self.direction {
            Direction::Credit => self.quantity as i128,
            Direction::Debit => -(self.quantity as i128),
        }
    }
}

/// Current time in microseconds since Unix epoch
pub fn now_micros() -> i64 {
    Utc::now().timestamp_micros()
}

/// Registered account owner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    /// Stable id
    pub user_id: Uuid,
    /// Login name
    pub username: String,
}

/// Registered instrument
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractRecord {
    /// Stable id
    pub contract_id: Uuid,
    /// Ticker
    pub ticker: String,
}

/// Durable posting, resolved against users and contracts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostingRecord {
    /// Unique posting id (UUIDv7 for time-ordering)
    pub posting_id: Uuid,

    /// Journal this posting belongs to
    pub journal_id: Uuid,

    /// Resolved user
    pub user_id: Uuid,

    /// Username at commit time
    pub username: String,

    /// Resolved contract
    pub contract_id: Uuid,

    /// Ticker at commit time
    pub ticker: String,

    /// Quantity
    pub quantity: u64,

    /// Direction
    pub direction: Direction,

    /// Note
    pub note: Option<String>,

    /// Posting timestamp
    pub timestamp: DateTime<Utc>,
}

impl PostingRecord {
    /// Resolve a submitted posting into a durable record
    pub fn resolve(
        posting: &Posting,
        journal_id: Uuid,
        user: &UserRecord,
        contract: &ContractRecord,
        fallback: DateTime<Utc>,
    ) -> Self {
        let timestamp = posting
            .timestamp
            .and_then(DateTime::from_timestamp_micros)
            .unwrap_or(fallback);

        Self {
            posting_id: Uuid::now_v7(),
            journal_id,
            user_id: user.user_id,
            username: user.username.clone(),
            contract_id: contract.contract_id,
            ticker: contract.ticker.clone(),
            quantity: posting.quantity,
            direction: posting.direction,
            note: posting.note.clone(),
            timestamp,
        }
    }
}

/// Journal header as written by `insert_journal`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalHeader {
    /// Unique journal id (UUIDv7)
    pub journal_id: Uuid,

    /// Transaction type
    pub journal_type: String,

    /// Commit timestamp
    pub timestamp: DateTime<Utc>,

    /// Postings in submission order
    pub posting_ids: Vec<Uuid>,
}

/// Committed transaction; immutable once written
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Journal {
    /// Unique journal id
    pub journal_id: Uuid,

    /// Transaction type
    pub journal_type: String,

    /// Commit timestamp
    pub timestamp: DateTime<Utc>,

    /// Postings in submission order
    pub postings: Vec<PostingRecord>,
}

impl Journal {
    /// Header referencing the postings by id
    pub fn header(&self) -> JournalHeader {
        JournalHeader {
            journal_id: self.journal_id,
            journal_type: self.journal_type.clone(),
            timestamp: self.timestamp,
            posting_ids: self.postings.iter().map(|p| p.posting_id).collect(),
        }
    }

    /// Σ credits − Σ debits
    pub fn net_quantity(&self) -> i128 {
        self.postings
            .iter()
            .map(|p| match p.direction {
                Direction::Credit => p.quantity as i128,
                Direction::Debit => -(p.quantity as i128),
            })
            .sum()
    }
}

impl fmt::Display for Journal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Journal({}, type={}, postings={})",
            self.journal_id,
            self.journal_type,
            self.postings.len()
        )
    }
}
