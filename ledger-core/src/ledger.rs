//! Posting-commit engine
//!
//! Postings for one transaction arrive piecemeal from independent callers.
//! The engine correlates them by uid into a [`PostingGroup`], and once the
//! group is complete validates and commits it as one atomic unit, handing
//! the single outcome to every caller that contributed a posting.
//!
//! # Concurrency
//!
//! ```text
//!   post(batch) ──► post_one(posting) ──► pending: DashMap<uid, Arc<Mutex<PostingGroup>>>
//!                                              │
//!                         per-uid lock ────────┤ add → ready? → commit task → atomic_commit (blocking pool)
//!                                              │                                  │
//!                         timer task ──────────┘                       succeed / fail → remove(uid)
//! ```
//!
//! Everything touching one group (add, ready check, commit, fan-out,
//! removal) runs under that group's mutex. Commit, fan-out and removal run
//! in a spawned task holding the owned guard, detached from the caller
//! whose posting completed the group. Distinct uids only share the
//! map's shard locks, which are never held across an await.
//!
//! A group removed after success, failure or timeout is never revived: a
//! posting that finds its group already resolved retries and lands in a
//! fresh group for the same uid.
//!
//! # Example
//!
//! ```no_run
//! use ledger_core::{Ledger, Metrics, RocksStore, Config};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::default();
//!     let store = Arc::new(RocksStore::open(&config)?);
//!     let ledger = Ledger::new(store, config.group_timeout(), Metrics::new()?);
//!
//!     // let outcome = ledger.post(postings).await;
//!     Ok(())
//! }
//! ```

use crate::{
    error::StoreError,
    group::{PostingGroup, Waiter},
    schema,
    storage::{Store, TransactionScope},
    types::{now_micros, Journal, Posting, PostingRecord},
    Error, Metrics, Result,
};
use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex};
use tokio::time::{Duration, Instant};
use uuid::Uuid;

type GroupSlot = Arc<Mutex<PostingGroup>>;

/// Main ledger interface
#[derive(Clone)]
pub struct Ledger {
    inner: Arc<LedgerInner>,
}

struct LedgerInner {
    /// Persistence collaborator
    store: Arc<dyn Store>,

    /// In-flight groups; the only shared mutable state
    pending: DashMap<String, GroupSlot>,

    /// Deadline extension granted by each new posting
    group_timeout: Option<Duration>,

    /// Metrics
    metrics: Metrics,
}

impl Ledger {
    /// Create an engine over `store`
    pub fn new(store: Arc<dyn Store>, group_timeout: Option<Duration>, metrics: Metrics) -> Self {
        Self {
            inner: Arc::new(LedgerInner {
                store,
                pending: DashMap::new(),
                group_timeout,
                metrics,
            }),
        }
    }

    /// Metrics
    pub fn metrics(&self) -> &Metrics {
        &self.inner.metrics
    }

    /// Number of groups waiting for postings
    pub fn pending_groups(&self) -> usize {
        self.inner.pending.len()
    }

    /// Whether a group for `uid` is currently in flight
    pub fn is_pending(&self, uid: &str) -> bool {
        self.inner.pending.contains_key(uid)
    }

    /// Decode and submit a raw batch
    pub async fn post_json(&self, raw: &[Value]) -> Result<()> {
        let postings = schema::decode_batch(raw)?;
        self.post(postings).await
    }

    /// Submit one caller's batch and wait for the transaction outcome
    ///
    /// A batch may carry only part of a transaction. All of its postings
    /// share a uid and so resolve together; the outcome of the first is
    /// returned for the whole call.
    pub async fn post(&self, postings: Vec<Posting>) -> Result<()> {
        let Some(first) = postings.first() else {
            tracing::error!("Received empty argument list");
            return Err(Error::Argument("empty batch".to_string()));
        };

        for (index, posting) in postings.iter().enumerate() {
            if let Err(reason) = schema::validate_posting(posting) {
                tracing::error!(index, ?posting, %reason, "Received improperly formatted posting");
                return Err(Error::Argument(format!("posting {}: {}", index, reason)));
            }
        }

        let uid = first.uid.clone();
        if postings.iter().any(|p| p.uid != uid) {
            tracing::error!(%uid, "Batch postings have mixed uids");
            return Err(Error::UidMismatch);
        }

        let submitted_at = now_micros();
        let mut waiters = Vec::with_capacity(postings.len());
        for mut posting in postings {
            if posting.timestamp.is_none() {
                posting.timestamp = Some(submitted_at);
            }
            waiters.push(self.post_one(posting).await);
        }

        match waiters.into_iter().next() {
            Some(waiter) => waiter.wait().await,
            None => Err(Error::Internal("batch produced no waiters".to_string())),
        }
    }

    /// Add one posting to its group, starting the commit if the group is now complete
    pub async fn post_one(&self, posting: Posting) -> Waiter {
        let uid = posting.uid.clone();

        loop {
            let slot = self.inner.slot_for(&uid);
            let mut group = slot.clone().lock_owned().await;

            if group.is_resolved() {
                // Lost a race with commit or timeout; start over in a fresh group
                drop(group);
                self.inner.remove_slot(&uid, &slot);
                continue;
            }

            let waiter = group.add(posting);
            self.inner.metrics.record_posting();
            tracing::debug!(%uid, received = group.postings().len(), "Posting added to group");

            // Do not check consistency before the group is complete
            if group.is_ready() {
                // The commit task owns the lock, so a caller dropping this
                // future cannot strand the group between commit and fan-out
                let inner = self.inner.clone();
                tokio::spawn(async move { inner.commit_group(&slot, &mut group).await });
            } else if let Some(disarmed) = group.take_timer() {
                tokio::spawn(run_timer(self.inner.clone(), uid, slot, disarmed));
            }

            return waiter;
        }
    }
}

impl std::fmt::Debug for Ledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ledger")
            .field("pending_groups", &self.inner.pending.len())
            .field("group_timeout", &self.inner.group_timeout)
            .finish()
    }
}

impl LedgerInner {
    /// Existing group for `uid`, or a new one
    fn slot_for(&self, uid: &str) -> GroupSlot {
        let slot = self
            .pending
            .entry(uid.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(PostingGroup::new(uid, self.group_timeout))))
            .clone();
        self.metrics.set_pending_groups(self.pending.len());
        slot
    }

    /// Remove `slot` if it is still the live group for `uid`
    fn remove_slot(&self, uid: &str, slot: &GroupSlot) {
        self.pending.remove_if(uid, |_, live| Arc::ptr_eq(live, slot));
        self.metrics.set_pending_groups(self.pending.len());
    }

    /// Validate and commit a complete group, retire its slot, then deliver
    /// the outcome
    async fn commit_group(&self, slot: &GroupSlot, group: &mut PostingGroup) {
        let postings = group.postings().to_vec();
        let store = self.store.clone();
        let started = std::time::Instant::now();

        let result = tokio::task::spawn_blocking(move || atomic_commit(store.as_ref(), &postings))
            .await
            .unwrap_or_else(|e| Err(Error::Internal(format!("commit task failed: {}", e))));

        self.metrics.record_commit(
            result.as_ref().map(|_| ()).map_err(Error::kind),
            started.elapsed().as_secs_f64(),
        );

        // Waiters never observe their uid still pending
        self.remove_slot(group.uid(), slot);

        match result {
            Ok(journal) => {
                tracing::info!(
                    uid = %group.uid(),
                    journal_id = %journal.journal_id,
                    journal_type = %journal.journal_type,
                    postings = journal.postings.len(),
                    "Journal committed"
                );
                group.succeed();
            }
            Err(error) => {
                tracing::error!(
                    uid = %group.uid(),
                    kind = error.kind().as_str(),
                    code = error.code(),
                    %error,
                    "Commit failed"
                );
                group.log_postings();
                group.fail(error);
            }
        }
    }
}

/// Expire the group at `slot` once its deadline passes without a new posting
async fn run_timer(
    inner: Arc<LedgerInner>,
    uid: String,
    slot: GroupSlot,
    mut disarmed: oneshot::Receiver<()>,
) {
    loop {
        let deadline = {
            let group = slot.lock().await;
            match group.deadline() {
                Some(deadline) if !group.is_resolved() => deadline,
                _ => return,
            }
        };

        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => {}
            _ = &mut disarmed => return,
        }

        let mut group = slot.lock().await;
        if group.is_resolved() {
            return;
        }

        // A posting may have rearmed the deadline while we slept
        if group.deadline().is_some_and(|d| d <= Instant::now()) {
            inner.remove_slot(&uid, &slot);
            inner.metrics.record_timeout();
            group.expire();
            return;
        }
    }
}

/// Check that a complete group may be committed
///
/// In order: shared type, shared count, credits equal debits.
pub fn check_consistency(postings: &[Posting]) -> Result<()> {
    let first = postings
        .first()
        .ok_or_else(|| Error::Internal("no postings to commit".to_string()))?;

    if postings.iter().any(|p| p.posting_type != first.posting_type) {
        return Err(Error::TypeMismatch);
    }

    if postings.iter().any(|p| p.count != first.count) {
        return Err(Error::CountMismatch);
    }

    let net: i128 = postings.iter().map(Posting::signed_quantity).sum();
    if net != 0 {
        return Err(Error::QuantityMismatch);
    }

    Ok(())
}

/// Validate `postings` and persist them with their journal in one transaction
///
/// The transaction is rolled back on every path that does not reach commit.
pub fn atomic_commit(store: &dyn Store, postings: &[Posting]) -> Result<Journal> {
    check_consistency(postings)?;

    let mut scope = TransactionScope::begin(store).map_err(storage_error)?;

    let journal_id = Uuid::now_v7();
    let now = Utc::now();

    let mut records = Vec::with_capacity(postings.len());
    for posting in postings {
        let user = scope.resolve_user(&posting.username).map_err(storage_error)?;
        let contract = scope
            .resolve_contract(&posting.contract)
            .map_err(storage_error)?;
        records.push(PostingRecord::resolve(posting, journal_id, &user, &contract, now));
    }

    let journal = Journal {
        journal_id,
        journal_type: postings[0].posting_type.clone(),
        timestamp: now,
        postings: records,
    };

    scope.insert_postings(&journal.postings).map_err(storage_error)?;
    scope.insert_journal(&journal.header()).map_err(storage_error)?;
    scope.commit().map_err(storage_error)?;

    Ok(journal)
}

/// Log the storage detail that the caller-visible error hides
fn storage_error(err: StoreError) -> Error {
    if matches!(err, StoreError::Operational(_) | StoreError::Serialization(_)) {
        tracing::error!(error = %err, "Storage failure during commit");
    }
    err.into()
}
