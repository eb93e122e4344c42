//! End-to-end tests for the posting-commit engine
//!
//! Covers outcome fan-out under concurrency, atomicity against a failing
//! store, group expiry, and the accountant facade.

use ledger_core::{
    error::StoreResult,
    types::{ContractRecord, UserRecord},
    AccountantExport, Config, Direction, Error, JournalHeader, Ledger, Metrics, Posting,
    PostingRecord, RocksStore, Store, StoreError, StoreTransaction,
};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn open_store() -> (Arc<RocksStore>, tempfile::TempDir) {
    let temp_dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.data_dir = temp_dir.path().to_path_buf();

    let store = Arc::new(RocksStore::open(&config).unwrap());
    for user in ["alice", "bob", "carol"] {
        store.register_user(user).unwrap();
    }
    for ticker in ["BTC", "ETH"] {
        store.register_contract(ticker).unwrap();
    }
    (store, temp_dir)
}

fn create_test_ledger(timeout: Option<Duration>) -> (Ledger, Arc<RocksStore>, tempfile::TempDir) {
    let (store, temp_dir) = open_store();
    let ledger = Ledger::new(store.clone(), timeout, Metrics::new().unwrap());
    (ledger, store, temp_dir)
}

fn posting(uid: &str, count: u32, username: &str, quantity: u64, direction: Direction) -> Posting {
    Posting::new("trade", username, "BTC", quantity, direction, None, None).with_uid(uid, count)
}

fn spawn_post(ledger: &Ledger, postings: Vec<Posting>) -> tokio::task::JoinHandle<ledger_core::Result<()>> {
    let ledger = ledger.clone();
    tokio::spawn(async move { ledger.post(postings).await })
}

/// Where a [`FaultyStore`] transaction breaks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fault {
    None,
    InsertJournal,
    Panic,
    SlowCommit,
}

/// Wraps a real store and injects failures mid-transaction
struct FaultyStore {
    inner: Arc<RocksStore>,
    fault: Fault,
    commits: AtomicUsize,
    rollbacks: AtomicUsize,
}

impl FaultyStore {
    fn new(inner: Arc<RocksStore>, fault: Fault) -> Arc<Self> {
        Arc::new(Self {
            inner,
            fault,
            commits: AtomicUsize::new(0),
            rollbacks: AtomicUsize::new(0),
        })
    }
}

impl Store for FaultyStore {
    fn begin_transaction(&self) -> StoreResult<Box<dyn StoreTransaction + '_>> {
        Ok(Box::new(FaultyTransaction {
            inner: self.inner.begin_transaction()?,
            store: self,
        }))
    }
}

struct FaultyTransaction<'a> {
    inner: Box<dyn StoreTransaction + 'a>,
    store: &'a FaultyStore,
}

impl StoreTransaction for FaultyTransaction<'_> {
    fn resolve_user(&self, username: &str) -> StoreResult<UserRecord> {
        if self.store.fault == Fault::Panic {
            panic!("user resolver crashed");
        }
        self.inner.resolve_user(username)
    }

    fn resolve_contract(&self, ticker: &str) -> StoreResult<ContractRecord> {
        self.inner.resolve_contract(ticker)
    }

    fn insert_postings(&mut self, postings: &[PostingRecord]) -> StoreResult<()> {
        self.inner.insert_postings(postings)
    }

    fn insert_journal(&mut self, header: &JournalHeader) -> StoreResult<()> {
        if self.store.fault == Fault::InsertJournal {
            return Err(StoreError::Operational("connection reset by peer".to_string()));
        }
        self.inner.insert_journal(header)
    }

    fn commit(self: Box<Self>) -> StoreResult<()> {
        let this = *self;
        if this.store.fault == Fault::SlowCommit {
            std::thread::sleep(Duration::from_millis(150));
        }
        this.store.commits.fetch_add(1, Ordering::SeqCst);
        this.inner.commit()
    }

    fn rollback(self: Box<Self>) {
        let this = *self;
        this.store.rollbacks.fetch_add(1, Ordering::SeqCst);
        this.inner.rollback()
    }
}

fn assert_empty(store: &RocksStore) {
    assert!(store.journals().unwrap().is_empty());
    assert!(store.postings().unwrap().is_empty());
    assert!(store.user_postings("alice").unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_alice_bob_scenario() {
    let (ledger, store, _temp) = create_test_ledger(None);

    // tx1 balances: both callers see success, one journal with two postings
    let alice = spawn_post(&ledger, vec![posting("tx1", 2, "alice", 100, Direction::Debit)]);
    let bob = spawn_post(&ledger, vec![posting("tx1", 2, "bob", 100, Direction::Credit)]);
    assert_eq!(alice.await.unwrap(), Ok(()));
    assert_eq!(bob.await.unwrap(), Ok(()));

    let journals = store.journals().unwrap();
    assert_eq!(journals.len(), 1);
    assert_eq!(journals[0].postings.len(), 2);
    assert_eq!(journals[0].net_quantity(), 0);
    assert_eq!(store.user_postings("alice").unwrap().len(), 1);
    assert_eq!(store.user_postings("bob").unwrap().len(), 1);

    // tx2 is off by one: both callers see QuantityMismatch, nothing persisted
    let alice = spawn_post(&ledger, vec![posting("tx2", 2, "alice", 100, Direction::Debit)]);
    let bob = spawn_post(&ledger, vec![posting("tx2", 2, "bob", 99, Direction::Credit)]);
    assert_eq!(alice.await.unwrap(), Err(Error::QuantityMismatch));
    assert_eq!(bob.await.unwrap(), Err(Error::QuantityMismatch));

    assert_eq!(store.journals().unwrap().len(), 1);
    assert_eq!(store.postings().unwrap().len(), 2);
    assert_eq!(ledger.pending_groups(), 0);
    assert_eq!(ledger.metrics().journals_committed.get(), 1);
    assert_eq!(
        ledger
            .metrics()
            .commit_failures
            .with_label_values(&["QuantityMismatch"])
            .get(),
        1
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_every_contributor_gets_one_outcome() {
    let (ledger, store, _temp) = create_test_ledger(None);
    const LEGS: u32 = 8;

    let handles: Vec<_> = (0..LEGS)
        .map(|i| {
            let direction = if i % 2 == 0 { Direction::Debit } else { Direction::Credit };
            let user = if i % 2 == 0 { "alice" } else { "bob" };
            spawn_post(&ledger, vec![posting("tx-fan", LEGS, user, 25, direction)])
        })
        .collect();

    for handle in handles {
        assert_eq!(handle.await.unwrap(), Ok(()));
    }

    let journals = store.journals().unwrap();
    assert_eq!(journals.len(), 1);
    assert_eq!(journals[0].postings.len(), LEGS as usize);
    assert_eq!(ledger.metrics().postings_total.get(), LEGS as u64);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_distinct_uids_commit_independently() {
    let (ledger, store, _temp) = create_test_ledger(None);

    let mut handles = Vec::new();
    for n in 0..20 {
        let uid = format!("tx-{}", n);
        handles.push(spawn_post(&ledger, vec![posting(&uid, 2, "alice", n, Direction::Debit)]));
        handles.push(spawn_post(&ledger, vec![posting(&uid, 2, "carol", n, Direction::Credit)]));
    }

    for handle in handles {
        assert_eq!(handle.await.unwrap(), Ok(()));
    }

    assert_eq!(store.journals().unwrap().len(), 20);
    assert_eq!(store.user_postings("carol").unwrap().len(), 20);
    assert_eq!(ledger.pending_groups(), 0);
}

#[tokio::test]
async fn test_type_mismatch_fails_whole_group() {
    let (ledger, store, _temp) = create_test_ledger(None);

    let mut transfer = posting("tx-type", 2, "bob", 10, Direction::Credit);
    transfer.posting_type = "transfer".to_string();

    let alice = spawn_post(&ledger, vec![posting("tx-type", 2, "alice", 10, Direction::Debit)]);
    let bob = spawn_post(&ledger, vec![transfer]);

    assert_eq!(alice.await.unwrap(), Err(Error::TypeMismatch));
    assert_eq!(bob.await.unwrap(), Err(Error::TypeMismatch));
    assert!(store.journals().unwrap().is_empty());
}

#[tokio::test]
async fn test_largest_declared_count_decides_readiness() {
    let (ledger, store, _temp) = create_test_ledger(None);

    // One contributor claims three legs, another claims one: wait for three
    let first = spawn_post(&ledger, vec![posting("tx-count", 3, "alice", 10, Direction::Debit)]);
    tokio::time::sleep(Duration::from_millis(20)).await;
    let second = spawn_post(&ledger, vec![posting("tx-count", 1, "bob", 5, Direction::Credit)]);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(ledger.is_pending("tx-count"));

    let third = spawn_post(&ledger, vec![posting("tx-count", 3, "carol", 5, Direction::Credit)]);

    for handle in [first, second, third] {
        assert_eq!(handle.await.unwrap(), Err(Error::CountMismatch));
    }
    assert!(store.journals().unwrap().is_empty());
    assert!(!ledger.is_pending("tx-count"));
}

#[tokio::test]
async fn test_unknown_contract_is_reported() {
    let (ledger, store, _temp) = create_test_ledger(None);

    let mut doge = posting("tx-doge", 2, "alice", 1, Direction::Debit);
    doge.contract = "DOGE".to_string();

    let result = ledger
        .post(vec![doge, posting("tx-doge", 2, "bob", 1, Direction::Credit)])
        .await;

    assert_eq!(result, Err(Error::UnknownContract("DOGE".to_string())));
    assert_eq!(result.unwrap_err().code(), 103);
    assert!(store.postings().unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failed_write_leaves_nothing_behind() {
    let (inner, _temp) = open_store();
    let store = FaultyStore::new(inner.clone(), Fault::InsertJournal);
    let ledger = Ledger::new(store.clone(), None, Metrics::new().unwrap());

    let alice = spawn_post(&ledger, vec![posting("tx-fail", 2, "alice", 7, Direction::Debit)]);
    let bob = spawn_post(&ledger, vec![posting("tx-fail", 2, "bob", 7, Direction::Credit)]);

    let alice = alice.await.unwrap().unwrap_err();
    let bob = bob.await.unwrap().unwrap_err();
    assert_eq!(alice, Error::Database);
    assert_eq!(bob, Error::Database);
    assert_eq!(alice.code(), 999);
    assert!(alice.is_retryable());

    // The storage detail never reaches the caller
    assert!(!alice.to_string().contains("connection reset"));

    assert_eq!(store.commits.load(Ordering::SeqCst), 0);
    assert_eq!(store.rollbacks.load(Ordering::SeqCst), 1);
    assert_empty(&inner);
    assert_eq!(ledger.pending_groups(), 0);
}

#[tokio::test]
async fn test_panicking_store_fails_group_and_rolls_back() {
    let (inner, _temp) = open_store();
    let store = FaultyStore::new(inner.clone(), Fault::Panic);
    let ledger = Ledger::new(store.clone(), None, Metrics::new().unwrap());

    let result = ledger
        .post(vec![
            posting("tx-panic", 2, "alice", 3, Direction::Debit),
            posting("tx-panic", 2, "bob", 3, Direction::Credit),
        ])
        .await;

    assert!(matches!(result, Err(Error::Internal(_))));
    assert_eq!(store.rollbacks.load(Ordering::SeqCst), 1);
    assert_empty(&inner);
    assert!(!ledger.is_pending("tx-panic"));
}

#[tokio::test]
async fn test_healthy_wrapper_commits_once() {
    let (inner, _temp) = open_store();
    let store = FaultyStore::new(inner.clone(), Fault::None);
    let ledger = Ledger::new(store.clone(), None, Metrics::new().unwrap());

    let result = ledger
        .post(vec![
            posting("tx-ok", 2, "alice", 3, Direction::Debit),
            posting("tx-ok", 2, "bob", 3, Direction::Credit),
        ])
        .await;

    assert_eq!(result, Ok(()));
    assert_eq!(store.commits.load(Ordering::SeqCst), 1);
    assert_eq!(store.rollbacks.load(Ordering::SeqCst), 0);
    assert_eq!(inner.journals().unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_abandoned_caller_does_not_strand_commit() {
    let (inner, _temp) = open_store();
    let store = FaultyStore::new(inner.clone(), Fault::SlowCommit);
    let ledger = Ledger::new(store.clone(), Some(Duration::from_millis(300)), Metrics::new().unwrap());

    let alice = spawn_post(&ledger, vec![posting("tx-drop", 2, "alice", 8, Direction::Debit)]);
    tokio::time::sleep(Duration::from_millis(20)).await;

    // Bob completes the group, then stops waiting mid-commit
    let bob = tokio::time::timeout(
        Duration::from_millis(20),
        ledger.post(vec![posting("tx-drop", 2, "bob", 8, Direction::Credit)]),
    )
    .await;
    assert!(bob.is_err());

    // Alice still learns the real outcome, not a timeout
    assert_eq!(alice.await.unwrap(), Ok(()));
    assert_eq!(store.commits.load(Ordering::SeqCst), 1);
    assert_eq!(inner.journals().unwrap().len(), 1);
    assert!(!ledger.is_pending("tx-drop"));
    assert_eq!(ledger.metrics().group_timeouts.get(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_incomplete_group_times_out_for_everyone() {
    let (ledger, store, _temp) = create_test_ledger(Some(Duration::from_millis(100)));

    let alice = spawn_post(&ledger, vec![posting("tx-slow", 3, "alice", 10, Direction::Debit)]);
    let bob = spawn_post(&ledger, vec![posting("tx-slow", 3, "bob", 5, Direction::Credit)]);

    assert_eq!(alice.await.unwrap(), Err(Error::GroupTimeout));
    assert_eq!(bob.await.unwrap(), Err(Error::GroupTimeout));
    assert!(!ledger.is_pending("tx-slow"));
    assert_eq!(ledger.metrics().group_timeouts.get(), 1);

    // A straggler for the expired uid does not revive the old postings
    let late = ledger
        .post(vec![
            posting("tx-slow", 2, "carol", 5, Direction::Credit),
            posting("tx-slow", 2, "alice", 5, Direction::Debit),
        ])
        .await;
    assert_eq!(late, Ok(()));

    let journals = store.journals().unwrap();
    assert_eq!(journals.len(), 1);
    assert_eq!(journals[0].postings.len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_each_posting_extends_deadline() {
    let (ledger, _store, _temp) = create_test_ledger(Some(Duration::from_millis(300)));

    let first = spawn_post(&ledger, vec![posting("tx-rearm", 3, "alice", 10, Direction::Debit)]);
    tokio::time::sleep(Duration::from_millis(200)).await;
    let second = spawn_post(&ledger, vec![posting("tx-rearm", 3, "bob", 4, Direction::Credit)]);
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Past the first posting's deadline, within the second's
    assert!(ledger.is_pending("tx-rearm"));
    let third = spawn_post(&ledger, vec![posting("tx-rearm", 3, "carol", 6, Direction::Credit)]);

    for handle in [first, second, third] {
        assert_eq!(handle.await.unwrap(), Ok(()));
    }
}

#[tokio::test]
async fn test_disabled_timeout_waits_indefinitely() {
    let (ledger, _store, _temp) = create_test_ledger(None);

    let waiter = spawn_post(&ledger, vec![posting("tx-idle", 2, "alice", 1, Direction::Debit)]);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(ledger.is_pending("tx-idle"));
    assert!(!waiter.is_finished());

    ledger
        .post(vec![posting("tx-idle", 2, "bob", 1, Direction::Credit)])
        .await
        .unwrap();
    assert_eq!(waiter.await.unwrap(), Ok(()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_export_relays_outcomes() {
    let (ledger, _store, _temp) = create_test_ledger(None);
    let export = AccountantExport::new(ledger);

    let leg = |user: &str, quantity: u64, direction: &str| {
        json!({
            "uid": "tx-export", "count": 2, "type": "trade",
            "username": user, "contract": "ETH",
            "quantity": quantity, "direction": direction
        })
    };

    let first = {
        let export = export.clone();
        let leg = leg("alice", 50, "debit");
        tokio::spawn(async move { export.post(vec![leg]).await })
    };
    let second = export.post(vec![leg("bob", 49, "credit")]).await;

    let reply = second.unwrap_err();
    assert_eq!(reply.kind, "QuantityMismatch");
    assert_eq!(reply.code, 200);
    assert_eq!(first.await.unwrap(), Err(reply));
    assert_eq!(export.ping(), "pong");
}
