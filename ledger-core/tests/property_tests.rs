//! Property-based tests for ledger invariants
//!
//! These tests use proptest to verify:
//! - Value conservation: every journal balances, unbalanced sets never commit
//! - Order independence: the verdict does not depend on arrival order
//! - Single outcome: every contributor of a group sees the same result

use ledger_core::{
    ledger::check_consistency, Config, Direction, Error, Ledger, Metrics, Posting, RocksStore,
};
use proptest::prelude::*;
use std::sync::Arc;

const USERS: [&str; 3] = ["alice", "bob", "carol"];

/// Strategy for generating quantities (including zero)
fn quantity_strategy() -> impl Strategy<Value = u64> {
    0u64..1_000_000_000u64
}

/// Strategy for generating usernames
fn user_strategy() -> impl Strategy<Value = &'static str> {
    prop::sample::select(USERS.to_vec())
}

/// Balanced legs: each quantity is debited from one user and credited to another
fn balanced_strategy() -> impl Strategy<Value = Vec<(&'static str, u64, Direction)>> {
    prop::collection::vec((user_strategy(), user_strategy(), quantity_strategy()), 1..5)
        .prop_map(|moves| {
            moves
                .into_iter()
                .flat_map(|(from, to, quantity)| {
                    [(from, quantity, Direction::Debit), (to, quantity, Direction::Credit)]
                })
                .collect::<Vec<_>>()
        })
        .prop_shuffle()
}

/// Balanced legs with one leg nudged by a non-zero amount
fn unbalanced_strategy() -> impl Strategy<Value = Vec<(&'static str, u64, Direction)>> {
    (balanced_strategy(), any::<prop::sample::Index>(), 1u64..1_000u64).prop_map(
        |(mut legs, index, delta)| {
            let leg = index.get_mut(&mut legs);
            leg.1 += delta;
            legs
        },
    )
}

fn to_postings(uid: &str, legs: &[(&'static str, u64, Direction)]) -> Vec<Posting> {
    legs.iter()
        .map(|(user, quantity, direction)| {
            Posting::new("trade", *user, "BTC", *quantity, *direction, None, None)
                .with_uid(uid, legs.len() as u32)
        })
        .collect()
}

/// Create test ledger with temp directory
fn create_test_ledger() -> (Ledger, Arc<RocksStore>, tempfile::TempDir) {
    let temp_dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.data_dir = temp_dir.path().to_path_buf();

    let store = Arc::new(RocksStore::open(&config).unwrap());
    for user in USERS {
        store.register_user(user).unwrap();
    }
    store.register_contract("BTC").unwrap();

    let ledger = Ledger::new(store.clone(), None, Metrics::new().unwrap());
    (ledger, store, temp_dir)
}

/// Submit every posting from its own task and collect all outcomes
async fn submit_concurrently(ledger: &Ledger, postings: Vec<Posting>) -> Vec<ledger_core::Result<()>> {
    let handles: Vec<_> = postings
        .into_iter()
        .map(|posting| {
            let ledger = ledger.clone();
            tokio::spawn(async move { ledger.post(vec![posting]).await })
        })
        .collect();

    let mut outcomes = Vec::with_capacity(handles.len());
    for handle in handles {
        outcomes.push(handle.await.unwrap());
    }
    outcomes
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// Property: balanced sets pass consistency checks in any order
    #[test]
    fn prop_balanced_sets_are_consistent(legs in balanced_strategy()) {
        prop_assert_eq!(check_consistency(&to_postings("tx", &legs)), Ok(()));
    }

    /// Property: unbalanced sets always yield QuantityMismatch
    #[test]
    fn prop_unbalanced_sets_mismatch(legs in unbalanced_strategy()) {
        prop_assert_eq!(
            check_consistency(&to_postings("tx", &legs)),
            Err(Error::QuantityMismatch)
        );
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Property: a committed journal balances and every contributor sees success
    #[test]
    fn prop_balanced_groups_commit(legs in balanced_strategy()) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let (ledger, store, _temp) = create_test_ledger();

            let outcomes = submit_concurrently(&ledger, to_postings("tx-balanced", &legs)).await;
            prop_assert!(outcomes.iter().all(|o| o.is_ok()));

            let journals = store.journals().unwrap();
            prop_assert_eq!(journals.len(), 1);
            prop_assert_eq!(journals[0].postings.len(), legs.len());
            prop_assert_eq!(journals[0].net_quantity(), 0);
            prop_assert_eq!(ledger.pending_groups(), 0);
            Ok(())
        })?;
    }

    /// Property: unbalanced groups fail for everyone and leave no trace
    #[test]
    fn prop_unbalanced_groups_leave_no_journal(legs in unbalanced_strategy()) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let (ledger, store, _temp) = create_test_ledger();

            let outcomes = submit_concurrently(&ledger, to_postings("tx-unbalanced", &legs)).await;
            prop_assert!(outcomes.iter().all(|o| *o == Err(Error::QuantityMismatch)));

            prop_assert!(store.journals().unwrap().is_empty());
            prop_assert!(store.postings().unwrap().is_empty());
            prop_assert_eq!(ledger.pending_groups(), 0);
            Ok(())
        })?;
    }
}
