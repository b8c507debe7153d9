//! Integration Tests for the Transfer Engine
//!
//! Full units of work against the in-process backend, including injected
//! conflicts, failed appends and slow commits.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;

use crate::error::LedgerError;
use crate::models::{DepositCommand, EntryKind, TransferCommand};
use crate::store::{LedgerReader, MemoryLedger, UnitOfWork, WalletReader, WalletStore};
use crate::transfer::{MemoryTransferEngine, RetryPolicy};

const ALICE: i64 = 1;
const BOB: i64 = 2;
const CAROL: i64 = 3;

/// Engine plus direct access to its backend
struct TestHarness {
    engine: MemoryTransferEngine,
    store: Arc<MemoryLedger>,
}

impl TestHarness {
    async fn new() -> Self {
        let store = Arc::new(MemoryLedger::new());
        let policy = RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
            unit_of_work_timeout: Duration::from_millis(250),
        };
        let engine = MemoryTransferEngine::from_store(store.clone(), policy);

        for (id, name) in [(ALICE, "alice"), (BOB, "bob"), (CAROL, "carol")] {
            store.add_user(id, name).unwrap();
            engine.open_wallet(id).await.unwrap();
        }
        Self { engine, store }
    }

    async fn fund(&self, user: i64, amount: Decimal) {
        self.engine.deposit(user, amount, None).await.unwrap();
    }

    async fn balance(&self, user: i64) -> Decimal {
        self.store.find_by_user(user).await.unwrap().unwrap().balance
    }
}

// ========================================================================
// Happy Path Tests
// ========================================================================

#[tokio::test]
async fn test_transfer_returns_entry_with_names() {
    let h = TestHarness::new().await;
    h.fund(ALICE, dec!(100)).await;

    let receipt = h
        .engine
        .transfer(ALICE, BOB, dec!(40), Some(" lunch ".into()))
        .await
        .unwrap();

    assert!(!receipt.replayed);
    assert_eq!(receipt.view.sender_name, "alice");
    assert_eq!(receipt.view.recipient_name, "bob");
    assert_eq!(receipt.view.entry.kind, EntryKind::Transfer);
    assert_eq!(receipt.view.entry.note.as_deref(), Some("lunch"));
    assert_eq!(h.balance(ALICE).await, dec!(60));
    assert_eq!(h.balance(BOB).await, dec!(40));
}

#[tokio::test]
async fn test_deposit_default_note() {
    let h = TestHarness::new().await;
    let receipt = h.engine.deposit(ALICE, dec!(5), None).await.unwrap();
    assert_eq!(receipt.entry.note.as_deref(), Some("Deposit"));
    assert_eq!(receipt.wallet.balance, dec!(5));
}

#[tokio::test]
async fn test_reverse_order_transfer_locks_ascending() {
    let h = TestHarness::new().await;
    h.fund(CAROL, dec!(10)).await;

    h.engine.transfer(CAROL, ALICE, dec!(10), None).await.unwrap();
    assert_eq!(h.balance(CAROL).await, Decimal::ZERO);
    assert_eq!(h.balance(ALICE).await, dec!(10));
}

// ========================================================================
// Validation Tests
// ========================================================================

#[tokio::test]
async fn test_unknown_users() {
    let h = TestHarness::new().await;
    h.fund(ALICE, dec!(10)).await;

    assert_eq!(
        h.engine.transfer(ALICE, 99, dec!(1), None).await.unwrap_err(),
        LedgerError::UserNotFound(99)
    );
    assert_eq!(
        h.engine.transfer(98, ALICE, dec!(1), None).await.unwrap_err(),
        LedgerError::UserNotFound(98)
    );
    assert_eq!(
        h.engine.deposit(97, dec!(1), None).await.unwrap_err(),
        LedgerError::UserNotFound(97)
    );
    assert_eq!(
        h.engine.open_wallet(96).await.unwrap_err(),
        LedgerError::UserNotFound(96)
    );
}

#[tokio::test]
async fn test_missing_wallet_is_integrity_error() {
    let h = TestHarness::new().await;
    h.store.add_user(50, "no-wallet").unwrap();
    h.fund(ALICE, dec!(10)).await;

    assert_eq!(
        h.engine.transfer(ALICE, 50, dec!(1), None).await.unwrap_err(),
        LedgerError::WalletNotFound(50)
    );
    assert_eq!(
        h.engine.deposit(50, dec!(1), None).await.unwrap_err(),
        LedgerError::WalletNotFound(50)
    );
    assert_eq!(h.balance(ALICE).await, dec!(10));
}

#[tokio::test]
async fn test_invalid_amounts() {
    let h = TestHarness::new().await;
    h.fund(ALICE, dec!(10)).await;

    for amount in [dec!(0), dec!(-5), dec!(0.001)] {
        let err = h.engine.transfer(ALICE, BOB, amount, None).await.unwrap_err();
        assert!(matches!(err, LedgerError::InvalidArgument(_)), "{}", amount);
        let err = h.engine.deposit(ALICE, amount, None).await.unwrap_err();
        assert!(matches!(err, LedgerError::InvalidArgument(_)), "{}", amount);
    }
}

#[tokio::test]
async fn test_duplicate_wallet() {
    let h = TestHarness::new().await;
    assert!(matches!(
        h.engine.open_wallet(ALICE).await,
        Err(LedgerError::InvalidArgument(_))
    ));
}

// ========================================================================
// Failure Injection Tests
// ========================================================================

#[tokio::test]
async fn test_failed_append_rolls_back_balances() {
    let h = TestHarness::new().await;
    h.fund(ALICE, dec!(100)).await;
    let entries_before = h.store.entry_count().unwrap();

    h.store.fail_next_appends(1);
    let err = h.engine.transfer(ALICE, BOB, dec!(30), None).await.unwrap_err();

    assert!(matches!(
        err,
        LedgerError::StorageFailure {
            transient: false,
            ..
        }
    ));
    assert_eq!(h.balance(ALICE).await, dec!(100));
    assert_eq!(h.balance(BOB).await, Decimal::ZERO);
    assert_eq!(h.store.entry_count().unwrap(), entries_before);
}

#[tokio::test]
async fn test_conflict_retried_transparently() {
    let h = TestHarness::new().await;
    h.fund(ALICE, dec!(100)).await;

    h.store.inject_conflicts(2);
    h.engine.transfer(ALICE, BOB, dec!(25), None).await.unwrap();

    assert_eq!(h.balance(ALICE).await, dec!(75));
    assert_eq!(h.balance(BOB).await, dec!(25));
    assert_eq!(h.store.list_by_user(BOB).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_conflicts_exhaust_retries() {
    let h = TestHarness::new().await;
    h.fund(ALICE, dec!(100)).await;

    h.store.inject_conflicts(3);
    let err = h.engine.transfer(ALICE, BOB, dec!(25), None).await.unwrap_err();

    assert!(matches!(
        err,
        LedgerError::StorageFailure {
            transient: true,
            ..
        }
    ));
    assert_eq!(h.balance(ALICE).await, dec!(100));
    assert_eq!(h.balance(BOB).await, Decimal::ZERO);
}

#[tokio::test]
async fn test_slow_commit_times_out_and_rolls_back() {
    let h = TestHarness::new().await;
    h.fund(ALICE, dec!(100)).await;

    h.store.set_commit_delay(Duration::from_secs(2));
    let err = h.engine.transfer(ALICE, BOB, dec!(10), None).await.unwrap_err();
    h.store.set_commit_delay(Duration::ZERO);

    assert!(err.is_retryable());
    assert_eq!(h.balance(ALICE).await, dec!(100));

    // Row locks were released with the abandoned unit of work
    h.engine.transfer(ALICE, BOB, dec!(10), None).await.unwrap();
    assert_eq!(h.balance(BOB).await, dec!(10));
}

#[tokio::test]
async fn test_disjoint_pairs_do_not_block() {
    let h = TestHarness::new().await;
    h.fund(ALICE, dec!(50)).await;
    h.fund(BOB, dec!(50)).await;

    // An open unit of work holds ALICE's row
    let mut held = h.store.begin().await.unwrap();
    h.store.lock_by_user(&mut held, ALICE).await.unwrap();

    h.engine.transfer(BOB, CAROL, dec!(20), None).await.unwrap();
    assert_eq!(h.balance(CAROL).await, dec!(20));

    // A transfer touching ALICE waits on the row and runs out of time
    let err = h.engine.transfer(ALICE, BOB, dec!(5), None).await.unwrap_err();
    assert!(err.is_retryable());

    h.store.rollback(held).await.unwrap();
    h.engine.transfer(ALICE, BOB, dec!(5), None).await.unwrap();
    assert_eq!(h.balance(ALICE).await, dec!(45));
}

// ========================================================================
// Idempotency Tests
// ========================================================================

#[tokio::test]
async fn test_request_key_replay() {
    let h = TestHarness::new().await;
    h.fund(ALICE, dec!(100)).await;

    let cmd = TransferCommand {
        sender_id: ALICE,
        recipient_id: BOB,
        amount: dec!(20),
        note: Some("rent".into()),
        request_key: Some("rent-2024-03".into()),
    };

    let first = h.engine.execute_transfer(cmd.clone()).await.unwrap();
    let second = h.engine.execute_transfer(cmd.clone()).await.unwrap();

    assert!(!first.replayed);
    assert!(second.replayed);
    assert_eq!(first.view.entry.id, second.view.entry.id);
    assert_eq!(h.balance(ALICE).await, dec!(80));
    assert_eq!(h.balance(BOB).await, dec!(20));

    let reuse = TransferCommand {
        amount: dec!(21),
        ..cmd
    };
    assert!(matches!(
        h.engine.execute_transfer(reuse).await,
        Err(LedgerError::InvalidArgument(_))
    ));
}

#[tokio::test]
async fn test_deposit_request_key_replay() {
    let h = TestHarness::new().await;
    let cmd = DepositCommand {
        user_id: ALICE,
        amount: dec!(15),
        note: None,
        request_key: Some("topup-1".into()),
    };

    let first = h.engine.execute_deposit(cmd.clone()).await.unwrap();
    let second = h.engine.execute_deposit(cmd).await.unwrap();

    assert!(second.replayed);
    assert_eq!(first.entry.id, second.entry.id);
    assert_eq!(second.wallet.balance, dec!(15));
    assert_eq!(h.balance(ALICE).await, dec!(15));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_duplicate_request_key_moves_money_once() {
    let h = Arc::new(TestHarness::new().await);
    h.fund(ALICE, dec!(100)).await;

    let cmd = TransferCommand {
        sender_id: ALICE,
        recipient_id: BOB,
        amount: dec!(10),
        note: None,
        request_key: Some("dup".into()),
    };

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let h = h.clone();
            let cmd = cmd.clone();
            tokio::spawn(async move { h.engine.execute_transfer(cmd).await })
        })
        .collect();

    let receipts: Vec<_> = futures::future::join_all(handles)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .collect();

    assert_eq!(receipts.iter().filter(|r| !r.replayed).count(), 1);
    assert_eq!(h.balance(ALICE).await, dec!(90));
    assert_eq!(h.balance(BOB).await, dec!(10));
}
