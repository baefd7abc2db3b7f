extern crate petra;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use petra::common::exception::AbortReason;
use petra::common::rid::RID;
use petra::concurrency::lock_manager::{LockManager, LockMode};
use petra::concurrency::transaction::{IsolationLevel, TransactionState};
use petra::concurrency::transaction_manager::TransactionManager;

fn setup() -> (Arc<TransactionManager>, Arc<LockManager>) {
    let txn_manager = Arc::new(TransactionManager::new());
    let lock_manager = Arc::new(LockManager::new(Arc::clone(&txn_manager)));
    (txn_manager, lock_manager)
}

#[test]
fn compatible_shared_locks_are_granted_together() {
    let (tm, lm) = setup();
    let t1 = tm.begin(IsolationLevel::RepeatableRead);
    let t2 = tm.begin(IsolationLevel::RepeatableRead);

    assert!(lm.lock_table(&t1, LockMode::Shared, 1).unwrap());
    assert!(lm.lock_table(&t2, LockMode::Shared, 1).unwrap());
    assert!(t1.is_table_shared_locked(1));
    assert!(t2.is_table_shared_locked(1));

    assert!(lm.unlock_table(&t1, 1).unwrap());
    assert!(lm.unlock_table(&t2, 1).unwrap());
}

#[test]
fn relocking_the_same_mode_is_idempotent() {
    let (tm, lm) = setup();
    let t1 = tm.begin(IsolationLevel::RepeatableRead);

    assert!(lm.lock_table(&t1, LockMode::IntentionShared, 1).unwrap());
    assert!(lm.lock_table(&t1, LockMode::IntentionShared, 1).unwrap());
    assert!(lm.unlock_table(&t1, 1).unwrap());
}

#[test]
fn shared_on_read_uncommitted_aborts() {
    let (tm, lm) = setup();
    let t1 = tm.begin(IsolationLevel::ReadUncommitted);

    let err = lm.lock_table(&t1, LockMode::Shared, 1).unwrap_err();
    assert_eq!(err.reason, AbortReason::LockSharedOnReadUncommitted);
    assert_eq!(t1.state(), TransactionState::Aborted);
}

#[test]
fn read_uncommitted_takes_exclusive_locks() {
    let (tm, lm) = setup();
    let t1 = tm.begin(IsolationLevel::ReadUncommitted);

    assert!(lm.lock_table(&t1, LockMode::IntentionExclusive, 1).unwrap());
    assert!(lm
        .lock_row(&t1, LockMode::Exclusive, 1, RID::new(1, 1))
        .unwrap());
    assert!(lm.unlock_row(&t1, 1, RID::new(1, 1), false).unwrap());
    assert!(lm.unlock_table(&t1, 1).unwrap());
}

#[test]
fn repeatable_read_shrinking_rejects_all_locks() {
    let (tm, lm) = setup();
    let t1 = tm.begin(IsolationLevel::RepeatableRead);

    assert!(lm.lock_table(&t1, LockMode::Shared, 1).unwrap());
    assert!(lm.unlock_table(&t1, 1).unwrap());
    assert_eq!(t1.state(), TransactionState::Shrinking);

    let err = lm.lock_table(&t1, LockMode::IntentionShared, 2).unwrap_err();
    assert_eq!(err.reason, AbortReason::LockOnShrinking);
    assert_eq!(t1.state(), TransactionState::Aborted);
}

#[test]
fn read_committed_shrinking_allows_shared_only() {
    let (tm, lm) = setup();
    let t1 = tm.begin(IsolationLevel::ReadCommitted);

    assert!(lm.lock_table(&t1, LockMode::Exclusive, 1).unwrap());
    assert!(lm.unlock_table(&t1, 1).unwrap());
    assert_eq!(t1.state(), TransactionState::Shrinking);

    // IS and S are still allowed while shrinking.
    assert!(lm.lock_table(&t1, LockMode::IntentionShared, 2).unwrap());
    assert!(lm.lock_table(&t1, LockMode::Shared, 3).unwrap());

    // Anything stronger aborts.
    let err = lm.lock_table(&t1, LockMode::Exclusive, 4).unwrap_err();
    assert_eq!(err.reason, AbortReason::LockOnShrinking);
}

#[test]
fn shared_unlock_does_not_shrink_read_committed() {
    let (tm, lm) = setup();
    let t1 = tm.begin(IsolationLevel::ReadCommitted);

    assert!(lm.lock_table(&t1, LockMode::Shared, 1).unwrap());
    assert!(lm.unlock_table(&t1, 1).unwrap());
    assert_eq!(t1.state(), TransactionState::Growing);
}

#[test]
fn row_lock_requires_table_lock() {
    let (tm, lm) = setup();
    let t1 = tm.begin(IsolationLevel::RepeatableRead);

    let err = lm
        .lock_row(&t1, LockMode::Shared, 1, RID::new(1, 1))
        .unwrap_err();
    assert_eq!(err.reason, AbortReason::TableLockNotPresent);
}

#[test]
fn row_exclusive_requires_write_intent_on_table() {
    let (tm, lm) = setup();
    let t1 = tm.begin(IsolationLevel::RepeatableRead);

    // S on the table admits row S but not row X.
    assert!(lm.lock_table(&t1, LockMode::Shared, 1).unwrap());
    assert!(lm
        .lock_row(&t1, LockMode::Shared, 1, RID::new(1, 1))
        .unwrap());
    let err = lm
        .lock_row(&t1, LockMode::Exclusive, 1, RID::new(1, 2))
        .unwrap_err();
    assert_eq!(err.reason, AbortReason::TableLockNotPresent);
}

#[test]
fn row_shared_allowed_under_table_exclusive() {
    // The table X lock already dominates; row S must still be granted.
    let (tm, lm) = setup();
    let t1 = tm.begin(IsolationLevel::RepeatableRead);

    assert!(lm.lock_table(&t1, LockMode::Exclusive, 1).unwrap());
    assert!(lm
        .lock_row(&t1, LockMode::Shared, 1, RID::new(1, 1))
        .unwrap());
}

#[test]
fn intention_lock_on_row_aborts() {
    let (tm, lm) = setup();
    let t1 = tm.begin(IsolationLevel::RepeatableRead);

    assert!(lm.lock_table(&t1, LockMode::IntentionExclusive, 1).unwrap());
    let err = lm
        .lock_row(&t1, LockMode::IntentionExclusive, 1, RID::new(1, 1))
        .unwrap_err();
    assert_eq!(err.reason, AbortReason::AttemptedIntentionLockOnRow);
}

#[test]
fn unlock_table_with_row_locks_aborts() {
    let (tm, lm) = setup();
    let t1 = tm.begin(IsolationLevel::RepeatableRead);

    assert!(lm.lock_table(&t1, LockMode::IntentionExclusive, 1).unwrap());
    assert!(lm
        .lock_row(&t1, LockMode::Exclusive, 1, RID::new(1, 1))
        .unwrap());

    let err = lm.unlock_table(&t1, 1).unwrap_err();
    assert_eq!(err.reason, AbortReason::TableUnlockedBeforeUnlockingRows);
}

#[test]
fn unlock_without_lock_aborts() {
    let (tm, lm) = setup();
    let t1 = tm.begin(IsolationLevel::RepeatableRead);

    let err = lm.unlock_table(&t1, 1).unwrap_err();
    assert_eq!(err.reason, AbortReason::AttemptedUnlockButNoLockHeld);

    let t2 = tm.begin(IsolationLevel::RepeatableRead);
    let err = lm.unlock_row(&t2, 1, RID::new(1, 1), false).unwrap_err();
    assert_eq!(err.reason, AbortReason::AttemptedUnlockButNoLockHeld);
}

#[test]
fn incompatible_upgrade_aborts() {
    let (tm, lm) = setup();
    let t1 = tm.begin(IsolationLevel::RepeatableRead);

    assert!(lm.lock_table(&t1, LockMode::Exclusive, 1).unwrap());
    let err = lm.lock_table(&t1, LockMode::Shared, 1).unwrap_err();
    assert_eq!(err.reason, AbortReason::IncompatibleUpgrade);
}

#[test]
fn valid_upgrade_replaces_the_old_grant() {
    let (tm, lm) = setup();
    let t1 = tm.begin(IsolationLevel::RepeatableRead);

    assert!(lm.lock_table(&t1, LockMode::IntentionShared, 1).unwrap());
    assert!(lm.lock_table(&t1, LockMode::IntentionExclusive, 1).unwrap());
    assert!(!t1.is_table_intention_shared_locked(1));
    assert!(t1.is_table_intention_exclusive_locked(1));

    assert!(lm.lock_table(&t1, LockMode::Exclusive, 1).unwrap());
    assert!(t1.is_table_exclusive_locked(1));
    assert!(lm.unlock_table(&t1, 1).unwrap());
}

#[test]
fn upgrade_conflict_aborts_second_upgrader() {
    let (tm, lm) = setup();
    let t1 = tm.begin(IsolationLevel::RepeatableRead);
    let t2 = tm.begin(IsolationLevel::RepeatableRead);
    let t3 = tm.begin(IsolationLevel::RepeatableRead);

    assert!(lm.lock_table(&t1, LockMode::Shared, 1).unwrap());
    assert!(lm.lock_table(&t2, LockMode::Shared, 1).unwrap());
    assert!(lm.lock_table(&t3, LockMode::Shared, 1).unwrap());

    // T1 reserves the upgrade slot and blocks in a thread.
    let blocked = {
        let lm = Arc::clone(&lm);
        let t1 = Arc::clone(&t1);
        thread::spawn(move || lm.lock_table(&t1, LockMode::Exclusive, 1))
    };
    thread::sleep(Duration::from_millis(100));

    // T2's concurrent upgrade hits the occupied slot.
    let err = lm.lock_table(&t2, LockMode::Exclusive, 1).unwrap_err();
    assert_eq!(err.reason, AbortReason::UpgradeConflict);
    assert_eq!(t2.state(), TransactionState::Aborted);

    // Releasing the remaining shared locks lets T1's upgrade through
    // (T2 is aborted and treated as absent).
    assert!(lm.unlock_table(&t3, 1).unwrap());
    assert!(blocked.join().unwrap().unwrap());
    assert!(t1.is_table_exclusive_locked(1));
}

#[test]
fn upgrade_has_priority_over_fifo_waiters() {
    // Scenario: T1 and T2 hold S. T1 upgrades to X (head of queue), T3
    // queues S behind it. When T2 releases, T1 gets X before T3; only
    // after T1 releases does T3 get S.
    let (tm, lm) = setup();
    let t1 = tm.begin(IsolationLevel::RepeatableRead);
    let t2 = tm.begin(IsolationLevel::RepeatableRead);
    let t3 = tm.begin(IsolationLevel::RepeatableRead);

    assert!(lm.lock_table(&t1, LockMode::Shared, 1).unwrap());
    assert!(lm.lock_table(&t2, LockMode::Shared, 1).unwrap());

    let t1_granted = Arc::new(AtomicBool::new(false));
    let t3_granted = Arc::new(AtomicBool::new(false));

    let upgrade = {
        let (lm, t1, flag) = (Arc::clone(&lm), Arc::clone(&t1), Arc::clone(&t1_granted));
        thread::spawn(move || {
            let granted = lm.lock_table(&t1, LockMode::Exclusive, 1).unwrap();
            flag.store(granted, Ordering::SeqCst);
        })
    };
    thread::sleep(Duration::from_millis(100));
    assert!(!t1_granted.load(Ordering::SeqCst), "upgrade must wait for T2");

    let reader = {
        let (lm, t3, flag) = (Arc::clone(&lm), Arc::clone(&t3), Arc::clone(&t3_granted));
        thread::spawn(move || {
            let granted = lm.lock_table(&t3, LockMode::Shared, 1).unwrap();
            flag.store(granted, Ordering::SeqCst);
        })
    };
    thread::sleep(Duration::from_millis(100));
    assert!(!t3_granted.load(Ordering::SeqCst));

    // T2 releases: the upgrade at the head wins, T3's S keeps waiting.
    assert!(lm.unlock_table(&t2, 1).unwrap());
    upgrade.join().unwrap();
    assert!(t1_granted.load(Ordering::SeqCst));
    thread::sleep(Duration::from_millis(100));
    assert!(
        !t3_granted.load(Ordering::SeqCst),
        "shared request must wait behind the granted X"
    );

    // T1 releases X: now T3 is granted.
    assert!(lm.unlock_table(&t1, 1).unwrap());
    reader.join().unwrap();
    assert!(t3_granted.load(Ordering::SeqCst));
}

#[test]
fn commit_releases_all_locks() {
    let (tm, lm) = setup();
    let t1 = tm.begin(IsolationLevel::RepeatableRead);
    let t2 = tm.begin(IsolationLevel::RepeatableRead);

    assert!(lm.lock_table(&t1, LockMode::IntentionExclusive, 1).unwrap());
    assert!(lm
        .lock_row(&t1, LockMode::Exclusive, 1, RID::new(1, 1))
        .unwrap());

    // T2 blocks on the row until T1 commits.
    let blocked = {
        let (lm, t2) = (Arc::clone(&lm), Arc::clone(&t2));
        thread::spawn(move || {
            lm.lock_table(&t2, LockMode::IntentionExclusive, 1)
                .unwrap();
            lm.lock_row(&t2, LockMode::Exclusive, 1, RID::new(1, 1))
                .unwrap()
        })
    };
    thread::sleep(Duration::from_millis(100));
    tm.commit(&t1, &lm);

    assert!(blocked.join().unwrap());
    assert_eq!(t1.state(), TransactionState::Committed);
    assert!(!t1.holds_row_locks_on(1));
}
