use std::collections::{HashMap, HashSet};
use std::fmt;
use std::thread;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::common::config::{TableOid, TxnId};
use crate::common::rid::RID;
use crate::concurrency::lock_manager::LockMode;

/// Two-phase locking state of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionState {
    Growing,
    Shrinking,
    Committed,
    Aborted,
}

/// Transaction isolation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
}

/// A transaction descriptor: isolation level, 2PL phase, and the lock sets
/// mirroring every lock currently granted to it by the lock manager.
#[derive(Debug)]
pub struct Transaction {
    // Immutable fields
    txn_id: TxnId,
    isolation_level: IsolationLevel,
    thread_id: thread::ThreadId,

    // Mutable fields with interior mutability
    state: RwLock<TransactionState>,
    shared_table_lock_set: Mutex<HashSet<TableOid>>,
    exclusive_table_lock_set: Mutex<HashSet<TableOid>>,
    intention_shared_table_lock_set: Mutex<HashSet<TableOid>>,
    intention_exclusive_table_lock_set: Mutex<HashSet<TableOid>>,
    shared_intention_exclusive_table_lock_set: Mutex<HashSet<TableOid>>,
    shared_row_lock_set: Mutex<HashMap<TableOid, HashSet<RID>>>,
    exclusive_row_lock_set: Mutex<HashMap<TableOid, HashSet<RID>>>,
}

impl Transaction {
    /// Creates a new transaction in the `Growing` phase.
    ///
    /// # Parameters
    /// - `txn_id`: The transaction ID.
    /// - `isolation_level`: The isolation level of the transaction.
    pub fn new(txn_id: TxnId, isolation_level: IsolationLevel) -> Self {
        Self {
            txn_id,
            isolation_level,
            thread_id: thread::current().id(),
            state: RwLock::new(TransactionState::Growing),
            shared_table_lock_set: Mutex::new(HashSet::new()),
            exclusive_table_lock_set: Mutex::new(HashSet::new()),
            intention_shared_table_lock_set: Mutex::new(HashSet::new()),
            intention_exclusive_table_lock_set: Mutex::new(HashSet::new()),
            shared_intention_exclusive_table_lock_set: Mutex::new(HashSet::new()),
            shared_row_lock_set: Mutex::new(HashMap::new()),
            exclusive_row_lock_set: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the ID of the thread that started the transaction.
    pub fn thread_id(&self) -> thread::ThreadId {
        self.thread_id
    }

    /// Returns the ID of this transaction.
    pub fn txn_id(&self) -> TxnId {
        self.txn_id
    }

    /// Returns the isolation level of this transaction.
    pub fn isolation_level(&self) -> IsolationLevel {
        self.isolation_level
    }

    /// Returns the transaction state.
    pub fn state(&self) -> TransactionState {
        *self.state.read()
    }

    pub fn set_state(&self, state: TransactionState) {
        *self.state.write() = state;
    }

    pub fn is_table_shared_locked(&self, oid: TableOid) -> bool {
        self.shared_table_lock_set.lock().contains(&oid)
    }

    pub fn is_table_exclusive_locked(&self, oid: TableOid) -> bool {
        self.exclusive_table_lock_set.lock().contains(&oid)
    }

    pub fn is_table_intention_shared_locked(&self, oid: TableOid) -> bool {
        self.intention_shared_table_lock_set.lock().contains(&oid)
    }

    pub fn is_table_intention_exclusive_locked(&self, oid: TableOid) -> bool {
        self.intention_exclusive_table_lock_set.lock().contains(&oid)
    }

    pub fn is_table_shared_intention_exclusive_locked(&self, oid: TableOid) -> bool {
        self.shared_intention_exclusive_table_lock_set
            .lock()
            .contains(&oid)
    }

    /// The table lock mode currently held on `oid`, if any. At most one
    /// mode per table is granted to a transaction at a time.
    pub fn held_table_lock_mode(&self, oid: TableOid) -> Option<LockMode> {
        if self.is_table_shared_locked(oid) {
            Some(LockMode::Shared)
        } else if self.is_table_exclusive_locked(oid) {
            Some(LockMode::Exclusive)
        } else if self.is_table_intention_shared_locked(oid) {
            Some(LockMode::IntentionShared)
        } else if self.is_table_intention_exclusive_locked(oid) {
            Some(LockMode::IntentionExclusive)
        } else if self.is_table_shared_intention_exclusive_locked(oid) {
            Some(LockMode::SharedIntentionExclusive)
        } else {
            None
        }
    }

    /// The row lock mode currently held on `(oid, rid)`, if any.
    pub fn held_row_lock_mode(&self, oid: TableOid, rid: RID) -> Option<LockMode> {
        if self
            .shared_row_lock_set
            .lock()
            .get(&oid)
            .is_some_and(|rows| rows.contains(&rid))
        {
            Some(LockMode::Shared)
        } else if self
            .exclusive_row_lock_set
            .lock()
            .get(&oid)
            .is_some_and(|rows| rows.contains(&rid))
        {
            Some(LockMode::Exclusive)
        } else {
            None
        }
    }

    /// True when the transaction still holds any row lock on `oid`.
    pub fn holds_row_locks_on(&self, oid: TableOid) -> bool {
        self.shared_row_lock_set
            .lock()
            .get(&oid)
            .is_some_and(|rows| !rows.is_empty())
            || self
                .exclusive_row_lock_set
                .lock()
                .get(&oid)
                .is_some_and(|rows| !rows.is_empty())
    }

    fn table_lock_set(&self, mode: LockMode) -> &Mutex<HashSet<TableOid>> {
        match mode {
            LockMode::Shared => &self.shared_table_lock_set,
            LockMode::Exclusive => &self.exclusive_table_lock_set,
            LockMode::IntentionShared => &self.intention_shared_table_lock_set,
            LockMode::IntentionExclusive => &self.intention_exclusive_table_lock_set,
            LockMode::SharedIntentionExclusive => &self.shared_intention_exclusive_table_lock_set,
        }
    }

    fn row_lock_set(&self, mode: LockMode) -> &Mutex<HashMap<TableOid, HashSet<RID>>> {
        match mode {
            LockMode::Shared => &self.shared_row_lock_set,
            LockMode::Exclusive => &self.exclusive_row_lock_set,
            _ => unreachable!("rows only take S and X locks"),
        }
    }

    pub(crate) fn insert_table_lock(&self, mode: LockMode, oid: TableOid) {
        self.table_lock_set(mode).lock().insert(oid);
    }

    pub(crate) fn remove_table_lock(&self, mode: LockMode, oid: TableOid) {
        self.table_lock_set(mode).lock().remove(&oid);
    }

    pub(crate) fn insert_row_lock(&self, mode: LockMode, oid: TableOid, rid: RID) {
        self.row_lock_set(mode)
            .lock()
            .entry(oid)
            .or_default()
            .insert(rid);
    }

    pub(crate) fn remove_row_lock(&self, mode: LockMode, oid: TableOid, rid: RID) {
        if let Some(rows) = self.row_lock_set(mode).lock().get_mut(&oid) {
            rows.remove(&rid);
        }
    }

    /// Snapshot of all held table locks, for bulk release on commit/abort.
    pub(crate) fn table_locks(&self) -> Vec<(LockMode, TableOid)> {
        let mut locks = Vec::new();
        for mode in [
            LockMode::Shared,
            LockMode::Exclusive,
            LockMode::IntentionShared,
            LockMode::IntentionExclusive,
            LockMode::SharedIntentionExclusive,
        ] {
            for &oid in self.table_lock_set(mode).lock().iter() {
                locks.push((mode, oid));
            }
        }
        locks
    }

    /// Snapshot of all held row locks, for bulk release on commit/abort.
    pub(crate) fn row_locks(&self) -> Vec<(LockMode, TableOid, RID)> {
        let mut locks = Vec::new();
        for mode in [LockMode::Shared, LockMode::Exclusive] {
            for (&oid, rows) in self.row_lock_set(mode).lock().iter() {
                for &rid in rows.iter() {
                    locks.push((mode, oid, rid));
                }
            }
        }
        locks
    }
}

/// Formatter implementation for `IsolationLevel`.
impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IsolationLevel::ReadUncommitted => "READ_UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ_COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE_READ",
        };
        write!(f, "{}", name)
    }
}

/// Formatter implementation for `TransactionState`.
impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransactionState::Growing => "GROWING",
            TransactionState::Shrinking => "SHRINKING",
            TransactionState::Committed => "COMMITTED",
            TransactionState::Aborted => "ABORTED",
        };
        write!(f, "{}", name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transaction_basic_properties() {
        let txn = Transaction::new(1, IsolationLevel::ReadCommitted);

        assert_eq!(txn.txn_id(), 1);
        assert_eq!(txn.isolation_level(), IsolationLevel::ReadCommitted);
        assert_eq!(txn.state(), TransactionState::Growing);
        assert_eq!(txn.thread_id(), thread::current().id());
    }

    #[test]
    fn test_transaction_state_transitions() {
        let txn = Transaction::new(1, IsolationLevel::RepeatableRead);
        assert_eq!(txn.state(), TransactionState::Growing);

        txn.set_state(TransactionState::Shrinking);
        assert_eq!(txn.state(), TransactionState::Shrinking);

        txn.set_state(TransactionState::Committed);
        assert_eq!(txn.state(), TransactionState::Committed);
    }

    #[test]
    fn test_lock_set_bookkeeping() {
        let txn = Transaction::new(7, IsolationLevel::RepeatableRead);

        txn.insert_table_lock(LockMode::IntentionExclusive, 3);
        assert_eq!(
            txn.held_table_lock_mode(3),
            Some(LockMode::IntentionExclusive)
        );
        assert_eq!(txn.held_table_lock_mode(4), None);

        txn.insert_row_lock(LockMode::Exclusive, 3, RID::new(1, 1));
        assert!(txn.holds_row_locks_on(3));
        assert_eq!(
            txn.held_row_lock_mode(3, RID::new(1, 1)),
            Some(LockMode::Exclusive)
        );

        txn.remove_row_lock(LockMode::Exclusive, 3, RID::new(1, 1));
        assert!(!txn.holds_row_locks_on(3));

        txn.remove_table_lock(LockMode::IntentionExclusive, 3);
        assert_eq!(txn.held_table_lock_mode(3), None);
    }

    #[test]
    fn test_lock_snapshots() {
        let txn = Transaction::new(9, IsolationLevel::ReadCommitted);
        txn.insert_table_lock(LockMode::IntentionShared, 1);
        txn.insert_table_lock(LockMode::Shared, 2);
        txn.insert_row_lock(LockMode::Shared, 1, RID::new(5, 0));

        let tables = txn.table_locks();
        assert_eq!(tables.len(), 2);
        assert!(tables.contains(&(LockMode::IntentionShared, 1)));
        assert!(tables.contains(&(LockMode::Shared, 2)));

        let rows = txn.row_locks();
        assert_eq!(rows, vec![(LockMode::Shared, 1, RID::new(5, 0))]);
    }

    #[test]
    fn test_isolation_level_display() {
        assert_eq!(
            IsolationLevel::ReadUncommitted.to_string(),
            "READ_UNCOMMITTED"
        );
        assert_eq!(IsolationLevel::ReadCommitted.to_string(), "READ_COMMITTED");
        assert_eq!(
            IsolationLevel::RepeatableRead.to_string(),
            "REPEATABLE_READ"
        );
    }

    #[test]
    fn test_transaction_state_display() {
        assert_eq!(TransactionState::Growing.to_string(), "GROWING");
        assert_eq!(TransactionState::Shrinking.to_string(), "SHRINKING");
        assert_eq!(TransactionState::Committed.to_string(), "COMMITTED");
        assert_eq!(TransactionState::Aborted.to_string(), "ABORTED");
    }
}
