use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;

use crate::common::config::TxnId;
use crate::concurrency::lock_manager::LockManager;
use crate::concurrency::transaction::{IsolationLevel, Transaction, TransactionState};

/// Owns the transaction lifecycle: id assignment, the registry the
/// deadlock detector aborts victims through, and lock release on
/// commit/abort.
pub struct TransactionManager {
    next_txn_id: AtomicU64,
    txn_map: Mutex<HashMap<TxnId, Arc<Transaction>>>,
}

impl TransactionManager {
    pub fn new() -> Self {
        Self {
            next_txn_id: AtomicU64::new(0),
            txn_map: Mutex::new(HashMap::new()),
        }
    }

    /// Starts a new transaction at the given isolation level.
    pub fn begin(&self, isolation_level: IsolationLevel) -> Arc<Transaction> {
        let txn_id = self.next_txn_id.fetch_add(1, Ordering::SeqCst);
        let txn = Arc::new(Transaction::new(txn_id, isolation_level));
        self.txn_map.lock().insert(txn_id, Arc::clone(&txn));
        debug!("txn {} begins at {}", txn_id, isolation_level);
        txn
    }

    /// Looks up a live transaction by id.
    pub fn get_transaction(&self, txn_id: TxnId) -> Option<Arc<Transaction>> {
        self.txn_map.lock().get(&txn_id).cloned()
    }

    /// Commits the transaction, releasing every lock it still holds.
    pub fn commit(&self, txn: &Arc<Transaction>, lock_manager: &LockManager) {
        lock_manager.release_all_locks(txn);
        txn.set_state(TransactionState::Committed);
        self.txn_map.lock().remove(&txn.txn_id());
        debug!("txn {} committed", txn.txn_id());
    }

    /// Aborts the transaction, releasing every lock it still holds. Also
    /// used to unwind deadlock victims after their lock request fails.
    pub fn abort(&self, txn: &Arc<Transaction>, lock_manager: &LockManager) {
        txn.set_state(TransactionState::Aborted);
        lock_manager.release_all_locks(txn);
        self.txn_map.lock().remove(&txn.txn_id());
        debug!("txn {} aborted", txn.txn_id());
    }
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new()
    }
}
