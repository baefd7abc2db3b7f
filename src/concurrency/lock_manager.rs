//! Hierarchical two-phase lock manager.
//!
//! Tables take all five modes (`S`, `X`, `IS`, `IX`, `SIX`); rows take
//! `S` and `X` only and require an appropriate table lock first. Each
//! resource has one FIFO request queue: new requests join the tail, a
//! valid upgrade drops its old grant and jumps to the head, and granting
//! scans the queue in order, stopping at the first request incompatible
//! with the cumulative granted set (strict FIFO, no bypass).
//!
//! A background detector periodically builds the wait-for graph from the
//! queues, finds cycles with a deterministic smallest-source DFS, and
//! aborts the largest (youngest) transaction id on each cycle. Victims
//! discover the abort when the queue broadcast wakes them, withdraw their
//! pending request, and return failure so the transaction manager can
//! unwind them.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;

use log::{debug, trace};
use parking_lot::{Condvar, Mutex};

use crate::common::config::{TableOid, TxnId, CYCLE_DETECTION_INTERVAL, INVALID_TXN_ID};
use crate::common::exception::{AbortReason, TransactionAbortError};
use crate::common::rid::RID;
use crate::concurrency::transaction::{IsolationLevel, Transaction, TransactionState};
use crate::concurrency::transaction_manager::TransactionManager;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LockMode {
    Shared,
    Exclusive,
    IntentionShared,
    IntentionExclusive,
    SharedIntentionExclusive,
}

impl LockMode {
    /// The lock compatibility matrix: whether a resource already held in
    /// `self` admits a concurrent grant of `requested`.
    pub fn is_compatible_with(self, requested: LockMode) -> bool {
        use LockMode::*;
        match (self, requested) {
            (IntentionShared, Exclusive) | (Exclusive, _) => false,
            (IntentionShared, _) => true,
            (IntentionExclusive, IntentionShared) | (IntentionExclusive, IntentionExclusive) => {
                true
            }
            (IntentionExclusive, _) => false,
            (Shared, IntentionShared) | (Shared, Shared) => true,
            (Shared, _) => false,
            (SharedIntentionExclusive, IntentionShared) => true,
            (SharedIntentionExclusive, _) => false,
        }
    }

    /// The upgrade lattice: `IS -> {S, X, IX, SIX}`, `S -> {X, SIX}`,
    /// `IX -> {X, SIX}`, `SIX -> {X}`.
    pub fn can_upgrade_to(self, target: LockMode) -> bool {
        use LockMode::*;
        match self {
            IntentionShared => matches!(
                target,
                Shared | Exclusive | IntentionExclusive | SharedIntentionExclusive
            ),
            Shared => matches!(target, Exclusive | SharedIntentionExclusive),
            IntentionExclusive => matches!(target, Exclusive | SharedIntentionExclusive),
            SharedIntentionExclusive => matches!(target, Exclusive),
            Exclusive => false,
        }
    }

    pub fn is_intention(self) -> bool {
        matches!(
            self,
            LockMode::IntentionShared | LockMode::IntentionExclusive
                | LockMode::SharedIntentionExclusive
        )
    }
}

/// A lock request on a table or a row. For table requests `rid` is unset.
#[derive(Debug, Clone)]
pub struct LockRequest {
    txn_id: TxnId,
    lock_mode: LockMode,
    oid: TableOid,
    rid: Option<RID>,
    granted: bool,
}

impl LockRequest {
    fn new_table_request(txn_id: TxnId, lock_mode: LockMode, oid: TableOid) -> Self {
        Self {
            txn_id,
            lock_mode,
            oid,
            rid: None,
            granted: false,
        }
    }

    fn new_row_request(txn_id: TxnId, lock_mode: LockMode, oid: TableOid, rid: RID) -> Self {
        Self {
            txn_id,
            lock_mode,
            oid,
            rid: Some(rid),
            granted: false,
        }
    }
}

struct QueueInner {
    queue: VecDeque<LockRequest>,
    /// The one transaction allowed to be upgrading on this resource.
    upgrading: TxnId,
}

/// FIFO request queue for one resource, with the condition variable its
/// waiters park on.
pub struct LockRequestQueue {
    inner: Mutex<QueueInner>,
    cv: Condvar,
}

impl LockRequestQueue {
    fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                queue: VecDeque::new(),
                upgrading: INVALID_TXN_ID,
            }),
            cv: Condvar::new(),
        }
    }
}

/// LockManager handles transactions asking for locks on tables and rows.
pub struct LockManager {
    txn_manager: Arc<TransactionManager>,
    table_lock_map: Mutex<HashMap<TableOid, Arc<LockRequestQueue>>>,
    row_lock_map: Mutex<HashMap<RID, Arc<LockRequestQueue>>>,
    enable_cycle_detection: AtomicBool,
    detector_thread: Mutex<Option<thread::JoinHandle<()>>>,
    /// Wait-for graph, rebuilt from the queues each detection cycle.
    /// Adjacency lists are kept sorted for deterministic traversal.
    waits_for: Mutex<BTreeMap<TxnId, Vec<TxnId>>>,
}

impl LockManager {
    pub fn new(txn_manager: Arc<TransactionManager>) -> Self {
        Self {
            txn_manager,
            table_lock_map: Mutex::new(HashMap::new()),
            row_lock_map: Mutex::new(HashMap::new()),
            enable_cycle_detection: AtomicBool::new(false),
            detector_thread: Mutex::new(None),
            waits_for: Mutex::new(BTreeMap::new()),
        }
    }

    /// Marks the transaction aborted and produces the error to return.
    fn abort_txn(&self, txn: &Transaction, reason: AbortReason) -> TransactionAbortError {
        txn.set_state(TransactionState::Aborted);
        debug!("txn {} aborted: {}", txn.txn_id(), reason);
        TransactionAbortError::new(txn.txn_id(), reason)
    }

    /// Isolation-level acquisition rules (applies to tables and rows).
    fn check_acquisition(
        &self,
        txn: &Transaction,
        lock_mode: LockMode,
    ) -> Result<(), TransactionAbortError> {
        match txn.isolation_level() {
            IsolationLevel::RepeatableRead => {
                if txn.state() == TransactionState::Shrinking {
                    return Err(self.abort_txn(txn, AbortReason::LockOnShrinking));
                }
            }
            IsolationLevel::ReadCommitted => {
                if txn.state() == TransactionState::Shrinking
                    && !matches!(lock_mode, LockMode::IntentionShared | LockMode::Shared)
                {
                    return Err(self.abort_txn(txn, AbortReason::LockOnShrinking));
                }
            }
            IsolationLevel::ReadUncommitted => {
                if !matches!(
                    lock_mode,
                    LockMode::Exclusive | LockMode::IntentionExclusive
                ) {
                    return Err(
                        self.abort_txn(txn, AbortReason::LockSharedOnReadUncommitted)
                    );
                }
                if txn.state() == TransactionState::Shrinking {
                    return Err(self.abort_txn(txn, AbortReason::LockOnShrinking));
                }
            }
        }
        Ok(())
    }

    fn table_queue(&self, oid: TableOid) -> Arc<LockRequestQueue> {
        let mut map = self.table_lock_map.lock();
        Arc::clone(
            map.entry(oid)
                .or_insert_with(|| Arc::new(LockRequestQueue::new())),
        )
        // The map latch drops here; only the queue latch is held from now on.
    }

    fn row_queue(&self, rid: RID) -> Arc<LockRequestQueue> {
        let mut map = self.row_lock_map.lock();
        Arc::clone(
            map.entry(rid)
                .or_insert_with(|| Arc::new(LockRequestQueue::new())),
        )
    }

    /// Whether `txn_id` should be treated as absent when scanning queues.
    fn txn_is_absent(&self, txn_id: TxnId) -> bool {
        match self.txn_manager.get_transaction(txn_id) {
            Some(txn) => txn.state() == TransactionState::Aborted,
            None => true,
        }
    }

    /// One FIFO grant scan. Computes the set of modes compatible with the
    /// already-granted requests, then walks the waiters in order, stopping
    /// at the first incompatible one. Returns true when `txn`'s request
    /// was granted (and book-kept in its lock sets).
    fn try_grant(&self, inner: &mut QueueInner, txn: &Transaction) -> bool {
        let grantable = |mode: LockMode, granted_modes: &[LockMode]| {
            granted_modes.iter().all(|&g| g.is_compatible_with(mode))
        };

        let mut granted_modes: Vec<LockMode> = Vec::new();
        for request in inner.queue.iter().filter(|r| r.granted) {
            if !self.txn_is_absent(request.txn_id) {
                granted_modes.push(request.lock_mode);
            }
        }

        let mut grant_index = None;
        for (index, request) in inner.queue.iter().enumerate() {
            if request.granted {
                continue;
            }
            if self.txn_is_absent(request.txn_id) {
                continue;
            }
            if !grantable(request.lock_mode, &granted_modes) {
                // Strict FIFO: nothing behind this request may be granted.
                break;
            }
            if request.txn_id == txn.txn_id() {
                grant_index = Some(index);
                break;
            }
            // Tentatively granted ahead of us; it constrains what follows.
            granted_modes.push(request.lock_mode);
        }

        let Some(index) = grant_index else {
            return false;
        };
        let request = &mut inner.queue[index];
        request.granted = true;
        let (lock_mode, oid, rid) = (request.lock_mode, request.oid, request.rid);
        if inner.upgrading == txn.txn_id() {
            inner.upgrading = INVALID_TXN_ID;
        }
        match rid {
            Some(rid) => txn.insert_row_lock(lock_mode, oid, rid),
            None => txn.insert_table_lock(lock_mode, oid),
        }
        trace!("txn {} granted {:?} on table {}", txn.txn_id(), lock_mode, oid);
        true
    }

    /// Removes `txn_id`'s pending request and upgrade reservation.
    fn withdraw(inner: &mut QueueInner, txn_id: TxnId) {
        inner.queue.retain(|r| r.txn_id != txn_id || r.granted);
        if inner.upgrading == txn_id {
            inner.upgrading = INVALID_TXN_ID;
        }
    }

    /// Parks on the queue until the request is granted. Returns false when
    /// the transaction was aborted while waiting (deadlock victim); the
    /// pending request is withdrawn before returning.
    fn wait_for_grant(&self, queue: &LockRequestQueue, txn: &Transaction) -> bool {
        let mut inner = queue.inner.lock();
        loop {
            if txn.state() == TransactionState::Aborted {
                Self::withdraw(&mut inner, txn.txn_id());
                drop(inner);
                queue.cv.notify_all();
                return false;
            }
            if self.try_grant(&mut inner, txn) {
                // A grant can unblock compatible requests right behind it.
                drop(inner);
                queue.cv.notify_all();
                return true;
            }
            queue.cv.wait(&mut inner);
        }
    }

    /// Acquires a table lock in the given mode, blocking until granted.
    ///
    /// Returns `Ok(false)` if the transaction was aborted while waiting.
    /// Rule violations abort the transaction and return the abort error.
    pub fn lock_table(
        &self,
        txn: &Transaction,
        lock_mode: LockMode,
        oid: TableOid,
    ) -> Result<bool, TransactionAbortError> {
        self.check_acquisition(txn, lock_mode)?;

        let upgrade_from = match txn.held_table_lock_mode(oid) {
            Some(held) if held == lock_mode => return Ok(true),
            Some(held) => {
                if !held.can_upgrade_to(lock_mode) {
                    return Err(self.abort_txn(txn, AbortReason::IncompatibleUpgrade));
                }
                Some(held)
            }
            None => None,
        };

        let queue = self.table_queue(oid);
        {
            let mut inner = queue.inner.lock();
            if let Some(held) = upgrade_from {
                if inner.upgrading != INVALID_TXN_ID {
                    return Err(self.abort_txn(txn, AbortReason::UpgradeConflict));
                }
                // Drop the old grant, reserve the upgrade slot, and jump to
                // the head so the holder cannot wait behind its own readers.
                inner.queue.retain(|r| r.txn_id != txn.txn_id());
                txn.remove_table_lock(held, oid);
                inner.upgrading = txn.txn_id();
                inner
                    .queue
                    .push_front(LockRequest::new_table_request(txn.txn_id(), lock_mode, oid));
            } else {
                inner
                    .queue
                    .push_back(LockRequest::new_table_request(txn.txn_id(), lock_mode, oid));
            }
        }
        Ok(self.wait_for_grant(&queue, txn))
    }

    /// Releases the table lock held by the transaction.
    ///
    /// All row locks on the table must have been released first. Updates
    /// the transaction phase per the unlock-to-shrinking rules.
    pub fn unlock_table(
        &self,
        txn: &Transaction,
        oid: TableOid,
    ) -> Result<bool, TransactionAbortError> {
        let Some(held) = txn.held_table_lock_mode(oid) else {
            return Err(self.abort_txn(txn, AbortReason::AttemptedUnlockButNoLockHeld));
        };
        if txn.holds_row_locks_on(oid) {
            return Err(self.abort_txn(txn, AbortReason::TableUnlockedBeforeUnlockingRows));
        }

        let queue = self.table_queue(oid);
        {
            let mut inner = queue.inner.lock();
            inner
                .queue
                .retain(|r| !(r.txn_id == txn.txn_id() && r.granted));
        }
        queue.cv.notify_all();

        self.transition_on_unlock(txn, held);
        txn.remove_table_lock(held, oid);
        trace!("txn {} released {:?} on table {}", txn.txn_id(), held, oid);
        Ok(true)
    }

    /// Acquires a row lock (`S` or `X` only), blocking until granted. The
    /// transaction must already hold a suitable table lock.
    pub fn lock_row(
        &self,
        txn: &Transaction,
        lock_mode: LockMode,
        oid: TableOid,
        rid: RID,
    ) -> Result<bool, TransactionAbortError> {
        if lock_mode.is_intention() {
            return Err(self.abort_txn(txn, AbortReason::AttemptedIntentionLockOnRow));
        }
        self.check_acquisition(txn, lock_mode)?;

        // Multilevel check: row S under any table lock, row X only under
        // IX, X, or SIX.
        let table_mode = txn.held_table_lock_mode(oid);
        let table_lock_ok = match lock_mode {
            LockMode::Shared => table_mode.is_some(),
            LockMode::Exclusive => matches!(
                table_mode,
                Some(LockMode::IntentionExclusive)
                    | Some(LockMode::Exclusive)
                    | Some(LockMode::SharedIntentionExclusive)
            ),
            _ => unreachable!("intention modes rejected above"),
        };
        if !table_lock_ok {
            return Err(self.abort_txn(txn, AbortReason::TableLockNotPresent));
        }

        let upgrade_from = match txn.held_row_lock_mode(oid, rid) {
            Some(held) if held == lock_mode => return Ok(true),
            Some(held) => {
                if !held.can_upgrade_to(lock_mode) {
                    return Err(self.abort_txn(txn, AbortReason::IncompatibleUpgrade));
                }
                Some(held)
            }
            None => None,
        };

        let queue = self.row_queue(rid);
        {
            let mut inner = queue.inner.lock();
            if let Some(held) = upgrade_from {
                if inner.upgrading != INVALID_TXN_ID {
                    return Err(self.abort_txn(txn, AbortReason::UpgradeConflict));
                }
                inner.queue.retain(|r| r.txn_id != txn.txn_id());
                txn.remove_row_lock(held, oid, rid);
                inner.upgrading = txn.txn_id();
                inner.queue.push_front(LockRequest::new_row_request(
                    txn.txn_id(),
                    lock_mode,
                    oid,
                    rid,
                ));
            } else {
                inner.queue.push_back(LockRequest::new_row_request(
                    txn.txn_id(),
                    lock_mode,
                    oid,
                    rid,
                ));
            }
        }
        Ok(self.wait_for_grant(&queue, txn))
    }

    /// Releases a row lock. With `force`, skips the phase transition (used
    /// when rolling back).
    pub fn unlock_row(
        &self,
        txn: &Transaction,
        oid: TableOid,
        rid: RID,
        force: bool,
    ) -> Result<bool, TransactionAbortError> {
        let Some(held) = txn.held_row_lock_mode(oid, rid) else {
            return Err(self.abort_txn(txn, AbortReason::AttemptedUnlockButNoLockHeld));
        };

        let queue = self.row_queue(rid);
        {
            let mut inner = queue.inner.lock();
            inner
                .queue
                .retain(|r| !(r.txn_id == txn.txn_id() && r.granted));
        }
        queue.cv.notify_all();

        if !force {
            self.transition_on_unlock(txn, held);
        }
        txn.remove_row_lock(held, oid, rid);
        Ok(true)
    }

    /// Unlock-to-shrinking rules: `REPEATABLE_READ` shrinks on S or X,
    /// `READ_COMMITTED` and `READ_UNCOMMITTED` on X only.
    fn transition_on_unlock(&self, txn: &Transaction, unlocked: LockMode) {
        if txn.state() != TransactionState::Growing {
            return;
        }
        let shrinks = match txn.isolation_level() {
            IsolationLevel::RepeatableRead => {
                matches!(unlocked, LockMode::Shared | LockMode::Exclusive)
            }
            IsolationLevel::ReadCommitted | IsolationLevel::ReadUncommitted => {
                matches!(unlocked, LockMode::Exclusive)
            }
        };
        if shrinks {
            txn.set_state(TransactionState::Shrinking);
        }
    }

    /// Releases every lock the transaction still holds, rows first, with
    /// no phase bookkeeping. Used by commit and abort.
    pub fn release_all_locks(&self, txn: &Transaction) {
        for (mode, oid, rid) in txn.row_locks() {
            let queue = self.row_queue(rid);
            {
                let mut inner = queue.inner.lock();
                inner.queue.retain(|r| r.txn_id != txn.txn_id());
                if inner.upgrading == txn.txn_id() {
                    inner.upgrading = INVALID_TXN_ID;
                }
            }
            queue.cv.notify_all();
            txn.remove_row_lock(mode, oid, rid);
        }
        for (mode, oid) in txn.table_locks() {
            let queue = self.table_queue(oid);
            {
                let mut inner = queue.inner.lock();
                inner.queue.retain(|r| r.txn_id != txn.txn_id());
                if inner.upgrading == txn.txn_id() {
                    inner.upgrading = INVALID_TXN_ID;
                }
            }
            queue.cv.notify_all();
            txn.remove_table_lock(mode, oid);
        }
    }

    /// Adds an edge `t1 -> t2` (t1 waits for t2) to the wait-for graph.
    pub fn add_edge(&self, t1: TxnId, t2: TxnId) {
        let mut graph = self.waits_for.lock();
        let edges = graph.entry(t1).or_default();
        if let Err(pos) = edges.binary_search(&t2) {
            edges.insert(pos, t2);
        }
    }

    /// Removes the edge `t1 -> t2` from the wait-for graph.
    pub fn remove_edge(&self, t1: TxnId, t2: TxnId) {
        let mut graph = self.waits_for.lock();
        if let Some(edges) = graph.get_mut(&t1) {
            if let Ok(pos) = edges.binary_search(&t2) {
                edges.remove(pos);
            }
        }
    }

    /// All edges currently in the wait-for graph.
    pub fn get_edge_list(&self) -> Vec<(TxnId, TxnId)> {
        let graph = self.waits_for.lock();
        graph
            .iter()
            .flat_map(|(&from, tos)| tos.iter().map(move |&to| (from, to)))
            .collect()
    }

    /// Looks for a cycle, exploring sources in ascending txn id order and
    /// neighbors in ascending order. Returns the largest (youngest) txn id
    /// on the first cycle found.
    pub fn has_cycle(&self) -> Option<TxnId> {
        let graph = self.waits_for.lock();
        let mut visited: HashSet<TxnId> = HashSet::new();

        for &source in graph.keys() {
            if visited.contains(&source) {
                continue;
            }
            let mut path: Vec<TxnId> = Vec::new();
            let mut on_path: HashSet<TxnId> = HashSet::new();
            if let Some(victim) =
                Self::find_cycle(&graph, source, &mut path, &mut on_path, &mut visited)
            {
                return Some(victim);
            }
        }
        None
    }

    fn find_cycle(
        graph: &BTreeMap<TxnId, Vec<TxnId>>,
        node: TxnId,
        path: &mut Vec<TxnId>,
        on_path: &mut HashSet<TxnId>,
        visited: &mut HashSet<TxnId>,
    ) -> Option<TxnId> {
        visited.insert(node);
        on_path.insert(node);
        path.push(node);

        if let Some(neighbors) = graph.get(&node) {
            for &next in neighbors {
                if on_path.contains(&next) {
                    // Cycle: everything on the path from `next` onwards.
                    let start = path.iter().position(|&n| n == next).expect("on path");
                    let victim = *path[start..].iter().max().expect("non-empty cycle");
                    return Some(victim);
                }
                if !visited.contains(&next) {
                    if let Some(victim) = Self::find_cycle(graph, next, path, on_path, visited) {
                        return Some(victim);
                    }
                }
            }
        }

        on_path.remove(&node);
        path.pop();
        None
    }

    fn all_queues(&self) -> Vec<Arc<LockRequestQueue>> {
        let tables = self.table_lock_map.lock();
        let rows = self.row_lock_map.lock();
        tables
            .values()
            .chain(rows.values())
            .map(Arc::clone)
            .collect()
    }

    /// Rebuilds the wait-for graph from a snapshot of every queue. Queue
    /// latches are released before any cycle search runs. Returns true
    /// when some queue still parks a waiter whose transaction is already
    /// aborted (it raced the previous broadcast and must be woken again).
    fn build_waits_for(&self) -> bool {
        let queues = self.all_queues();
        let mut stale_waiters = false;

        self.waits_for.lock().clear();
        for queue in queues {
            let inner = queue.inner.lock();
            let holders: Vec<TxnId> = inner
                .queue
                .iter()
                .filter(|r| r.granted && !self.txn_is_absent(r.txn_id))
                .map(|r| r.txn_id)
                .collect();
            let mut waiters: Vec<TxnId> = Vec::new();
            for request in inner.queue.iter().filter(|r| !r.granted) {
                if self.txn_is_absent(request.txn_id) {
                    stale_waiters = true;
                } else {
                    waiters.push(request.txn_id);
                }
            }
            drop(inner);
            for &waiter in &waiters {
                for &holder in &holders {
                    self.add_edge(waiter, holder);
                }
            }
        }
        stale_waiters
    }

    /// One detection pass: rebuild the graph, abort the youngest member of
    /// every cycle, and broadcast all queues if anything was aborted (or an
    /// already-aborted waiter is still parked). Returns the victims.
    pub fn run_detection_pass(&self) -> Vec<TxnId> {
        let stale_waiters = self.build_waits_for();

        let mut victims = Vec::new();
        while let Some(victim) = self.has_cycle() {
            debug!("deadlock detected, aborting txn {}", victim);
            if let Some(txn) = self.txn_manager.get_transaction(victim) {
                txn.set_state(TransactionState::Aborted);
            }
            self.waits_for.lock().remove(&victim);
            victims.push(victim);
        }

        if !victims.is_empty() || stale_waiters {
            for queue in self.all_queues() {
                queue.cv.notify_all();
            }
        }
        victims
    }

    /// Starts the background deadlock detection task.
    pub fn start_deadlock_detection(self: &Arc<Self>) {
        let mut thread_slot = self.detector_thread.lock();
        if thread_slot.is_some() {
            return;
        }
        self.enable_cycle_detection.store(true, Ordering::SeqCst);
        let weak: Weak<LockManager> = Arc::downgrade(self);
        *thread_slot = Some(thread::spawn(move || loop {
            thread::sleep(CYCLE_DETECTION_INTERVAL);
            let Some(lock_manager) = weak.upgrade() else {
                break;
            };
            if !lock_manager.enable_cycle_detection.load(Ordering::SeqCst) {
                break;
            }
            lock_manager.run_detection_pass();
        }));
    }

    /// Stops the background deadlock detection task and joins it.
    pub fn stop_deadlock_detection(&self) {
        self.enable_cycle_detection.store(false, Ordering::SeqCst);
        if let Some(handle) = self.detector_thread.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for LockManager {
    fn drop(&mut self) {
        self.enable_cycle_detection.store(false, Ordering::SeqCst);
    }
}
