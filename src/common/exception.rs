use std::fmt;

use thiserror::Error;

use crate::common::config::TxnId;

/// Reasons a transaction can be aborted by the lock manager or the
/// deadlock detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    LockOnShrinking,
    UpgradeConflict,
    LockSharedOnReadUncommitted,
    TableLockNotPresent,
    AttemptedUnlockButNoLockHeld,
    TableUnlockedBeforeUnlockingRows,
    IncompatibleUpgrade,
    AttemptedIntentionLockOnRow,
    /// Set by the cycle detector when this transaction was chosen as the victim.
    Deadlock,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AbortReason::LockOnShrinking => "LOCK_ON_SHRINKING",
            AbortReason::UpgradeConflict => "UPGRADE_CONFLICT",
            AbortReason::LockSharedOnReadUncommitted => "LOCK_SHARED_ON_READ_UNCOMMITTED",
            AbortReason::TableLockNotPresent => "TABLE_LOCK_NOT_PRESENT",
            AbortReason::AttemptedUnlockButNoLockHeld => "ATTEMPTED_UNLOCK_BUT_NO_LOCK_HELD",
            AbortReason::TableUnlockedBeforeUnlockingRows => {
                "TABLE_UNLOCKED_BEFORE_UNLOCKING_ROWS"
            }
            AbortReason::IncompatibleUpgrade => "INCOMPATIBLE_UPGRADE",
            AbortReason::AttemptedIntentionLockOnRow => "ATTEMPTED_INTENTION_LOCK_ON_ROW",
            AbortReason::Deadlock => "DEADLOCK",
        };
        write!(f, "{}", name)
    }
}

/// Raised by the lock manager when a request violates the two-phase
/// locking rules. The transaction state has already been set to
/// `Aborted` when this error is returned; the transaction manager is
/// expected to roll back.
#[derive(Debug, Clone, Error)]
#[error("transaction {txn_id} aborted: {reason}")]
pub struct TransactionAbortError {
    pub txn_id: TxnId,
    pub reason: AbortReason,
}

impl TransactionAbortError {
    pub fn new(txn_id: TxnId, reason: AbortReason) -> Self {
        Self { txn_id, reason }
    }
}

/// Errors surfaced by the B+Tree page codecs.
#[derive(Debug, Error)]
pub enum BPlusTreeError {
    #[error("invalid page type")]
    InvalidPageType,

    #[error("node failed to decode: {0}")]
    DeserializationError(String),
}
