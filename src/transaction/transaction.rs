use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

use crate::common::types::{Lsn, Rid, TxnId, INVALID_LSN};
use crate::storage::heap::table::{HeapError, TableHeap};

/// Transaction isolation levels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
}

/// 2PL state machine: Growing acquires, Shrinking releases, then one of
/// the terminal states. Aborted can be entered from anywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Growing,
    Shrinking,
    Committed,
    Aborted,
}

#[derive(Error, Debug)]
pub enum TransactionError {
    #[error("Transaction {0} acquired a lock while shrinking")]
    LockOnShrinking(TxnId),
    #[error("Transaction {0} requested a shared lock at read-uncommitted isolation")]
    LockSharedOnReadUncommitted(TxnId),
    #[error("Transaction {0} lost an upgrade race")]
    UpgradeConflict(TxnId),
    #[error("Transaction {0} was chosen as a deadlock victim")]
    Deadlock(TxnId),
    #[error("Transaction {0} is no longer active")]
    InvalidState(TxnId),
    #[error("Heap error during rollback: {0}")]
    Heap(#[from] HeapError),
    #[error("Log error: {0}")]
    Log(#[from] crate::transaction::wal::log_manager::LogManagerError),
    #[error("Index rollback failed: {0}")]
    IndexRollback(String),
}

pub type Result<T> = std::result::Result<T, TransactionError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOp {
    Insert,
    Delete,
    Update,
}

/// Undo descriptor for one heap mutation. `tuple` is the before-image
/// (for an insert, the inserted bytes).
pub struct TableWriteRecord {
    pub rid: Rid,
    pub op: WriteOp,
    pub tuple: Vec<u8>,
    pub table: Arc<TableHeap>,
}

/// An index an aborting transaction can back its entries out of, with the
/// key already in its encoded form.
pub trait RollbackIndex: Send + Sync {
    fn rollback_insert(
        &self,
        key: &[u8],
    ) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>;
    fn rollback_delete(
        &self,
        key: &[u8],
        rid: Rid,
    ) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// Undo descriptor for one index mutation.
pub struct IndexWriteRecord {
    pub op: WriteOp,
    pub key: Vec<u8>,
    pub rid: Rid,
    pub index: Arc<dyn RollbackIndex>,
}

/// An active transaction. Shared as `Arc<Transaction>` between the worker
/// thread, the lock manager and the deadlock detector, so every mutable
/// field sits behind interior mutability.
pub struct Transaction {
    id: TxnId,
    isolation_level: IsolationLevel,
    state: Mutex<TransactionState>,
    prev_lsn: AtomicU32,
    shared_lock_set: Mutex<HashSet<Rid>>,
    exclusive_lock_set: Mutex<HashSet<Rid>>,
    write_set: Mutex<Vec<TableWriteRecord>>,
    index_write_set: Mutex<Vec<IndexWriteRecord>>,
}

impl Transaction {
    pub fn new(id: TxnId, isolation_level: IsolationLevel) -> Self {
        Self {
            id,
            isolation_level,
            state: Mutex::new(TransactionState::Growing),
            prev_lsn: AtomicU32::new(INVALID_LSN),
            shared_lock_set: Mutex::new(HashSet::new()),
            exclusive_lock_set: Mutex::new(HashSet::new()),
            write_set: Mutex::new(Vec::new()),
            index_write_set: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn isolation_level(&self) -> IsolationLevel {
        self.isolation_level
    }

    pub fn state(&self) -> TransactionState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: TransactionState) {
        *self.state.lock() = state;
    }

    /// LSN of this transaction's most recent log record; threads its
    /// per-transaction undo chain.
    pub fn prev_lsn(&self) -> Lsn {
        self.prev_lsn.load(Ordering::SeqCst)
    }

    pub fn set_prev_lsn(&self, lsn: Lsn) {
        self.prev_lsn.store(lsn, Ordering::SeqCst);
    }

    pub fn is_shared_locked(&self, rid: Rid) -> bool {
        self.shared_lock_set.lock().contains(&rid)
    }

    pub fn is_exclusive_locked(&self, rid: Rid) -> bool {
        self.exclusive_lock_set.lock().contains(&rid)
    }

    pub fn add_shared_lock(&self, rid: Rid) {
        self.shared_lock_set.lock().insert(rid);
    }

    pub fn add_exclusive_lock(&self, rid: Rid) {
        self.exclusive_lock_set.lock().insert(rid);
    }

    pub fn remove_shared_lock(&self, rid: Rid) {
        self.shared_lock_set.lock().remove(&rid);
    }

    pub fn remove_exclusive_lock(&self, rid: Rid) {
        self.exclusive_lock_set.lock().remove(&rid);
    }

    pub fn shared_locks(&self) -> Vec<Rid> {
        self.shared_lock_set.lock().iter().copied().collect()
    }

    pub fn exclusive_locks(&self) -> Vec<Rid> {
        self.exclusive_lock_set.lock().iter().copied().collect()
    }

    /// Record an undo descriptor. Callers append only after the mutation
    /// itself succeeded, so a failed mutation leaves no rollback entry.
    pub fn append_write_record(&self, record: TableWriteRecord) {
        self.write_set.lock().push(record);
    }

    /// Pop the most recent undo descriptor; Abort drains these in reverse.
    pub fn pop_write_record(&self) -> Option<TableWriteRecord> {
        self.write_set.lock().pop()
    }

    pub fn take_write_set(&self) -> Vec<TableWriteRecord> {
        std::mem::take(&mut self.write_set.lock())
    }

    pub fn append_index_record(&self, record: IndexWriteRecord) {
        self.index_write_set.lock().push(record);
    }

    pub fn pop_index_record(&self) -> Option<IndexWriteRecord> {
        self.index_write_set.lock().pop()
    }
}
