use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::common::types::TxnId;
use crate::transaction::lock_manager::LockManager;
use crate::transaction::transaction::{
    IsolationLevel, Result, Transaction, TransactionError, TransactionState, WriteOp,
};
use crate::transaction::wal::log_manager::LogManager;
use crate::transaction::wal::log_record::{LogPayload, LogRecord};

/// Transaction lifecycle: Begin hands out ids and BEGIN records, Commit
/// finalizes deletes and waits for the log to reach the commit LSN,
/// Abort walks the write sets backwards issuing inverse operations.
pub struct TransactionManager {
    next_txn_id: AtomicU32,
    lock_manager: Arc<LockManager>,
    log_manager: Arc<LogManager>,
    active_txns: Mutex<HashMap<TxnId, Arc<Transaction>>>,
}

impl TransactionManager {
    pub fn new(lock_manager: Arc<LockManager>, log_manager: Arc<LogManager>) -> Self {
        Self {
            next_txn_id: AtomicU32::new(1),
            lock_manager,
            log_manager,
            active_txns: Mutex::new(HashMap::new()),
        }
    }

    /// Start a transaction and log its BEGIN record.
    pub fn begin(&self, isolation_level: IsolationLevel) -> Result<Arc<Transaction>> {
        let txn_id = self.next_txn_id.fetch_add(1, Ordering::SeqCst);
        let txn = Arc::new(Transaction::new(txn_id, isolation_level));

        let mut record = LogRecord::new(txn_id, txn.prev_lsn(), LogPayload::Begin);
        let lsn = self.log_manager.append_log_record(&mut record)?;
        txn.set_prev_lsn(lsn);

        self.active_txns.lock().insert(txn_id, Arc::clone(&txn));
        Ok(txn)
    }

    /// Commit: finalize pending deletes, log COMMIT, block until the log
    /// is durable up to the commit LSN (group commit), release locks.
    pub fn commit(&self, txn: &Arc<Transaction>) -> Result<()> {
        if txn.state() == TransactionState::Aborted
            || txn.state() == TransactionState::Committed
        {
            return Err(TransactionError::InvalidState(txn.id()));
        }

        // mark-deleted tuples become real deletes at commit
        for record in txn.take_write_set() {
            if record.op == WriteOp::Delete {
                record.table.apply_delete(txn, record.rid)?;
            }
        }

        let mut record = LogRecord::new(txn.id(), txn.prev_lsn(), LogPayload::Commit);
        let commit_lsn = self.log_manager.append_log_record(&mut record)?;
        txn.set_prev_lsn(commit_lsn);
        self.log_manager.flush_till_lsn(commit_lsn)?;

        txn.set_state(TransactionState::Committed);
        self.lock_manager.release_all(txn);
        self.active_txns.lock().remove(&txn.id());
        Ok(())
    }

    /// Abort: undo the heap write set in reverse, then the index write
    /// set, log ABORT, release locks. The compensations are logged so a
    /// crash mid-abort still recovers to the rolled-back state.
    pub fn abort(&self, txn: &Arc<Transaction>) -> Result<()> {
        if txn.state() == TransactionState::Committed {
            return Err(TransactionError::InvalidState(txn.id()));
        }

        while let Some(record) = txn.pop_write_record() {
            match record.op {
                WriteOp::Insert => record.table.apply_delete(txn, record.rid)?,
                WriteOp::Delete => record.table.rollback_mark_delete(txn, record.rid)?,
                WriteOp::Update => {
                    record.table.rollback_update(txn, record.rid, &record.tuple)?
                }
            }
        }

        while let Some(record) = txn.pop_index_record() {
            let result = match record.op {
                WriteOp::Insert => record.index.rollback_insert(&record.key),
                WriteOp::Delete => record.index.rollback_delete(&record.key, record.rid),
                WriteOp::Update => Ok(()),
            };
            result.map_err(|e| TransactionError::IndexRollback(e.to_string()))?;
        }

        let mut record = LogRecord::new(txn.id(), txn.prev_lsn(), LogPayload::Abort);
        let lsn = self.log_manager.append_log_record(&mut record)?;
        txn.set_prev_lsn(lsn);

        txn.set_state(TransactionState::Aborted);
        self.lock_manager.release_all(txn);
        self.active_txns.lock().remove(&txn.id());
        Ok(())
    }

    pub fn get_transaction(&self, txn_id: TxnId) -> Option<Arc<Transaction>> {
        self.active_txns.lock().get(&txn_id).cloned()
    }

    pub fn active_transaction_ids(&self) -> Vec<TxnId> {
        self.active_txns.lock().keys().copied().collect()
    }
}
