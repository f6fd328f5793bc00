use std::sync::Arc;

use thiserror::Error;

use crate::common::types::{Page, PageId, Rid};
use crate::storage::buffer::{BufferPoolError, BufferPoolManager};
use crate::storage::page::error::PageError;
use crate::storage::page::manager::PageManager;
use crate::transaction::transaction::{TableWriteRecord, Transaction, WriteOp};
use crate::transaction::wal::log_manager::{LogManager, LogManagerError};
use crate::transaction::wal::log_record::{LogPayload, LogRecord};

#[derive(Error, Debug)]
pub enum HeapError {
    #[error("Buffer pool error: {0}")]
    BufferPool(#[from] BufferPoolError),
    #[error("Page error: {0}")]
    Page(#[from] PageError),
    #[error("Log error: {0}")]
    Log(#[from] LogManagerError),
    #[error("Tuple of {0} bytes does not fit on a page")]
    TupleTooLarge(usize),
}

pub type Result<T> = std::result::Result<T, HeapError>;

/// A logged heap of tuples: a linked chain of slotted pages whose every
/// mutation appends a WAL record and stamps the page LSN before the pin
/// is released. The undo descriptor is recorded only after the mutation
/// and its log append both succeeded.
///
/// Deletes are two-phase: `mark_delete` during the transaction,
/// `apply_delete` at commit, `rollback_mark_delete` on abort.
pub struct TableHeap {
    buffer_pool: Arc<BufferPoolManager>,
    log_manager: Arc<LogManager>,
    page_manager: PageManager,
    first_page_id: PageId,
}

impl TableHeap {
    /// Create a heap with one empty page, logged as NEWPAGE under `txn`.
    pub fn new(
        buffer_pool: Arc<BufferPoolManager>,
        log_manager: Arc<LogManager>,
        txn: &Transaction,
    ) -> Result<Self> {
        let (page_ptr, page_id) = buffer_pool.new_page()?;
        let page_manager = PageManager::new();
        {
            let mut page = page_ptr.write();
            page_manager.init_page(&mut page);
            let mut record = LogRecord::new(
                txn.id(),
                txn.prev_lsn(),
                LogPayload::NewPage {
                    prev_page_id: crate::common::types::INVALID_PAGE_ID,
                    page_id,
                },
            );
            let lsn = log_manager.append_log_record(&mut record)?;
            txn.set_prev_lsn(lsn);
            page.set_lsn(lsn);
        }
        buffer_pool.unpin_page(page_id, true)?;

        Ok(Self {
            buffer_pool,
            log_manager,
            page_manager,
            first_page_id: page_id,
        })
    }

    /// Reattach to a heap whose first page already exists (after restart).
    pub fn open(
        buffer_pool: Arc<BufferPoolManager>,
        log_manager: Arc<LogManager>,
        first_page_id: PageId,
    ) -> Self {
        Self {
            buffer_pool,
            log_manager,
            page_manager: PageManager::new(),
            first_page_id,
        }
    }

    pub fn first_page_id(&self) -> PageId {
        self.first_page_id
    }

    /// Insert a tuple, walking the page chain for space and extending it
    /// when every page is full. Returns the tuple's address.
    pub fn insert_tuple(self: &Arc<Self>, txn: &Transaction, data: &[u8]) -> Result<Rid> {
        if data.len() > PageManager::max_record_size() {
            return Err(HeapError::TupleTooLarge(data.len()));
        }

        let mut page_id = self.first_page_id;
        loop {
            let page_ptr = self.buffer_pool.fetch_page(page_id)?;
            let mut page = page_ptr.write();
            match self.page_manager.insert_record(&mut page, data) {
                Ok(slot) => {
                    let rid = Rid::new(page_id, slot);
                    self.append_and_stamp(
                        txn,
                        LogPayload::Insert {
                            rid,
                            tuple: data.to_vec(),
                        },
                        &mut page,
                    )?;
                    drop(page);
                    self.buffer_pool.unpin_page(page_id, true)?;
                    txn.append_write_record(TableWriteRecord {
                        rid,
                        op: WriteOp::Insert,
                        tuple: data.to_vec(),
                        table: Arc::clone(self),
                    });
                    return Ok(rid);
                }
                Err(PageError::InsufficientSpace) => {
                    let header = self.page_manager.get_header(&page);
                    if let Some(next) = header.next_page_id {
                        drop(page);
                        self.buffer_pool.unpin_page(page_id, false)?;
                        page_id = next;
                        continue;
                    }
                    let new_id = self.extend_chain(txn, page_id, &mut page, header)?;
                    drop(page);
                    self.buffer_pool.unpin_page(page_id, true)?;
                    page_id = new_id;
                }
                Err(e) => {
                    drop(page);
                    self.buffer_pool.unpin_page(page_id, false)?;
                    return Err(e.into());
                }
            }
        }
    }

    /// Flag a tuple as delete-pending, keeping its bytes for rollback.
    pub fn mark_delete(self: &Arc<Self>, txn: &Transaction, rid: Rid) -> Result<()> {
        let before = self.with_page_mut(rid.page_id, |pm, page| {
            let before = pm.get_record(page, rid.slot)?;
            pm.mark_delete(page, rid.slot)?;
            self.append_and_stamp(
                txn,
                LogPayload::MarkDelete {
                    rid,
                    tuple: before.clone(),
                },
                page,
            )?;
            Ok(before)
        })?;
        txn.append_write_record(TableWriteRecord {
            rid,
            op: WriteOp::Delete,
            tuple: before,
            table: Arc::clone(self),
        });
        Ok(())
    }

    /// Tombstone a tuple for good. Commit finalizes marked deletes with
    /// this; Abort uses it to take back an insert. Writes no undo entry.
    pub fn apply_delete(&self, txn: &Transaction, rid: Rid) -> Result<()> {
        self.with_page_mut(rid.page_id, |pm, page| {
            let before = pm.get_record_any(page, rid.slot)?;
            pm.apply_delete(page, rid.slot)?;
            self.append_and_stamp(txn, LogPayload::ApplyDelete { rid, tuple: before }, page)
        })
    }

    /// Clear a pending delete mark; the abort path of `mark_delete`.
    pub fn rollback_mark_delete(&self, txn: &Transaction, rid: Rid) -> Result<()> {
        self.with_page_mut(rid.page_id, |pm, page| {
            pm.rollback_delete(page, rid.slot)?;
            let tuple = pm.get_record(page, rid.slot)?;
            self.append_and_stamp(txn, LogPayload::RollbackDelete { rid, tuple }, page)
        })
    }

    /// Overwrite a tuple in place.
    pub fn update_tuple(self: &Arc<Self>, txn: &Transaction, rid: Rid, data: &[u8]) -> Result<()> {
        let before = self.with_page_mut(rid.page_id, |pm, page| {
            let before = pm.get_record(page, rid.slot)?;
            pm.update_record(page, rid.slot, data)?;
            self.append_and_stamp(
                txn,
                LogPayload::Update {
                    rid,
                    old_tuple: before.clone(),
                    new_tuple: data.to_vec(),
                },
                page,
            )?;
            Ok(before)
        })?;
        txn.append_write_record(TableWriteRecord {
            rid,
            op: WriteOp::Update,
            tuple: before,
            table: Arc::clone(self),
        });
        Ok(())
    }

    /// Write the before-image back; the abort path of `update_tuple`.
    pub fn rollback_update(&self, txn: &Transaction, rid: Rid, before: &[u8]) -> Result<()> {
        self.with_page_mut(rid.page_id, |pm, page| {
            let current = pm.get_record(page, rid.slot)?;
            pm.update_record(page, rid.slot, before)?;
            self.append_and_stamp(
                txn,
                LogPayload::Update {
                    rid,
                    old_tuple: current,
                    new_tuple: before.to_vec(),
                },
                page,
            )
        })
    }

    /// Read a live tuple; `None` for absent or delete-pending slots.
    pub fn get_tuple(&self, rid: Rid) -> Result<Option<Vec<u8>>> {
        let page_ptr = self.buffer_pool.fetch_page(rid.page_id)?;
        let result = {
            let page = page_ptr.read();
            self.page_manager.get_record(&page, rid.slot)
        };
        self.buffer_pool.unpin_page(rid.page_id, false)?;
        match result {
            Ok(tuple) => Ok(Some(tuple)),
            Err(PageError::RecordNotFound) | Err(PageError::InvalidSlot(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Allocate, link and log a fresh page at the end of the chain.
    fn extend_chain(
        &self,
        txn: &Transaction,
        tail_id: PageId,
        tail: &mut Page,
        mut tail_header: crate::storage::page::header::PageHeader,
    ) -> Result<PageId> {
        let (new_ptr, new_id) = self.buffer_pool.new_page()?;
        {
            let mut new_page = new_ptr.write();
            self.page_manager.init_page(&mut new_page);
            let mut new_header = self.page_manager.get_header(&new_page);
            new_header.prev_page_id = Some(tail_id);
            self.page_manager.set_header(&mut new_page, &new_header);
            self.append_and_stamp(
                txn,
                LogPayload::NewPage {
                    prev_page_id: tail_id,
                    page_id: new_id,
                },
                &mut new_page,
            )?;
        }
        tail_header.next_page_id = Some(new_id);
        self.page_manager.set_header(tail, &tail_header);
        self.buffer_pool.unpin_page(new_id, true)?;
        Ok(new_id)
    }

    /// Run a mutation against a latched page; the pin is dropped either
    /// way, conservatively dirty.
    fn with_page_mut<T>(
        &self,
        page_id: PageId,
        f: impl FnOnce(&PageManager, &mut Page) -> Result<T>,
    ) -> Result<T> {
        let page_ptr = self.buffer_pool.fetch_page(page_id)?;
        let result = {
            let mut page = page_ptr.write();
            f(&self.page_manager, &mut page)
        };
        self.buffer_pool.unpin_page(page_id, true)?;
        result
    }

    /// Append a record to the log, thread it onto the transaction's chain
    /// and stamp the page's LSN.
    fn append_and_stamp(
        &self,
        txn: &Transaction,
        payload: LogPayload,
        page: &mut Page,
    ) -> Result<()> {
        let mut record = LogRecord::new(txn.id(), txn.prev_lsn(), payload);
        let lsn = self.log_manager.append_log_record(&mut record)?;
        txn.set_prev_lsn(lsn);
        page.set_lsn(lsn);
        Ok(())
    }

}
