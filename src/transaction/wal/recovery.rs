use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, info, warn};
use thiserror::Error;

use crate::common::types::{Lsn, Page, PageId, TxnId, INVALID_LSN, INVALID_PAGE_ID};
use crate::storage::buffer::{BufferPoolError, BufferPoolManager};
use crate::storage::disk::{DiskManager, DiskManagerError};
use crate::storage::page::error::PageError;
use crate::storage::page::manager::PageManager;
use crate::transaction::wal::log_record::{LogPayload, LogRecord};

#[derive(Error, Debug)]
pub enum RecoveryError {
    #[error("IO error: {0}")]
    Io(#[from] DiskManagerError),
    #[error("Buffer pool error: {0}")]
    BufferPool(#[from] BufferPoolError),
    #[error("Page error: {0}")]
    Page(#[from] PageError),
    #[error("Log is corrupt at offset {0}")]
    CorruptLog(u64),
}

pub type Result<T> = std::result::Result<T, RecoveryError>;

/// ARIES-style restart recovery: one forward scan that redoes every
/// logged effect the pages have not seen (analysis and redo combined),
/// then a backward walk of each loser transaction's prev-LSN chain.
///
/// Runs once on startup, before any transaction activity.
pub struct LogRecovery {
    disk_manager: Arc<DiskManager>,
    buffer_pool: Arc<BufferPoolManager>,
    page_manager: PageManager,
    /// txn id -> LSN of its latest record; losers once the scan ends
    active_txn: HashMap<TxnId, Lsn>,
    /// LSN -> absolute log file offset, for the undo walk
    lsn_mapping: HashMap<Lsn, u64>,
    buffer: Vec<u8>,
    buffer_valid: usize,
    /// File offset the buffer currently holds, if any
    buffer_offset: Option<u64>,
}

impl LogRecovery {
    pub fn new(
        disk_manager: Arc<DiskManager>,
        buffer_pool: Arc<BufferPoolManager>,
        buffer_size: usize,
    ) -> Self {
        Self {
            disk_manager,
            buffer_pool,
            page_manager: PageManager::new(),
            active_txn: HashMap::new(),
            lsn_mapping: HashMap::new(),
            buffer: vec![0u8; buffer_size],
            buffer_valid: 0,
            buffer_offset: None,
        }
    }

    /// Redo then undo.
    pub fn recover(&mut self) -> Result<()> {
        self.redo()?;
        self.undo()
    }

    /// Ids of the transactions left without COMMIT or ABORT records.
    pub fn loser_transactions(&self) -> Vec<TxnId> {
        let mut losers: Vec<TxnId> = self.active_txn.keys().copied().collect();
        losers.sort_unstable();
        losers
    }

    /// Scan the log from offset 0 in buffer-sized chunks, replaying each
    /// record whose target page has not seen it. A truncated trailing
    /// record ends the scan: everything past a torn write is unreachable.
    pub fn redo(&mut self) -> Result<()> {
        info!("recovery: redo scan starting");
        self.active_txn.clear();
        self.lsn_mapping.clear();

        let mut file_offset = 0u64;
        let mut replayed = 0usize;
        loop {
            let valid = self.disk_manager.read_log(&mut self.buffer, file_offset)?;
            if valid == 0 {
                break;
            }
            let mut pos = 0;
            while let Some(record) = LogRecord::deserialize(&self.buffer[pos..valid]) {
                self.lsn_mapping.insert(record.lsn, file_offset + pos as u64);
                pos += record.size();
                self.redo_record(&record)?;
                replayed += 1;
            }
            if pos == 0 {
                break;
            }
            file_offset += pos as u64;
        }
        info!(
            "recovery: redo done, {} records scanned, {} losers",
            replayed,
            self.active_txn.len()
        );
        Ok(())
    }

    fn redo_record(&mut self, record: &LogRecord) -> Result<()> {
        self.active_txn.insert(record.txn_id, record.lsn);
        let lsn = record.lsn;
        match &record.payload {
            LogPayload::Begin => {}
            LogPayload::Commit | LogPayload::Abort => {
                self.active_txn.remove(&record.txn_id);
            }
            LogPayload::Insert { rid, tuple } => {
                let (page_id, slot) = (rid.page_id, rid.slot);
                self.redo_page_op(page_id, lsn, |pm, page| {
                    pm.insert_record_at(page, slot, tuple)
                })?;
            }
            LogPayload::MarkDelete { rid, .. } => {
                let slot = rid.slot;
                self.redo_page_op(rid.page_id, lsn, |pm, page| pm.mark_delete(page, slot))?;
            }
            LogPayload::RollbackDelete { rid, .. } => {
                let slot = rid.slot;
                self.redo_page_op(rid.page_id, lsn, |pm, page| {
                    pm.rollback_delete(page, slot)
                })?;
            }
            LogPayload::ApplyDelete { rid, .. } => {
                let slot = rid.slot;
                self.redo_page_op(rid.page_id, lsn, |pm, page| pm.apply_delete(page, slot))?;
            }
            LogPayload::Update { rid, new_tuple, .. } => {
                let slot = rid.slot;
                self.redo_page_op(rid.page_id, lsn, |pm, page| {
                    pm.update_record(page, slot, new_tuple)
                })?;
            }
            LogPayload::NewPage {
                prev_page_id,
                page_id,
            } => {
                self.redo_new_page(*prev_page_id, *page_id, lsn)?;
            }
        }
        Ok(())
    }

    fn redo_page_op(
        &self,
        page_id: PageId,
        lsn: Lsn,
        op: impl FnOnce(&PageManager, &mut Page) -> std::result::Result<(), PageError>,
    ) -> Result<()> {
        let page_ptr = self.buffer_pool.fetch_page(page_id)?;
        let result = {
            let mut page = page_ptr.write();
            if page.lsn() >= lsn {
                debug!("redo: page {page_id} already at lsn {}", page.lsn());
                Ok(false)
            } else {
                op(&self.page_manager, &mut page).map(|()| {
                    page.set_lsn(lsn);
                    true
                })
            }
        };
        match result {
            Ok(dirty) => {
                self.buffer_pool.unpin_page(page_id, dirty)?;
                Ok(())
            }
            Err(e) => {
                self.buffer_pool.unpin_page(page_id, true)?;
                Err(e.into())
            }
        }
    }

    fn redo_new_page(&self, prev_page_id: PageId, page_id: PageId, lsn: Lsn) -> Result<()> {
        let page_ptr = self.buffer_pool.fetch_page(page_id)?;
        let mut dirty = false;
        {
            let mut page = page_ptr.write();
            if page.lsn() < lsn {
                self.page_manager.init_page(&mut page);
                if prev_page_id != INVALID_PAGE_ID {
                    let mut header = self.page_manager.get_header(&page);
                    header.prev_page_id = Some(prev_page_id);
                    self.page_manager.set_header(&mut page, &header);
                }
                page.set_lsn(lsn);
                dirty = true;
            }
        }
        self.buffer_pool.unpin_page(page_id, dirty)?;

        if dirty && prev_page_id != INVALID_PAGE_ID {
            let prev_ptr = self.buffer_pool.fetch_page(prev_page_id)?;
            {
                let mut prev = prev_ptr.write();
                let mut header = self.page_manager.get_header(&prev);
                header.next_page_id = Some(page_id);
                self.page_manager.set_header(&mut prev, &header);
            }
            self.buffer_pool.unpin_page(prev_page_id, true)?;
        }
        Ok(())
    }

    /// Walk each loser's prev-LSN chain backwards, applying inverse
    /// operations. These are recovery actions and are not logged.
    pub fn undo(&mut self) -> Result<()> {
        let mut losers: Vec<(TxnId, Lsn)> =
            self.active_txn.iter().map(|(&t, &l)| (t, l)).collect();
        losers.sort_unstable();
        info!("recovery: undoing {} loser transactions", losers.len());

        self.buffer_offset = None;
        self.buffer_valid = 0;
        for (txn_id, last_lsn) in losers {
            debug!("recovery: undoing txn {txn_id} from lsn {last_lsn}");
            let mut lsn = last_lsn;
            while lsn != INVALID_LSN {
                let Some(&offset) = self.lsn_mapping.get(&lsn) else {
                    warn!("recovery: lsn {lsn} missing from mapping, chain cut short");
                    break;
                };
                let record = self.fetch_record(offset)?;
                self.undo_record(&record)?;
                lsn = record.prev_lsn;
            }
        }
        Ok(())
    }

    /// Re-read the chunk holding `offset` unless the buffer already
    /// covers it.
    fn fetch_record(&mut self, offset: u64) -> Result<LogRecord> {
        if let Some(base) = self.buffer_offset {
            if offset >= base {
                let pos = (offset - base) as usize;
                if pos < self.buffer_valid {
                    if let Some(record) =
                        LogRecord::deserialize(&self.buffer[pos..self.buffer_valid])
                    {
                        return Ok(record);
                    }
                }
            }
        }
        let valid = self.disk_manager.read_log(&mut self.buffer, offset)?;
        self.buffer_offset = Some(offset);
        self.buffer_valid = valid;
        LogRecord::deserialize(&self.buffer[..valid]).ok_or(RecoveryError::CorruptLog(offset))
    }

    fn undo_record(&mut self, record: &LogRecord) -> Result<()> {
        match &record.payload {
            LogPayload::Begin | LogPayload::Commit | LogPayload::Abort => Ok(()),
            LogPayload::Insert { rid, .. } => {
                let slot = rid.slot;
                self.undo_page_op(rid.page_id, |pm, page| pm.apply_delete(page, slot))
            }
            LogPayload::MarkDelete { rid, .. } => {
                let slot = rid.slot;
                self.undo_page_op(rid.page_id, |pm, page| pm.rollback_delete(page, slot))
            }
            LogPayload::RollbackDelete { rid, .. } => {
                let slot = rid.slot;
                self.undo_page_op(rid.page_id, |pm, page| pm.mark_delete(page, slot))
            }
            LogPayload::ApplyDelete { rid, tuple } => {
                let slot = rid.slot;
                self.undo_page_op(rid.page_id, |pm, page| {
                    pm.insert_record_at(page, slot, tuple)
                })
            }
            LogPayload::Update { rid, old_tuple, .. } => {
                let slot = rid.slot;
                self.undo_page_op(rid.page_id, |pm, page| {
                    pm.update_record(page, slot, old_tuple)
                })
            }
            // the page stays allocated; reclaiming it is not worth making
            // deallocation crash-safe
            LogPayload::NewPage { .. } => Ok(()),
        }
    }

    fn undo_page_op(
        &self,
        page_id: PageId,
        op: impl FnOnce(&PageManager, &mut Page) -> std::result::Result<(), PageError>,
    ) -> Result<()> {
        let page_ptr = self.buffer_pool.fetch_page(page_id)?;
        let result = {
            let mut page = page_ptr.write();
            op(&self.page_manager, &mut page)
        };
        self.buffer_pool.unpin_page(page_id, true)?;
        match result {
            Ok(()) => Ok(()),
            // a previous crash may already have persisted this undo
            Err(PageError::RecordNotFound) | Err(PageError::DuplicateRecord) => {
                debug!("undo: page {page_id} already reflects the rollback");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}
