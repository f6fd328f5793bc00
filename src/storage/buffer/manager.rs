use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::common::types::{
    Frame, FrameId, FramePtr, Page, PageId, PagePtr, INVALID_PAGE_ID,
};
use crate::storage::buffer::error::BufferPoolError;
use crate::storage::buffer::replacer::LruReplacer;
use crate::storage::disk::DiskManager;
use crate::transaction::wal::log_manager::LogManager;

pub type Result<T> = std::result::Result<T, BufferPoolError>;

struct PoolInner {
    page_table: HashMap<PageId, FrameId>,
    free_list: VecDeque<FrameId>,
}

/// Buffer pool manager: maps pages to frames, pins and unpins them, and
/// evicts through the LRU replacer when the pool fills up.
///
/// The pool latch is held for the duration of every operation, including
/// across disk I/O; the parallel pool is the mitigation for the resulting
/// serialization.
pub struct BufferPoolManager {
    pool_size: usize,
    num_instances: u32,
    instance_index: u32,
    next_page_id: AtomicU32,
    frames: Vec<FramePtr>,
    inner: Mutex<PoolInner>,
    replacer: LruReplacer,
    disk_manager: Arc<DiskManager>,
    log_manager: Option<Arc<LogManager>>,
}

impl BufferPoolManager {
    pub fn new(
        pool_size: usize,
        disk_manager: Arc<DiskManager>,
        log_manager: Option<Arc<LogManager>>,
    ) -> Result<Self> {
        Self::new_instance(pool_size, 1, 0, disk_manager, log_manager)
    }

    /// One sub-pool of a parallel buffer pool: this instance serves pages
    /// with `page_id % num_instances == instance_index` and allocates ids
    /// in that congruence class.
    pub fn new_instance(
        pool_size: usize,
        num_instances: u32,
        instance_index: u32,
        disk_manager: Arc<DiskManager>,
        log_manager: Option<Arc<LogManager>>,
    ) -> Result<Self> {
        assert!(num_instances > 0 && instance_index < num_instances);

        let mut frames = Vec::with_capacity(pool_size);
        let mut free_list = VecDeque::with_capacity(pool_size);
        for i in 0..pool_size {
            let frame_id = i as FrameId;
            let page = Arc::new(RwLock::new(Page::new(INVALID_PAGE_ID)));
            frames.push(Arc::new(RwLock::new(Frame::new(frame_id, page))));
            free_list.push_back(frame_id);
        }

        let first_id = Self::first_allocatable_id(
            disk_manager.page_count()?,
            instance_index,
            num_instances,
        );

        Ok(Self {
            pool_size,
            num_instances,
            instance_index,
            next_page_id: AtomicU32::new(first_id),
            frames,
            inner: Mutex::new(PoolInner {
                page_table: HashMap::new(),
                free_list,
            }),
            replacer: LruReplacer::new(pool_size),
            disk_manager,
            log_manager,
        })
    }

    /// Smallest id >= max(pages_on_disk, 1) in this instance's congruence
    /// class. Never 0: page 0 is the header page.
    fn first_allocatable_id(pages_on_disk: u32, index: u32, n: u32) -> PageId {
        let base = pages_on_disk.max(1);
        base + (index + n - base % n) % n
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// True when this instance serves the given page id.
    pub fn manages(&self, page_id: PageId) -> bool {
        page_id % self.num_instances == self.instance_index
    }

    /// Number of frames currently eligible for eviction.
    pub fn evictable_count(&self) -> usize {
        self.replacer.size()
    }

    /// Number of frames on the free list.
    pub fn free_count(&self) -> usize {
        self.inner.lock().free_list.len()
    }

    fn allocate_page(&self) -> PageId {
        self.next_page_id.fetch_add(self.num_instances, Ordering::SeqCst)
    }

    /// Fetch a page, reading it from disk on a miss. Fails with
    /// `PoolExhausted` when every frame is pinned and the free list is
    /// empty.
    pub fn fetch_page(&self, page_id: PageId) -> Result<PagePtr> {
        if page_id == INVALID_PAGE_ID {
            return Err(BufferPoolError::PageNotFound(page_id));
        }

        let mut inner = self.inner.lock();
        if let Some(&frame_id) = inner.page_table.get(&page_id) {
            let frame = &self.frames[frame_id as usize];
            let mut guard = frame.write();
            guard.pin_count += 1;
            self.replacer.pin(frame_id);
            return Ok(guard.page.clone());
        }

        let frame_id = self.acquire_frame(&mut inner)?;
        let frame = &self.frames[frame_id as usize];
        let page_ptr = {
            let mut guard = frame.write();
            {
                let mut page = guard.page.write();
                page.reset();
                if let Err(e) = self.disk_manager.read_page(page_id, &mut page) {
                    page.page_id = INVALID_PAGE_ID;
                    drop(page);
                    drop(guard);
                    inner.free_list.push_back(frame_id);
                    return Err(e.into());
                }
            }
            guard.pin_count = 1;
            guard.is_dirty = false;
            guard.page.clone()
        };
        inner.page_table.insert(page_id, frame_id);
        Ok(page_ptr)
    }

    /// Allocate a fresh page id and pin a zeroed frame for it.
    pub fn new_page(&self) -> Result<(PagePtr, PageId)> {
        let mut inner = self.inner.lock();
        let frame_id = self.acquire_frame(&mut inner)?;
        let page_id = self.allocate_page();

        let frame = &self.frames[frame_id as usize];
        let page_ptr = {
            let mut guard = frame.write();
            {
                let mut page = guard.page.write();
                page.reset();
                page.page_id = page_id;
            }
            guard.pin_count = 1;
            guard.is_dirty = true;
            guard.page.clone()
        };
        inner.page_table.insert(page_id, frame_id);
        Ok((page_ptr, page_id))
    }

    /// Drop one pin. Returns whether the caller actually held one.
    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> Result<bool> {
        let inner = self.inner.lock();
        let Some(&frame_id) = inner.page_table.get(&page_id) else {
            return Err(BufferPoolError::PageNotFound(page_id));
        };

        let frame = &self.frames[frame_id as usize];
        let mut guard = frame.write();
        if is_dirty {
            guard.is_dirty = true;
        }
        if guard.pin_count == 0 {
            return Ok(false);
        }
        guard.pin_count -= 1;
        if guard.pin_count == 0 {
            self.replacer.unpin(frame_id);
        }
        Ok(true)
    }

    /// Write a page through to disk even if it is clean; forced
    /// checkpoints rely on the unconditional write.
    pub fn flush_page(&self, page_id: PageId) -> Result<()> {
        self.flush_page_internal(page_id, false)
    }

    /// Write back every dirty resident page.
    pub fn flush_all_pages(&self) -> Result<()> {
        let ids: Vec<PageId> = self.inner.lock().page_table.keys().copied().collect();
        for page_id in ids {
            match self.flush_page_internal(page_id, true) {
                // evicted or deleted since the snapshot
                Err(BufferPoolError::PageNotFound(_)) => {}
                other => other?,
            }
        }
        Ok(())
    }

    /// The page latch may be held by another thread, so the frame is
    /// pinned and the pool latch released before waiting on it; holding
    /// both here can deadlock against a latch holder fetching a page.
    fn flush_page_internal(&self, page_id: PageId, only_dirty: bool) -> Result<()> {
        let frame = {
            let inner = self.inner.lock();
            let Some(&frame_id) = inner.page_table.get(&page_id) else {
                return Err(BufferPoolError::PageNotFound(page_id));
            };
            let frame = self.frames[frame_id as usize].clone();
            let mut guard = frame.write();
            if only_dirty && !guard.is_dirty {
                return Ok(());
            }
            guard.pin_count += 1;
            self.replacer.pin(frame_id);
            drop(guard);
            frame
        };

        let page_ptr = frame.read().page.clone();
        let result = {
            let page = page_ptr.read();
            self.write_page_out(&page)
        };

        let mut guard = frame.write();
        if result.is_ok() {
            guard.is_dirty = false;
        }
        guard.pin_count -= 1;
        if guard.pin_count == 0 {
            self.replacer.unpin(guard.frame_id);
        }
        result
    }

    /// Drop a page from the pool and retire its id. The page is not
    /// written back; persisting it first is the caller's responsibility.
    pub fn delete_page(&self, page_id: PageId) -> Result<()> {
        let mut inner = self.inner.lock();
        let Some(&frame_id) = inner.page_table.get(&page_id) else {
            self.disk_manager.deallocate_page(page_id);
            return Ok(());
        };

        let frame = &self.frames[frame_id as usize];
        let mut guard = frame.write();
        if guard.pin_count > 0 {
            return Err(BufferPoolError::PagePinned(page_id));
        }

        {
            let mut page = guard.page.write();
            page.reset();
            page.page_id = INVALID_PAGE_ID;
        }
        guard.is_dirty = false;
        drop(guard);

        inner.page_table.remove(&page_id);
        self.replacer.pin(frame_id);
        inner.free_list.push_back(frame_id);
        self.disk_manager.deallocate_page(page_id);
        Ok(())
    }

    /// Free list first, then LRU eviction. Dirty victims are written back
    /// under the WAL rule before their frame is reused.
    fn acquire_frame(&self, inner: &mut PoolInner) -> Result<FrameId> {
        if let Some(frame_id) = inner.free_list.pop_front() {
            return Ok(frame_id);
        }

        let Some(frame_id) = self.replacer.victim() else {
            return Err(BufferPoolError::PoolExhausted(self.pool_size));
        };

        let frame = &self.frames[frame_id as usize];
        let mut guard = frame.write();
        let old_page_id = guard.page.read().page_id;
        if guard.is_dirty {
            let page = guard.page.read();
            log::debug!("evicting dirty page {} (lsn {})", old_page_id, page.lsn());
            if let Err(e) = self.write_page_out(&page) {
                drop(page);
                drop(guard);
                self.replacer.unpin(frame_id);
                return Err(e);
            }
        }
        guard.is_dirty = false;
        if old_page_id != INVALID_PAGE_ID {
            inner.page_table.remove(&old_page_id);
        }
        Ok(frame_id)
    }

    /// WAL rule: the log must be durable up to a page's LSN before the
    /// page itself reaches disk.
    fn write_page_out(&self, page: &Page) -> Result<()> {
        if let Some(log_manager) = &self.log_manager {
            let page_lsn = page.lsn();
            if page_lsn > log_manager.persistent_lsn() {
                log_manager
                    .flush_till_lsn(page_lsn)
                    .map_err(|e| BufferPoolError::LogFlush(e.to_string()))?;
            }
        }
        self.disk_manager.write_page(page)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn create_pool(pool_size: usize) -> (BufferPoolManager, NamedTempFile, NamedTempFile) {
        let db = NamedTempFile::new().unwrap();
        let log = NamedTempFile::new().unwrap();
        let disk = Arc::new(DiskManager::with_log_path(db.path(), log.path()).unwrap());
        let pool = BufferPoolManager::new(pool_size, disk, None).unwrap();
        (pool, db, log)
    }

    #[test]
    fn test_new_page_ids_start_after_header() {
        let (pool, _db, _log) = create_pool(4);
        let (_p, id) = pool.new_page().unwrap();
        assert_eq!(id, 1);
        let (_p, id) = pool.new_page().unwrap();
        assert_eq!(id, 2);
    }

    #[test]
    fn test_page_data_survives_eviction() {
        let (pool, _db, _log) = create_pool(2);

        let (page, id) = pool.new_page().unwrap();
        page.write().data[123] = 42;
        pool.unpin_page(id, true).unwrap();

        // churn through enough pages to evict it
        for _ in 0..4 {
            let (_p, pid) = pool.new_page().unwrap();
            pool.unpin_page(pid, false).unwrap();
        }

        let page = pool.fetch_page(id).unwrap();
        assert_eq!(page.read().data[123], 42);
        pool.unpin_page(id, false).unwrap();
    }

    #[test]
    fn test_exhaustion_and_recovery_of_frames() {
        let (pool, _db, _log) = create_pool(2);
        let (_a, a) = pool.new_page().unwrap();
        let (_b, _b_id) = pool.new_page().unwrap();
        assert!(matches!(
            pool.new_page(),
            Err(BufferPoolError::PoolExhausted(2))
        ));
        pool.unpin_page(a, false).unwrap();
        assert!(pool.new_page().is_ok());
    }

    #[test]
    fn test_unpin_reports_whether_pin_was_held() {
        let (pool, _db, _log) = create_pool(2);
        let (_p, id) = pool.new_page().unwrap();
        assert!(pool.unpin_page(id, false).unwrap());
        assert!(!pool.unpin_page(id, false).unwrap());
        assert!(matches!(
            pool.unpin_page(999, false),
            Err(BufferPoolError::PageNotFound(999))
        ));
    }

    #[test]
    fn test_delete_page_refuses_pinned() {
        let (pool, _db, _log) = create_pool(2);
        let (_p, id) = pool.new_page().unwrap();
        assert!(matches!(
            pool.delete_page(id),
            Err(BufferPoolError::PagePinned(_))
        ));
        pool.unpin_page(id, false).unwrap();
        pool.delete_page(id).unwrap();
        // the frame is free again and the page is gone
        assert_eq!(pool.free_count(), 2);
        assert_eq!(pool.evictable_count(), 0);
        // deleting a non-resident page deallocates and succeeds
        pool.delete_page(id).unwrap();
    }

    #[test]
    fn test_frame_accounting_invariant() {
        // every frame is free XOR evictable XOR pinned
        let (pool, _db, _log) = create_pool(3);
        let (_p1, id1) = pool.new_page().unwrap();
        let (_p2, id2) = pool.new_page().unwrap();
        assert_eq!(pool.free_count(), 1);
        assert_eq!(pool.evictable_count(), 0);

        pool.unpin_page(id1, false).unwrap();
        assert_eq!(pool.free_count(), 1);
        assert_eq!(pool.evictable_count(), 1);

        pool.fetch_page(id1).unwrap();
        assert_eq!(pool.evictable_count(), 0);
        pool.unpin_page(id1, false).unwrap();
        pool.unpin_page(id2, false).unwrap();
        assert_eq!(pool.free_count() + pool.evictable_count(), 3);
    }

    #[test]
    fn test_modular_allocation() {
        let db = NamedTempFile::new().unwrap();
        let log = NamedTempFile::new().unwrap();
        let disk = Arc::new(DiskManager::with_log_path(db.path(), log.path()).unwrap());

        let pool = BufferPoolManager::new_instance(4, 3, 1, disk, None).unwrap();
        let (_p, a) = pool.new_page().unwrap();
        let (_q, b) = pool.new_page().unwrap();
        assert_eq!(a % 3, 1);
        assert_eq!(b % 3, 1);
        assert_eq!(b, a + 3);
        assert!(pool.manages(a));
        assert!(!pool.manages(a + 1));
    }
}
