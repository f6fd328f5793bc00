use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::common::types::{PageId, PagePtr};
use crate::storage::buffer::error::BufferPoolError;
use crate::storage::buffer::manager::{BufferPoolManager, Result};
use crate::storage::disk::DiskManager;
use crate::transaction::wal::log_manager::LogManager;

/// Fan-out over N independent sub-pools: the sub-pool responsible for
/// page p is `p % N`, removing the single pool latch as a bottleneck at
/// the cost of weaker cross-page locality.
pub struct ParallelBufferPoolManager {
    instances: Vec<BufferPoolManager>,
    next_instance: AtomicUsize,
}

impl ParallelBufferPoolManager {
    pub fn new(
        num_instances: usize,
        pool_size: usize,
        disk_manager: Arc<DiskManager>,
        log_manager: Option<Arc<LogManager>>,
    ) -> Result<Self> {
        assert!(num_instances > 0);
        let mut instances = Vec::with_capacity(num_instances);
        for i in 0..num_instances {
            instances.push(BufferPoolManager::new_instance(
                pool_size,
                num_instances as u32,
                i as u32,
                disk_manager.clone(),
                log_manager.clone(),
            )?);
        }
        Ok(Self {
            instances,
            next_instance: AtomicUsize::new(0),
        })
    }

    /// Total frames across all sub-pools.
    pub fn pool_size(&self) -> usize {
        self.instances[0].pool_size() * self.instances.len()
    }

    fn instance_for(&self, page_id: PageId) -> &BufferPoolManager {
        &self.instances[page_id as usize % self.instances.len()]
    }

    pub fn fetch_page(&self, page_id: PageId) -> Result<PagePtr> {
        self.instance_for(page_id).fetch_page(page_id)
    }

    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> Result<bool> {
        self.instance_for(page_id).unpin_page(page_id, is_dirty)
    }

    pub fn flush_page(&self, page_id: PageId) -> Result<()> {
        self.instance_for(page_id).flush_page(page_id)
    }

    pub fn delete_page(&self, page_id: PageId) -> Result<()> {
        self.instance_for(page_id).delete_page(page_id)
    }

    /// Round-robin over sub-pools, starting one further along each call
    /// so allocations spread out.
    pub fn new_page(&self) -> Result<(PagePtr, PageId)> {
        let n = self.instances.len();
        let start = self.next_instance.fetch_add(1, Ordering::SeqCst) % n;
        for i in 0..n {
            match self.instances[(start + i) % n].new_page() {
                Err(BufferPoolError::PoolExhausted(_)) => continue,
                other => return other,
            }
        }
        Err(BufferPoolError::PoolExhausted(self.pool_size()))
    }

    pub fn flush_all_pages(&self) -> Result<()> {
        for instance in &self.instances {
            instance.flush_all_pages()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn create_parallel_pool(
        num_instances: usize,
        pool_size: usize,
    ) -> (ParallelBufferPoolManager, NamedTempFile, NamedTempFile) {
        let db = NamedTempFile::new().unwrap();
        let log = NamedTempFile::new().unwrap();
        let disk = Arc::new(DiskManager::with_log_path(db.path(), log.path()).unwrap());
        let pool = ParallelBufferPoolManager::new(num_instances, pool_size, disk, None).unwrap();
        (pool, db, log)
    }

    #[test]
    fn test_allocations_spread_over_instances() {
        let (pool, _db, _log) = create_parallel_pool(3, 2);
        let mut residues = std::collections::HashSet::new();
        for _ in 0..3 {
            let (_p, id) = pool.new_page().unwrap();
            residues.insert(id % 3);
            pool.unpin_page(id, false).unwrap();
        }
        assert_eq!(residues.len(), 3);
    }

    #[test]
    fn test_page_round_trip_through_responsible_instance() {
        let (pool, _db, _log) = create_parallel_pool(4, 2);
        let (page, id) = pool.new_page().unwrap();
        page.write().data[77] = 9;
        pool.unpin_page(id, true).unwrap();

        // churn every instance to force eviction everywhere
        for _ in 0..16 {
            let (_p, pid) = pool.new_page().unwrap();
            pool.unpin_page(pid, false).unwrap();
        }

        let page = pool.fetch_page(id).unwrap();
        assert_eq!(page.read().data[77], 9);
        pool.unpin_page(id, false).unwrap();
    }

    #[test]
    fn test_new_page_exhausts_only_when_all_instances_full() {
        let (pool, _db, _log) = create_parallel_pool(2, 1);
        let (_a, _ida) = pool.new_page().unwrap();
        let (_b, _idb) = pool.new_page().unwrap();
        assert!(matches!(
            pool.new_page(),
            Err(BufferPoolError::PoolExhausted(_))
        ));
    }
}
