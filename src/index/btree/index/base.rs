use std::collections::VecDeque;
use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{Mutex, RawRwLock};

use crate::common::types::{Page, PageId, PagePtr, Rid, HEADER_PAGE_ID, INVALID_PAGE_ID};
use crate::index::btree::error::BTreeError;
use crate::index::btree::header_page::HeaderPage;
use crate::index::btree::key::IndexKey;
use crate::index::btree::node::{InternalNode, LeafNode};
use crate::storage::buffer::BufferPoolManager;
use crate::transaction::transaction::{IndexWriteRecord, RollbackIndex, Transaction, WriteOp};

pub(crate) type ReadGuard = ArcRwLockReadGuard<RawRwLock, Page>;
pub(crate) type WriteGuard = ArcRwLockWriteGuard<RawRwLock, Page>;

pub(crate) enum Latch {
    Read(ReadGuard),
    Write(WriteGuard),
}

/// A pinned, latched tree page. Dropping releases the latch first and
/// only then the pin, so the frame can never be evicted out from under a
/// live latch.
pub(crate) struct LatchedPage {
    pub page_id: PageId,
    ptr: PagePtr,
    latch: Option<Latch>,
    dirty: bool,
    pool: Arc<BufferPoolManager>,
}

impl LatchedPage {
    pub fn fetch_read(pool: &Arc<BufferPoolManager>, page_id: PageId) -> Result<Self, BTreeError> {
        let ptr = pool.fetch_page(page_id)?;
        let latch = Latch::Read(ptr.read_arc());
        Ok(Self {
            page_id,
            ptr,
            latch: Some(latch),
            dirty: false,
            pool: Arc::clone(pool),
        })
    }

    pub fn fetch_write(pool: &Arc<BufferPoolManager>, page_id: PageId) -> Result<Self, BTreeError> {
        let ptr = pool.fetch_page(page_id)?;
        let latch = Latch::Write(ptr.write_arc());
        Ok(Self {
            page_id,
            ptr,
            latch: Some(latch),
            dirty: false,
            pool: Arc::clone(pool),
        })
    }

    /// Wrap a freshly allocated page; already pinned, write-latched and
    /// dirty.
    pub fn from_new_page(pool: &Arc<BufferPoolManager>, ptr: PagePtr, page_id: PageId) -> Self {
        let latch = Latch::Write(ptr.write_arc());
        Self {
            page_id,
            ptr,
            latch: Some(latch),
            dirty: true,
            pool: Arc::clone(pool),
        }
    }

    pub fn page(&self) -> &Page {
        match self.latch.as_ref() {
            Some(Latch::Read(guard)) => guard,
            Some(Latch::Write(guard)) => guard,
            None => unreachable!("latch already released"),
        }
    }

    pub fn page_mut(&mut self) -> &mut Page {
        match self.latch.as_mut() {
            Some(Latch::Write(guard)) => &mut *guard,
            _ => unreachable!("page_mut on a read latch"),
        }
    }

    /// Trade the read latch for a write latch. Other threads may slip in
    /// between; callers must re-validate what they saw.
    pub fn upgrade(&mut self) {
        self.latch = None;
        self.latch = Some(Latch::Write(self.ptr.write_arc()));
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }
}

impl Drop for LatchedPage {
    fn drop(&mut self) {
        self.latch.take();
        if let Err(e) = self.pool.unpin_page(self.page_id, self.dirty) {
            log::warn!("failed to unpin page {}: {e}", self.page_id);
        }
    }
}

/// FIFO queue of latched ancestors held during a pessimistic descent.
/// Released front to back (acquisition order) as soon as the current
/// child is safe.
pub(crate) struct Context {
    queue: VecDeque<LatchedPage>,
}

impl Context {
    pub fn new() -> Self {
        Self {
            queue: VecDeque::new(),
        }
    }

    pub fn push(&mut self, page: LatchedPage) {
        self.queue.push_back(page);
    }

    /// The nearest latched ancestor (the split/merge target's parent).
    pub fn pop_deepest(&mut self) -> Option<LatchedPage> {
        self.queue.pop_back()
    }

    pub fn release_all(&mut self) {
        while let Some(page) = self.queue.pop_front() {
            drop(page);
        }
    }
}

/// A disk-resident B+ tree whose nodes are buffer pool pages. Leaves
/// hold (key, rid) entries and chain left to right; internals hold
/// separator/child entries. Concurrent access is coordinated purely by
/// page latches acquired root-to-leaf (latch crabbing).
pub struct BPlusTree<K: IndexKey> {
    name: String,
    pub(crate) buffer_pool: Arc<BufferPoolManager>,
    /// The root pointer has its own mutex; traversals re-verify the
    /// latched page is still the root and restart when it moved.
    pub(crate) root_page_id: Mutex<PageId>,
    pub(crate) leaf_max_size: u32,
    pub(crate) internal_max_size: u32,
    pub(crate) _marker: PhantomData<K>,
}

impl<K: IndexKey> BPlusTree<K> {
    /// Open (or register) the named index. `leaf_max_size` must be at
    /// least 2 and `internal_max_size` at least 4, and both must fit a
    /// page.
    pub fn new(
        name: &str,
        buffer_pool: Arc<BufferPoolManager>,
        leaf_max_size: u32,
        internal_max_size: u32,
    ) -> Result<Self, BTreeError> {
        // leaves need one entry of headroom: a merge of two minimal
        // siblings can land exactly on max_size before the next split
        assert!(leaf_max_size >= 2 && leaf_max_size < LeafNode::<&Page, K>::capacity());
        assert!(internal_max_size >= 4 && internal_max_size <= InternalNode::<&Page, K>::capacity());

        let tree = Self {
            name: name.to_string(),
            buffer_pool,
            root_page_id: Mutex::new(INVALID_PAGE_ID),
            leaf_max_size,
            internal_max_size,
            _marker: PhantomData,
        };

        // pick up a persisted root or register ourselves in the directory
        let header_ptr = tree.buffer_pool.fetch_page(HEADER_PAGE_ID)?;
        let (root, dirty) = {
            let mut page = header_ptr.write();
            let mut header = HeaderPage::new(&mut *page);
            match header.get_root_id(name) {
                Some(root) => (root, false),
                None => {
                    header.insert_record(name, INVALID_PAGE_ID);
                    (INVALID_PAGE_ID, true)
                }
            }
        };
        tree.buffer_pool.unpin_page(HEADER_PAGE_ID, dirty)?;
        *tree.root_page_id.lock() = root;
        Ok(tree)
    }

    /// Maximum fanout the page size allows.
    pub fn with_max_fanout(
        name: &str,
        buffer_pool: Arc<BufferPoolManager>,
    ) -> Result<Self, BTreeError> {
        let leaf = LeafNode::<&Page, K>::capacity() - 1;
        let internal = InternalNode::<&Page, K>::capacity();
        Self::new(name, buffer_pool, leaf, internal)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_empty(&self) -> bool {
        *self.root_page_id.lock() == INVALID_PAGE_ID
    }

    pub fn root_page_id(&self) -> PageId {
        *self.root_page_id.lock()
    }

    /// Record the new root in the page-0 directory. Callers hold the
    /// root mutex.
    pub(crate) fn persist_root(&self, root: PageId) -> Result<(), BTreeError> {
        let header_ptr = self.buffer_pool.fetch_page(HEADER_PAGE_ID)?;
        {
            let mut page = header_ptr.write();
            let mut header = HeaderPage::new(&mut *page);
            if !header.update_record(&self.name, root) {
                header.insert_record(&self.name, root);
            }
        }
        self.buffer_pool.unpin_page(HEADER_PAGE_ID, true)?;
        Ok(())
    }

    /// Allocate a fresh page, write-latched.
    pub(crate) fn new_page_latched(&self) -> Result<(LatchedPage, PageId), BTreeError> {
        let (ptr, page_id) = self.buffer_pool.new_page()?;
        Ok((
            LatchedPage::from_new_page(&self.buffer_pool, ptr, page_id),
            page_id,
        ))
    }
}

impl<K: IndexKey> RollbackIndex for BPlusTree<K> {
    fn rollback_insert(
        &self,
        key: &[u8],
    ) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let key = K::decode(key);
        self.remove(&key)?;
        Ok(())
    }

    fn rollback_delete(
        &self,
        key: &[u8],
        rid: Rid,
    ) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let key = K::decode(key);
        self.insert(&key, rid)?;
        Ok(())
    }
}

impl<K: IndexKey> BPlusTree<K> {
    /// Insert and record an undo descriptor on the transaction so an
    /// abort removes the entry again.
    pub fn insert_for_txn(
        self: &Arc<Self>,
        txn: &Transaction,
        key: &K,
        rid: Rid,
    ) -> Result<bool, BTreeError> {
        let inserted = self.insert(key, rid)?;
        if inserted {
            txn.append_index_record(IndexWriteRecord {
                op: WriteOp::Insert,
                key: key.to_bytes(),
                rid,
                index: Arc::clone(self) as Arc<dyn RollbackIndex>,
            });
        }
        Ok(inserted)
    }

    /// Remove and record an undo descriptor re-inserting the entry on
    /// abort.
    pub fn remove_for_txn(self: &Arc<Self>, txn: &Transaction, key: &K) -> Result<bool, BTreeError> {
        let Some(rid) = self.get_value(key)? else {
            return Ok(false);
        };
        if !self.remove(key)? {
            return Ok(false);
        }
        txn.append_index_record(IndexWriteRecord {
            op: WriteOp::Delete,
            key: key.to_bytes(),
            rid,
            index: Arc::clone(self) as Arc<dyn RollbackIndex>,
        });
        Ok(true)
    }
}
