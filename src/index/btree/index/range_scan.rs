use std::marker::PhantomData;
use std::sync::Arc;

use crate::common::types::{Rid, INVALID_PAGE_ID};
use crate::index::btree::error::BTreeError;
use crate::index::btree::index::base::{BPlusTree, Context, LatchedPage};
use crate::index::btree::index::operations::AccessMode;
use crate::index::btree::key::IndexKey;
use crate::index::btree::node::{self, LeafNode, NodeType};
use crate::storage::buffer::BufferPoolManager;

/// Ordered scan over the leaf chain. Holds one read latch and pin at a
/// time, released before stepping to the next leaf so deletions merging
/// leaves can never deadlock against a scan. A leaf recycled in that
/// unlatched window ends the scan early.
pub struct BTreeIterator<K: IndexKey> {
    pool: Arc<BufferPoolManager>,
    current: Option<LatchedPage>,
    index: usize,
    _marker: PhantomData<K>,
}

impl<K: IndexKey> Iterator for BTreeIterator<K> {
    type Item = (K, Rid);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let leaf = self.current.as_ref()?;
            let node = LeafNode::<_, K>::new(leaf.page());
            if self.index < node.size() as usize {
                let item = (node.key_at(self.index), node.rid_at(self.index));
                self.index += 1;
                return Some(item);
            }

            let next_id = node.next_page_id();
            self.current = None;
            if next_id == INVALID_PAGE_ID {
                return None;
            }
            let next = LatchedPage::fetch_read(&self.pool, next_id).ok()?;
            if node::node_type(next.page()) != Some(NodeType::Leaf) {
                return None;
            }
            self.current = Some(next);
            self.index = 0;
        }
    }
}

impl<K: IndexKey> BPlusTree<K> {
    /// Iterate every entry in key order.
    pub fn iter(&self) -> Result<BTreeIterator<K>, BTreeError> {
        let mut ctx = Context::new();
        let leaf = self.find_leaf(None, AccessMode::Read, &mut ctx)?;
        Ok(BTreeIterator {
            pool: Arc::clone(&self.buffer_pool),
            current: leaf,
            index: 0,
            _marker: PhantomData,
        })
    }

    /// Iterate from the first key >= `key`.
    pub fn iter_from(&self, key: &K) -> Result<BTreeIterator<K>, BTreeError> {
        let mut ctx = Context::new();
        let leaf = self.find_leaf(Some(key), AccessMode::Read, &mut ctx)?;
        let index = leaf
            .as_ref()
            .map(|leaf| LeafNode::<_, K>::new(leaf.page()).lower_bound(key))
            .unwrap_or(0);
        Ok(BTreeIterator {
            pool: Arc::clone(&self.buffer_pool),
            current: leaf,
            index,
            _marker: PhantomData,
        })
    }
}
