use crate::common::types::{PageId, INVALID_PAGE_ID};
use crate::index::btree::error::BTreeError;
use crate::index::btree::index::base::{BPlusTree, Context, LatchedPage};
use crate::index::btree::index::operations::AccessMode;
use crate::index::btree::key::IndexKey;
use crate::index::btree::node::{self, InternalNode, LeafNode, NodeType};

type Result<T> = std::result::Result<T, BTreeError>;

impl<K: IndexKey> BPlusTree<K> {
    /// Remove a key. Returns whether it was present.
    ///
    /// Mirrors insert: an optimistic attempt re-latches the leaf for
    /// writing when it can shrink without underflow; otherwise a
    /// pessimistic descent rebalances by borrowing from or merging with
    /// a sibling, propagating upward as parents underflow.
    pub fn remove(&self, key: &K) -> Result<bool> {
        loop {
            if let Some(result) = self.lucky_remove(key)? {
                return Ok(result);
            }
            if let Some(result) = self.sad_remove(key)? {
                return Ok(result);
            }
        }
    }

    fn lucky_remove(&self, key: &K) -> Result<Option<bool>> {
        let mut ctx = Context::new();
        let Some(mut leaf) = self.find_leaf(Some(key), AccessMode::Read, &mut ctx)? else {
            return Ok(Some(false));
        };

        {
            let node = LeafNode::<_, K>::new(leaf.page());
            if node.lookup(key).is_none() {
                return Ok(Some(false));
            }
            if node.is_root() {
                return Ok(None);
            }
        }

        leaf.upgrade();
        if !self.leaf_accepts(leaf.page(), key, AccessMode::Delete) {
            return Ok(None);
        }

        let removed = {
            let mut node = LeafNode::<_, K>::new(leaf.page_mut());
            node.remove(key)
        };
        if removed {
            leaf.mark_dirty();
        }
        Ok(Some(removed))
    }

    fn sad_remove(&self, key: &K) -> Result<Option<bool>> {
        let mut ctx = Context::new();
        let Some(mut leaf) = self.find_leaf(Some(key), AccessMode::Delete, &mut ctx)? else {
            return Ok(Some(false));
        };

        let mut deleted_pages: Vec<PageId> = Vec::new();
        let (removed, size_after, is_root, min_size) = {
            let mut node = LeafNode::<_, K>::new(leaf.page_mut());
            let removed = node.remove(key);
            (removed, node.size(), node.is_root(), node.min_size())
        };
        if !removed {
            drop(leaf);
            ctx.release_all();
            return Ok(Some(false));
        }
        leaf.mark_dirty();

        if is_root {
            if size_after == 0 {
                // the tree is empty now
                let mut root_guard = self.root_page_id.lock();
                *root_guard = INVALID_PAGE_ID;
                self.persist_root(INVALID_PAGE_ID)?;
                deleted_pages.push(leaf.page_id);
            }
            drop(leaf);
            ctx.release_all();
        } else if size_after < min_size {
            self.rebalance_upward(leaf, &mut ctx, &mut deleted_pages)?;
            ctx.release_all();
        } else {
            drop(leaf);
            ctx.release_all();
        }

        // all latches are down; retire emptied pages
        for page_id in deleted_pages {
            if let Err(e) = self.buffer_pool.delete_page(page_id) {
                log::warn!("could not delete emptied tree page {page_id}: {e}");
            }
        }
        Ok(Some(true))
    }

    /// Fix an underflowed node, walking up while merges underflow the
    /// parents; ends with a root adjustment when the walk reaches it.
    fn rebalance_upward(
        &self,
        mut child: LatchedPage,
        ctx: &mut Context,
        deleted_pages: &mut Vec<PageId>,
    ) -> Result<()> {
        loop {
            let Some(mut parent) = ctx.pop_deepest() else {
                return Err(BTreeError::Corrupted("underflow reached an unlatched parent"));
            };
            let merged = self.coalesce_or_redistribute(&mut parent, child, deleted_pages)?;

            if node::node_is_root(parent.page()) {
                return self.adjust_root(parent, deleted_pages);
            }
            if merged && node::node_size(parent.page()) < node::node_min_size(parent.page()) {
                child = parent;
                continue;
            }
            drop(parent);
            return Ok(());
        }
    }

    /// Borrow one entry from a sibling with spares (left first, then
    /// right), or merge with a sibling when neither has any. Returns
    /// whether a merge removed an entry from the parent.
    fn coalesce_or_redistribute(
        &self,
        parent: &mut LatchedPage,
        mut node_page: LatchedPage,
        deleted_pages: &mut Vec<PageId>,
    ) -> Result<bool> {
        let node_id = node_page.page_id;
        let index = {
            let parent_node = InternalNode::<_, K>::new(parent.page());
            parent_node
                .value_index(node_id)
                .ok_or(BTreeError::Corrupted("child vanished from its parent"))?
        };
        let parent_size = node::node_size(parent.page()) as usize;

        // the sibling latches stay held from the spare check through the
        // merge, so the decision cannot be invalidated underneath us
        if index > 0 {
            let sibling_id = InternalNode::<_, K>::new(parent.page()).child_at(index - 1);
            let mut left_sibling = LatchedPage::fetch_write(&self.buffer_pool, sibling_id)?;
            if Self::has_spare(left_sibling.page()) {
                self.redistribute_from_left(parent, &mut left_sibling, &mut node_page, index)?;
                return Ok(false);
            }
            if index + 1 < parent_size {
                let right_id = InternalNode::<_, K>::new(parent.page()).child_at(index + 1);
                let mut right_sibling = LatchedPage::fetch_write(&self.buffer_pool, right_id)?;
                if Self::has_spare(right_sibling.page()) {
                    self.redistribute_from_right(
                        parent,
                        &mut right_sibling,
                        &mut node_page,
                        index,
                    )?;
                    return Ok(false);
                }
            }
            self.merge_into_left(parent, &mut left_sibling, &mut node_page, index)?;
            deleted_pages.push(node_id);
        } else {
            let sibling_id = InternalNode::<_, K>::new(parent.page()).child_at(index + 1);
            let mut right_sibling = LatchedPage::fetch_write(&self.buffer_pool, sibling_id)?;
            if Self::has_spare(right_sibling.page()) {
                self.redistribute_from_right(parent, &mut right_sibling, &mut node_page, index)?;
                return Ok(false);
            }
            self.merge_into_left(parent, &mut node_page, &mut right_sibling, index + 1)?;
            deleted_pages.push(sibling_id);
        }
        Ok(true)
    }

    fn has_spare(page: &crate::common::types::Page) -> bool {
        node::node_size(page) > node::node_min_size(page)
    }

    /// Move the left sibling's last entry to the front of `node_page`
    /// and refresh the separator at `index`.
    fn redistribute_from_left(
        &self,
        parent: &mut LatchedPage,
        sibling: &mut LatchedPage,
        node_page: &mut LatchedPage,
        index: usize,
    ) -> Result<()> {
        match node::node_type(node_page.page()) {
            Some(NodeType::Leaf) => {
                let new_separator = {
                    let mut sibling_node = LeafNode::<_, K>::new(sibling.page_mut());
                    let mut node = LeafNode::<_, K>::new(node_page.page_mut());
                    sibling_node.move_last_to_front_of(&mut node);
                    node.key_at(0)
                };
                let mut parent_node = InternalNode::<_, K>::new(parent.page_mut());
                parent_node.set_key_at(index, &new_separator);
            }
            Some(NodeType::Internal) => {
                let separator = InternalNode::<_, K>::new(parent.page()).key_at(index);
                let (moved_child, new_separator) = {
                    let mut sibling_node = InternalNode::<_, K>::new(sibling.page_mut());
                    let new_separator =
                        sibling_node.key_at(sibling_node.size() as usize - 1);
                    let mut node = InternalNode::<_, K>::new(node_page.page_mut());
                    let moved = sibling_node.move_last_to_front_of(&mut node, &separator);
                    (moved, new_separator)
                };
                {
                    let mut parent_node = InternalNode::<_, K>::new(parent.page_mut());
                    parent_node.set_key_at(index, &new_separator);
                }
                self.reparent(moved_child, node_page.page_id)?;
            }
            None => return Err(BTreeError::Corrupted("sibling is not a tree node")),
        }
        parent.mark_dirty();
        sibling.mark_dirty();
        node_page.mark_dirty();
        Ok(())
    }

    /// Move the right sibling's first entry to the end of `node_page`
    /// and refresh the separator at `index + 1`.
    fn redistribute_from_right(
        &self,
        parent: &mut LatchedPage,
        sibling: &mut LatchedPage,
        node_page: &mut LatchedPage,
        index: usize,
    ) -> Result<()> {
        match node::node_type(node_page.page()) {
            Some(NodeType::Leaf) => {
                let new_separator = {
                    let mut sibling_node = LeafNode::<_, K>::new(sibling.page_mut());
                    let mut node = LeafNode::<_, K>::new(node_page.page_mut());
                    sibling_node.move_first_to_end_of(&mut node);
                    sibling_node.key_at(0)
                };
                let mut parent_node = InternalNode::<_, K>::new(parent.page_mut());
                parent_node.set_key_at(index + 1, &new_separator);
            }
            Some(NodeType::Internal) => {
                let separator = InternalNode::<_, K>::new(parent.page()).key_at(index + 1);
                let (moved_child, new_separator) = {
                    let mut sibling_node = InternalNode::<_, K>::new(sibling.page_mut());
                    let new_separator = sibling_node.key_at(1);
                    let mut node = InternalNode::<_, K>::new(node_page.page_mut());
                    let moved = sibling_node.move_first_to_end_of(&mut node, &separator);
                    (moved, new_separator)
                };
                {
                    let mut parent_node = InternalNode::<_, K>::new(parent.page_mut());
                    parent_node.set_key_at(index + 1, &new_separator);
                }
                self.reparent(moved_child, node_page.page_id)?;
            }
            None => return Err(BTreeError::Corrupted("sibling is not a tree node")),
        }
        parent.mark_dirty();
        sibling.mark_dirty();
        node_page.mark_dirty();
        Ok(())
    }

    /// Fold `right` into `left` and drop the parent entry at
    /// `right_index`. Leaves hand over the chain pointer; internals pull
    /// the separator down and reparent the moved children.
    fn merge_into_left(
        &self,
        parent: &mut LatchedPage,
        left: &mut LatchedPage,
        right: &mut LatchedPage,
        right_index: usize,
    ) -> Result<()> {
        match node::node_type(left.page()) {
            Some(NodeType::Leaf) => {
                let mut right_node = LeafNode::<_, K>::new(right.page_mut());
                let mut left_node = LeafNode::<_, K>::new(left.page_mut());
                right_node.move_all_to(&mut left_node);
            }
            Some(NodeType::Internal) => {
                let separator = InternalNode::<_, K>::new(parent.page()).key_at(right_index);
                let moved_children = {
                    let mut right_node = InternalNode::<_, K>::new(right.page_mut());
                    let mut left_node = InternalNode::<_, K>::new(left.page_mut());
                    right_node.move_all_to(&mut left_node, &separator)
                };
                for child_id in moved_children {
                    self.reparent(child_id, left.page_id)?;
                }
            }
            None => return Err(BTreeError::Corrupted("merge target is not a tree node")),
        }
        {
            let mut parent_node = InternalNode::<_, K>::new(parent.page_mut());
            parent_node.remove_at(right_index);
        }
        parent.mark_dirty();
        left.mark_dirty();
        right.mark_dirty();
        Ok(())
    }

    /// Shrink the tree when the root is an internal node with a single
    /// child: that child becomes the root.
    fn adjust_root(
        &self,
        mut root: LatchedPage,
        deleted_pages: &mut Vec<PageId>,
    ) -> Result<()> {
        let collapse = node::node_type(root.page()) == Some(NodeType::Internal)
            && node::node_size(root.page()) == 1;
        if !collapse {
            return Ok(());
        }

        let child_id = {
            let mut root_node = InternalNode::<_, K>::new(root.page_mut());
            root_node.remove_and_return_only_child()
        };
        root.mark_dirty();
        {
            let mut child = LatchedPage::fetch_write(&self.buffer_pool, child_id)?;
            node::set_node_parent(child.page_mut(), INVALID_PAGE_ID);
            child.mark_dirty();
        }
        {
            let mut root_guard = self.root_page_id.lock();
            *root_guard = child_id;
            self.persist_root(child_id)?;
        }
        deleted_pages.push(root.page_id);
        Ok(())
    }
}
