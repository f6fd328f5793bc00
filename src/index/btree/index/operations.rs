use crate::common::types::{PageId, Rid, INVALID_PAGE_ID};
use crate::index::btree::error::BTreeError;
use crate::index::btree::index::base::{BPlusTree, Context, LatchedPage};
use crate::index::btree::key::IndexKey;
use crate::index::btree::node::{self, InternalNode, LeafNode, NodeType};

pub type Result<T> = std::result::Result<T, BTreeError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AccessMode {
    Read,
    Insert,
    Delete,
}

impl<K: IndexKey> BPlusTree<K> {
    /// Point lookup under read-crabbing latches.
    pub fn get_value(&self, key: &K) -> Result<Option<Rid>> {
        let mut ctx = Context::new();
        let Some(leaf) = self.find_leaf(Some(key), AccessMode::Read, &mut ctx)? else {
            return Ok(None);
        };
        let node = LeafNode::<_, K>::new(leaf.page());
        Ok(node.lookup(key))
    }

    /// Insert a unique key. Returns false (and changes nothing) for a
    /// duplicate.
    ///
    /// Tries the optimistic protocol first: read-crab to the leaf and
    /// re-latch it for writing, valid only while the leaf stays safe.
    /// Falls back to a pessimistic write-crabbing descent that keeps
    /// every unsafe ancestor latched.
    pub fn insert(&self, key: &K, rid: Rid) -> Result<bool> {
        loop {
            if let Some(result) = self.lucky_insert(key, rid)? {
                return Ok(result);
            }
            if let Some(result) = self.sad_insert(key, rid)? {
                return Ok(result);
            }
        }
    }

    fn lucky_insert(&self, key: &K, rid: Rid) -> Result<Option<bool>> {
        {
            let mut root_guard = self.root_page_id.lock();
            if *root_guard == INVALID_PAGE_ID {
                self.start_new_tree(key, rid, &mut root_guard)?;
                return Ok(Some(true));
            }
        }

        let mut ctx = Context::new();
        let Some(mut leaf) = self.find_leaf(Some(key), AccessMode::Read, &mut ctx)? else {
            return Ok(None);
        };
        if node::node_is_root(leaf.page()) {
            // a root leaf may split or empty; only the sad path handles that
            return Ok(None);
        }

        leaf.upgrade();
        // the leaf may have split, merged or been recycled while we
        // re-latched; bail out unless the key still provably lands here
        if !self.leaf_accepts(leaf.page(), key, AccessMode::Insert) {
            return Ok(None);
        }

        let inserted = {
            let mut node = LeafNode::<_, K>::new(leaf.page_mut());
            node.insert(key, rid)
        };
        if inserted {
            leaf.mark_dirty();
        }
        Ok(Some(inserted))
    }

    fn sad_insert(&self, key: &K, rid: Rid) -> Result<Option<bool>> {
        {
            let mut root_guard = self.root_page_id.lock();
            if *root_guard == INVALID_PAGE_ID {
                self.start_new_tree(key, rid, &mut root_guard)?;
                return Ok(Some(true));
            }
        }

        let mut ctx = Context::new();
        let Some(mut leaf) = self.find_leaf(Some(key), AccessMode::Insert, &mut ctx)? else {
            return Ok(None);
        };

        let (inserted, size_after) = {
            let mut node = LeafNode::<_, K>::new(leaf.page_mut());
            let inserted = node.insert(key, rid);
            (inserted, node.size())
        };
        if !inserted {
            drop(leaf);
            ctx.release_all();
            return Ok(Some(false));
        }
        leaf.mark_dirty();

        if size_after >= self.leaf_max_size {
            let (mut sibling, sibling_id) = self.new_page_latched()?;
            let split_key = {
                let parent_id = node::node_parent(leaf.page());
                let mut new_node = LeafNode::<_, K>::init(
                    sibling.page_mut(),
                    sibling_id,
                    parent_id,
                    self.leaf_max_size,
                );
                let mut old_node = LeafNode::<_, K>::new(leaf.page_mut());
                old_node.move_half_to(&mut new_node);
                new_node.set_next_page_id(old_node.next_page_id());
                old_node.set_next_page_id(sibling_id);
                new_node.key_at(0)
            };
            self.insert_into_parent(&mut ctx, leaf, split_key, sibling)?;
        } else {
            drop(leaf);
            ctx.release_all();
        }
        Ok(Some(true))
    }

    /// Does this (write-latched) page still own the key's position?
    /// Checked after an optimistic re-latch.
    pub(crate) fn leaf_accepts(
        &self,
        page: &crate::common::types::Page,
        key: &K,
        mode: AccessMode,
    ) -> bool {
        if node::node_type(page) != Some(NodeType::Leaf) || node::node_is_root(page) {
            return false;
        }
        let node = LeafNode::<_, K>::new(page);
        let size = node.size();
        if size == 0 {
            return false;
        }
        let safe = match mode {
            AccessMode::Insert => size + 1 < node.max_size(),
            AccessMode::Delete => size > node.min_size(),
            AccessMode::Read => true,
        };
        safe
            && *key >= node.key_at(0)
            && (*key <= node.key_at(size as usize - 1)
                || node.next_page_id() == INVALID_PAGE_ID)
    }

    /// Root-to-leaf descent. Read mode crabs hand over hand; write modes
    /// queue latched ancestors in `ctx`, dropping the whole queue each
    /// time a safe child is reached. Returns `None` for an empty tree.
    pub(crate) fn find_leaf(
        &self,
        key: Option<&K>,
        mode: AccessMode,
        ctx: &mut Context,
    ) -> Result<Option<LatchedPage>> {
        'restart: loop {
            let root_id = *self.root_page_id.lock();
            if root_id == INVALID_PAGE_ID {
                return Ok(None);
            }
            let mut current = match mode {
                AccessMode::Read => LatchedPage::fetch_read(&self.buffer_pool, root_id)?,
                _ => LatchedPage::fetch_write(&self.buffer_pool, root_id)?,
            };
            // the root may have moved before we got the latch
            if !node::node_is_root(current.page()) || *self.root_page_id.lock() != root_id {
                drop(current);
                ctx.release_all();
                continue 'restart;
            }

            loop {
                match node::node_type(current.page()) {
                    Some(NodeType::Leaf) => return Ok(Some(current)),
                    Some(NodeType::Internal) => {}
                    None => return Err(BTreeError::Corrupted("page is not a tree node")),
                }
                let child_id = {
                    let internal = InternalNode::<_, K>::new(current.page());
                    match key {
                        Some(key) => internal.lookup(key),
                        None => internal.child_at(0),
                    }
                };
                match mode {
                    AccessMode::Read => {
                        // acquire the child before releasing the parent
                        let child = LatchedPage::fetch_read(&self.buffer_pool, child_id)?;
                        current = child;
                    }
                    AccessMode::Insert | AccessMode::Delete => {
                        let child = LatchedPage::fetch_write(&self.buffer_pool, child_id)?;
                        let parent = std::mem::replace(&mut current, child);
                        ctx.push(parent);
                        if Self::is_safe(current.page(), mode) {
                            ctx.release_all();
                        }
                    }
                }
            }
        }
    }

    fn is_safe(page: &crate::common::types::Page, mode: AccessMode) -> bool {
        match mode {
            AccessMode::Read => true,
            AccessMode::Insert => node::node_size(page) + 1 < node::node_max_size(page),
            AccessMode::Delete => node::node_size(page) > node::node_min_size(page),
        }
    }

    /// First key of an empty tree: a single leaf becomes the root.
    fn start_new_tree(&self, key: &K, rid: Rid, root_guard: &mut PageId) -> Result<()> {
        let (mut page, page_id) = self.new_page_latched()?;
        {
            let mut leaf = LeafNode::<_, K>::init(
                page.page_mut(),
                page_id,
                INVALID_PAGE_ID,
                self.leaf_max_size,
            );
            leaf.insert(key, rid);
        }
        drop(page);
        *root_guard = page_id;
        self.persist_root(page_id)
    }

    /// Thread a freshly split sibling into the parent, splitting upward
    /// as long as parents overflow. Every parent this can touch is still
    /// latched in `ctx` (an ancestor released as safe cannot overflow).
    fn insert_into_parent(
        &self,
        ctx: &mut Context,
        mut left: LatchedPage,
        mut split_key: K,
        mut right: LatchedPage,
    ) -> Result<()> {
        loop {
            if node::node_is_root(left.page()) {
                let (mut root_page, root_id) = self.new_page_latched()?;
                {
                    let mut root = InternalNode::<_, K>::init(
                        root_page.page_mut(),
                        root_id,
                        INVALID_PAGE_ID,
                        self.internal_max_size,
                    );
                    root.populate_new_root(left.page_id, &split_key, right.page_id);
                }
                node::set_node_parent(left.page_mut(), root_id);
                node::set_node_parent(right.page_mut(), root_id);
                left.mark_dirty();
                right.mark_dirty();
                {
                    let mut root_guard = self.root_page_id.lock();
                    *root_guard = root_id;
                    self.persist_root(root_id)?;
                }
                drop(root_page);
                drop(left);
                drop(right);
                ctx.release_all();
                return Ok(());
            }

            let Some(mut parent) = ctx.pop_deepest() else {
                return Err(BTreeError::Corrupted("split reached an unlatched parent"));
            };
            let parent_size = {
                let mut parent_node = InternalNode::<_, K>::new(parent.page_mut());
                parent_node.insert_node_after(left.page_id, &split_key, right.page_id)
            };
            parent.mark_dirty();
            drop(left);
            drop(right);

            if parent_size < self.internal_max_size {
                drop(parent);
                ctx.release_all();
                return Ok(());
            }

            // the parent overflowed in turn
            let (mut sibling, sibling_id) = self.new_page_latched()?;
            let parent_parent = node::node_parent(parent.page());
            let (moved_children, pushed_key) = {
                let mut new_node = InternalNode::<_, K>::init(
                    sibling.page_mut(),
                    sibling_id,
                    parent_parent,
                    self.internal_max_size,
                );
                let mut old_node = InternalNode::<_, K>::new(parent.page_mut());
                let moved = old_node.move_half_to(&mut new_node);
                (moved, new_node.key_at(0))
            };
            for child_id in moved_children {
                self.reparent(child_id, sibling_id)?;
            }
            split_key = pushed_key;
            left = parent;
            right = sibling;
        }
    }

    /// Point a child at its new parent. We hold the new parent's write
    /// latch, so acquiring the child keeps the root-to-leaf order.
    pub(crate) fn reparent(&self, child_id: PageId, new_parent: PageId) -> Result<()> {
        let mut child = LatchedPage::fetch_write(&self.buffer_pool, child_id)?;
        node::set_node_parent(child.page_mut(), new_parent);
        child.mark_dirty();
        Ok(())
    }
}
