use std::collections::VecDeque;
use std::marker::PhantomData;

use anyhow::{anyhow, bail, ensure, Context, Result};
use log::warn;
use parking_lot::Mutex;

use super::btree_iterator::TreeIterator;
use crate::buffer_pool::ArcBufferPool;
use crate::errors::Error;
use crate::pages::header_page::HeaderPage;
use crate::pages::indexes::b_plus_tree::{IndexKey, TreePage, TreePageType};
use crate::pages::{PageId, HEADER_PAGE_ID, INVALID_PAGE_ID};
use crate::tuple::Rid;
use crate::txn_manager::Transaction;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TreeOp {
    Lookup,
    Insert,
    Delete,
}

/// Unique-key B+-tree over buffer-pool pages. Lookups crab with read
/// latches; inserts and deletes crab with write latches, keeping the chain
/// from the last unsafe ancestor in the transaction's page set. A trivial
/// sentinel page stands in as the root's parent so root swaps take part in
/// the same protocol.
pub struct BPlusTree<K: IndexKey> {
    index_name: String,
    /// guards root id reads/writes, separate from the sentinel's latch
    root_page_id: Mutex<PageId>,
    trivial_page_id: PageId,
    bpm: ArcBufferPool,
    _marker: PhantomData<K>,
}

impl<K: IndexKey> BPlusTree<K> {
    /// Opens (or registers) the index named `index_name`, restoring its root
    /// from the header page.
    pub fn new(index_name: &str, bpm: ArcBufferPool) -> Result<Self> {
        let trivial_page_id = {
            let mut pool = bpm.lock();
            let frame = pool.new_page().context("allocating the root sentinel")?;
            let mut page: TreePage<K> = frame.into();
            let page_id = page.page_id();
            page.init_trivial(page_id);
            pool.unpin_page(page_id, true);
            page_id
        };

        let root_page_id = {
            let mut pool = bpm.lock();
            let frame = pool.fetch_page(HEADER_PAGE_ID)?;
            let mut header = HeaderPage::new(frame.writer());
            let root = match header.get_root_id(index_name) {
                Some(root) => root,
                None => {
                    header.insert_record(index_name, INVALID_PAGE_ID);
                    INVALID_PAGE_ID
                }
            };
            pool.unpin_page(HEADER_PAGE_ID, true);
            root
        };

        Ok(Self {
            index_name: index_name.to_string(),
            root_page_id: Mutex::new(root_page_id),
            trivial_page_id,
            bpm,
            _marker: PhantomData,
        })
    }

    pub fn root_page_id(&self) -> PageId {
        *self.root_page_id.lock()
    }

    pub fn is_empty(&self) -> Result<bool> {
        let root_id = *self.root_page_id.lock();
        if root_id == INVALID_PAGE_ID {
            return Ok(true);
        }
        let root = self.load_page(root_id)?;
        let empty = root.size() == 0;
        self.unpin(root_id, false);
        Ok(empty)
    }

    /// Point query. Read-crabs down, holding at most two latches.
    pub fn get_value(&self, key: K) -> Result<Option<Rid>> {
        let Some(leaf) = self.find_leaf_read(Some(&key))? else {
            return Ok(None);
        };
        let value = leaf.lookup(&key);
        leaf.latch().runlock();
        self.unpin(leaf.page_id(), false);
        Ok(value)
    }

    /// Unique-key insert; `false` when the key is already present.
    pub fn insert(&self, key: K, value: Rid, txn: &mut Transaction) -> Result<bool> {
        loop {
            {
                let mut root_id = self.root_page_id.lock();
                if *root_id == INVALID_PAGE_ID {
                    self.start_new_tree(key, value, &mut root_id)?;
                    return Ok(true);
                }
            }
            match self.insert_into_leaf(key, value, txn)? {
                Some(inserted) => return Ok(inserted),
                // the tree emptied out before the descent latched it
                None => continue,
            }
        }
    }

    /// Removing a missing key is a no-op.
    pub fn remove(&self, key: K, txn: &mut Transaction) -> Result<()> {
        if self.is_empty()? {
            return Ok(());
        }
        let Some(mut leaf) = self.find_leaf_write(&key, TreeOp::Delete, txn)? else {
            return Ok(());
        };

        leaf.remove_record(&key);

        if leaf.is_root() {
            if self.adjust_root(&mut leaf)? {
                txn.add_deleted_page(leaf.page_id());
            }
            self.release_page_set(txn, TreeOp::Delete, true)?;
            return Ok(());
        }

        if leaf.size() < leaf.min_size() {
            match self.coalesce_or_redistribute(&mut leaf, txn) {
                Ok(true) => txn.add_deleted_page(leaf.page_id()),
                Ok(false) => {}
                Err(e) => {
                    let _ = self.release_page_set(txn, TreeOp::Delete, true);
                    return Err(e);
                }
            }
        }
        self.release_page_set(txn, TreeOp::Delete, true)?;
        Ok(())
    }

    /// Iterator over the whole tree in key order.
    pub fn begin(&self) -> Result<TreeIterator<K>> {
        match self.find_leaf_read(None)? {
            None => Ok(TreeIterator::empty(self.bpm.clone())),
            Some(leaf) => {
                leaf.latch().runlock();
                Ok(TreeIterator::new(leaf, 0, self.bpm.clone()))
            }
        }
    }

    /// Iterator positioned at the first key `>= key`.
    pub fn begin_at(&self, key: K) -> Result<TreeIterator<K>> {
        match self.find_leaf_read(Some(&key))? {
            None => Ok(TreeIterator::empty(self.bpm.clone())),
            Some(leaf) => {
                leaf.latch().runlock();
                // past the leaf's last key the first advance hops the chain
                let index = leaf.key_index(&key).unwrap_or_else(|| leaf.size());
                Ok(TreeIterator::new(leaf, index, self.bpm.clone()))
            }
        }
    }

    fn load_page(&self, page_id: PageId) -> Result<TreePage<K>> {
        let mut pool = self.bpm.lock();
        let frame = pool.fetch_page(page_id)?;
        Ok(TreePage::from(frame))
    }

    fn unpin(&self, page_id: PageId, is_dirty: bool) {
        self.bpm.lock().unpin_page(page_id, is_dirty);
    }

    fn new_leaf_page(&self, parent: PageId) -> Result<TreePage<K>> {
        let mut pool = self.bpm.lock();
        let frame = pool.new_page().context("index ran out of buffer pool memory")?;
        let mut page: TreePage<K> = frame.into();
        let page_id = page.page_id();
        page.init_leaf(page_id, parent);
        Ok(page)
    }

    fn new_internal_page(&self, parent: PageId) -> Result<TreePage<K>> {
        let mut pool = self.bpm.lock();
        let frame = pool.new_page().context("index ran out of buffer pool memory")?;
        let mut page: TreePage<K> = frame.into();
        let page_id = page.page_id();
        page.init_internal(page_id, parent);
        Ok(page)
    }

    /// keep the header page's record in sync on every root change
    fn update_root_page_id(&self, root_page_id: PageId) -> Result<()> {
        let mut pool = self.bpm.lock();
        let frame = pool.fetch_page(HEADER_PAGE_ID)?;
        let mut header = HeaderPage::new(frame.writer());
        if !header.update_record(&self.index_name, root_page_id) {
            header.insert_record(&self.index_name, root_page_id);
        }
        pool.unpin_page(HEADER_PAGE_ID, true);
        Ok(())
    }

    fn start_new_tree(&self, key: K, value: Rid, root_id: &mut PageId) -> Result<()> {
        let mut leaf = self.new_leaf_page(INVALID_PAGE_ID)?;
        leaf.insert_record(key, value);
        let page_id = leaf.page_id();
        self.unpin(page_id, true);
        *root_id = page_id;
        self.update_root_page_id(page_id)?;
        Ok(())
    }

    /// Read-crabbing descent: latch the child, drop the parent. Returns the
    /// still-latched, pinned leaf, or `None` on an empty tree.
    fn find_leaf_read(&self, key: Option<&K>) -> Result<Option<TreePage<K>>> {
        let mut page = self.load_page(self.trivial_page_id)?;
        page.latch().rlock();

        loop {
            let child_id = match page.page_type() {
                TreePageType::Trivial => *self.root_page_id.lock(),
                TreePageType::Internal => match key {
                    Some(key) => page.lookup_internal(key),
                    None => page.value_at(0),
                },
                TreePageType::Leaf => return Ok(Some(page)),
                other => {
                    page.latch().runlock();
                    self.unpin(page.page_id(), false);
                    bail!(Error::Internal(format!(
                        "unexpected {other:?} page during descent"
                    )));
                }
            };

            if child_id == INVALID_PAGE_ID {
                page.latch().runlock();
                self.unpin(page.page_id(), false);
                return Ok(None);
            }

            let child = match self.load_page(child_id) {
                Ok(child) => child,
                Err(e) => {
                    page.latch().runlock();
                    self.unpin(page.page_id(), false);
                    return Err(e);
                }
            };
            child.latch().rlock();
            page.latch().runlock();
            self.unpin(page.page_id(), false);
            page = child;
        }
    }

    /// Write-crabbing descent. Every latched page goes into the
    /// transaction's page set; when a child is safe for `op` the whole set
    /// of ancestors is released. Returns `None` on an empty tree.
    fn find_leaf_write(
        &self,
        key: &K,
        op: TreeOp,
        txn: &mut Transaction,
    ) -> Result<Option<TreePage<K>>> {
        debug_assert!(op != TreeOp::Lookup);

        let mut page = self.load_page(self.trivial_page_id)?;
        page.latch().wlock();
        txn.add_into_page_set(page.page_id(), page.latch().clone());

        loop {
            let (child_id, at_root) = match page.page_type() {
                TreePageType::Trivial => (*self.root_page_id.lock(), true),
                TreePageType::Internal => (page.lookup_internal(key), false),
                TreePageType::Leaf => return Ok(Some(page)),
                other => {
                    self.release_page_set(txn, op, false)?;
                    bail!(Error::Internal(format!(
                        "unexpected {other:?} page during descent"
                    )));
                }
            };

            if child_id == INVALID_PAGE_ID {
                self.release_page_set(txn, op, false)?;
                return Ok(None);
            }

            let child = match self.load_page(child_id) {
                Ok(child) => child,
                Err(e) => {
                    let _ = self.release_page_set(txn, op, false);
                    return Err(e);
                }
            };
            child.latch().wlock();

            let safe = match op {
                TreeOp::Insert => child.size() < child.max_size(),
                TreeOp::Delete => {
                    if at_root {
                        child.size() > 1
                    } else {
                        child.size() > child.min_size()
                    }
                }
                TreeOp::Lookup => unreachable!(),
            };
            if safe {
                self.release_page_set(txn, op, false)?;
            }
            txn.add_into_page_set(child.page_id(), child.latch().clone());
            page = child;
        }
    }

    /// Unlatch and unpin the transaction's page set in acquisition order,
    /// then drop every page scheduled for deletion.
    fn release_page_set(&self, txn: &mut Transaction, op: TreeOp, dirty: bool) -> Result<()> {
        while let Some((page_id, latch)) = txn.pop_front_page() {
            match op {
                TreeOp::Lookup => latch.runlock(),
                _ => latch.wunlock(),
            }
            self.unpin(page_id, dirty);
        }

        if op != TreeOp::Lookup {
            for page_id in txn.take_deleted_pages() {
                if !self.bpm.lock().delete_page(page_id)? {
                    warn!("page {page_id} still pinned, delete skipped");
                }
            }
        }
        Ok(())
    }

    fn insert_into_leaf(&self, key: K, value: Rid, txn: &mut Transaction) -> Result<Option<bool>> {
        let Some(mut leaf) = self.find_leaf_write(&key, TreeOp::Insert, txn)? else {
            return Ok(None);
        };

        if leaf.lookup(&key).is_some() {
            self.release_page_set(txn, TreeOp::Insert, false)?;
            return Ok(Some(false));
        }

        let outcome = self.insert_into_leaf_page(&mut leaf, key, value);
        // latches and pins go back on success and failure alike
        self.release_page_set(txn, TreeOp::Insert, true)?;
        outcome.map(|_| Some(true))
    }

    fn insert_into_leaf_page(&self, leaf: &mut TreePage<K>, key: K, value: Rid) -> Result<()> {
        if leaf.size() + 1 > leaf.max_size() {
            let mut new_leaf = self.new_leaf_page(leaf.parent_page_id())?;
            leaf.move_half_to_leaf(&mut new_leaf);
            let pop_key = new_leaf.key_at(0);
            if key < pop_key {
                leaf.insert_record(key, value);
            } else {
                new_leaf.insert_record(key, value);
            }
            let result = self.insert_into_parent(leaf, pop_key, &mut new_leaf);
            self.unpin(new_leaf.page_id(), true);
            result?;
        } else {
            leaf.insert_record(key, value);
        }
        Ok(())
    }

    /// Install the separator for a freshly split pair into the parent,
    /// cascading splits up to (and including) the root.
    fn insert_into_parent(
        &self,
        old: &mut TreePage<K>,
        key: K,
        new: &mut TreePage<K>,
    ) -> Result<()> {
        let parent_id = old.parent_page_id();

        if parent_id == INVALID_PAGE_ID {
            // the root itself split, grow the tree by one level
            let mut root = self.new_internal_page(INVALID_PAGE_ID)?;
            root.populate_new_root(old.page_id(), key, new.page_id());
            old.set_parent_page_id(root.page_id());
            new.set_parent_page_id(root.page_id());
            *self.root_page_id.lock() = root.page_id();
            self.update_root_page_id(root.page_id())?;
            self.unpin(root.page_id(), true);
            return Ok(());
        }

        let mut parent = self.load_page(parent_id)?;
        if parent.size() + 1 > parent.max_size() {
            let mut new_parent = self.new_internal_page(parent.parent_page_id())?;
            parent.move_half_to_internal(&mut new_parent);
            self.reparent_children(&new_parent, 0, new_parent.size())?;

            let pop_key = new_parent.key_at(0);
            if key < pop_key {
                parent.insert_node_after(old.page_id(), key, new.page_id());
                new.set_parent_page_id(parent.page_id());
            } else {
                new_parent.insert_node_after(old.page_id(), key, new.page_id());
                new.set_parent_page_id(new_parent.page_id());
            }
            let result = self.insert_into_parent(&mut parent, pop_key, &mut new_parent);
            self.unpin(new_parent.page_id(), true);
            result?;
        } else {
            parent.insert_node_after(old.page_id(), key, new.page_id());
        }
        self.unpin(parent_id, true);
        Ok(())
    }

    /// children moved between internal pages must point at their new parent
    fn reparent_children(&self, page: &TreePage<K>, from: usize, to: usize) -> Result<()> {
        for index in from..to {
            let child_id = page.value_at(index);
            let mut child = self.load_page(child_id)?;
            child.set_parent_page_id(page.page_id());
            self.unpin(child_id, true);
        }
        Ok(())
    }

    /// Underflow handling: try to borrow from the left sibling, then the
    /// right; otherwise merge into the left-hand page. Returns whether
    /// `node` itself must be deleted.
    fn coalesce_or_redistribute(&self, node: &mut TreePage<K>, txn: &mut Transaction) -> Result<bool> {
        if node.size() >= node.min_size() {
            return Ok(false);
        }
        let parent_id = node.parent_page_id();
        debug_assert_ne!(parent_id, INVALID_PAGE_ID);

        let mut parent = self.load_page(parent_id)?;
        let node_index = parent
            .value_index(node.page_id())
            .ok_or_else(|| anyhow!(Error::Internal("page missing from its parent".into())))?;

        if node_index >= 1 {
            let left_id = parent.value_at(node_index - 1);
            let mut left = self.load_page(left_id)?;
            if left.size() + node.size() >= node.max_size() {
                self.redistribute_from_left(&mut left, node, &mut parent, node_index)?;
                self.unpin(left_id, true);
                self.unpin(parent_id, true);
                return Ok(false);
            }
            self.unpin(left_id, false);
        }
        if node_index + 1 < parent.size() {
            let right_id = parent.value_at(node_index + 1);
            let mut right = self.load_page(right_id)?;
            if right.size() + node.size() >= node.max_size() {
                self.redistribute_from_right(&mut right, node, &mut parent, node_index)?;
                self.unpin(right_id, true);
                self.unpin(parent_id, true);
                return Ok(false);
            }
            self.unpin(right_id, false);
        }

        let delete_node = if node_index >= 1 {
            // merge node into its left sibling
            let left_id = parent.value_at(node_index - 1);
            let mut left = self.load_page(left_id)?;
            let separator = parent.key_at(node_index);
            if node.is_leaf() {
                node.move_all_to_leaf(&mut left);
            } else {
                let moved_from = left.size();
                node.move_all_to_internal(&mut left, separator);
                self.reparent_children(&left, moved_from, left.size())?;
            }
            parent.remove_at(node_index);
            self.unpin(left_id, true);
            true
        } else {
            // leftmost page: pull the right sibling into node instead
            let right_id = parent.value_at(node_index + 1);
            let mut right = self.load_page(right_id)?;
            let separator = parent.key_at(node_index + 1);
            if node.is_leaf() {
                right.move_all_to_leaf(node);
            } else {
                let moved_from = node.size();
                right.move_all_to_internal(node, separator);
                self.reparent_children(node, moved_from, node.size())?;
            }
            parent.remove_at(node_index + 1);
            txn.add_deleted_page(right_id);
            self.unpin(right_id, true);
            false
        };

        let parent_gone = if parent.is_root() {
            self.adjust_root(&mut parent)?
        } else {
            self.coalesce_or_redistribute(&mut parent, txn)?
        };
        if parent_gone {
            txn.add_deleted_page(parent_id);
        }
        self.unpin(parent_id, true);
        Ok(delete_node)
    }

    fn redistribute_from_left(
        &self,
        left: &mut TreePage<K>,
        node: &mut TreePage<K>,
        parent: &mut TreePage<K>,
        node_index: usize,
    ) -> Result<()> {
        if node.is_leaf() {
            left.move_last_to_front_of_leaf(node);
            parent.set_key_at(node_index, node.key_at(0));
        } else {
            let separator = parent.key_at(node_index);
            let new_separator = left.move_last_to_front_of_internal(node, separator);
            parent.set_key_at(node_index, new_separator);
            self.reparent_children(node, 0, 1)?;
        }
        Ok(())
    }

    fn redistribute_from_right(
        &self,
        right: &mut TreePage<K>,
        node: &mut TreePage<K>,
        parent: &mut TreePage<K>,
        node_index: usize,
    ) -> Result<()> {
        if node.is_leaf() {
            right.move_first_to_end_of_leaf(node);
            parent.set_key_at(node_index + 1, right.key_at(0));
        } else {
            let separator = parent.key_at(node_index + 1);
            let new_separator = right.move_first_to_end_of_internal(node, separator);
            parent.set_key_at(node_index + 1, new_separator);
            self.reparent_children(node, node.size() - 1, node.size())?;
        }
        Ok(())
    }

    /// The root may underflow: an empty root leaf ends the tree, a root
    /// internal page with a single child hands the root over to it. Returns
    /// whether the old root page must be deleted.
    fn adjust_root(&self, old_root: &mut TreePage<K>) -> Result<bool> {
        debug_assert!(old_root.is_root());
        if (old_root.is_leaf() && old_root.size() >= 1)
            || (!old_root.is_leaf() && old_root.size() >= 2)
        {
            return Ok(false);
        }

        if old_root.is_leaf() {
            *self.root_page_id.lock() = INVALID_PAGE_ID;
            self.update_root_page_id(INVALID_PAGE_ID)?;
        } else {
            let child_id = old_root.remove_and_return_only_child();
            let mut child = self.load_page(child_id)?;
            child.set_parent_page_id(INVALID_PAGE_ID);
            self.unpin(child_id, true);
            *self.root_page_id.lock() = child_id;
            self.update_root_page_id(child_id)?;
        }
        Ok(true)
    }

    /// Structural invariant walk used by tests: equal leaf depth, strictly
    /// ascending keys, separator/child-boundary agreement, occupancy bounds,
    /// and parent back-pointers.
    pub fn verify_integrity(&self) -> Result<()> {
        let root_id = *self.root_page_id.lock();
        if root_id == INVALID_PAGE_ID {
            return Ok(());
        }

        let mut queue: VecDeque<(PageId, Option<K>, Option<K>, usize, PageId)> = VecDeque::new();
        queue.push_back((root_id, None, None, 0, INVALID_PAGE_ID));
        let mut leaf_depth = None;

        while let Some((page_id, lower, upper, depth, parent_id)) = queue.pop_front() {
            let page = self.load_page(page_id)?;
            let result = self.check_page(
                &page,
                lower,
                upper,
                depth,
                parent_id,
                root_id,
                &mut leaf_depth,
                &mut queue,
            );
            self.unpin(page_id, false);
            result?;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn check_page(
        &self,
        page: &TreePage<K>,
        lower: Option<K>,
        upper: Option<K>,
        depth: usize,
        parent_id: PageId,
        root_id: PageId,
        leaf_depth: &mut Option<usize>,
        queue: &mut VecDeque<(PageId, Option<K>, Option<K>, usize, PageId)>,
    ) -> Result<()> {
        let page_id = page.page_id();
        let size = page.size();

        ensure!(
            page.parent_page_id() == parent_id,
            Error::Internal(format!("page {page_id} has a stale parent pointer"))
        );
        ensure!(
            size <= page.max_size(),
            Error::Internal(format!("page {page_id} overflows its max size"))
        );
        if page_id != root_id {
            ensure!(
                size >= page.min_size(),
                Error::Internal(format!("page {page_id} underflows its min size"))
            );
        } else if page.is_internal() {
            ensure!(
                size >= 2,
                Error::Internal(format!("root {page_id} kept a single child"))
            );
        }

        let first_key_index = if page.is_leaf() { 0 } else { 1 };
        for index in first_key_index..size {
            let key = page.key_at(index);
            if index > first_key_index {
                ensure!(
                    page.key_at(index - 1) < key,
                    Error::Internal(format!("page {page_id} keys are not ascending"))
                );
            }
            if let Some(lower) = lower {
                ensure!(
                    key >= lower,
                    Error::Internal(format!("page {page_id} violates its lower bound"))
                );
            }
            if let Some(upper) = upper {
                ensure!(
                    key < upper,
                    Error::Internal(format!("page {page_id} violates its upper bound"))
                );
            }
        }

        if page.is_leaf() {
            match leaf_depth {
                Some(expected) => ensure!(
                    depth == *expected,
                    Error::Internal("leaves sit at different depths".into())
                ),
                None => *leaf_depth = Some(depth),
            }
        } else {
            for index in 0..size {
                let child_lower = if index == 0 {
                    lower
                } else {
                    Some(page.key_at(index))
                };
                let child_upper = if index == size - 1 {
                    upper
                } else {
                    Some(page.key_at(index + 1))
                };
                queue.push_back((page.value_at(index), child_lower, child_upper, depth + 1, page_id));
            }
        }
        Ok(())
    }
}
