//! Disk-based B+ tree index.
//!
//! Internal and leaf nodes live on buffer pool pages. Lookups descend with
//! read-latch coupling; mutations first try an optimistic write descent
//! (latch the child, release the parent) and fall back to a pessimistic
//! descent that keeps the safe suffix of ancestors write-latched while
//! splits and merges propagate.
//!
//! The current root page id is cached in an atomic and persisted in the
//! header page record for the index name on every root change. Because the
//! root can move between reading the id and latching the page, every
//! root latch re-validates the id under the latch and retries on a
//! mismatch; a dedicated mutex serializes only the very first root
//! creation.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, trace};
use parking_lot::Mutex;

use crate::buffer::buffer_pool_manager::BufferPoolManager;
use crate::common::config::{PageId, HEADER_PAGE_ID, INVALID_PAGE_ID};
use crate::storage::index::index_iterator::IndexIterator;
use crate::storage::index::latch_crabbing::{
    release_bottom_up, InternalWriteGuard, LeafWriteGuard, NodePage, NodeReadGuard,
    NodeWriteGuard,
};
use crate::storage::index::{KeyComparator, KeyType, ValueType};
use crate::storage::page::b_plus_tree_internal_page::BPlusTreeInternalPage;
use crate::storage::page::b_plus_tree_leaf_page::BPlusTreeLeafPage;
use crate::storage::page::header_page::HeaderPage;

/// Write paths treat pool exhaustion as a violated sizing precondition:
/// the pool must cover the latch-coupling working set (tree height plus a
/// sibling).
const POOL_EXHAUSTED: &str = "buffer pool exhausted: pool smaller than the latch-coupling set";

enum OptimisticOutcome<T> {
    Done(T),
    NeedRestart,
}

/// Per-subtree facts gathered by `verify_integrity`.
struct NodeSummary<K> {
    depth: usize,
    min_key: K,
    leaves: Vec<PageId>,
}

pub struct BPlusTree<K, V, C> {
    index_name: String,
    bpm: Arc<BufferPoolManager>,
    comparator: C,
    leaf_max_size: usize,
    internal_max_size: usize,
    /// Cached root page id; the header page record is the durable copy.
    root_page_id: AtomicU64,
    /// Serializes only the empty-to-nonempty transition.
    root_latch: Mutex<()>,
    _marker: PhantomData<(K, V)>,
}

impl<K, V, C> BPlusTree<K, V, C>
where
    K: KeyType,
    V: ValueType,
    C: KeyComparator<K>,
{
    /// Opens (or prepares to create) the named index. If the header page
    /// already records a root for `index_name`, the tree resumes from it.
    pub fn new(
        index_name: impl Into<String>,
        bpm: Arc<BufferPoolManager>,
        comparator: C,
        leaf_max_size: usize,
        internal_max_size: usize,
    ) -> Self {
        assert!(leaf_max_size >= 2, "leaf max size must be at least 2");
        assert!(internal_max_size >= 3, "internal max size must be at least 3");
        let index_name = index_name.into();

        let root_page_id = {
            let pin = bpm
                .fetch_page_guarded(HEADER_PAGE_ID)
                .expect(POOL_EXHAUSTED);
            let data = pin.read();
            HeaderPage::load(&data)
                .get_record(&index_name)
                .unwrap_or(INVALID_PAGE_ID)
        };

        Self {
            index_name,
            bpm,
            comparator,
            leaf_max_size,
            internal_max_size,
            root_page_id: AtomicU64::new(root_page_id),
            root_latch: Mutex::new(()),
            _marker: PhantomData,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.root_page_id.load(Ordering::SeqCst) == INVALID_PAGE_ID
    }

    pub fn root_page_id(&self) -> PageId {
        self.root_page_id.load(Ordering::SeqCst)
    }

    /// Publishes a root change to the cached id and the header page.
    fn set_root_page_id(&self, root_id: PageId) {
        self.root_page_id.store(root_id, Ordering::SeqCst);
        let pin = self
            .bpm
            .fetch_page_guarded(HEADER_PAGE_ID)
            .expect(POOL_EXHAUSTED);
        let mut data = pin.write();
        let mut header = HeaderPage::load(&data);
        if !header.update_record(&self.index_name, root_id) {
            header.insert_record(&self.index_name, root_id);
        }
        header.store(&mut data);
        drop(data);
        pin.set_dirty();
        debug!("index {} root is now page {}", self.index_name, root_id);
    }

    /// Read-latches the current root, re-validating the root id under the
    /// latch. Returns `None` when the tree is empty or the pool cannot
    /// serve the fetch (read paths degrade to a miss).
    fn latch_root_read(&self) -> Option<NodeReadGuard<K, V>> {
        loop {
            let root_id = self.root_page_id.load(Ordering::SeqCst);
            if root_id == INVALID_PAGE_ID {
                return None;
            }
            let pin = self.bpm.fetch_page_guarded(root_id)?;
            match NodeReadGuard::acquire(pin) {
                Ok(guard) => {
                    if self.root_page_id.load(Ordering::SeqCst) == root_id {
                        return Some(guard);
                    }
                }
                Err(_) => {
                    // The page stopped being a node, so the root must have
                    // moved; anything else is corruption.
                    assert_ne!(
                        self.root_page_id.load(Ordering::SeqCst),
                        root_id,
                        "root page {} no longer decodes as a node",
                        root_id
                    );
                }
            }
        }
    }

    /// Write-latches the current root with the same re-validation loop.
    fn latch_root_write(&self) -> Option<NodeWriteGuard<K, V>> {
        loop {
            let root_id = self.root_page_id.load(Ordering::SeqCst);
            if root_id == INVALID_PAGE_ID {
                return None;
            }
            let pin = self
                .bpm
                .fetch_page_guarded(root_id)
                .expect(POOL_EXHAUSTED);
            match NodeWriteGuard::acquire(pin) {
                Ok(guard) => {
                    if self.root_page_id.load(Ordering::SeqCst) == root_id {
                        return Some(guard);
                    }
                }
                Err(_) => {
                    assert_ne!(
                        self.root_page_id.load(Ordering::SeqCst),
                        root_id,
                        "root page {} no longer decodes as a node",
                        root_id
                    );
                }
            }
        }
    }

    /// Point lookup. Descends with read-latch coupling; returns `None` for
    /// a missing key or when the pool cannot serve a fetch.
    pub fn get_value(&self, key: &K) -> Option<V> {
        let mut guard = self.latch_root_read()?;
        loop {
            let next = match guard.node() {
                NodePage::Leaf(leaf) => return leaf.lookup(key, &self.comparator),
                NodePage::Internal(internal) => {
                    let index = internal.child_index(key, &self.comparator);
                    let child = internal.child_at(index);
                    let pin = self.bpm.fetch_page_guarded(child)?;
                    NodeReadGuard::acquire(pin).ok()?
                }
            };
            // The child is latched; only now may the parent latch go.
            guard = next;
        }
    }

    /// Inserts a unique key. Returns false (leaving the tree unchanged) if
    /// the key is already present.
    pub fn insert(&self, key: K, value: V) -> bool {
        loop {
            if self.is_empty() {
                if self.start_new_tree(&key, &value) {
                    return true;
                }
                // Lost the creation race; fall through to a regular descent.
                continue;
            }
            match self.insert_optimistic(&key, &value) {
                Some(OptimisticOutcome::Done(inserted)) => return inserted,
                Some(OptimisticOutcome::NeedRestart) => {}
                None => continue, // tree emptied under us
            }
            match self.insert_pessimistic(&key, &value) {
                Some(inserted) => return inserted,
                None => continue,
            }
        }
    }

    /// Creates the first leaf as root under the serializing root latch.
    /// Returns false if another thread created the root first.
    fn start_new_tree(&self, key: &K, value: &V) -> bool {
        let _serialize = self.root_latch.lock();
        if !self.is_empty() {
            return false;
        }
        let (root_id, pin) = self.bpm.new_page_guarded().expect(POOL_EXHAUSTED);
        let mut root = LeafWriteGuard::for_new(
            pin,
            BPlusTreeLeafPage::new(root_id, self.leaf_max_size),
        );
        root.node_mut()
            .insert(key.clone(), value.clone(), &self.comparator);
        drop(root);
        self.set_root_page_id(root_id);
        debug!("index {} created root leaf {}", self.index_name, root_id);
        true
    }

    /// Optimistic write descent: W-latch the child, release the parent. At
    /// the leaf, inserts only if the leaf stays strictly below capacity.
    /// `None` means the tree emptied; `NeedRestart` demands a pessimistic
    /// pass.
    fn insert_optimistic(&self, key: &K, value: &V) -> Option<OptimisticOutcome<bool>> {
        let mut guard = self.latch_root_write()?;
        loop {
            let next = match &mut guard {
                NodeWriteGuard::Leaf(leaf) => {
                    if leaf.node().lookup(key, &self.comparator).is_some() {
                        return Some(OptimisticOutcome::Done(false));
                    }
                    if leaf.node().size() + 1 < leaf.node().max_size() {
                        leaf.node_mut()
                            .insert(key.clone(), value.clone(), &self.comparator);
                        return Some(OptimisticOutcome::Done(true));
                    }
                    return Some(OptimisticOutcome::NeedRestart);
                }
                NodeWriteGuard::Internal(internal) => {
                    let index = internal.node().child_index(key, &self.comparator);
                    let child = internal.node().child_at(index);
                    let pin = self.bpm.fetch_page_guarded(child).expect(POOL_EXHAUSTED);
                    NodeWriteGuard::acquire(pin).expect("child page is not a node")
                }
            };
            guard = next;
        }
    }

    /// Pessimistic write descent: W-latch the path, releasing ancestors
    /// whenever the current node is insert-safe. Applies the insert and
    /// propagates splits through the held safe suffix.
    fn insert_pessimistic(&self, key: &K, value: &V) -> Option<bool> {
        let mut held: Vec<InternalWriteGuard<K>> = Vec::new();
        let mut guard = self.latch_root_write()?;
        loop {
            match guard {
                NodeWriteGuard::Leaf(mut leaf) => {
                    if leaf.node().lookup(key, &self.comparator).is_some() {
                        release_bottom_up(&mut held);
                        return Some(false);
                    }
                    leaf.node_mut()
                        .insert(key.clone(), value.clone(), &self.comparator);
                    if leaf.node().size() > leaf.node().max_size() {
                        self.split_leaf(leaf, &mut held);
                    }
                    release_bottom_up(&mut held);
                    return Some(true);
                }
                NodeWriteGuard::Internal(internal) => {
                    if internal.is_insert_safe() {
                        release_bottom_up(&mut held);
                    }
                    let index = internal.node().child_index(key, &self.comparator);
                    let child = internal.node().child_at(index);
                    let pin = self.bpm.fetch_page_guarded(child).expect(POOL_EXHAUSTED);
                    let next = NodeWriteGuard::acquire(pin).expect("child page is not a node");
                    held.push(internal);
                    guard = next;
                }
            }
        }
    }

    /// Splits an overflowing leaf: the new right sibling takes the upper
    /// `size - min_size` entries, joins the leaf chain, and its first key
    /// rises as the separator.
    fn split_leaf(&self, mut leaf: LeafWriteGuard<K, V>, held: &mut Vec<InternalWriteGuard<K>>) {
        let (upper_keys, upper_values) = leaf.node_mut().split_off_upper();
        let (right_id, right_pin) = self.bpm.new_page_guarded().expect(POOL_EXHAUSTED);
        let mut right = LeafWriteGuard::for_new(
            right_pin,
            BPlusTreeLeafPage::new(right_id, self.leaf_max_size),
        );
        right.node_mut().absorb_upper(upper_keys, upper_values);
        right
            .node_mut()
            .set_next_page_id(leaf.node().next_page_id());
        right
            .node_mut()
            .set_parent_page_id(leaf.node().parent_page_id());
        leaf.node_mut().set_next_page_id(right_id);

        let risen = right.node().key_at(0).clone();
        trace!(
            "split leaf {} -> {} (separator rises)",
            leaf.page_id(),
            right_id
        );
        self.insert_into_parent(
            NodeWriteGuard::Leaf(leaf),
            risen,
            NodeWriteGuard::Leaf(right),
            held,
        );
    }

    /// Propagates a split upward: inserts `(risen, right)` after `left` in
    /// the deepest held ancestor, splitting ancestors as needed; at the
    /// root, installs a new internal root and registers it in the header
    /// page.
    fn insert_into_parent(
        &self,
        left: NodeWriteGuard<K, V>,
        risen: K,
        right: NodeWriteGuard<K, V>,
        held: &mut Vec<InternalWriteGuard<K>>,
    ) {
        let mut left = left;
        let mut right = right;
        let mut risen = risen;

        loop {
            if held.is_empty() {
                // `left` was the root.
                let (root_id, root_pin) = self.bpm.new_page_guarded().expect(POOL_EXHAUSTED);
                let mut root = InternalWriteGuard::for_new(
                    root_pin,
                    BPlusTreeInternalPage::new(root_id, self.internal_max_size),
                );
                root.node_mut()
                    .populate_new_root(left.page_id(), risen, right.page_id());
                left.set_parent_page_id(root_id);
                right.set_parent_page_id(root_id);
                drop(left);
                drop(right);
                drop(root);
                self.set_root_page_id(root_id);
                return;
            }

            let mut parent = held.pop().expect("held suffix is non-empty");
            let index = parent
                .node()
                .index_of_child(left.page_id())
                .expect("split child missing from held parent");
            parent
                .node_mut()
                .insert_after(index, risen.clone(), right.page_id());
            right.set_parent_page_id(parent.page_id());
            drop(left);
            drop(right);

            if parent.node().size() <= parent.node().max_size() {
                // Parent absorbed the split; remaining ancestors were
                // already insert-safe or are released by the caller.
                return;
            }

            // Parent overflows: split it and keep propagating.
            let (risen_above, upper_keys, upper_children) = parent.node_mut().split_off_upper();
            let (pright_id, pright_pin) = self.bpm.new_page_guarded().expect(POOL_EXHAUSTED);
            let mut pright = InternalWriteGuard::for_new(
                pright_pin,
                BPlusTreeInternalPage::new(pright_id, self.internal_max_size),
            );
            pright.node_mut().absorb_upper(upper_keys, upper_children);
            pright
                .node_mut()
                .set_parent_page_id(parent.node().parent_page_id());
            // Children that moved to the new node must learn their parent.
            // Their latches are free: the guards from the level below were
            // dropped above, and no descent can pass the held suffix.
            let moved: Vec<PageId> = pright.node().children().to_vec();
            for child in moved {
                self.reassign_parent(child, pright_id);
            }
            trace!("split internal {} -> {}", parent.page_id(), pright_id);

            left = NodeWriteGuard::Internal(parent);
            right = NodeWriteGuard::Internal(pright);
            risen = risen_above;
        }
    }

    /// Rewrites `parent_page_id` of `child` under the child's own W latch.
    fn reassign_parent(&self, child: PageId, new_parent: PageId) {
        let pin = self.bpm.fetch_page_guarded(child).expect(POOL_EXHAUSTED);
        let mut guard: NodeWriteGuard<K, V> =
            NodeWriteGuard::acquire(pin).expect("child page is not a node");
        guard.set_parent_page_id(new_parent);
    }

    /// Removes a key. Removing a missing key is a no-op.
    pub fn remove(&self, key: &K) {
        loop {
            if self.is_empty() {
                return;
            }
            match self.remove_optimistic(key) {
                Some(OptimisticOutcome::Done(())) => return,
                Some(OptimisticOutcome::NeedRestart) => {}
                None => continue,
            }
            if self.remove_pessimistic(key).is_some() {
                return;
            }
        }
    }

    /// Optimistic write descent for deletes: applies the removal when the
    /// leaf stays at or above `min_size`, or when the leaf is the root.
    fn remove_optimistic(&self, key: &K) -> Option<OptimisticOutcome<()>> {
        let mut guard = self.latch_root_write()?;
        loop {
            match guard {
                NodeWriteGuard::Leaf(mut leaf) => {
                    if leaf.node().lookup(key, &self.comparator).is_none() {
                        return Some(OptimisticOutcome::Done(()));
                    }
                    let is_root = leaf.node().is_root();
                    if !is_root && leaf.node().size() <= leaf.node().min_size() {
                        return Some(OptimisticOutcome::NeedRestart);
                    }
                    leaf.node_mut().remove(key, &self.comparator);
                    if is_root && leaf.node().size() == 0 {
                        self.clear_root(NodeWriteGuard::Leaf(leaf));
                    }
                    return Some(OptimisticOutcome::Done(()));
                }
                NodeWriteGuard::Internal(internal) => {
                    let index = internal.node().child_index(key, &self.comparator);
                    let child = internal.node().child_at(index);
                    let pin = self.bpm.fetch_page_guarded(child).expect(POOL_EXHAUSTED);
                    let next = NodeWriteGuard::acquire(pin).expect("child page is not a node");
                    // The child is latched; the parent may now be released.
                    drop(internal);
                    guard = next;
                }
            }
        }
    }

    /// Empties the tree: the root leaf lost its last entry. The cached id
    /// and the header record are reset before the page is freed.
    fn clear_root(&self, guard: NodeWriteGuard<K, V>) {
        let root_id = guard.page_id();
        self.set_root_page_id(INVALID_PAGE_ID);
        guard.delete(&self.bpm);
        debug!("index {} is now empty (freed root {})", self.index_name, root_id);
    }

    /// Pessimistic delete descent holding the safe suffix; on leaf
    /// underflow, borrows from a sibling (left preferred) or merges.
    fn remove_pessimistic(&self, key: &K) -> Option<()> {
        let mut held: Vec<InternalWriteGuard<K>> = Vec::new();
        let mut guard = self.latch_root_write()?;
        loop {
            match guard {
                NodeWriteGuard::Leaf(mut leaf) => {
                    if leaf.node().lookup(key, &self.comparator).is_none() {
                        release_bottom_up(&mut held);
                        return Some(());
                    }
                    leaf.node_mut().remove(key, &self.comparator);
                    if leaf.node().is_root() {
                        if leaf.node().size() == 0 {
                            self.clear_root(NodeWriteGuard::Leaf(leaf));
                        }
                        release_bottom_up(&mut held);
                        return Some(());
                    }
                    if leaf.node().size() >= leaf.node().min_size() {
                        release_bottom_up(&mut held);
                        return Some(());
                    }
                    self.resolve_underflow(NodeWriteGuard::Leaf(leaf), &mut held);
                    release_bottom_up(&mut held);
                    return Some(());
                }
                NodeWriteGuard::Internal(internal) => {
                    if internal.is_delete_safe() {
                        release_bottom_up(&mut held);
                    }
                    let index = internal.node().child_index(key, &self.comparator);
                    let child = internal.node().child_at(index);
                    let pin = self.bpm.fetch_page_guarded(child).expect(POOL_EXHAUSTED);
                    let next = NodeWriteGuard::acquire(pin).expect("child page is not a node");
                    held.push(internal);
                    guard = next;
                }
            }
        }
    }

    /// Restores the size invariant for an underflowing non-root node.
    /// Tries to borrow an edge entry from a sibling (left preferred), then
    /// merges right-into-left; a parent left underfull recurses, and a
    /// single-child internal root collapses into its child.
    fn resolve_underflow(
        &self,
        node: NodeWriteGuard<K, V>,
        held: &mut Vec<InternalWriteGuard<K>>,
    ) {
        let mut node = node;
        loop {
            let mut parent = held
                .pop()
                .expect("underflowing non-root node must have a held parent");
            let index = parent
                .node()
                .index_of_child(node.page_id())
                .expect("underflowing child missing from held parent");

            // Left sibling first: borrow its last entry if it can donate.
            let left = if index > 0 {
                let left_id = parent.node().child_at(index - 1);
                let pin = self.bpm.fetch_page_guarded(left_id).expect(POOL_EXHAUSTED);
                Some(NodeWriteGuard::acquire(pin).expect("sibling page is not a node"))
            } else {
                None
            };
            if let Some(mut left_sibling) = left {
                if left_sibling.size() > left_sibling.min_size() {
                    self.borrow_from_left(&mut parent, index, &mut left_sibling, &mut node);
                    return;
                }
                // Cannot donate; fall through to try the right, keeping the
                // merge candidate in hand.
                let right = if index + 1 < parent.node().size() {
                    let right_id = parent.node().child_at(index + 1);
                    let pin = self.bpm.fetch_page_guarded(right_id).expect(POOL_EXHAUSTED);
                    Some(NodeWriteGuard::acquire(pin).expect("sibling page is not a node"))
                } else {
                    None
                };
                if let Some(mut right_sibling) = right {
                    if right_sibling.size() > right_sibling.min_size() {
                        self.borrow_from_right(&mut parent, index, &mut node, &mut right_sibling);
                        return;
                    }
                }
                // Merge this node into its left sibling.
                let survivor = self.merge_into_left(&mut parent, index - 1, left_sibling, node);
                node = match self.finish_merge(parent, survivor, held) {
                    Some(next) => next,
                    None => return,
                };
            } else {
                // Leftmost child: the right sibling is the only option.
                let right_id = parent.node().child_at(index + 1);
                let pin = self.bpm.fetch_page_guarded(right_id).expect(POOL_EXHAUSTED);
                let mut right_sibling =
                    NodeWriteGuard::acquire(pin).expect("sibling page is not a node");
                if right_sibling.size() > right_sibling.min_size() {
                    self.borrow_from_right(&mut parent, index, &mut node, &mut right_sibling);
                    return;
                }
                let survivor = self.merge_into_left(&mut parent, index, node, right_sibling);
                node = match self.finish_merge(parent, survivor, held) {
                    Some(next) => next,
                    None => return,
                };
            }
        }
    }

    /// After a merge, decides whether the parent collapses (one-child
    /// root), underflows (continue upward), or is fine. Returns the next
    /// underflowing node, if any.
    fn finish_merge(
        &self,
        parent: InternalWriteGuard<K>,
        survivor: NodeWriteGuard<K, V>,
        _held: &mut Vec<InternalWriteGuard<K>>,
    ) -> Option<NodeWriteGuard<K, V>> {
        let mut survivor = survivor;
        if parent.node().is_root() {
            if parent.node().size() == 1 {
                // Collapse: the surviving child becomes the root.
                let new_root = survivor.page_id();
                survivor.set_parent_page_id(INVALID_PAGE_ID);
                drop(survivor);
                self.set_root_page_id(new_root);
                parent.delete(&self.bpm);
                debug!("index {} root collapsed to page {}", self.index_name, new_root);
                return None;
            }
            return None;
        }
        drop(survivor);
        if parent.node().size() >= parent.node().min_size() {
            return None;
        }
        Some(NodeWriteGuard::Internal(parent))
    }

    /// Moves the left sibling's last entry to the front of `node`,
    /// updating the separator between them.
    fn borrow_from_left(
        &self,
        parent: &mut InternalWriteGuard<K>,
        index: usize,
        left: &mut NodeWriteGuard<K, V>,
        node: &mut NodeWriteGuard<K, V>,
    ) {
        match (left, node) {
            (NodeWriteGuard::Leaf(left), NodeWriteGuard::Leaf(node)) => {
                let (key, value) = left.node_mut().pop_back();
                parent.node_mut().set_key_at(index, key.clone());
                node.node_mut().push_front(key, value);
            }
            (NodeWriteGuard::Internal(left), NodeWriteGuard::Internal(node)) => {
                let (moved_key, moved_child) = left.node_mut().pop_back();
                let old_separator = parent.node().key_at(index).clone();
                parent.node_mut().set_key_at(index, moved_key.clone());
                node.node_mut()
                    .push_front(moved_child, old_separator, moved_key);
                self.reassign_parent(moved_child, node.page_id());
            }
            _ => unreachable!("siblings of different kinds"),
        }
        trace!("borrowed from left sibling at parent slot {}", index);
    }

    /// Moves the right sibling's first entry to the back of `node`,
    /// updating the separator between them.
    fn borrow_from_right(
        &self,
        parent: &mut InternalWriteGuard<K>,
        index: usize,
        node: &mut NodeWriteGuard<K, V>,
        right: &mut NodeWriteGuard<K, V>,
    ) {
        match (node, right) {
            (NodeWriteGuard::Leaf(node), NodeWriteGuard::Leaf(right)) => {
                let (key, value) = right.node_mut().pop_front();
                node.node_mut().push_back(key, value);
                let new_separator = right.node().key_at(0).clone();
                parent.node_mut().set_key_at(index + 1, new_separator);
            }
            (NodeWriteGuard::Internal(node), NodeWriteGuard::Internal(right)) => {
                let old_separator = parent.node().key_at(index + 1).clone();
                let (moved_child, next_separator) = right.node_mut().pop_front();
                parent.node_mut().set_key_at(index + 1, next_separator);
                node.node_mut().push_back(old_separator, moved_child);
                self.reassign_parent(moved_child, node.page_id());
            }
            _ => unreachable!("siblings of different kinds"),
        }
        trace!("borrowed from right sibling at parent slot {}", index + 1);
    }

    /// Merges the right node into the left one, removes the separator from
    /// the parent, frees the right page, and returns the surviving guard.
    fn merge_into_left(
        &self,
        parent: &mut InternalWriteGuard<K>,
        left_index: usize,
        left: NodeWriteGuard<K, V>,
        right: NodeWriteGuard<K, V>,
    ) -> NodeWriteGuard<K, V> {
        let mut left = left;
        match (&mut left, right) {
            (NodeWriteGuard::Leaf(left), NodeWriteGuard::Leaf(mut right)) => {
                left.node_mut().merge_from(right.node_mut());
                right.delete(&self.bpm);
            }
            (NodeWriteGuard::Internal(left), NodeWriteGuard::Internal(mut right)) => {
                let separator = parent.node().key_at(left_index + 1).clone();
                let moved: Vec<PageId> = right.node().children().to_vec();
                left.node_mut().merge_from(separator, right.node_mut());
                right.delete(&self.bpm);
                for child in moved {
                    self.reassign_parent(child, left.page_id());
                }
            }
            _ => unreachable!("siblings of different kinds"),
        }
        parent.node_mut().remove_at(left_index + 1);
        trace!("merged child into parent slot {}", left_index);
        left
    }

    /// Read-crabs down to the leaf selected by `pick_child`, returning the
    /// pinned leaf with its latch already released. `None` on an empty tree
    /// or a pool miss (read paths degrade to the end iterator).
    fn descend_to_leaf(
        &self,
        pick_child: impl Fn(&BPlusTreeInternalPage<K>) -> usize,
    ) -> Option<(crate::buffer::buffer_pool_manager::PageGuard, BPlusTreeLeafPage<K, V>)> {
        let mut guard = self.latch_root_read()?;
        loop {
            let child = match guard.node() {
                NodePage::Leaf(_) => None,
                NodePage::Internal(internal) => Some(internal.child_at(pick_child(internal))),
            };
            match child {
                None => return Some(guard.into_leaf_parts()),
                Some(child) => {
                    let pin = self.bpm.fetch_page_guarded(child)?;
                    let next = NodeReadGuard::acquire(pin).ok()?;
                    guard = next;
                }
            }
        }
    }

    /// Iterator positioned at the first entry of the index.
    pub fn begin(&self) -> IndexIterator<K, V, C> {
        match self.descend_to_leaf(|_| 0) {
            Some((pin, leaf)) => IndexIterator::new(self.bpm.clone(), pin, leaf, 0),
            None => IndexIterator::end(self.bpm.clone()),
        }
    }

    /// Iterator positioned at the first entry with key >= `key`.
    pub fn begin_from(&self, key: &K) -> IndexIterator<K, V, C> {
        match self.descend_to_leaf(|internal| internal.child_index(key, &self.comparator)) {
            Some((pin, leaf)) => {
                let index = leaf.key_index(key, &self.comparator);
                IndexIterator::new(self.bpm.clone(), pin, leaf, index)
            }
            None => IndexIterator::end(self.bpm.clone()),
        }
    }

    /// The canonical end iterator.
    pub fn end(&self) -> IndexIterator<K, V, C> {
        IndexIterator::end(self.bpm.clone())
    }

    /// Walks the whole tree checking its structural invariants: every leaf
    /// at equal depth, sizes within bounds, parent pointers consistent,
    /// each separator a lower fence of its child's subtree (equal to the
    /// subtree minimum right after the structural change that produced it;
    /// a later removal of that minimum leaves the separator as a fence),
    /// and the leaf chain visiting every leaf in order.
    ///
    /// Diagnostic only: meant to run on a quiescent tree (no latching
    /// discipline), and panics on the first violated invariant.
    pub fn verify_integrity(&self) {
        let root_id = self.root_page_id();
        if root_id == INVALID_PAGE_ID {
            return;
        }
        let summary = self.verify_node(root_id, INVALID_PAGE_ID, true);

        // The next-pointer chain must visit exactly the leaves found by
        // the top-down walk, in the same order.
        let mut cursor = summary.leaves[0];
        for (position, &expected) in summary.leaves.iter().enumerate() {
            assert_eq!(cursor, expected, "leaf chain diverges at position {}", position);
            let pin = self
                .bpm
                .fetch_page_guarded(cursor)
                .expect(POOL_EXHAUSTED);
            let data = pin.read();
            let leaf = BPlusTreeLeafPage::<K, V>::load(&data).expect("leaf chain page decodes");
            cursor = leaf.next_page_id();
        }
        assert_eq!(cursor, INVALID_PAGE_ID, "last leaf must end the chain");
    }

    fn verify_node(&self, page_id: PageId, expected_parent: PageId, is_root: bool) -> NodeSummary<K> {
        let node = {
            let pin = self.bpm.fetch_page_guarded(page_id).expect(POOL_EXHAUSTED);
            let guard = NodeReadGuard::<K, V>::acquire(pin).expect("tree page decodes as a node");
            match guard.node() {
                NodePage::Leaf(leaf) => NodePage::Leaf(leaf.clone()),
                NodePage::Internal(internal) => NodePage::Internal(internal.clone()),
            }
            // The guard (latch and pin) drops here; the walk holds at most
            // one page at a time.
        };

        match node {
            NodePage::Leaf(leaf) => {
                assert_eq!(leaf.parent_page_id(), expected_parent, "leaf {} parent", page_id);
                assert!(leaf.size() >= 1, "leaf {} is empty", page_id);
                if !is_root {
                    assert!(leaf.size() >= leaf.min_size(), "leaf {} underflows", page_id);
                }
                assert!(leaf.size() <= leaf.max_size(), "leaf {} overflows", page_id);
                for i in 1..leaf.size() {
                    assert_eq!(
                        self.comparator.compare(leaf.key_at(i - 1), leaf.key_at(i)),
                        std::cmp::Ordering::Less,
                        "leaf {} keys out of order",
                        page_id
                    );
                }
                NodeSummary {
                    depth: 1,
                    min_key: leaf.key_at(0).clone(),
                    leaves: vec![page_id],
                }
            }
            NodePage::Internal(internal) => {
                assert_eq!(
                    internal.parent_page_id(),
                    expected_parent,
                    "node {} parent",
                    page_id
                );
                if is_root {
                    assert!(internal.size() >= 2, "root {} has a single child", page_id);
                } else {
                    assert!(
                        internal.size() >= internal.min_size(),
                        "node {} underflows",
                        page_id
                    );
                }
                assert!(internal.size() <= internal.max_size(), "node {} overflows", page_id);

                for i in 2..internal.size() {
                    assert_eq!(
                        self.comparator
                            .compare(internal.key_at(i - 1), internal.key_at(i)),
                        std::cmp::Ordering::Less,
                        "node {} separators out of order",
                        page_id
                    );
                }

                let mut depth = 0;
                let mut min_key = None;
                let mut leaves = Vec::new();
                for i in 0..internal.size() {
                    let child = self.verify_node(internal.child_at(i), page_id, false);
                    if i == 0 {
                        depth = child.depth;
                        min_key = Some(child.min_key.clone());
                    } else {
                        assert_eq!(child.depth, depth, "leaves at unequal depth under {}", page_id);
                        assert_ne!(
                            self.comparator.compare(internal.key_at(i), &child.min_key),
                            std::cmp::Ordering::Greater,
                            "separator {} of node {} exceeds its subtree minimum",
                            i,
                            page_id
                        );
                    }
                    leaves.extend(child.leaves);
                }
                NodeSummary {
                    depth: depth + 1,
                    min_key: min_key.expect("internal node has children"),
                    leaves,
                }
            }
        }
    }

    /// Level-order dump of the tree for debugging.
    pub fn debug_dump(&self) -> String
    where
        K: std::fmt::Debug,
    {
        use std::collections::VecDeque;
        use std::fmt::Write as _;

        let mut out = String::new();
        let root_id = self.root_page_id();
        if root_id == INVALID_PAGE_ID {
            return "<empty>".to_string();
        }
        let mut queue: VecDeque<PageId> = VecDeque::from([root_id]);
        while let Some(page_id) = queue.pop_front() {
            let Some(pin) = self.bpm.fetch_page_guarded(page_id) else {
                continue;
            };
            let Ok(guard) = NodeReadGuard::<K, V>::acquire(pin) else {
                continue;
            };
            match guard.node() {
                NodePage::Leaf(leaf) => {
                    let keys: Vec<&K> = (0..leaf.size()).map(|i| leaf.key_at(i)).collect();
                    let _ = writeln!(
                        out,
                        "leaf {} parent={} next={} keys={:?}",
                        page_id,
                        leaf.parent_page_id(),
                        leaf.next_page_id(),
                        keys
                    );
                }
                NodePage::Internal(internal) => {
                    let keys: Vec<&K> = (1..internal.size()).map(|i| internal.key_at(i)).collect();
                    let _ = writeln!(
                        out,
                        "internal {} parent={} children={:?} keys={:?}",
                        page_id,
                        internal.parent_page_id(),
                        internal.children(),
                        keys
                    );
                    queue.extend(internal.children().iter().copied());
                }
            }
        }
        out
    }
}
