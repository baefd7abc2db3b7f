//! Latch crabbing (lock coupling) support for the B+ tree.
//!
//! Traversals couple latches top-down: a child's latch is acquired before
//! the parent's is released. Write descents come in two flavors:
//!
//! - **Optimistic**: W-latch each node on the way down, releasing the
//!   parent immediately; restart pessimistically if the leaf turns out to
//!   need a structural change.
//! - **Pessimistic**: W-latch the whole path, releasing all ancestors the
//!   moment the current node is *safe* (insert: won't split; delete: won't
//!   underflow; root special-cased). The still-held ancestors form the
//!   safe suffix that structural changes may touch.
//!
//! Each guard here owns the page latch (an `ArcRwLockWriteGuard` holding a
//! cloned `Arc`), the buffer-pool pin, and the decoded node. Mutations go
//! through `node_mut`, which records a dirty intent; on drop the node is
//! re-encoded into the page image, the latch is released, and only then is
//! the page unpinned.

use std::sync::Arc;

use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::RawRwLock;

use crate::buffer::buffer_pool_manager::{BufferPoolManager, PageGuard};
use crate::common::config::PageId;
use crate::common::exception::BPlusTreeError;
use crate::storage::index::{KeyType, ValueType};
use crate::storage::page::b_plus_tree_internal_page::BPlusTreeInternalPage;
use crate::storage::page::b_plus_tree_leaf_page::BPlusTreeLeafPage;
use crate::storage::page::b_plus_tree_page::{page_type_of, IndexPageType};
use crate::storage::page::page::PageData;

/// A decoded node of either kind, as produced by a read traversal.
pub enum NodePage<K, V> {
    Leaf(BPlusTreeLeafPage<K, V>),
    Internal(BPlusTreeInternalPage<K>),
}

/// Read-latched, pinned node. Dropping releases the latch first (field
/// order), then the pin.
pub struct NodeReadGuard<K: KeyType, V: ValueType> {
    latch: ArcRwLockReadGuard<RawRwLock, PageData>,
    pin: PageGuard,
    node: NodePage<K, V>,
}

impl<K: KeyType, V: ValueType> NodeReadGuard<K, V> {
    /// Read-latches the pinned page and decodes the node stored on it.
    pub fn acquire(pin: PageGuard) -> Result<Self, BPlusTreeError> {
        let latch = pin.read();
        let node = match page_type_of(&latch) {
            IndexPageType::LeafPage => NodePage::Leaf(BPlusTreeLeafPage::load(&latch)?),
            IndexPageType::InternalPage => {
                NodePage::Internal(BPlusTreeInternalPage::load(&latch)?)
            }
            IndexPageType::InvalidIndexPage => return Err(BPlusTreeError::InvalidPageType),
        };
        Ok(Self { latch, pin, node })
    }

    pub fn node(&self) -> &NodePage<K, V> {
        &self.node
    }

    /// Dismantles the guard into the pin and the decoded leaf, releasing
    /// the latch. Used to seed iterators, which keep the leaf pinned but
    /// not latched.
    ///
    /// # Panics
    ///
    /// Panics if the node is not a leaf.
    pub fn into_leaf_parts(self) -> (PageGuard, BPlusTreeLeafPage<K, V>) {
        let Self { latch, pin, node } = self;
        drop(latch);
        match node {
            NodePage::Leaf(leaf) => (pin, leaf),
            NodePage::Internal(_) => unreachable!("into_leaf_parts on an internal node"),
        }
    }
}

/// Write-latched, pinned leaf with its decoded image. Mutations mark the
/// guard dirty; the image is stored back on drop.
pub struct LeafWriteGuard<K: KeyType, V: ValueType> {
    latch: ArcRwLockWriteGuard<RawRwLock, PageData>,
    pin: PageGuard,
    node: BPlusTreeLeafPage<K, V>,
    dirty: bool,
}

impl<K: KeyType, V: ValueType> LeafWriteGuard<K, V> {
    /// Wraps a freshly allocated page with a node image that has not been
    /// written out yet.
    pub fn for_new(pin: PageGuard, node: BPlusTreeLeafPage<K, V>) -> Self {
        let latch = pin.write();
        Self {
            latch,
            pin,
            node,
            dirty: true,
        }
    }

    pub fn page_id(&self) -> PageId {
        self.pin.page_id()
    }

    pub fn node(&self) -> &BPlusTreeLeafPage<K, V> {
        &self.node
    }

    pub fn node_mut(&mut self) -> &mut BPlusTreeLeafPage<K, V> {
        self.dirty = true;
        &mut self.node
    }

    /// Drops the guard without persisting changes and frees the page.
    pub fn delete(mut self, bpm: &Arc<BufferPoolManager>) {
        let page_id = self.page_id();
        self.dirty = false;
        self.pin.discard();
        drop(self);
        bpm.delete_page(page_id);
    }
}

impl<K: KeyType, V: ValueType> Drop for LeafWriteGuard<K, V> {
    fn drop(&mut self) {
        if self.dirty {
            self.node.store(&mut self.latch);
            self.pin.set_dirty();
        }
    }
}

/// Write-latched, pinned internal node with its decoded image.
pub struct InternalWriteGuard<K: KeyType> {
    latch: ArcRwLockWriteGuard<RawRwLock, PageData>,
    pin: PageGuard,
    node: BPlusTreeInternalPage<K>,
    dirty: bool,
}

impl<K: KeyType> InternalWriteGuard<K> {
    pub fn for_new(pin: PageGuard, node: BPlusTreeInternalPage<K>) -> Self {
        let latch = pin.write();
        Self {
            latch,
            pin,
            node,
            dirty: true,
        }
    }

    pub fn page_id(&self) -> PageId {
        self.pin.page_id()
    }

    pub fn node(&self) -> &BPlusTreeInternalPage<K> {
        &self.node
    }

    pub fn node_mut(&mut self) -> &mut BPlusTreeInternalPage<K> {
        self.dirty = true;
        &mut self.node
    }

    /// True when an insert below cannot propagate a split into this node.
    pub fn is_insert_safe(&self) -> bool {
        self.node.size() < self.node.max_size()
    }

    /// True when a delete below cannot propagate a merge into this node.
    /// The root is safe as long as losing one child leaves it with two,
    /// since a two-child root never collapses from a single child merge.
    pub fn is_delete_safe(&self) -> bool {
        if self.node.is_root() {
            self.node.size() > 2
        } else {
            self.node.size() > self.node.min_size()
        }
    }

    pub fn delete(mut self, bpm: &Arc<BufferPoolManager>) {
        let page_id = self.page_id();
        self.dirty = false;
        self.pin.discard();
        drop(self);
        bpm.delete_page(page_id);
    }
}

impl<K: KeyType> Drop for InternalWriteGuard<K> {
    fn drop(&mut self) {
        if self.dirty {
            self.node.store(&mut self.latch);
            self.pin.set_dirty();
        }
    }
}

/// Write guard over a node of either kind, used by descents that do not
/// know the node kind until the page is latched.
pub enum NodeWriteGuard<K: KeyType, V: ValueType> {
    Leaf(LeafWriteGuard<K, V>),
    Internal(InternalWriteGuard<K>),
}

impl<K: KeyType, V: ValueType> NodeWriteGuard<K, V> {
    /// Write-latches the pinned page and decodes whichever node kind is
    /// stored on it. The latch is taken exactly once.
    pub fn acquire(pin: PageGuard) -> Result<Self, BPlusTreeError> {
        let latch = pin.write();
        match page_type_of(&latch) {
            IndexPageType::LeafPage => {
                let node = BPlusTreeLeafPage::load(&latch)?;
                Ok(NodeWriteGuard::Leaf(LeafWriteGuard {
                    latch,
                    pin,
                    node,
                    dirty: false,
                }))
            }
            IndexPageType::InternalPage => {
                let node = BPlusTreeInternalPage::load(&latch)?;
                Ok(NodeWriteGuard::Internal(InternalWriteGuard {
                    latch,
                    pin,
                    node,
                    dirty: false,
                }))
            }
            IndexPageType::InvalidIndexPage => Err(BPlusTreeError::InvalidPageType),
        }
    }

    pub fn page_id(&self) -> PageId {
        match self {
            NodeWriteGuard::Leaf(g) => g.page_id(),
            NodeWriteGuard::Internal(g) => g.page_id(),
        }
    }

    pub fn size(&self) -> usize {
        match self {
            NodeWriteGuard::Leaf(g) => g.node().size(),
            NodeWriteGuard::Internal(g) => g.node().size(),
        }
    }

    pub fn min_size(&self) -> usize {
        match self {
            NodeWriteGuard::Leaf(g) => g.node().min_size(),
            NodeWriteGuard::Internal(g) => g.node().min_size(),
        }
    }

    pub fn set_parent_page_id(&mut self, parent: PageId) {
        match self {
            NodeWriteGuard::Leaf(g) => g.node_mut().set_parent_page_id(parent),
            NodeWriteGuard::Internal(g) => g.node_mut().set_parent_page_id(parent),
        }
    }

    pub fn delete(self, bpm: &Arc<BufferPoolManager>) {
        match self {
            NodeWriteGuard::Leaf(g) => g.delete(bpm),
            NodeWriteGuard::Internal(g) => g.delete(bpm),
        }
    }
}

/// Releases the safe-suffix guards bottom-up (deepest first), mirroring
/// the acquisition order of the descent.
pub fn release_bottom_up<K: KeyType>(held: &mut Vec<InternalWriteGuard<K>>) {
    while let Some(guard) = held.pop() {
        drop(guard);
    }
}
