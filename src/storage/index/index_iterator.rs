use std::fmt::Debug;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::buffer::buffer_pool_manager::{BufferPoolManager, PageGuard};
use crate::common::config::INVALID_PAGE_ID;
use crate::storage::index::{KeyComparator, KeyType, ValueType};
use crate::storage::page::b_plus_tree_leaf_page::BPlusTreeLeafPage;

/// Forward, single-pass iterator over the B+ tree leaf chain.
///
/// Holds a pin on the current leaf (preventing eviction) together with a
/// decoded snapshot of its entries; the page latch itself is not held
/// between advances. Reaching the end of a leaf releases it and pins the
/// next one through `next_page_id`. The canonical end iterator holds no
/// page.
pub struct IndexIterator<K, V, C>
where
    K: KeyType,
    V: ValueType,
    C: KeyComparator<K>,
{
    bpm: Arc<BufferPoolManager>,
    pin: Option<PageGuard>,
    leaf: Option<BPlusTreeLeafPage<K, V>>,
    index: usize,
    _marker: PhantomData<C>,
}

impl<K, V, C> IndexIterator<K, V, C>
where
    K: KeyType,
    V: ValueType,
    C: KeyComparator<K>,
{
    /// Creates an iterator positioned at `index` within the pinned leaf,
    /// skipping ahead to the next leaf when the position is one past the
    /// end (as `begin_from` can produce).
    pub fn new(
        bpm: Arc<BufferPoolManager>,
        pin: PageGuard,
        leaf: BPlusTreeLeafPage<K, V>,
        index: usize,
    ) -> Self {
        let mut iter = Self {
            bpm,
            pin: Some(pin),
            leaf: Some(leaf),
            index,
            _marker: PhantomData,
        };
        iter.skip_exhausted_leaf();
        iter
    }

    /// The canonical end iterator.
    pub fn end(bpm: Arc<BufferPoolManager>) -> Self {
        Self {
            bpm,
            pin: None,
            leaf: None,
            index: 0,
            _marker: PhantomData,
        }
    }

    pub fn is_end(&self) -> bool {
        self.pin.is_none()
    }

    /// Returns the entry under the cursor.
    ///
    /// # Panics
    ///
    /// Panics when called on the end iterator.
    pub fn value(&self) -> (K, V) {
        let leaf = self.leaf.as_ref().expect("dereferenced end iterator");
        leaf.entry_at(self.index)
    }

    /// Moves past the current leaf while the cursor sits at or beyond its
    /// size, following the chain; becomes the end iterator at the last
    /// leaf.
    fn skip_exhausted_leaf(&mut self) {
        loop {
            let Some(leaf) = self.leaf.as_ref() else {
                return;
            };
            if self.index < leaf.size() {
                return;
            }
            let next_page_id = leaf.next_page_id();
            self.pin = None;
            self.leaf = None;
            self.index = 0;
            if next_page_id == INVALID_PAGE_ID {
                return;
            }
            // Pool exhaustion on a read path degrades to the end iterator.
            let Some(pin) = self.bpm.fetch_page_guarded(next_page_id) else {
                return;
            };
            let next_leaf = {
                let data = pin.read();
                match BPlusTreeLeafPage::load(&data) {
                    Ok(leaf) => leaf,
                    Err(_) => return,
                }
            };
            self.pin = Some(pin);
            self.leaf = Some(next_leaf);
        }
    }

    /// Advances the cursor by one entry.
    pub fn advance(&mut self) {
        if self.is_end() {
            return;
        }
        self.index += 1;
        self.skip_exhausted_leaf();
    }
}

impl<K, V, C> Iterator for IndexIterator<K, V, C>
where
    K: KeyType,
    V: ValueType,
    C: KeyComparator<K>,
{
    type Item = (K, V);

    fn next(&mut self) -> Option<(K, V)> {
        if self.is_end() {
            return None;
        }
        let entry = self.value();
        self.advance();
        Some(entry)
    }
}

/// Copying an iterator pins the same leaf page independently.
impl<K, V, C> Clone for IndexIterator<K, V, C>
where
    K: KeyType,
    V: ValueType,
    C: KeyComparator<K>,
{
    fn clone(&self) -> Self {
        let pin = self.pin.as_ref().map(|pin| {
            self.bpm
                .fetch_page_guarded(pin.page_id())
                .expect("iterator leaf is pinned, re-pin cannot miss")
        });
        Self {
            bpm: self.bpm.clone(),
            pin,
            leaf: self.leaf.clone(),
            index: self.index,
            _marker: PhantomData,
        }
    }
}

impl<K, V, C> PartialEq for IndexIterator<K, V, C>
where
    K: KeyType,
    V: ValueType,
    C: KeyComparator<K>,
{
    fn eq(&self, other: &Self) -> bool {
        let self_page = self.pin.as_ref().map(|p| p.page_id());
        let other_page = other.pin.as_ref().map(|p| p.page_id());
        self_page == other_page && self.index == other.index
    }
}

impl<K, V, C> Eq for IndexIterator<K, V, C>
where
    K: KeyType,
    V: ValueType,
    C: KeyComparator<K>,
{
}

impl<K, V, C> Debug for IndexIterator<K, V, C>
where
    K: KeyType,
    V: ValueType,
    C: KeyComparator<K>,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.pin {
            Some(pin) => write!(
                f,
                "IndexIterator {{ page_id: {}, index: {} }}",
                pin.page_id(),
                self.index
            ),
            None => write!(f, "IndexIterator {{ end }}"),
        }
    }
}
