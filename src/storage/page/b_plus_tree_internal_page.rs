use std::cmp::Ordering;

use bincode::{Decode, Encode};

use crate::common::config::{PageId, INVALID_PAGE_ID};
use crate::common::exception::BPlusTreeError;
use crate::storage::index::KeyComparator;
use crate::storage::page::b_plus_tree_page::{
    page_type_of, IndexPageType, NODE_BODY_OFFSET, PAGE_TYPE_OFFSET,
};
use crate::storage::page::page::PageData;

/// Internal page of a B+ tree: `size` children and `size` keys laid out as
/// `(key_0, child_0), (key_1, child_1), ...` where `key_0` is stored but
/// semantically ignored and `key_i` (i >= 1) is the smallest key reachable
/// from `child_i`.
///
/// `size` counts children. A node holds at most `max_size` children in
/// steady state and `max_size + 1` transiently during a split.
#[derive(Debug, Clone, Encode, Decode)]
pub struct BPlusTreeInternalPage<K> {
    page_id: PageId,
    parent_page_id: PageId,
    max_size: u32,
    keys: Vec<K>,
    children: Vec<PageId>,
}

impl<K> BPlusTreeInternalPage<K>
where
    K: Clone + Encode + Decode<()>,
{
    pub fn new(page_id: PageId, max_size: usize) -> Self {
        Self {
            page_id,
            parent_page_id: INVALID_PAGE_ID,
            max_size: max_size as u32,
            keys: Vec::with_capacity(max_size + 1),
            children: Vec::with_capacity(max_size + 1),
        }
    }

    /// Decodes an internal node from a page image.
    pub fn load(data: &PageData) -> Result<Self, BPlusTreeError> {
        if page_type_of(data) != IndexPageType::InternalPage {
            return Err(BPlusTreeError::InvalidPageType);
        }
        let config = bincode::config::standard();
        bincode::decode_from_slice(&data[NODE_BODY_OFFSET..], config)
            .map(|(node, _)| node)
            .map_err(|e| BPlusTreeError::DeserializationError(e.to_string()))
    }

    /// Encodes this node into a page image.
    ///
    /// # Panics
    ///
    /// Panics if the encoded node exceeds the page body.
    pub fn store(&self, data: &mut PageData) {
        let config = bincode::config::standard();
        data.reset_memory();
        data[PAGE_TYPE_OFFSET] = IndexPageType::InternalPage.to_u8();
        bincode::encode_into_slice(self, &mut data[NODE_BODY_OFFSET..], config)
            .expect("internal node exceeds page size");
    }

    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    pub fn parent_page_id(&self) -> PageId {
        self.parent_page_id
    }

    pub fn set_parent_page_id(&mut self, parent_page_id: PageId) {
        self.parent_page_id = parent_page_id;
    }

    pub fn is_root(&self) -> bool {
        self.parent_page_id == INVALID_PAGE_ID
    }

    /// Number of children.
    pub fn size(&self) -> usize {
        self.children.len()
    }

    pub fn max_size(&self) -> usize {
        self.max_size as usize
    }

    pub fn min_size(&self) -> usize {
        (self.max_size as usize + 1) / 2
    }

    pub fn key_at(&self, index: usize) -> &K {
        &self.keys[index]
    }

    pub fn set_key_at(&mut self, index: usize, key: K) {
        debug_assert!(index >= 1, "key 0 is ignored");
        self.keys[index] = key;
    }

    pub fn child_at(&self, index: usize) -> PageId {
        self.children[index]
    }

    pub fn children(&self) -> &[PageId] {
        &self.children
    }

    /// Index of the child whose subtree covers `key`: the last child whose
    /// separator is less than or equal to `key` (key 0 is ignored).
    pub fn child_index<C: KeyComparator<K>>(&self, key: &K, comparator: &C) -> usize {
        self.keys[1..].partition_point(|k| comparator.compare(k, key) != Ordering::Greater)
    }

    /// Position of `child` among this node's children.
    pub fn index_of_child(&self, child: PageId) -> Option<usize> {
        self.children.iter().position(|&c| c == child)
    }

    /// Initializes an empty node as a root with two children separated by
    /// `key`. The ignored slot 0 stores a copy of the separator.
    pub fn populate_new_root(&mut self, left: PageId, key: K, right: PageId) {
        debug_assert!(self.children.is_empty());
        self.keys.push(key.clone());
        self.keys.push(key);
        self.children.push(left);
        self.children.push(right);
    }

    /// Inserts `(key, child)` immediately after child position `index`.
    pub fn insert_after(&mut self, index: usize, key: K, child: PageId) {
        self.keys.insert(index + 1, key);
        self.children.insert(index + 1, child);
    }

    /// Removes the separator and child at `index`.
    pub fn remove_at(&mut self, index: usize) {
        self.keys.remove(index);
        self.children.remove(index);
    }

    /// Splits off the upper `size - min_size` children for a new right
    /// sibling. Returns the risen separator (the moved slice's first key,
    /// which becomes the right node's ignored slot 0) together with the
    /// moved keys and children.
    pub fn split_off_upper(&mut self) -> (K, Vec<K>, Vec<PageId>) {
        let split_at = self.min_size();
        let keys = self.keys.split_off(split_at);
        let children = self.children.split_off(split_at);
        let risen = keys[0].clone();
        (risen, keys, children)
    }

    /// Adopts the split-off upper half produced by a sibling.
    pub fn absorb_upper(&mut self, keys: Vec<K>, children: Vec<PageId>) {
        debug_assert!(self.children.is_empty());
        self.keys = keys;
        self.children = children;
    }

    /// Appends every entry of `right`; `separator` is the parent key that
    /// divided the two nodes and becomes the key of `right`'s first child.
    pub fn merge_from(&mut self, separator: K, right: &mut Self) {
        self.keys.push(separator);
        self.keys.extend(right.keys.drain(1..));
        right.keys.clear();
        self.children.append(&mut right.children);
    }

    /// Removes the last `(key, child)` pair for a borrow by the right
    /// sibling.
    pub fn pop_back(&mut self) -> (K, PageId) {
        let key = self.keys.pop().expect("pop_back on empty internal node");
        let child = self
            .children
            .pop()
            .expect("pop_back on empty internal node");
        (key, child)
    }

    /// Removes the first child for a borrow by the left sibling. Returns
    /// the child and the separator key of the new first child (previously
    /// at index 1, now the ignored slot 0).
    pub fn pop_front(&mut self) -> (PageId, K) {
        let child = self.children.remove(0);
        let next_separator = self.keys[1].clone();
        self.keys.remove(0);
        (child, next_separator)
    }

    /// Prepends a child borrowed from the left sibling. `old_first_key`
    /// becomes the separator of the previously-first child; the new slot 0
    /// key is a placeholder (ignored).
    pub fn push_front(&mut self, child: PageId, old_first_key: K, placeholder: K) {
        self.keys[0] = old_first_key;
        self.keys.insert(0, placeholder);
        self.children.insert(0, child);
    }

    /// Appends a child borrowed from the right sibling with its separator.
    pub fn push_back(&mut self, key: K, child: PageId) {
        self.keys.push(key);
        self.children.push(child);
    }
}
