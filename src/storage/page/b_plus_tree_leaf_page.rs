use std::cmp::Ordering;

use bincode::{Decode, Encode};

use crate::common::config::{PageId, INVALID_PAGE_ID};
use crate::common::exception::BPlusTreeError;
use crate::storage::index::KeyComparator;
use crate::storage::page::b_plus_tree_page::{
    page_type_of, IndexPageType, NODE_BODY_OFFSET, PAGE_TYPE_OFFSET,
};
use crate::storage::page::page::PageData;

/// Leaf page of a B+ tree: pairs `(key, value)` in ascending key order plus
/// a `next_page_id` link chaining all leaves left to right.
///
/// A leaf holds at most `max_size` entries in steady state; during an
/// insert it may transiently hold `max_size + 1` until the tree splits it.
#[derive(Debug, Clone, Encode, Decode)]
pub struct BPlusTreeLeafPage<K, V> {
    page_id: PageId,
    parent_page_id: PageId,
    next_page_id: PageId,
    max_size: u32,
    keys: Vec<K>,
    values: Vec<V>,
}

impl<K, V> BPlusTreeLeafPage<K, V>
where
    K: Clone + Encode + Decode<()>,
    V: Clone + Encode + Decode<()>,
{
    pub fn new(page_id: PageId, max_size: usize) -> Self {
        Self {
            page_id,
            parent_page_id: INVALID_PAGE_ID,
            next_page_id: INVALID_PAGE_ID,
            max_size: max_size as u32,
            keys: Vec::with_capacity(max_size + 1),
            values: Vec::with_capacity(max_size + 1),
        }
    }

    /// Decodes a leaf node from a page image.
    pub fn load(data: &PageData) -> Result<Self, BPlusTreeError> {
        if page_type_of(data) != IndexPageType::LeafPage {
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
    /// Panics if the encoded node exceeds the page body; `max_size` must be
    /// chosen so a full node fits.
    pub fn store(&self, data: &mut PageData) {
        let config = bincode::config::standard();
        data.reset_memory();
        data[PAGE_TYPE_OFFSET] = IndexPageType::LeafPage.to_u8();
        bincode::encode_into_slice(self, &mut data[NODE_BODY_OFFSET..], config)
            .expect("leaf node exceeds page size");
    }

    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    pub fn set_page_id(&mut self, page_id: PageId) {
        self.page_id = page_id;
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

    /// Next leaf page id; `INVALID_PAGE_ID` for the rightmost leaf.
    pub fn next_page_id(&self) -> PageId {
        self.next_page_id
    }

    pub fn set_next_page_id(&mut self, next_page_id: PageId) {
        self.next_page_id = next_page_id;
    }

    pub fn size(&self) -> usize {
        self.keys.len()
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

    pub fn value_at(&self, index: usize) -> &V {
        &self.values[index]
    }

    pub fn entry_at(&self, index: usize) -> (K, V) {
        (self.keys[index].clone(), self.values[index].clone())
    }

    /// Index of the first key greater than or equal to `key`.
    pub fn key_index<C: KeyComparator<K>>(&self, key: &K, comparator: &C) -> usize {
        self.keys
            .partition_point(|k| comparator.compare(k, key) == Ordering::Less)
    }

    /// Point lookup within this leaf.
    pub fn lookup<C: KeyComparator<K>>(&self, key: &K, comparator: &C) -> Option<V> {
        let index = self.key_index(key, comparator);
        if index < self.keys.len() && comparator.compare(&self.keys[index], key) == Ordering::Equal
        {
            return Some(self.values[index].clone());
        }
        None
    }

    /// Inserts a key-value pair in sort position. Returns false on a
    /// duplicate key, leaving the leaf unchanged.
    pub fn insert<C: KeyComparator<K>>(&mut self, key: K, value: V, comparator: &C) -> bool {
        let index = self.key_index(&key, comparator);
        if index < self.keys.len() && comparator.compare(&self.keys[index], &key) == Ordering::Equal
        {
            return false;
        }
        self.keys.insert(index, key);
        self.values.insert(index, value);
        true
    }

    /// Removes the entry for `key`. Returns false if the key is absent.
    pub fn remove<C: KeyComparator<K>>(&mut self, key: &K, comparator: &C) -> bool {
        let index = self.key_index(key, comparator);
        if index < self.keys.len() && comparator.compare(&self.keys[index], key) == Ordering::Equal
        {
            self.keys.remove(index);
            self.values.remove(index);
            return true;
        }
        false
    }

    /// Splits off the upper `size - min_size` entries for a new right
    /// sibling, leaving `min_size` entries here.
    pub fn split_off_upper(&mut self) -> (Vec<K>, Vec<V>) {
        let split_at = self.min_size();
        let keys = self.keys.split_off(split_at);
        let values = self.values.split_off(split_at);
        (keys, values)
    }

    /// Adopts the split-off upper half produced by a sibling.
    pub fn absorb_upper(&mut self, keys: Vec<K>, values: Vec<V>) {
        debug_assert!(self.keys.is_empty());
        self.keys = keys;
        self.values = values;
    }

    /// Appends every entry of `right` and takes over its next pointer.
    pub fn merge_from(&mut self, right: &mut Self) {
        self.keys.append(&mut right.keys);
        self.values.append(&mut right.values);
        self.next_page_id = right.next_page_id;
    }

    pub fn pop_back(&mut self) -> (K, V) {
        let key = self.keys.pop().expect("pop_back on empty leaf");
        let value = self.values.pop().expect("pop_back on empty leaf");
        (key, value)
    }

    pub fn pop_front(&mut self) -> (K, V) {
        (self.keys.remove(0), self.values.remove(0))
    }

    pub fn push_back(&mut self, key: K, value: V) {
        self.keys.push(key);
        self.values.push(value);
    }

    pub fn push_front(&mut self, key: K, value: V) {
        self.keys.insert(0, key);
        self.values.insert(0, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::index::int_comparator::IntComparator;
    use crate::storage::page::page::PageData;

    fn leaf_with(keys: &[i32]) -> BPlusTreeLeafPage<i32, u64> {
        let cmp = IntComparator::new();
        let mut leaf = BPlusTreeLeafPage::new(5, 4);
        for &k in keys {
            assert!(leaf.insert(k, k as u64 * 100, &cmp));
        }
        leaf
    }

    #[test]
    fn insert_keeps_keys_sorted() {
        let leaf = leaf_with(&[30, 10, 20]);
        assert_eq!(leaf.key_at(0), &10);
        assert_eq!(leaf.key_at(1), &20);
        assert_eq!(leaf.key_at(2), &30);
    }

    #[test]
    fn duplicate_insert_is_rejected() {
        let cmp = IntComparator::new();
        let mut leaf = leaf_with(&[10, 20]);
        assert!(!leaf.insert(10, 999, &cmp));
        assert_eq!(leaf.size(), 2);
        assert_eq!(leaf.lookup(&10, &cmp), Some(1000));
    }

    #[test]
    fn remove_missing_is_noop() {
        let cmp = IntComparator::new();
        let mut leaf = leaf_with(&[10]);
        assert!(!leaf.remove(&99, &cmp));
        assert_eq!(leaf.size(), 1);
    }

    #[test]
    fn split_moves_upper_entries() {
        let mut leaf = leaf_with(&[1, 2, 3, 4]);
        let (keys, values) = leaf.split_off_upper();
        // max_size 4 => min_size 2 stays, upper half moves.
        assert_eq!(leaf.size(), 2);
        assert_eq!(keys, vec![3, 4]);
        assert_eq!(values, vec![300, 400]);
    }

    #[test]
    fn codec_round_trip() {
        let cmp = IntComparator::new();
        let mut leaf = leaf_with(&[7, 3]);
        leaf.set_next_page_id(42);
        leaf.set_parent_page_id(9);

        let mut data = PageData::new();
        leaf.store(&mut data);
        assert_eq!(page_type_of(&data), IndexPageType::LeafPage);

        let reloaded = BPlusTreeLeafPage::<i32, u64>::load(&data).unwrap();
        assert_eq!(reloaded.page_id(), 5);
        assert_eq!(reloaded.parent_page_id(), 9);
        assert_eq!(reloaded.next_page_id(), 42);
        assert_eq!(reloaded.lookup(&7, &cmp), Some(700));
        assert_eq!(reloaded.lookup(&3, &cmp), Some(300));
    }
}
