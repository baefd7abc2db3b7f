extern crate petra;

use std::sync::Arc;

use petra::buffer::buffer_pool_manager::BufferPoolManager;
use petra::common::rid::RID;
use petra::storage::disk::disk_manager::MemoryDiskManager;
use petra::storage::index::b_plus_tree::BPlusTree;
use petra::storage::index::int_comparator::IntComparator;

type IntTree = BPlusTree<i32, RID, IntComparator>;

fn make_tree(pool_size: usize, leaf_max: usize, internal_max: usize) -> (Arc<BufferPoolManager>, IntTree) {
    let disk = Arc::new(MemoryDiskManager::new());
    let bpm = Arc::new(BufferPoolManager::new(pool_size, 2, disk));
    let tree = BPlusTree::new("test_index", bpm.clone(), IntComparator::new(), leaf_max, internal_max);
    (bpm, tree)
}

fn rid_for(key: i32) -> RID {
    RID::new(key as u64, key as u32)
}

fn scan_keys(tree: &IntTree) -> Vec<i32> {
    tree.begin().map(|(k, _)| k).collect()
}

#[test]
fn empty_tree_behavior() {
    let (_bpm, tree) = make_tree(10, 3, 3);
    assert!(tree.is_empty());
    assert_eq!(tree.get_value(&1), None);
    assert!(tree.begin().is_end());
    assert_eq!(tree.begin(), tree.end());
    // Removing from an empty tree is a no-op.
    tree.remove(&1);
    assert!(tree.is_empty());
}

#[test]
fn split_on_insert() {
    // Scenario: leaf_max_size = 3, insert 10, 20, 5, 15. The third insert
    // fills the root leaf; the fourth splits it and grows a root.
    let (_bpm, tree) = make_tree(10, 3, 3);

    assert!(tree.insert(10, rid_for(10)));
    assert!(tree.insert(20, rid_for(20)));
    let root_before = tree.root_page_id();

    assert!(tree.insert(5, rid_for(5)));
    assert_eq!(tree.root_page_id(), root_before, "filling the leaf must not split");

    assert!(tree.insert(15, rid_for(15)));
    assert_ne!(tree.root_page_id(), root_before, "split must grow a new root");
    tree.verify_integrity();

    for key in [5, 10, 15, 20] {
        assert_eq!(tree.get_value(&key), Some(rid_for(key)));
    }
    assert_eq!(scan_keys(&tree), vec![5, 10, 15, 20]);

    // The new right leaf starts at the risen separator.
    let from_15: Vec<i32> = tree.begin_from(&15).map(|(k, _)| k).collect();
    assert_eq!(from_15, vec![15, 20]);
}

#[test]
fn root_change_is_recorded_in_header_page() {
    let (bpm, tree) = make_tree(10, 3, 3);
    for key in [10, 20, 5, 15] {
        assert!(tree.insert(key, rid_for(key)));
    }
    let root = tree.root_page_id();

    // A second handle to the same named index resumes from the header
    // page record.
    let reopened: IntTree =
        BPlusTree::new("test_index", bpm.clone(), IntComparator::new(), 3, 3);
    assert_eq!(reopened.root_page_id(), root);
    assert_eq!(reopened.get_value(&15), Some(rid_for(15)));

    // A different name is a different (empty) index.
    let other: IntTree = BPlusTree::new("other_index", bpm, IntComparator::new(), 3, 3);
    assert!(other.is_empty());
}

#[test]
fn duplicate_insert_is_rejected() {
    let (_bpm, tree) = make_tree(10, 3, 3);
    assert!(tree.insert(7, rid_for(7)));
    assert!(!tree.insert(7, RID::new(999, 999)));
    assert_eq!(tree.get_value(&7), Some(rid_for(7)));
    assert_eq!(scan_keys(&tree), vec![7]);
}

#[test]
fn delete_with_merge() {
    // Scenario: three leaves [1,2] [4,5] [7,8] under root separators 4, 7.
    // Removing 5 cannot borrow (both siblings at min_size), so the middle
    // leaf merges left; the parent keeps two children and does not
    // collapse.
    let (_bpm, tree) = make_tree(10, 3, 3);
    for key in [1, 2, 4, 5, 7, 8] {
        assert!(tree.insert(key, rid_for(key)));
    }
    assert_eq!(scan_keys(&tree), vec![1, 2, 4, 5, 7, 8]);
    let root_before = tree.root_page_id();

    tree.remove(&5);
    tree.verify_integrity();

    assert_eq!(scan_keys(&tree), vec![1, 2, 4, 7, 8]);
    assert_eq!(tree.get_value(&5), None);
    assert_eq!(tree.get_value(&4), Some(rid_for(4)));
    assert_eq!(
        tree.root_page_id(),
        root_before,
        "a two-child root must not collapse"
    );
}

#[test]
fn delete_with_borrow_and_collapse() {
    let (_bpm, tree) = make_tree(10, 3, 3);
    // Leaves [1,2] [4,5,6] [7,8]: the middle leaf can donate either way.
    for key in [1, 2, 4, 5, 7, 8, 6] {
        assert!(tree.insert(key, rid_for(key)));
    }
    assert_eq!(scan_keys(&tree), vec![1, 2, 4, 5, 6, 7, 8]);

    // [7,8] underflows and borrows 6 from its left sibling.
    tree.remove(&8);
    assert_eq!(scan_keys(&tree), vec![1, 2, 4, 5, 6, 7]);

    // Now every sibling is at min_size, so this one merges left.
    tree.remove(&4);
    assert_eq!(scan_keys(&tree), vec![1, 2, 5, 6, 7]);

    // Drain the left leaf; the final merge leaves a one-child root, which
    // collapses so the merged leaf becomes the root.
    tree.remove(&2);
    let root_before = tree.root_page_id();
    tree.remove(&1);
    assert_eq!(scan_keys(&tree), vec![5, 6, 7]);
    assert_ne!(tree.root_page_id(), root_before, "one-child root must collapse");
    for key in [5, 6, 7] {
        assert_eq!(tree.get_value(&key), Some(rid_for(key)));
    }
}

#[test]
fn remove_until_empty_and_reuse() {
    let (_bpm, tree) = make_tree(16, 3, 3);
    let keys: Vec<i32> = (1..=40).collect();
    for &key in &keys {
        assert!(tree.insert(key, rid_for(key)));
    }
    assert_eq!(scan_keys(&tree), keys);

    // Root collapses step by step as the tree drains.
    for &key in &keys {
        tree.remove(&key);
        assert_eq!(tree.get_value(&key), None);
    }
    assert!(tree.is_empty());
    assert!(tree.begin().is_end());

    // The emptied index accepts inserts again.
    assert!(tree.insert(99, rid_for(99)));
    assert_eq!(tree.get_value(&99), Some(rid_for(99)));
    assert_eq!(scan_keys(&tree), vec![99]);
}

#[test]
fn insert_remove_round_trip_laws() {
    let (_bpm, tree) = make_tree(16, 4, 4);

    assert!(tree.insert(11, rid_for(11)));
    assert_eq!(tree.get_value(&11), Some(rid_for(11)));

    tree.remove(&11);
    assert_eq!(tree.get_value(&11), None);

    // Removing a missing key is a no-op.
    tree.remove(&11);
    assert_eq!(tree.get_value(&11), None);
}

#[test]
fn descending_inserts_keep_order() {
    let (_bpm, tree) = make_tree(16, 3, 3);
    for key in (1..=50).rev() {
        assert!(tree.insert(key, rid_for(key)));
    }
    tree.verify_integrity();
    assert_eq!(scan_keys(&tree), (1..=50).collect::<Vec<i32>>());
    for key in 1..=50 {
        assert_eq!(tree.get_value(&key), Some(rid_for(key)));
    }
}

#[test]
fn generic_keys_index_record_ids() {
    use petra::storage::index::generic_key::{GenericKey, GenericKeyComparator};

    let disk = Arc::new(MemoryDiskManager::new());
    let bpm = Arc::new(BufferPoolManager::new(16, 2, disk));
    let tree: BPlusTree<GenericKey<8>, RID, GenericKeyComparator<8>> = BPlusTree::new(
        "generic_index",
        bpm,
        GenericKeyComparator::new(),
        4,
        4,
    );

    for value in (0..100u64).rev() {
        let mut key = GenericKey::<8>::new();
        key.set_from_integer(value);
        assert!(tree.insert(key, RID::new(value, 0)));
    }
    tree.verify_integrity();

    for value in 0..100u64 {
        let mut key = GenericKey::<8>::new();
        key.set_from_integer(value);
        assert_eq!(tree.get_value(&key), Some(RID::new(value, 0)));
    }

    // Big-endian byte order makes the scan numeric.
    let scanned: Vec<RID> = tree.begin().map(|(_, v)| v).collect();
    assert_eq!(
        scanned,
        (0..100u64).map(|v| RID::new(v, 0)).collect::<Vec<RID>>()
    );
}

#[test]
fn iterator_walks_the_leaf_chain() {
    let (_bpm, tree) = make_tree(16, 3, 3);
    for key in 1..=30 {
        assert!(tree.insert(key, rid_for(key)));
    }

    let entries: Vec<(i32, RID)> = tree.begin().collect();
    assert_eq!(entries.len(), 30);
    for (i, (key, value)) in entries.iter().enumerate() {
        assert_eq!(*key, i as i32 + 1);
        assert_eq!(*value, rid_for(*key));
    }
}

#[test]
fn begin_from_positions_mid_range() {
    let (_bpm, tree) = make_tree(16, 3, 3);
    for key in (2..=40).step_by(2) {
        assert!(tree.insert(key, rid_for(key)));
    }

    // Exact hit.
    let from_10: Vec<i32> = tree.begin_from(&10).map(|(k, _)| k).collect();
    assert_eq!(from_10, (10..=40).step_by(2).collect::<Vec<i32>>());

    // Between keys: positions at the next larger key.
    let from_11: Vec<i32> = tree.begin_from(&11).map(|(k, _)| k).collect();
    assert_eq!(from_11, (12..=40).step_by(2).collect::<Vec<i32>>());

    // Past the last key: the end iterator.
    assert!(tree.begin_from(&41).is_end());
}

#[test]
fn iterator_clone_is_independent() {
    let (_bpm, tree) = make_tree(16, 3, 3);
    for key in 1..=10 {
        assert!(tree.insert(key, rid_for(key)));
    }

    let mut original = tree.begin();
    assert_eq!(original.next().map(|(k, _)| k), Some(1));

    let mut copy = original.clone();
    assert_eq!(original, copy);

    // Advancing the copy leaves the original where it was.
    assert_eq!(copy.next().map(|(k, _)| k), Some(2));
    assert_eq!(original.next().map(|(k, _)| k), Some(2));
}

#[test]
fn shuffled_workload_maintains_invariants() {
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::SeedableRng;

    let (_bpm, tree) = make_tree(32, 4, 4);
    let mut rng = StdRng::seed_from_u64(0x5EED);

    let mut keys: Vec<i32> = (0..300).collect();
    keys.shuffle(&mut rng);
    for &key in &keys {
        assert!(tree.insert(key, rid_for(key)));
    }
    tree.verify_integrity();
    assert_eq!(scan_keys(&tree), (0..300).collect::<Vec<i32>>());

    keys.shuffle(&mut rng);
    for &key in keys.iter().take(150) {
        tree.remove(&key);
    }
    tree.verify_integrity();
    let mut expected: Vec<i32> = keys[150..].to_vec();
    expected.sort_unstable();
    assert_eq!(scan_keys(&tree), expected);
}

#[test]
fn large_workload_with_interleaved_deletes() {
    let (_bpm, tree) = make_tree(32, 4, 4);

    for key in 0..500 {
        assert!(tree.insert(key, rid_for(key)));
    }
    for key in (0..500).step_by(3) {
        tree.remove(&key);
    }

    tree.verify_integrity();
    let expected: Vec<i32> = (0..500).filter(|k| k % 3 != 0).collect();
    assert_eq!(scan_keys(&tree), expected);
    for key in 0..500 {
        if key % 3 == 0 {
            assert_eq!(tree.get_value(&key), None);
        } else {
            assert_eq!(tree.get_value(&key), Some(rid_for(key)));
        }
    }
}
