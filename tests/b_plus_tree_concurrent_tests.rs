extern crate petra;

use std::sync::Arc;
use std::thread;

use petra::buffer::buffer_pool_manager::BufferPoolManager;
use petra::common::rid::RID;
use petra::storage::disk::disk_manager::MemoryDiskManager;
use petra::storage::index::b_plus_tree::BPlusTree;
use petra::storage::index::int_comparator::IntComparator;

type IntTree = BPlusTree<i32, RID, IntComparator>;

fn make_tree(pool_size: usize) -> Arc<IntTree> {
    let disk = Arc::new(MemoryDiskManager::new());
    let bpm = Arc::new(BufferPoolManager::new(pool_size, 2, disk));
    Arc::new(BPlusTree::new(
        "concurrent_index",
        bpm,
        IntComparator::new(),
        4,
        4,
    ))
}

fn rid_for(key: i32) -> RID {
    RID::new(key as u64, key as u32)
}

#[test]
fn concurrent_disjoint_inserts() {
    let tree = make_tree(64);
    const THREADS: i32 = 8;
    const PER_THREAD: i32 = 100;

    let mut handles = vec![];
    for t in 0..THREADS {
        let tree = Arc::clone(&tree);
        handles.push(thread::spawn(move || {
            for i in 0..PER_THREAD {
                let key = t * PER_THREAD + i;
                assert!(tree.insert(key, rid_for(key)));
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    tree.verify_integrity();
    for key in 0..THREADS * PER_THREAD {
        assert_eq!(tree.get_value(&key), Some(rid_for(key)), "key {}", key);
    }
    let scanned: Vec<i32> = tree.begin().map(|(k, _)| k).collect();
    assert_eq!(scanned, (0..THREADS * PER_THREAD).collect::<Vec<i32>>());
}

#[test]
fn concurrent_duplicate_inserts_pick_one_winner() {
    let tree = make_tree(32);
    const THREADS: usize = 8;

    let mut handles = vec![];
    for t in 0..THREADS {
        let tree = Arc::clone(&tree);
        handles.push(thread::spawn(move || {
            let mut won = 0;
            for key in 0..50 {
                if tree.insert(key, RID::new(t as u64, key as u32)) {
                    won += 1;
                }
            }
            won
        }));
    }
    let total_wins: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();

    // Each key is inserted exactly once across all threads.
    assert_eq!(total_wins, 50);
    let scanned: Vec<i32> = tree.begin().map(|(k, _)| k).collect();
    assert_eq!(scanned, (0..50).collect::<Vec<i32>>());
}

#[test]
fn concurrent_inserts_and_deletes() {
    let tree = make_tree(64);

    // Seed the even keys, then concurrently delete them while inserting
    // the odd keys.
    for key in (0..400).step_by(2) {
        assert!(tree.insert(key, rid_for(key)));
    }

    let inserter = {
        let tree = Arc::clone(&tree);
        thread::spawn(move || {
            for key in (1..400).step_by(2) {
                assert!(tree.insert(key, rid_for(key)));
            }
        })
    };
    let deleter = {
        let tree = Arc::clone(&tree);
        thread::spawn(move || {
            for key in (0..400).step_by(2) {
                tree.remove(&key);
            }
        })
    };
    inserter.join().unwrap();
    deleter.join().unwrap();

    tree.verify_integrity();
    let expected: Vec<i32> = (1..400).step_by(2).collect();
    let scanned: Vec<i32> = tree.begin().map(|(k, _)| k).collect();
    assert_eq!(scanned, expected);
    for key in 0..400 {
        if key % 2 == 0 {
            assert_eq!(tree.get_value(&key), None);
        } else {
            assert_eq!(tree.get_value(&key), Some(rid_for(key)));
        }
    }
}

#[test]
fn concurrent_readers_during_writes() {
    let tree = make_tree(64);
    for key in 0..200 {
        assert!(tree.insert(key, rid_for(key)));
    }

    let writer = {
        let tree = Arc::clone(&tree);
        thread::spawn(move || {
            for key in 200..400 {
                assert!(tree.insert(key, rid_for(key)));
            }
        })
    };
    let mut readers = vec![];
    for _ in 0..4 {
        let tree = Arc::clone(&tree);
        readers.push(thread::spawn(move || {
            for key in 0..200 {
                // Keys present before the writer started must stay visible.
                assert_eq!(tree.get_value(&key), Some(rid_for(key)));
            }
        }));
    }
    writer.join().unwrap();
    for reader in readers {
        reader.join().unwrap();
    }

    let scanned: Vec<i32> = tree.begin().map(|(k, _)| k).collect();
    assert_eq!(scanned, (0..400).collect::<Vec<i32>>());
}
