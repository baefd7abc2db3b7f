use log::trace;
use parking_lot::Mutex;

use crate::container::hash_function::HashKey;

/// A bucket in the extendible hash table. Holds at most `bucket_size`
/// entries and covers every directory slot whose low `local_depth` bits
/// match its residue.
struct Bucket<K, V> {
    items: Vec<(K, V)>,
    local_depth: u32,
}

impl<K: Eq, V> Bucket<K, V> {
    fn new(local_depth: u32) -> Self {
        Self {
            items: Vec::new(),
            local_depth,
        }
    }

    fn find(&self, key: &K) -> Option<&V> {
        self.items.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Removes the entry for `key` with a swap-remove; bucket order is not
    /// meaningful.
    fn remove(&mut self, key: &K) -> bool {
        if let Some(pos) = self.items.iter().position(|(k, _)| k == key) {
            self.items.swap_remove(pos);
            return true;
        }
        false
    }

    /// Overwrites the value for an existing key, or appends if there is
    /// room. Returns false iff the bucket is full and the key is new.
    fn insert(&mut self, key: K, value: V, bucket_size: usize) -> bool {
        if let Some(entry) = self.items.iter_mut().find(|(k, _)| *k == key) {
            entry.1 = value;
            return true;
        }
        if self.items.len() >= bucket_size {
            return false;
        }
        self.items.push((key, value));
        true
    }
}

struct TableInner<K, V> {
    /// Directory of bucket slab indices; length is always `2^global_depth`.
    dir: Vec<usize>,
    /// Bucket slab. Split-off buckets are appended; slots are never reused.
    buckets: Vec<Bucket<K, V>>,
    global_depth: u32,
    num_buckets: usize,
}

/// An in-memory extendible hash table with bucket splitting and directory
/// doubling. Serves as the buffer pool's resident-page map.
///
/// A single mutex guards all public operations; latency is traded for
/// correctness simplicity since this table sits on the buffer pool's hot
/// path under the pool's own coarse latch.
pub struct ExtendibleHashTable<K, V> {
    inner: Mutex<TableInner<K, V>>,
    bucket_size: usize,
}

impl<K, V> ExtendibleHashTable<K, V>
where
    K: HashKey + Eq + Clone,
    V: Clone,
{
    /// Creates a table with a single empty bucket at global depth 0.
    ///
    /// # Arguments
    ///
    /// * `bucket_size` - fixed capacity of each bucket.
    pub fn new(bucket_size: usize) -> Self {
        assert!(bucket_size > 0, "bucket size must be positive");
        Self {
            inner: Mutex::new(TableInner {
                dir: vec![0],
                buckets: vec![Bucket::new(0)],
                global_depth: 0,
                num_buckets: 1,
            }),
            bucket_size,
        }
    }

    fn index_of(global_depth: u32, key: &K) -> usize {
        let mask = (1u64 << global_depth) - 1;
        (key.hash_key() & mask) as usize
    }

    pub fn global_depth(&self) -> u32 {
        self.inner.lock().global_depth
    }

    /// Local depth of the bucket covering directory slot `dir_index`.
    pub fn local_depth(&self, dir_index: usize) -> u32 {
        let inner = self.inner.lock();
        inner.buckets[inner.dir[dir_index]].local_depth
    }

    pub fn num_buckets(&self) -> usize {
        self.inner.lock().num_buckets
    }

    /// Looks up the value stored for `key`.
    pub fn find(&self, key: &K) -> Option<V> {
        let inner = self.inner.lock();
        let dir_index = Self::index_of(inner.global_depth, key);
        inner.buckets[inner.dir[dir_index]].find(key).cloned()
    }

    /// Removes the entry for `key`, returning whether it was present.
    pub fn remove(&self, key: &K) -> bool {
        let mut inner = self.inner.lock();
        let dir_index = Self::index_of(inner.global_depth, key);
        let bucket = inner.dir[dir_index];
        inner.buckets[bucket].remove(key)
    }

    /// Inserts `key -> value`, replacing any existing value for the key.
    /// Splits the target bucket (doubling the directory when its local
    /// depth has caught up with the global depth) until the insert fits.
    pub fn insert(&self, key: K, value: V) {
        let mut inner = self.inner.lock();
        loop {
            let dir_index = Self::index_of(inner.global_depth, &key);
            let bucket = inner.dir[dir_index];
            if inner.buckets[bucket].insert(key.clone(), value.clone(), self.bucket_size) {
                return;
            }

            // Bucket is full. Double the directory if its local depth has
            // reached the global depth, then split and retry. Splitting can
            // repeat if every entry hashes to one side.
            if inner.buckets[bucket].local_depth == inner.global_depth {
                inner.global_depth += 1;
                let dir_size = inner.dir.len();
                for i in 0..dir_size {
                    let target = inner.dir[i];
                    inner.dir.push(target);
                }
                trace!("directory doubled to global depth {}", inner.global_depth);
            }
            Self::split_bucket(&mut inner, &key);
        }
    }

    /// Splits the (full) bucket covering `key`. Entries whose hash has bit
    /// `local_depth` set move to the new bucket; every directory slot whose
    /// low `local_depth + 1` bits match the new residue is rewired.
    fn split_bucket(inner: &mut TableInner<K, V>, key: &K) {
        let dir_index = Self::index_of(inner.global_depth, key);
        let old_slab = inner.dir[dir_index];
        let local_depth = inner.buckets[old_slab].local_depth;

        let index_old = dir_index & ((1usize << local_depth) - 1);
        let index_new = index_old + (1usize << local_depth);
        let split_mask = (1u64 << (local_depth + 1)) - 1;

        inner.buckets[old_slab].local_depth += 1;
        let mut new_bucket = Bucket::new(local_depth + 1);

        let old_items = std::mem::take(&mut inner.buckets[old_slab].items);
        for (k, v) in old_items {
            if (k.hash_key() & split_mask) as usize == index_new {
                new_bucket.items.push((k, v));
            } else {
                inner.buckets[old_slab].items.push((k, v));
            }
        }

        let new_slab = inner.buckets.len();
        inner.buckets.push(new_bucket);
        inner.num_buckets += 1;

        for index in 0..inner.dir.len() {
            let residue = index & (split_mask as usize);
            if residue == index_old {
                inner.dir[index] = old_slab;
            } else if residue == index_new {
                inner.dir[index] = new_slab;
            }
        }
        trace!(
            "split bucket residue {:#b} at local depth {}",
            index_old,
            local_depth + 1
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directory_aliasing_invariant() {
        // After a handful of splits, any two slots agreeing on the low
        // local_depth bits must share a bucket.
        let table: ExtendibleHashTable<u64, u64> = ExtendibleHashTable::new(2);
        for k in 0..32u64 {
            table.insert(k, k * 10);
        }
        let gd = table.global_depth();
        let dir_size = 1usize << gd;
        for i in 0..dir_size {
            let ld = table.local_depth(i);
            assert!(ld <= gd);
            // Slots agreeing on the low local_depth bits share the bucket,
            // so they must report the same local depth.
            let residue_mask = (1usize << ld) - 1;
            for j in 0..dir_size {
                if i & residue_mask == j & residue_mask {
                    assert_eq!(table.local_depth(j), ld);
                }
            }
        }
        for k in 0..32u64 {
            assert_eq!(table.find(&k), Some(k * 10));
        }
    }

    #[test]
    fn insert_replaces_existing_value() {
        let table: ExtendibleHashTable<u64, &str> = ExtendibleHashTable::new(4);
        table.insert(1, "a");
        table.insert(1, "b");
        assert_eq!(table.find(&1), Some("b"));
        assert_eq!(table.num_buckets(), 1);
    }

    #[test]
    fn remove_missing_is_noop() {
        let table: ExtendibleHashTable<u64, u64> = ExtendibleHashTable::new(4);
        assert!(!table.remove(&99));
        table.insert(99, 1);
        assert!(table.remove(&99));
        assert!(!table.remove(&99));
    }
}
