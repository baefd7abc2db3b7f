use std::cmp::Ordering;

pub mod b_plus_tree;
pub mod generic_key;
pub mod index_iterator;
pub mod int_comparator;
pub mod latch_crabbing;

/// Imposes a total order on index keys of type `K`.
pub trait KeyComparator<K>: Clone + Send + Sync + 'static {
    fn compare(&self, lhs: &K, rhs: &K) -> Ordering;
}

/// Bounds required of a B+ tree key: cloneable, thread-safe, and
/// serializable into page bodies.
pub trait KeyType:
    Clone + Send + Sync + std::fmt::Debug + bincode::Encode + bincode::Decode<()> + 'static
{
}

impl<T> KeyType for T where
    T: Clone + Send + Sync + std::fmt::Debug + bincode::Encode + bincode::Decode<()> + 'static
{
}

/// Bounds required of a B+ tree value (typically a record id).
pub trait ValueType:
    Clone + Send + Sync + std::fmt::Debug + bincode::Encode + bincode::Decode<()> + 'static
{
}

impl<T> ValueType for T where
    T: Clone + Send + Sync + std::fmt::Debug + bincode::Encode + bincode::Decode<()> + 'static
{
}
