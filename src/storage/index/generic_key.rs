use std::cmp::Ordering;
use std::fmt;

use bincode::{Decode, Encode};

use crate::storage::index::KeyComparator;

/// A fixed-width index key with opaque byte data. Used by indexes whose
/// key columns are serialized into N bytes (N in {4, 8, 16, 32, 64}).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Encode, Decode)]
pub struct GenericKey<const N: usize> {
    /// The fixed-size array holding the key data.
    data: [u8; N],
}

impl<const N: usize> GenericKey<N> {
    /// Creates a new `GenericKey` with zeroed data.
    pub fn new() -> Self {
        Self { data: [0; N] }
    }

    /// Sets the key data from a slice of bytes, truncating or zero-padding
    /// to N bytes.
    ///
    /// # Arguments
    ///
    /// * `bytes` - The slice of bytes to set the key from.
    pub fn set_from_bytes(&mut self, bytes: &[u8]) {
        let len = bytes.len().min(N);
        self.data[..len].copy_from_slice(&bytes[..len]);
    }

    /// Sets the key from an integer, big-endian so byte order matches
    /// numeric order.
    pub fn set_from_integer(&mut self, value: u64) {
        self.data = [0; N];
        let be = value.to_be_bytes();
        let take = be.len().min(N);
        self.data[N - take..].copy_from_slice(&be[be.len() - take..]);
    }

    /// Returns a reference to the key's byte data.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}

impl<const N: usize> Default for GenericKey<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> fmt::Display for GenericKey<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.data {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// Comparator for `GenericKey`, imposing lexicographic byte order.
#[derive(Clone, Copy, Debug, Default)]
pub struct GenericKeyComparator<const N: usize>;

impl<const N: usize> GenericKeyComparator<N> {
    pub fn new() -> Self {
        Self
    }
}

impl<const N: usize> KeyComparator<GenericKey<N>> for GenericKeyComparator<N> {
    fn compare(&self, lhs: &GenericKey<N>, rhs: &GenericKey<N>) -> Ordering {
        lhs.data.cmp(&rhs.data)
    }
}
