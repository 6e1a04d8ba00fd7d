//! Received-chunk bitmap
//!
//! Chunk indices are dense integers bounded by `total_chunks`, so membership
//! is tracked one bit per chunk.

use serde::{Deserialize, Serialize};

/// Fixed-capacity set of chunk indices in `[0, len)`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkBitmap {
    words: Vec<u64>,
    len: usize,
    count: usize,
}

impl ChunkBitmap {
    /// Empty bitmap able to hold indices `0..len`
    pub fn new(len: usize) -> Self {
        Self {
            words: vec![0; len.div_ceil(64)],
            len,
            count: 0,
        }
    }

    /// Build from a list of indices, ignoring anything out of range
    pub fn from_indices(len: usize, indices: impl IntoIterator<Item = usize>) -> Self {
        let mut bitmap = Self::new(len);
        for index in indices {
            bitmap.insert(index);
        }
        bitmap
    }

    /// Capacity (number of chunks in the file)
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of indices set
    pub fn count(&self) -> usize {
        self.count
    }

    pub fn is_full(&self) -> bool {
        self.count == self.len
    }

    pub fn contains(&self, index: usize) -> bool {
        if index >= self.len {
            return false;
        }
        self.words[index / 64] & (1 << (index % 64)) != 0
    }

    /// Set an index. Returns `true` if it was newly inserted.
    pub fn insert(&mut self, index: usize) -> bool {
        if index >= self.len || self.contains(index) {
            return false;
        }
        self.words[index / 64] |= 1 << (index % 64);
        self.count += 1;
        true
    }

    /// Indices set, ascending
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.len).filter(move |i| self.contains(*i))
    }

    /// Indices not yet set, ascending
    pub fn missing(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.len).filter(move |i| !self.contains(*i))
    }

    pub fn to_vec(&self) -> Vec<usize> {
        self.iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_is_idempotent() {
        let mut bitmap = ChunkBitmap::new(3);

        assert!(bitmap.insert(1));
        assert!(!bitmap.insert(1));
        assert_eq!(bitmap.count(), 1);
        assert!(bitmap.contains(1));
        assert!(!bitmap.contains(0));
    }

    #[test]
    fn test_out_of_range_is_ignored() {
        let mut bitmap = ChunkBitmap::new(2);

        assert!(!bitmap.insert(2));
        assert!(!bitmap.contains(2));
        assert_eq!(bitmap.count(), 0);
    }

    #[test]
    fn test_spans_word_boundary() {
        let bitmap = ChunkBitmap::from_indices(130, [0, 63, 64, 129]);

        assert_eq!(bitmap.count(), 4);
        assert_eq!(bitmap.to_vec(), vec![0, 63, 64, 129]);
        assert_eq!(bitmap.missing().count(), 126);
    }

    #[test]
    fn test_full_and_empty() {
        let mut bitmap = ChunkBitmap::new(2);
        assert!(!bitmap.is_full());

        bitmap.insert(0);
        bitmap.insert(1);
        assert!(bitmap.is_full());
        assert_eq!(bitmap.missing().count(), 0);

        let empty = ChunkBitmap::new(0);
        assert!(empty.is_empty());
        assert!(empty.is_full());
    }
}
