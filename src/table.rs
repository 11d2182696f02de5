//! Fixed-capacity, address-sorted tables.
//!
//! The heaps can't allocate their own bookkeeping from themselves, so every table lives inline
//! in the heap structure with a capacity picked at compile time.

use crate::block::Block;

/// An entry which can be stored in a [`BlockTable`].
pub trait Entry: Copy {
    /// The value used to fill unused slots.
    const EMPTY: Self;

    /// The address this entry is sorted by.
    fn key(&self) -> usize;
}

impl Entry for Block {
    const EMPTY: Self = Block::EMPTY;

    fn key(&self) -> usize {
        self.base()
    }
}

/// A table of entries kept sorted by [`Entry::key`].
///
/// The first `len` slots are in use, the rest hold [`Entry::EMPTY`].
pub struct BlockTable<T, const N: usize> {
    /// Storage for the entries.
    slots: [T; N],
    /// The number of slots in use.
    len: usize,
}
impl<T: Entry, const N: usize> BlockTable<T, N> {
    /// Create an empty table.
    pub const fn new() -> Self {
        Self {
            slots: [T::EMPTY; N],
            len: 0,
        }
    }

    /// The maximum number of entries.
    pub const fn capacity(&self) -> usize {
        N
    }

    /// The number of entries.
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Whether the table holds no entries.
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether the table has no free slots.
    pub const fn is_full(&self) -> bool {
        self.len == N
    }

    /// The entries, in key order.
    pub fn as_slice(&self) -> &[T] {
        &self.slots[..self.len]
    }

    /// The entries, mutably.
    ///
    /// The caller must not change any key in a way that breaks the ordering.
    pub fn as_slice_mut(&mut self) -> &mut [T] {
        &mut self.slots[..self.len]
    }

    /// Get the entry at `index`.
    pub fn get(&self, index: usize) -> Option<&T> {
        self.as_slice().get(index)
    }

    /// Iterate over the entries in key order.
    pub fn iter(&self) -> core::slice::Iter<'_, T> {
        self.as_slice().iter()
    }

    /// Binary search for an entry with the given key.
    ///
    /// On failure the error holds the index where such an entry would be inserted.
    pub fn search(&self, key: usize) -> Result<usize, usize> {
        self.as_slice().binary_search_by_key(&key, T::key)
    }

    /// The index of the first entry whose key is not below `key`.
    pub fn lower_bound(&self, key: usize) -> usize {
        self.as_slice().partition_point(|entry| entry.key() < key)
    }

    /// Insert `value` at `index`, shifting later entries up.
    ///
    /// Gives the value back if the table is full.
    pub fn insert_at(&mut self, index: usize, value: T) -> Result<(), T> {
        if self.is_full() {
            return Err(value);
        }
        debug_assert!(index <= self.len);
        debug_assert!(index == 0 || self.slots[index - 1].key() < value.key());
        debug_assert!(index == self.len || value.key() < self.slots[index].key());
        self.slots.copy_within(index..self.len, index + 1);
        self.slots[index] = value;
        self.len += 1;
        Ok(())
    }

    /// Insert `value` at its sorted position, returning the index it landed at.
    pub fn insert(&mut self, value: T) -> Result<usize, T> {
        let index = self.lower_bound(value.key());
        self.insert_at(index, value)?;
        Ok(index)
    }

    /// Remove and return the entry at `index`, shifting later entries down.
    pub fn remove(&mut self, index: usize) -> T {
        assert!(index < self.len, "table index {index} out of range");
        let value = self.slots[index];
        self.slots.copy_within(index + 1..self.len, index);
        self.len -= 1;
        self.slots[self.len] = T::EMPTY;
        value
    }
}
impl<T: Entry, const N: usize> Default for BlockTable<T, N> {
    fn default() -> Self {
        Self::new()
    }
}
impl<'a, T: Entry, const N: usize> IntoIterator for &'a BlockTable<T, N> {
    type Item = &'a T;
    type IntoIter = core::slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
