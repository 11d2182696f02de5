//! Per-heap feature flags.

bitset::bitset! {
    /// Optional behaviour of a heap.
    pub HeapFlags(u8) {
        /// Run the consistency checker after every mutation and log what it finds.
        Verify,
        /// Fill memory with a pattern when it is handed out and when it comes back.
        ///
        /// Only takes effect once [`crate::heap::Heap::set_poisoning`] has vouched for the arena.
        Poison,
        /// Grow ahead of time once free memory falls below the configured low-water mark.
        EagerGrowth,
    }
}
