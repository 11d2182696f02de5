//! Blocks of memory and the address math around them.

use core::fmt;

/// A contiguous extent of memory, identified by its base address and size in bytes.
///
/// Blocks don't own the memory they describe: a block is a plain value that lives either in a
/// heap's free list or in its table of live allocations.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Block {
    /// The first address in the block.
    base: usize,
    /// The number of bytes in the block.
    size: usize,
}
impl Block {
    /// A zero-sized block at address zero, used to fill unused table slots.
    pub const EMPTY: Self = Self { base: 0, size: 0 };

    /// Construct a block.
    pub const fn new(base: usize, size: usize) -> Self {
        Self { base, size }
    }

    /// The first address in the block.
    pub const fn base(self) -> usize {
        self.base
    }

    /// The size of the block, in bytes.
    pub const fn size(self) -> usize {
        self.size
    }

    /// One past the last address in the block.
    pub const fn end(self) -> usize {
        self.base + self.size
    }

    /// Whether `addr` falls inside this block.
    pub const fn contains(self, addr: usize) -> bool {
        self.base <= addr && addr < self.end()
    }

    /// Whether the two blocks share any address.
    pub const fn overlaps(self, other: Self) -> bool {
        self.base < other.end() && other.base < self.end()
    }

    /// Whether `next` starts exactly where this block ends.
    pub const fn touches(self, next: Self) -> bool {
        self.end() == next.base
    }
}
impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:#x}..{:#x})", self.base, self.end())
    }
}

/// Round `value` up to a multiple of `align`, which must be a power of two.
///
/// Returns `None` on overflow.
pub const fn align_up(value: usize, align: usize) -> Option<usize> {
    debug_assert!(align.is_power_of_two());
    match value.checked_add(align - 1) {
        Some(v) => Some(v & !(align - 1)),
        None => None,
    }
}

/// Round `value` down to a multiple of `align`, which must be a power of two.
pub const fn align_down(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    value & !(align - 1)
}

/// Whether `value` is a multiple of `align`, which must be a power of two.
pub const fn is_aligned(value: usize, align: usize) -> bool {
    value & (align - 1) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        let cases = [
            (0, 8, 0),
            (1, 8, 8),
            (8, 8, 8),
            (13, 16, 16),
            (4097, 4096, 8192),
        ];
        for (value, align, expected) in cases {
            assert_eq!(
                align_up(value, align),
                Some(expected),
                "align_up({value}, {align})"
            );
        }
        assert_eq!(align_up(usize::MAX, 8), None);
        assert_eq!(align_down(4097, 4096), 4096);
        assert!(is_aligned(0x3000, 0x1000));
        assert!(!is_aligned(0x3008, 0x10));
    }

    #[test]
    fn test_block_geometry() {
        let a = Block::new(0x1000, 0x100);
        let b = Block::new(0x1100, 0x80);
        assert_eq!(a.end(), 0x1100);
        assert!(a.touches(b));
        assert!(!b.touches(a));
        assert!(!a.overlaps(b));
        assert!(a.overlaps(Block::new(0x10f0, 0x20)));
        assert!(a.contains(0x10ff));
        assert!(!a.contains(0x1100));
    }
}
