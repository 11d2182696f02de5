//! The address-ordered list of free blocks.
//!
//! Blocks are stored sorted by base address, so the neighbours of any address are one binary
//! search away and merging on free only ever looks at the entries directly before and after.

use crate::{
    block::{Block, align_up},
    table::BlockTable,
};

/// A candidate found by one of the fit searches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fit {
    /// The index of the free block in the list.
    pub index: usize,
    /// Bytes between the start of the free block and the first suitably aligned address.
    pub pad: usize,
}

/// The result of carving an allocation out of a free block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Carved {
    /// The extent removed from the free list, including any absorbed prefix or remainder.
    pub block: Block,
    /// The address handed to the caller.
    pub addr: usize,
}

/// Which neighbours a released block was merged with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Merge {
    /// No free neighbour, the block was inserted on its own.
    Alone,
    /// The block was appended to the free block ending at its base.
    Previous,
    /// The free block starting at its end was prepended with it.
    Next,
    /// The block joined the free blocks on both sides into one.
    Both,
}

/// Reasons the free list refuses a released block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejected {
    /// The block overlaps memory that is already free.
    Overlap,
    /// There's no slot left to record the block.
    Full,
}

/// The free blocks of one arena.
pub struct FreeList<const N: usize> {
    /// Free blocks, sorted by address, never touching each other.
    blocks: BlockTable<Block, N>,
    /// The sum of the sizes of all blocks in the list.
    free_bytes: usize,
}
impl<const N: usize> FreeList<N> {
    /// Create an empty free list.
    pub const fn new() -> Self {
        Self {
            blocks: BlockTable::new(),
            free_bytes: 0,
        }
    }

    /// The number of free blocks.
    pub const fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Whether there are no free blocks at all.
    pub const fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// The total number of free bytes.
    pub const fn free_bytes(&self) -> usize {
        self.free_bytes
    }

    /// The free blocks, in address order.
    pub fn blocks(&self) -> &[Block] {
        self.blocks.as_slice()
    }

    /// The free block with the highest address.
    pub fn last(&self) -> Option<Block> {
        self.blocks.as_slice().last().copied()
    }

    /// The size of the largest free block.
    pub fn largest(&self) -> usize {
        self.blocks.iter().map(|b| b.size()).max().unwrap_or(0)
    }

    /// Find the first free block of exactly `size` bytes.
    ///
    /// Handing out exact matches first keeps repeated fixed-size allocations from chipping away
    /// at the big blocks.
    pub fn find_exact(&self, size: usize) -> Option<Fit> {
        self.blocks
            .iter()
            .position(|b| b.size() == size)
            .map(|index| Fit { index, pad: 0 })
    }

    /// Find the first free block, in address order, of at least `size` bytes.
    pub fn find_first_fit(&self, size: usize) -> Option<Fit> {
        self.blocks
            .iter()
            .position(|b| b.size() >= size)
            .map(|index| Fit { index, pad: 0 })
    }

    /// Find a free block holding `size` bytes starting at a multiple of `align`.
    ///
    /// An already aligned block of exactly the right size wins, otherwise the first block whose
    /// aligned sub-range is large enough.
    pub fn find_aligned(&self, size: usize, align: usize) -> Option<Fit> {
        let pad_of = |b: &Block| Some(align_up(b.base(), align)? - b.base());
        if let Some(index) = self
            .blocks
            .iter()
            .position(|b| b.size() == size && pad_of(b) == Some(0))
        {
            return Some(Fit { index, pad: 0 });
        }
        self.blocks.iter().enumerate().find_map(|(index, b)| {
            let pad = pad_of(b)?;
            (b.size() >= pad.checked_add(size)?).then_some(Fit { index, pad })
        })
    }

    /// Remove `size` bytes at offset `fit.pad` from the free block at `fit.index`.
    ///
    /// A prefix or remainder smaller than `min_block` isn't worth tracking, so it's handed out
    /// with the allocation instead of staying in the list.
    pub fn carve(&mut self, fit: Fit, size: usize, min_block: usize) -> Carved {
        let free = self.blocks.as_slice()[fit.index];
        debug_assert!(free.size() >= fit.pad + size);
        let addr = free.base() + fit.pad;
        let keep_prefix = fit.pad >= min_block;
        let mut keep_rest = free.end() - (addr + size) >= min_block;
        if keep_prefix && keep_rest && self.blocks.is_full() {
            keep_rest = false;
        }

        let start = if keep_prefix { addr } else { free.base() };
        let end = if keep_rest { addr + size } else { free.end() };
        let rest = Block::new(end, free.end() - end);

        match (keep_prefix, keep_rest) {
            (true, true) => {
                self.blocks.as_slice_mut()[fit.index] = Block::new(free.base(), fit.pad);
                // Room was checked above.
                _ = self.blocks.insert_at(fit.index + 1, rest);
            }
            (true, false) => {
                self.blocks.as_slice_mut()[fit.index] = Block::new(free.base(), fit.pad);
            }
            (false, true) => self.blocks.as_slice_mut()[fit.index] = rest,
            (false, false) => {
                self.blocks.remove(fit.index);
            }
        }

        let block = Block::new(start, end - start);
        self.free_bytes -= block.size();
        Carved { block, addr }
    }

    /// Return `block` to the list, merging it with the free blocks directly around it.
    pub fn release(&mut self, block: Block) -> Result<Merge, Rejected> {
        let index = self.blocks.lower_bound(block.base());
        let prev = index.checked_sub(1).map(|i| self.blocks.as_slice()[i]);
        let next = self.blocks.get(index).copied();
        if prev.is_some_and(|p| p.overlaps(block)) || next.is_some_and(|n| n.overlaps(block)) {
            return Err(Rejected::Overlap);
        }

        let prev = prev.filter(|p| p.touches(block));
        let next = next.filter(|n| block.touches(*n));
        let merge = match (prev, next) {
            (Some(p), Some(n)) => {
                self.blocks.as_slice_mut()[index - 1] =
                    Block::new(p.base(), p.size() + block.size() + n.size());
                self.blocks.remove(index);
                Merge::Both
            }
            (Some(p), None) => {
                self.blocks.as_slice_mut()[index - 1] =
                    Block::new(p.base(), p.size() + block.size());
                Merge::Previous
            }
            (None, Some(n)) => {
                self.blocks.as_slice_mut()[index] =
                    Block::new(block.base(), block.size() + n.size());
                Merge::Next
            }
            (None, None) => {
                self.blocks
                    .insert_at(index, block)
                    .map_err(|_| Rejected::Full)?;
                Merge::Alone
            }
        };
        self.free_bytes += block.size();
        Ok(merge)
    }
}
impl<const N: usize> Default for FreeList<N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIN: usize = 32;

    fn list_of<const N: usize>(blocks: &[(usize, usize)]) -> FreeList<N> {
        let mut list = FreeList::new();
        for &(base, size) in blocks {
            list.release(Block::new(base, size)).expect("Blocks are disjoint");
        }
        list
    }

    #[test]
    fn test_exact_match_preferred_over_first_fit() {
        let list = list_of::<8>(&[(0x1000, 0x100), (0x2000, 0x40), (0x3000, 0x40)]);
        assert_eq!(list.find_exact(0x40), Some(Fit { index: 1, pad: 0 }));
        assert_eq!(list.find_first_fit(0x40), Some(Fit { index: 0, pad: 0 }));
        assert_eq!(list.find_first_fit(0x200), None);
    }

    #[test]
    fn test_carve_splits_and_absorbs() {
        let mut list = list_of::<8>(&[(0x1000, 0x100)]);
        let carved = list.carve(Fit { index: 0, pad: 0 }, 0x40, MIN);
        assert_eq!(carved.block, Block::new(0x1000, 0x40));
        assert_eq!(list.blocks(), [Block::new(0x1040, 0xc0)]);

        // A remainder below the minimum block size goes with the allocation.
        let carved = list.carve(Fit { index: 0, pad: 0 }, 0xa8, MIN);
        assert_eq!(carved.block, Block::new(0x1040, 0xc0));
        assert!(list.is_empty());
        assert_eq!(list.free_bytes(), 0);
    }

    #[test]
    fn test_carve_keeps_minimum_sized_remainder() {
        let mut list = list_of::<8>(&[(0x1000, 0xc0)]);
        let carved = list.carve(Fit { index: 0, pad: 0 }, 0xa0, MIN);
        assert_eq!(carved.block, Block::new(0x1000, 0xa0));
        assert_eq!(list.blocks(), [Block::new(0x10a0, MIN)]);
        assert_eq!(list.free_bytes(), MIN);
    }

    #[test]
    fn test_carve_aligned_keeps_large_prefix() {
        let mut list = list_of::<8>(&[(0x1010, 0x1000)]);
        let fit = list.find_aligned(0x100, 0x100).expect("Block is big enough");
        assert_eq!(fit, Fit { index: 0, pad: 0xf0 });
        let carved = list.carve(fit, 0x100, MIN);
        assert_eq!(carved.addr, 0x1100);
        assert_eq!(carved.block, Block::new(0x1100, 0x100));
        assert_eq!(
            list.blocks(),
            [Block::new(0x1010, 0xf0), Block::new(0x1200, 0xe10)]
        );
    }

    #[test]
    fn test_carve_aligned_absorbs_small_prefix() {
        let mut list = list_of::<8>(&[(0x10f0, 0x1000)]);
        let fit = list.find_aligned(0x100, 0x100).expect("Block is big enough");
        let carved = list.carve(fit, 0x100, MIN);
        assert_eq!(carved.addr, 0x1100);
        assert_eq!(carved.block, Block::new(0x10f0, 0x110));
        assert_eq!(list.blocks(), [Block::new(0x1200, 0xef0)]);
    }

    #[test]
    fn test_release_merges_both_sides() {
        let mut list = list_of::<8>(&[(0x1000, 0x40), (0x1080, 0x40)]);
        assert_eq!(list.release(Block::new(0x1040, 0x40)), Ok(Merge::Both));
        assert_eq!(list.blocks(), [Block::new(0x1000, 0xc0)]);
        assert_eq!(list.free_bytes(), 0xc0);
    }

    #[test]
    fn test_release_merges_single_sides() {
        let mut list = list_of::<8>(&[(0x1000, 0x40), (0x2000, 0x40)]);
        assert_eq!(list.release(Block::new(0x1040, 0x20)), Ok(Merge::Previous));
        assert_eq!(list.release(Block::new(0x1fc0, 0x40)), Ok(Merge::Next));
        assert_eq!(list.release(Block::new(0x1800, 0x40)), Ok(Merge::Alone));
        assert_eq!(
            list.blocks(),
            [
                Block::new(0x1000, 0x60),
                Block::new(0x1800, 0x40),
                Block::new(0x1fc0, 0x80)
            ]
        );
    }

    #[test]
    fn test_release_rejects_overlap() {
        let mut list = list_of::<8>(&[(0x1000, 0x100)]);
        assert_eq!(list.release(Block::new(0x1080, 0x40)), Err(Rejected::Overlap));
        assert_eq!(list.release(Block::new(0x0fc0, 0x80)), Err(Rejected::Overlap));
        assert_eq!(list.free_bytes(), 0x100);
    }
}
