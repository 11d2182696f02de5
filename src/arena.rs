//! The bookkeeping shared by both heaps: one arena, its free list and its live allocations.
//!
//! An [`Arena`] never touches the memory it manages. It only tracks which extents of
//! `[start, limit)` are free and which belong to a caller, so every consistency check is a
//! lookup in one of its two sorted tables.

use core::marker::PhantomData;

use crate::{
    PAGE_SIZE,
    block::{Block, align_down, align_up, is_aligned},
    error::{Corruption, InitError, InvalidFree, InvalidFreeKind},
    free_list::{FreeList, Merge},
    table::{BlockTable, Entry},
};

/// The unit an arena does its accounting in.
pub trait Granularity {
    /// Every block base and size is a multiple of this. Must be a power of two.
    const UNIT: usize;
    /// The smallest block the arena will track on its own.
    const MIN_BLOCK: usize;
    /// A short name used in logs.
    const NAME: &'static str;
}

/// Byte-granular accounting, for the general purpose heap.
#[derive(Debug)]
pub struct Bytes;
impl Granularity for Bytes {
    const UNIT: usize = 8;
    const MIN_BLOCK: usize = 32;
    const NAME: &'static str = "bytes";
}

/// Page-granular accounting, for whole naturally aligned pages.
#[derive(Debug)]
pub struct Pages;
impl Granularity for Pages {
    const UNIT: usize = PAGE_SIZE;
    const MIN_BLOCK: usize = PAGE_SIZE;
    const NAME: &'static str = "pages";
}

/// A live allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    /// The extent taken out of the free list, including absorbed padding.
    pub block: Block,
    /// The address handed to the caller.
    pub addr: usize,
    /// The size the caller asked for.
    pub requested: usize,
}
impl Entry for Allocation {
    const EMPTY: Self = Self {
        block: Block::EMPTY,
        addr: 0,
        requested: 0,
    };

    fn key(&self) -> usize {
        self.addr
    }
}

/// A managed range `[start, limit)` of address space.
///
/// `N` bounds both the number of free blocks and the number of live allocations. Free blocks are
/// always separated by at least one allocation, so keeping live allocations below `N` means the
/// free list can never run out of slots.
pub struct Arena<G, const N: usize> {
    /// The first managed address.
    start: usize,
    /// One past the last managed address. Only ever grows.
    limit: usize,
    /// Free extents.
    free: FreeList<N>,
    /// Extents owned by callers, sorted by the address they were given.
    live: BlockTable<Allocation, N>,
    /// The sum of the block sizes in `live`.
    allocated_bytes: usize,
    _granularity: PhantomData<G>,
}
impl<G: Granularity, const N: usize> Arena<G, N> {
    /// Create an arena that manages nothing yet.
    pub const fn new() -> Self {
        Self {
            start: 0,
            limit: 0,
            free: FreeList::new(),
            live: BlockTable::new(),
            allocated_bytes: 0,
            _granularity: PhantomData,
        }
    }

    /// Whether [`Self::init`] has succeeded.
    pub const fn is_initialized(&self) -> bool {
        self.limit != 0
    }

    /// Start managing `size` bytes at `start` as a single free block.
    ///
    /// The range is shrunk inwards to multiples of [`Granularity::UNIT`].
    pub fn init(&mut self, start: usize, size: usize) -> Result<Block, InitError> {
        if self.is_initialized() {
            return Err(InitError::AlreadyInitialized);
        }
        let end = start.checked_add(size).ok_or(InitError::Overflow)?;
        let start = align_up(start, G::UNIT).ok_or(InitError::Overflow)?;
        if start == 0 {
            return Err(InitError::Overflow);
        }
        let end = align_down(end, G::UNIT);
        if end.saturating_sub(start) < G::MIN_BLOCK {
            return Err(InitError::TooSmall);
        }

        let block = Block::new(start, end - start);
        let merge = self.free.release(block);
        debug_assert_eq!(merge, Ok(Merge::Alone));
        self.start = start;
        self.limit = end;
        Ok(block)
    }

    /// The managed range.
    pub const fn bounds(&self) -> Block {
        Block::new(self.start, self.limit - self.start)
    }

    /// The free list.
    pub const fn free_list(&self) -> &FreeList<N> {
        &self.free
    }

    /// The live allocations, sorted by address.
    pub fn live(&self) -> &[Allocation] {
        self.live.as_slice()
    }

    /// The number of bytes currently handed out, counting absorbed padding.
    pub const fn allocated_bytes(&self) -> usize {
        self.allocated_bytes
    }

    /// The number of bytes in the free list.
    pub const fn free_bytes(&self) -> usize {
        self.free.free_bytes()
    }

    /// Whether the table of live allocations has reached its cap.
    ///
    /// Growing the arena doesn't help a full arena.
    pub const fn is_full(&self) -> bool {
        self.live.len() + 1 >= N
    }

    /// The size of the block that will be carved for a request of `size` bytes.
    pub const fn block_size_for(size: usize) -> Option<usize> {
        let size = if size == 0 { 1 } else { size };
        match align_up(size, G::UNIT) {
            Some(rounded) if rounded < G::MIN_BLOCK => Some(G::MIN_BLOCK),
            rounded => rounded,
        }
    }

    /// Take a block for `size` bytes aligned to `align` without growing.
    ///
    /// `align` must be a power of two. Returns `None` when nothing fits.
    pub fn try_alloc(&mut self, size: usize, align: usize) -> Option<Allocation> {
        debug_assert!(align.is_power_of_two());
        if !self.is_initialized() || self.is_full() {
            return None;
        }
        let need = Self::block_size_for(size)?;
        let fit = if align <= G::UNIT {
            self.free
                .find_exact(need)
                .or_else(|| self.free.find_first_fit(need))?
        } else {
            self.free.find_aligned(need, align)?
        };

        let carved = self.free.carve(fit, need, G::MIN_BLOCK);
        let allocation = Allocation {
            block: carved.block,
            addr: carved.addr,
            requested: size,
        };
        let inserted = self.live.insert(allocation);
        debug_assert!(inserted.is_ok(), "live table sized below capacity");
        self.allocated_bytes += allocation.block.size();
        Some(allocation)
    }

    /// Give the allocation at `addr` back to the free list.
    ///
    /// When `size` is given it has to round to the same block size as the size originally
    /// requested. Nothing changes if the free is rejected.
    pub fn release(
        &mut self,
        addr: usize,
        size: Option<usize>,
    ) -> Result<(Allocation, Merge), InvalidFree> {
        let reject = |kind| InvalidFree { addr, kind };
        if !self.is_initialized() {
            return Err(reject(InvalidFreeKind::Uninitialized));
        }
        if !self.bounds().contains(addr) {
            return Err(reject(InvalidFreeKind::OutOfBounds));
        }
        if !is_aligned(addr, G::UNIT) {
            return Err(reject(InvalidFreeKind::Misaligned));
        }
        let index = self
            .live
            .search(addr)
            .map_err(|_| reject(InvalidFreeKind::NotAllocated))?;
        let allocation = self.live.as_slice()[index];
        let expected_block = Self::block_size_for(allocation.requested);
        if let Some(given) = size.filter(|&given| Self::block_size_for(given) != expected_block) {
            return Err(reject(InvalidFreeKind::SizeMismatch {
                expected: allocation.requested,
                given,
            }));
        }

        let merge = match self.free.release(allocation.block) {
            Ok(merge) => merge,
            Err(rejected) => {
                log::error!(
                    "{} arena: free list refused {:?} ({rejected:?})",
                    G::NAME,
                    allocation.block
                );
                return Err(reject(InvalidFreeKind::NotAllocated));
            }
        };
        self.live.remove(index);
        self.allocated_bytes -= allocation.block.size();
        Ok((allocation, merge))
    }

    /// Append `len` freshly mapped bytes at the current limit.
    ///
    /// `len` is rounded down to the unit. Returns the new free extent.
    pub fn extend(&mut self, len: usize) -> Option<Block> {
        let len = align_down(len, G::UNIT);
        if !self.is_initialized() || len == 0 {
            return None;
        }
        let new_limit = self.limit.checked_add(len)?;
        let block = Block::new(self.limit, len);
        self.free.release(block).ok()?;
        self.limit = new_limit;
        Some(block)
    }

    /// Look up the live allocation handed out at exactly `addr`.
    pub fn find(&self, addr: usize) -> Option<Allocation> {
        let index = self.live.search(addr).ok()?;
        self.live.get(index).copied()
    }

    /// Look up the live allocation whose block contains `addr`.
    pub fn owner_of(&self, addr: usize) -> Option<Allocation> {
        let index = self.live.lower_bound(addr.checked_add(1)?).checked_sub(1)?;
        let allocation = *self.live.get(index)?;
        allocation.block.contains(addr).then_some(allocation)
    }

    /// Free bytes at the very end of the arena, which growth would extend.
    pub fn free_tail(&self) -> usize {
        self.free
            .last()
            .filter(|b| b.end() == self.limit)
            .map_or(0, Block::size)
    }

    /// Verify that the free and live blocks tile `[start, limit)` exactly.
    ///
    /// Also checks that no two free blocks touch, that every block is unit aligned and at least
    /// the minimum size, and that the byte counters match the tables.
    pub fn check(&self) -> Result<(), Corruption> {
        let free = self.free.blocks();
        let live = self.live.as_slice();
        let (mut f, mut l) = (0, 0);
        let mut cursor = self.start;
        let mut prev_free = false;
        let (mut free_sum, mut live_sum) = (0_usize, 0_usize);

        loop {
            let next_free = free.get(f).copied();
            let next_live = live.get(l).map(|a| a.block);
            let (block, is_free) = match (next_free, next_live) {
                (None, None) => break,
                (Some(b), None) => (b, true),
                (None, Some(b)) => (b, false),
                (Some(fb), Some(lb)) if fb.base() <= lb.base() => (fb, true),
                (Some(_), Some(lb)) => (lb, false),
            };
            if is_free {
                f += 1;
                free_sum += block.size();
            } else {
                let addr = live[l].addr;
                if !block.contains(addr) {
                    return Err(Corruption::BadBlock { at: block.base() });
                }
                l += 1;
                live_sum += block.size();
            }

            if block.base() < cursor {
                return Err(Corruption::Overlap { at: block.base() });
            }
            if block.base() > cursor {
                return Err(Corruption::Gap { at: cursor });
            }
            if !is_aligned(block.base() | block.size(), G::UNIT) || block.size() < G::MIN_BLOCK {
                return Err(Corruption::BadBlock { at: block.base() });
            }
            if block.end() > self.limit {
                return Err(Corruption::PastLimit { at: block.base() });
            }
            if is_free && prev_free {
                return Err(Corruption::Unmerged { at: block.base() });
            }
            cursor = block.end();
            prev_free = is_free;
        }

        if cursor != self.limit {
            return Err(Corruption::Gap { at: cursor });
        }
        if free_sum != self.free.free_bytes() || live_sum != self.allocated_bytes {
            return Err(Corruption::Accounting);
        }
        Ok(())
    }
}
impl<G: Granularity, const N: usize> Default for Arena<G, N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type ByteArena = Arena<Bytes, 16>;

    fn arena(start: usize, size: usize) -> ByteArena {
        let mut arena = ByteArena::new();
        arena.init(start, size).expect("Arena is large enough");
        arena
    }

    #[test]
    fn test_init_trims_to_unit() {
        let mut arena = ByteArena::new();
        let block = arena.init(0x1003, 0x100).expect("Arena is large enough");
        assert_eq!(block, Block::new(0x1008, 0xf8));
        assert_eq!(arena.init(0x1000, 0x100), Err(InitError::AlreadyInitialized));

        assert_eq!(ByteArena::new().init(0x1000, 16), Err(InitError::TooSmall));
        assert_eq!(ByteArena::new().init(0, 0x100), Err(InitError::Overflow));
        assert_eq!(
            ByteArena::new().init(usize::MAX - 8, 0x100),
            Err(InitError::Overflow)
        );
    }

    #[test]
    fn test_block_size_rounding() {
        assert_eq!(ByteArena::block_size_for(0), Some(32));
        assert_eq!(ByteArena::block_size_for(33), Some(40));
        assert_eq!(Arena::<Pages, 4>::block_size_for(1), Some(PAGE_SIZE));
        assert_eq!(Arena::<Pages, 4>::block_size_for(PAGE_SIZE + 1), Some(2 * PAGE_SIZE));
    }

    #[test]
    fn test_release_validation() {
        let mut arena = arena(0x1000, 0x1000);
        let a = arena.try_alloc(40, 1).expect("Fits");
        let kinds = [
            (0x9000, None, InvalidFreeKind::OutOfBounds),
            (a.addr + 4, None, InvalidFreeKind::Misaligned),
            (a.addr + 8, None, InvalidFreeKind::NotAllocated),
            (
                a.addr,
                Some(41),
                InvalidFreeKind::SizeMismatch {
                    expected: 40,
                    given: 41,
                },
            ),
        ];
        for (addr, size, kind) in kinds {
            assert_eq!(arena.release(addr, size), Err(InvalidFree { addr, kind }));
            arena.check().expect("Rejected frees change nothing");
        }
        arena.release(a.addr, Some(40)).expect("Valid free");
        assert_eq!(
            arena.release(a.addr, None).map(|_| ()),
            Err(InvalidFree {
                addr: a.addr,
                kind: InvalidFreeKind::NotAllocated
            })
        );
    }

    #[test]
    fn test_live_allocations_capped_below_capacity() {
        let mut arena = Arena::<Bytes, 4>::new();
        arena.init(0x1000, 0x1000).expect("Arena is large enough");
        for _ in 0..3 {
            arena.try_alloc(32, 1).expect("Below the cap");
        }
        assert_eq!(arena.try_alloc(32, 1), None);
        arena.check().expect("Arena is consistent");
    }

    #[test]
    fn test_owner_of() {
        let mut arena = arena(0x1000, 0x1000);
        let a = arena.try_alloc(64, 1).expect("Fits");
        let b = arena.try_alloc(64, 1).expect("Fits");
        assert_eq!(arena.owner_of(a.addr + 63), Some(a));
        assert_eq!(arena.owner_of(b.addr), Some(b));
        assert_eq!(arena.owner_of(b.block.end()), None);
    }

    #[test]
    fn test_check_detects_lost_block() {
        let mut arena = arena(0x1000, 0x100);
        arena.check().expect("Fresh arena is consistent");
        arena.free = FreeList::new();
        assert_eq!(arena.check(), Err(Corruption::Gap { at: 0x1000 }));
    }

    #[test]
    fn test_extend_merges_with_free_tail() {
        let mut arena = arena(0x1000, 0x100);
        assert_eq!(arena.free_tail(), 0x100);
        arena.extend(0x1000).expect("Extension fits");
        assert_eq!(arena.free_list().blocks(), [Block::new(0x1000, 0x1100)]);
        assert_eq!(arena.bounds().end(), 0x2100);
        arena.check().expect("Arena is consistent");
    }
}
