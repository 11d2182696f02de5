//! The heaps: an arena plus the policy around it.
//!
//! A [`Heap`] hands out pointers from its [`Arena`], asks its [`PageSource`] for more core when
//! nothing fits, and optionally poisons memory, checks itself after every mutation, and reports
//! allocations to a [`HeapObserver`].

use core::{fmt, panic::Location, ptr::NonNull};

use crate::{
    PAGE_SIZE,
    arena::{Allocation, Arena, Bytes, Granularity, Pages},
    block::{Block, align_up},
    config::HeapConfig,
    error::{Corruption, InitError, InvalidFree, OutOfMemory, Result},
    growth::{PageSource, growth_request},
};

/// The byte written over memory when it's handed out, with poisoning on.
pub const ALLOC_POISON: u8 = 0x23;
/// The byte written over memory when it's freed or freshly mapped, with poisoning on.
pub const FREE_POISON: u8 = 0x42;

/// The general purpose heap.
pub type ByteHeap<S, const N: usize> = Heap<Bytes, S, N>;
/// The heap of whole pages.
pub type PageHeap<S, const N: usize> = Heap<Pages, S, N>;

/// Something that wants to hear about every allocation and free.
///
/// Called with the heap's lock held, so it must not call back into the same heap.
pub trait HeapObserver: Sync {
    /// `size` bytes at `addr` were handed out to `caller`.
    fn allocated(&self, addr: usize, size: usize, caller: &'static Location<'static>);

    /// Someone tried to free `addr`, claiming it was `size` bytes if they said.
    ///
    /// Called for rejected frees too, after the heap has checked them. `accepted` is `false` when
    /// the heap refused the free and the allocation (if any) is still live.
    fn released(&self, addr: usize, size: Option<usize>, accepted: bool);
}

/// Counters describing a heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapStats {
    /// The managed range.
    pub bounds: Block,
    /// Bytes handed out, including absorbed padding.
    pub allocated_bytes: usize,
    /// Bytes in the free list.
    pub free_bytes: usize,
    /// The number of free blocks.
    pub free_blocks: usize,
    /// The size of the largest free block.
    pub largest_free: usize,
    /// The number of live allocations.
    pub live_allocations: usize,
    /// How many times the arena grew.
    pub growths: usize,
    /// How many times the page source refused to grow the arena.
    pub failed_growths: usize,
    /// How many allocations failed.
    pub failed_allocs: usize,
}
impl fmt::Display for HeapStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?}: {:#x} used in {} allocations, {:#x} free in {} blocks (largest {:#x}), \
             grew {} times ({} refused), {} failed allocations",
            self.bounds,
            self.allocated_bytes,
            self.live_allocations,
            self.free_bytes,
            self.free_blocks,
            self.largest_free,
            self.growths,
            self.failed_growths,
            self.failed_allocs,
        )
    }
}

/// A free-list heap over one arena, growing through `S`.
///
/// `G` picks byte or page granularity and `N` bounds the number of live allocations.
pub struct Heap<G, S, const N: usize> {
    /// A name for logs.
    name: &'static str,
    arena: Arena<G, N>,
    source: S,
    config: HeapConfig,
    /// Whether poisoning was vouched for through [`Self::set_poisoning`].
    poison: bool,
    observer: Option<&'static dyn HeapObserver>,
    growths: usize,
    failed_growths: usize,
    failed_allocs: usize,
}
impl<G: Granularity, S: PageSource, const N: usize> Heap<G, S, N> {
    /// Create a heap which manages nothing until [`Self::init`] or [`Self::bootstrap`].
    pub const fn new(name: &'static str, source: S, config: HeapConfig) -> Self {
        Self {
            name,
            arena: Arena::new(),
            source,
            config,
            poison: false,
            observer: None,
            growths: 0,
            failed_growths: 0,
            failed_allocs: 0,
        }
    }

    /// Start managing `size` bytes of already mapped memory at `start`.
    pub fn init(&mut self, start: usize, size: usize) -> Result<Block, InitError> {
        let block = self.arena.init(start, size)?;
        log::debug!("{}: managing {block:?}", self.name);
        self.fill(block, FREE_POISON);
        Ok(block)
    }

    /// Map `initial_size` bytes at `base` through the page source, then [`Self::init`] them.
    pub fn bootstrap(&mut self, base: usize, initial_size: usize) -> Result<Block> {
        if self.arena.is_initialized() {
            return Err(InitError::AlreadyInitialized.into());
        }
        let granularity = self.source.granularity().max(G::UNIT);
        let len = align_up(initial_size, granularity).ok_or(InitError::Overflow)?;
        let mapped = self.source.map(base, len).inspect_err(|e| {
            log::error!("{}: could not map the initial core at {base:#x}: {e}", self.name);
        })?;
        Ok(self.init(base, mapped)?)
    }

    /// Allocate `size` bytes aligned to the heap's unit.
    #[track_caller]
    pub fn alloc(&mut self, size: usize) -> Result<NonNull<u8>, OutOfMemory> {
        self.alloc_aligned(size, G::UNIT)
    }

    /// Allocate `size` bytes starting at a multiple of `align`.
    ///
    /// `align` must be a power of two. Grows the arena at most once.
    #[track_caller]
    pub fn alloc_aligned(&mut self, size: usize, align: usize) -> Result<NonNull<u8>, OutOfMemory> {
        if !align.is_power_of_two() {
            log::warn!("{}: alignment {align} isn't a power of two", self.name);
            self.failed_allocs += 1;
            return Err(OutOfMemory);
        }
        let allocation = match self.arena.try_alloc(size, align) {
            Some(allocation) => allocation,
            None => self.grow_and_retry(size, align).inspect_err(|_| {
                self.failed_allocs += 1;
                log::debug!("{}: out of memory for {size} bytes", self.name);
            })?,
        };
        let ptr = NonNull::new(core::ptr::with_exposed_provenance_mut(allocation.addr))
            .ok_or(OutOfMemory)?;
        self.after_alloc(allocation, Location::caller());
        Ok(ptr)
    }

    /// Grow by enough to hold the request, then try exactly once more.
    fn grow_and_retry(&mut self, size: usize, align: usize) -> Result<Allocation, OutOfMemory> {
        if !self.arena.is_initialized() || self.arena.is_full() {
            return Err(OutOfMemory);
        }
        let mut need = Arena::<G, N>::block_size_for(size).ok_or(OutOfMemory)?;
        if align > G::UNIT {
            // Room for the worst case padding in front.
            need = need.checked_add(align).ok_or(OutOfMemory)?;
        }
        let shortfall = need.saturating_sub(self.arena.free_tail());
        self.request_more_core(shortfall)?;
        self.arena.try_alloc(size, align).ok_or(OutOfMemory)
    }

    fn after_alloc(&mut self, allocation: Allocation, caller: &'static Location<'static>) {
        log::trace!(
            "{}: alloc({}) = {:#x} from {caller}",
            self.name,
            allocation.requested,
            allocation.addr
        );
        self.fill(allocation.block, ALLOC_POISON);
        if let Some(observer) = self.observer {
            observer.allocated(allocation.addr, allocation.requested, caller);
        }
        if self.config.flags.eager_growth()
            && self.arena.free_bytes() < self.config.low_water
            && !self.arena.is_full()
        {
            // Failure is logged by `request_more_core` and isn't this allocation's problem.
            _ = self.request_more_core(self.config.growth_chunk);
        }
        self.verify();
    }

    /// Free the allocation at `ptr`, whatever its size.
    pub fn free(&mut self, ptr: NonNull<u8>) -> Result<(), InvalidFree> {
        self.release(ptr.as_ptr().expose_provenance(), None)
    }

    /// Free the allocation at `ptr`, which was requested as `size` bytes.
    pub fn free_sized(&mut self, ptr: NonNull<u8>, size: usize) -> Result<(), InvalidFree> {
        self.release(ptr.as_ptr().expose_provenance(), Some(size))
    }

    fn release(&mut self, addr: usize, size: Option<usize>) -> Result<(), InvalidFree> {
        let released = self.arena.release(addr, size);
        if let Some(observer) = self.observer {
            observer.released(addr, size, released.is_ok());
        }
        let (allocation, merge) = released.inspect_err(|e| {
            log::error!("{}: {e}", self.name);
        })?;
        log::trace!("{}: free({addr:#x}) merged {merge:?}", self.name);
        self.fill(allocation.block, FREE_POISON);
        self.verify();
        Ok(())
    }

    /// Map at least `min_size` more bytes at the end of the arena and add them to the free list.
    ///
    /// At least [`HeapConfig::growth_chunk`] bytes are requested. Nothing changes on failure.
    pub fn request_more_core(&mut self, min_size: usize) -> Result<Block, OutOfMemory> {
        if !self.arena.is_initialized() || self.arena.is_full() {
            return Err(OutOfMemory);
        }
        let at = self.arena.bounds().end();
        let granularity = self.source.granularity().max(G::UNIT);
        let len =
            growth_request(min_size, granularity, self.config.growth_chunk).ok_or(OutOfMemory)?;
        let mapped = self.source.map(at, len).inspect_err(|e| {
            self.failed_growths += 1;
            log::warn!("{}: could not grow by {len:#x} at {at:#x}: {e}", self.name);
        })?;
        let Some(block) = self.arena.extend(mapped) else {
            self.failed_growths += 1;
            log::error!("{}: can't use {mapped:#x} bytes mapped at {at:#x}", self.name);
            return Err(OutOfMemory);
        };
        self.growths += 1;
        log::debug!("{}: grew to {:?}", self.name, self.arena.bounds());
        self.fill(block, FREE_POISON);
        self.verify();
        Ok(block)
    }

    /// Turn poisoning on or off.
    ///
    /// Poisoning also needs [`POISON`](crate::flags::HeapFlags::POISON) in the heap's config.
    ///
    /// # Safety
    /// While poisoning is on, every address the arena manages, now or after growth, must be
    /// mapped, writable, and not used by anything except this heap and the owners of its
    /// allocations.
    pub unsafe fn set_poisoning(&mut self, on: bool) {
        self.poison = on;
    }

    /// Whether freed and allocated memory is being overwritten.
    pub fn is_poisoning(&self) -> bool {
        self.poison && self.config.flags.poison()
    }

    fn fill(&self, block: Block, byte: u8) {
        if !self.is_poisoning() {
            return;
        }
        let ptr = core::ptr::with_exposed_provenance_mut::<u8>(block.base());
        // SAFETY:
        // The caller of `set_poisoning` promised the whole arena is memory this heap may write,
        // and `block` is inside the arena and not handed out to anyone else right now.
        unsafe { ptr.write_bytes(byte, block.size()) };
    }

    fn verify(&self) {
        if !self.config.flags.verify() {
            return;
        }
        if let Err(e) = self.arena.check() {
            log::error!("{}: heap is corrupt: {e}", self.name);
        }
    }

    /// Check every heap invariant.
    pub fn check(&self) -> Result<(), Corruption> {
        self.arena.check()
    }

    /// Report `allocated` and `released` events to `observer`, or stop reporting with `None`.
    pub fn set_observer(&mut self, observer: Option<&'static dyn HeapObserver>) {
        self.observer = observer;
    }

    /// Counters describing the heap.
    pub fn stats(&self) -> HeapStats {
        let free = self.arena.free_list();
        HeapStats {
            bounds: if self.arena.is_initialized() {
                self.arena.bounds()
            } else {
                Block::EMPTY
            },
            allocated_bytes: self.arena.allocated_bytes(),
            free_bytes: free.free_bytes(),
            free_blocks: free.len(),
            largest_free: free.largest(),
            live_allocations: self.arena.live().len(),
            growths: self.growths,
            failed_growths: self.failed_growths,
            failed_allocs: self.failed_allocs,
        }
    }

    /// The name used in logs.
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// The underlying arena.
    pub const fn arena(&self) -> &Arena<G, N> {
        &self.arena
    }

    /// The heap's tunables.
    pub const fn config(&self) -> &HeapConfig {
        &self.config
    }

    /// The page source backing the heap.
    pub const fn source(&self) -> &S {
        &self.source
    }
}

impl<S: PageSource, const N: usize> Heap<Pages, S, N> {
    /// Allocate `count` contiguous pages.
    #[track_caller]
    pub fn alloc_pages(&mut self, count: usize) -> Result<NonNull<u8>, OutOfMemory> {
        let size = count.checked_mul(PAGE_SIZE).ok_or(OutOfMemory)?;
        self.alloc(size)
    }

    /// Free `count` pages allocated with [`Self::alloc_pages`].
    pub fn free_pages(&mut self, ptr: NonNull<u8>, count: usize) -> Result<(), InvalidFree> {
        let addr = ptr.as_ptr().expose_provenance();
        let size = count.checked_mul(PAGE_SIZE).unwrap_or(usize::MAX);
        self.release(addr, Some(size))
    }
}
