//! Memory instances: a byte heap and a page heap, each behind its own lock.
//!
//! The kernel owns one [`KernelMemory`] and the debugger owns one [`DebugMemory`]. They share
//! code but no state, so the debugger can keep allocating while it inspects a broken kernel heap.

use core::{
    alloc::{GlobalAlloc, Layout},
    fmt,
    ops::Deref,
    ptr::{self, NonNull},
};

use crate::{
    PAGE_SIZE,
    block::Block,
    config::MemoryConfig,
    error::{Corruption, InitError, InvalidFree, OutOfMemory, Result},
    growth::PageSource,
    heap::{ByteHeap, HeapObserver, HeapStats, PageHeap},
    sync::IrqSpinLock,
};

/// The number of live allocations each kernel heap can track.
pub const KERNEL_SLOTS: usize = 512;
/// The number of live allocations each debugger heap can track.
pub const DEBUG_SLOTS: usize = 64;

/// Which instance this is, for logs and dumps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The kernel's own memory.
    Production,
    /// Memory reserved for the debugger.
    Debug,
}
impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Production => "kernel",
            Self::Debug => "kdbg",
        })
    }
}

/// Counters for both heaps of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryStats {
    /// Which instance these are for.
    pub role: Role,
    /// The byte heap.
    pub bytes: HeapStats,
    /// The page heap.
    pub pages: HeapStats,
}
impl fmt::Display for MemoryStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} bytes: {}", self.role, self.bytes)?;
        write!(f, "{} pages: {}", self.role, self.pages)
    }
}

/// A byte heap and a page heap with independent locks.
pub struct Memory<S, const N: usize> {
    role: Role,
    bytes: IrqSpinLock<ByteHeap<S, N>>,
    pages: IrqSpinLock<PageHeap<S, N>>,
}

/// The kernel's memory instance.
pub type KernelMemory<S> = Memory<S, KERNEL_SLOTS>;

impl<S: PageSource, const N: usize> Memory<S, N> {
    /// Create an instance with uninitialized heaps growing through the given sources.
    pub const fn new(role: Role, byte_source: S, page_source: S, config: &MemoryConfig) -> Self {
        let (bytes_name, pages_name) = match role {
            Role::Production => ("kernel bytes", "kernel pages"),
            Role::Debug => ("kdbg bytes", "kdbg pages"),
        };
        Self {
            role,
            bytes: IrqSpinLock::new(ByteHeap::new(bytes_name, byte_source, config.bytes.heap)),
            pages: IrqSpinLock::new(PageHeap::new(pages_name, page_source, config.pages.heap)),
        }
    }

    /// Which instance this is.
    pub const fn role(&self) -> Role {
        self.role
    }

    /// Hand `size` bytes of mapped memory at `start` to the byte heap.
    pub fn init_bytes(&self, start: usize, size: usize) -> Result<Block, InitError> {
        self.bytes.lock().init(start, size)
    }

    /// Hand `size` bytes of mapped memory at `start` to the page heap.
    pub fn init_pages(&self, start: usize, size: usize) -> Result<Block, InitError> {
        self.pages.lock().init(start, size)
    }

    /// Map the initial core for both heaps at the configured addresses and start them.
    pub fn bootstrap(&self, config: &MemoryConfig) -> Result<()> {
        let bytes = self
            .bytes
            .lock()
            .bootstrap(config.bytes.base, config.bytes.initial_size)?;
        let pages = self
            .pages
            .lock()
            .bootstrap(config.pages.base, config.pages.initial_size)?;
        log::info!("{} memory up: bytes at {bytes:?}, pages at {pages:?}", self.role);
        Ok(())
    }

    /// Allocate `size` bytes from the byte heap.
    #[track_caller]
    pub fn alloc(&self, size: usize) -> Result<NonNull<u8>, OutOfMemory> {
        self.bytes.lock().alloc(size)
    }

    /// Allocate `size` bytes aligned to `align` from the byte heap.
    #[track_caller]
    pub fn alloc_aligned(&self, size: usize, align: usize) -> Result<NonNull<u8>, OutOfMemory> {
        self.bytes.lock().alloc_aligned(size, align)
    }

    /// Return an allocation to the byte heap.
    pub fn free(&self, ptr: NonNull<u8>) -> Result<(), InvalidFree> {
        self.bytes.lock().free(ptr)
    }

    /// Return an allocation of `size` bytes to the byte heap.
    pub fn free_sized(&self, ptr: NonNull<u8>, size: usize) -> Result<(), InvalidFree> {
        self.bytes.lock().free_sized(ptr, size)
    }

    /// Allocate from the byte heap unless someone is holding it.
    ///
    /// Never spins, so it's safe to call from code that may have interrupted a heap operation.
    #[track_caller]
    pub fn try_alloc(&self, size: usize) -> Option<NonNull<u8>> {
        self.bytes.try_lock()?.alloc(size).ok()
    }

    /// Free to the byte heap unless someone is holding it.
    ///
    /// Returns `None` if the heap was locked, and whether the free was valid otherwise.
    pub fn try_free(&self, ptr: NonNull<u8>) -> Option<Result<(), InvalidFree>> {
        Some(self.bytes.try_lock()?.free(ptr))
    }

    /// Allocate a single page.
    #[track_caller]
    pub fn alloc_page(&self) -> Result<NonNull<u8>, OutOfMemory> {
        self.pages.lock().alloc_pages(1)
    }

    /// Allocate `count` contiguous pages.
    #[track_caller]
    pub fn alloc_pages(&self, count: usize) -> Result<NonNull<u8>, OutOfMemory> {
        self.pages.lock().alloc_pages(count)
    }

    /// Allocate `count` contiguous pages starting at a multiple of `align`.
    #[track_caller]
    pub fn alloc_pages_aligned(
        &self,
        count: usize,
        align: usize,
    ) -> Result<NonNull<u8>, OutOfMemory> {
        let size = count.checked_mul(PAGE_SIZE).ok_or(OutOfMemory)?;
        self.pages.lock().alloc_aligned(size, align)
    }

    /// Free a page allocated with [`Self::alloc_page`].
    pub fn free_page(&self, ptr: NonNull<u8>) -> Result<(), InvalidFree> {
        self.pages.lock().free_pages(ptr, 1)
    }

    /// Free `count` pages allocated together.
    pub fn free_pages(&self, ptr: NonNull<u8>, count: usize) -> Result<(), InvalidFree> {
        self.pages.lock().free_pages(ptr, count)
    }

    /// Free a block of pages without restating its size.
    pub fn free_page_block(&self, ptr: NonNull<u8>) -> Result<(), InvalidFree> {
        self.pages.lock().free(ptr)
    }

    /// Counters for both heaps.
    pub fn stats(&self) -> MemoryStats {
        MemoryStats {
            role: self.role,
            bytes: self.bytes.lock().stats(),
            pages: self.pages.lock().stats(),
        }
    }

    /// Counters for both heaps, or `None` if either is locked.
    pub fn try_stats(&self) -> Option<MemoryStats> {
        Some(MemoryStats {
            role: self.role,
            bytes: self.bytes.try_lock()?.stats(),
            pages: self.pages.try_lock()?.stats(),
        })
    }

    /// Check every invariant of both heaps.
    pub fn check(&self) -> Result<(), Corruption> {
        self.bytes.lock().check()?;
        self.pages.lock().check()
    }

    /// Like [`Self::check`], but `None` if either heap is locked.
    pub fn try_check(&self) -> Option<Result<(), Corruption>> {
        let bytes = self.bytes.try_lock()?.check();
        let pages = self.pages.try_lock()?.check();
        Some(bytes.and(pages))
    }

    /// Report every allocation and free on both heaps to `observer`.
    pub fn set_observer(&self, observer: Option<&'static dyn HeapObserver>) {
        self.bytes.lock().set_observer(observer);
        self.pages.lock().set_observer(observer);
    }

    /// Run `f` with the byte heap locked.
    pub fn with_bytes<R>(&self, f: impl FnOnce(&mut ByteHeap<S, N>) -> R) -> R {
        f(&mut self.bytes.lock())
    }

    /// Run `f` with the page heap locked.
    pub fn with_pages<R>(&self, f: impl FnOnce(&mut PageHeap<S, N>) -> R) -> R {
        f(&mut self.pages.lock())
    }

    /// Run `f` with the byte heap locked, unless it's already locked.
    pub fn try_with_bytes<R>(&self, f: impl FnOnce(&mut ByteHeap<S, N>) -> R) -> Option<R> {
        let mut heap = self.bytes.try_lock()?;
        Some(f(&mut heap))
    }

    /// Run `f` with the page heap locked, unless it's already locked.
    pub fn try_with_pages<R>(&self, f: impl FnOnce(&mut PageHeap<S, N>) -> R) -> Option<R> {
        let mut heap = self.pages.try_lock()?;
        Some(f(&mut heap))
    }
}

/// The byte heap backs Rust's `alloc` crate.
///
/// # Panics
/// `dealloc` panics on a pointer the heap didn't hand out, since it has no way to report it.
// SAFETY:
// Allocations never overlap and stay put until freed, and `alloc` honours the layout's size and
// alignment or returns null.
unsafe impl<S: PageSource + Send, const N: usize> GlobalAlloc for Memory<S, N> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.alloc_aligned(layout.size(), layout.align())
            .map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        let Some(ptr) = NonNull::new(ptr) else {
            return;
        };
        if let Err(e) = self.free_sized(ptr, layout.size()) {
            panic!("{} heap: bad dealloc: {e}", self.role);
        }
    }
}

/// The debugger's memory instance.
///
/// A distinct type from [`KernelMemory`] so debugger code can't be handed the kernel's heaps by
/// mistake.
pub struct DebugMemory<S>(Memory<S, DEBUG_SLOTS>);
impl<S: PageSource> DebugMemory<S> {
    /// Create the debugger's instance.
    pub const fn new(byte_source: S, page_source: S, config: &MemoryConfig) -> Self {
        Self(Memory::new(Role::Debug, byte_source, page_source, config))
    }
}
impl<S> Deref for DebugMemory<S> {
    type Target = Memory<S, DEBUG_SLOTS>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::DEBUG, growth::NoGrowth};

    #[test]
    fn test_try_alloc_backs_off_while_locked() {
        let memory = DebugMemory::new(NoGrowth, NoGrowth, &DEBUG);
        memory
            .init_bytes(0x8000, 0x1000)
            .expect("Arena is large enough");
        let held = memory.bytes.lock();
        assert_eq!(memory.try_alloc(16), None);
        assert!(memory.try_stats().is_none());
        drop(held);
        let ptr = memory.try_alloc(16).expect("Heap is free again");
        assert_eq!(memory.try_free(ptr), Some(Ok(())));
    }

    #[test]
    fn test_stats_before_init() {
        let memory = DebugMemory::new(NoGrowth, NoGrowth, &DEBUG);
        let stats = memory.stats();
        assert_eq!(stats.role, Role::Debug);
        assert_eq!(stats.bytes.bounds, Block::EMPTY);
        assert_eq!(memory.alloc(8), Err(OutOfMemory));
        assert_eq!(memory.check(), Ok(()));
    }
}
