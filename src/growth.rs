//! Getting more core from the paging code.
//!
//! The heaps never touch page tables or physical frames. When an arena runs dry its heap asks a
//! [`PageSource`] to map more memory directly after the arena's current limit, then appends the
//! new range to its free list.

use crate::{
    PAGE_SIZE,
    block::{Block, align_up},
    error::GrowthFailure,
};

/// Something that can map physically backed memory at a given virtual address.
pub trait PageSource {
    /// The size every mapping is rounded up to. Must be a power of two.
    fn granularity(&self) -> usize {
        PAGE_SIZE
    }

    /// Map at least `len` bytes of memory starting at virtual address `at`.
    ///
    /// Returns the number of bytes actually mapped, which is `len` rounded up to
    /// [`Self::granularity`]. Must fail fast rather than wait for memory to free up.
    fn map(&mut self, at: usize, len: usize) -> Result<usize, GrowthFailure>;
}

/// How many bytes to request from a source to cover a shortfall of `shortfall` bytes.
///
/// Never less than `chunk`, always a multiple of `granularity`. Returns `None` on overflow.
pub const fn growth_request(shortfall: usize, granularity: usize, chunk: usize) -> Option<usize> {
    let len = if shortfall > chunk { shortfall } else { chunk };
    align_up(len, granularity)
}

/// A page source that never grows anything.
///
/// Useful for arenas which are fixed at start-up.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoGrowth;
impl PageSource for NoGrowth {
    fn map(&mut self, _at: usize, _len: usize) -> Result<usize, GrowthFailure> {
        Err(GrowthFailure::Exhausted)
    }
}

/// A page source handing out a window of address space that is already backed by memory.
///
/// Mappings must be requested in order, each one starting where the last one ended. A page
/// budget limits how much of the window can be handed out in total.
#[derive(Debug, Clone)]
pub struct Window {
    /// The whole reserved range.
    window: Block,
    /// One past the last address handed out so far.
    mapped_until: usize,
    /// The number of pages which can still be handed out.
    pages_left: usize,
}
impl Window {
    /// Reserve `len` bytes at `base`, handing out at most `page_budget` pages.
    pub const fn new(base: usize, len: usize, page_budget: usize) -> Self {
        Self {
            window: Block::new(base, len),
            mapped_until: base,
            pages_left: page_budget,
        }
    }

    /// Reserve `len` bytes at `base` with no budget beyond the window itself.
    pub const fn unlimited(base: usize, len: usize) -> Self {
        Self::new(base, len, usize::MAX)
    }

    /// The range handed out so far.
    pub const fn mapped(&self) -> Block {
        Block::new(self.window.base(), self.mapped_until - self.window.base())
    }

    /// The number of pages which can still be handed out.
    pub const fn pages_left(&self) -> usize {
        self.pages_left
    }
}
impl PageSource for Window {
    fn map(&mut self, at: usize, len: usize) -> Result<usize, GrowthFailure> {
        let len = align_up(len, PAGE_SIZE).ok_or(GrowthFailure::OutOfWindow)?;
        let end = at.checked_add(len).ok_or(GrowthFailure::OutOfWindow)?;
        if at < self.window.base() || end > self.window.end() {
            return Err(GrowthFailure::OutOfWindow);
        }
        if at != self.mapped_until {
            return Err(GrowthFailure::MappingRejected);
        }
        let pages = len / PAGE_SIZE;
        if pages > self.pages_left {
            return Err(GrowthFailure::Exhausted);
        }
        self.pages_left -= pages;
        self.mapped_until = end;
        log::trace!("Window mapped {:?}, {} pages left", Block::new(at, len), self.pages_left);
        Ok(len)
    }
}

/// A page source backed by a closure, for binding to the kernel's paging code.
pub struct MapWith<F>(pub F);
impl<F> PageSource for MapWith<F>
where
    F: FnMut(usize, usize) -> Result<usize, GrowthFailure>,
{
    fn map(&mut self, at: usize, len: usize) -> Result<usize, GrowthFailure> {
        (self.0)(at, len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_growth_request_rounding() {
        assert_eq!(growth_request(1, PAGE_SIZE, 0), Some(PAGE_SIZE));
        assert_eq!(growth_request(100, PAGE_SIZE, 3 * PAGE_SIZE), Some(3 * PAGE_SIZE));
        assert_eq!(growth_request(PAGE_SIZE + 1, PAGE_SIZE, PAGE_SIZE), Some(2 * PAGE_SIZE));
        assert_eq!(growth_request(usize::MAX, PAGE_SIZE, 0), None);
    }

    #[test]
    fn test_window_maps_in_order_within_budget() {
        let mut window = Window::new(0x10_0000, 4 * PAGE_SIZE, 3);
        assert_eq!(window.map(0x10_0000, 10), Ok(PAGE_SIZE));
        assert_eq!(
            window.map(0x10_0000 + 2 * PAGE_SIZE, PAGE_SIZE),
            Err(GrowthFailure::MappingRejected)
        );
        assert_eq!(
            window.map(0x10_0000 + PAGE_SIZE, 3 * PAGE_SIZE),
            Err(GrowthFailure::Exhausted)
        );
        assert_eq!(window.map(0x10_0000 + PAGE_SIZE, 2 * PAGE_SIZE), Ok(2 * PAGE_SIZE));
        assert_eq!(
            window.map(0x10_0000 + 3 * PAGE_SIZE, 2 * PAGE_SIZE),
            Err(GrowthFailure::OutOfWindow)
        );
        assert_eq!(window.mapped(), Block::new(0x10_0000, 3 * PAGE_SIZE));
        assert_eq!(window.pages_left(), 0);
    }

    #[test]
    fn test_no_growth() {
        assert_eq!(NoGrowth.map(0x1000, PAGE_SIZE), Err(GrowthFailure::Exhausted));
    }
}
