//! Where the arenas live and how the heaps behave.

use crate::{PAGE_SIZE, flags::HeapFlags, growth::Window};

/// Tunables for a single heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapConfig {
    /// Optional behaviour.
    pub flags: HeapFlags,
    /// The least amount of memory requested from the page source in one go.
    pub growth_chunk: usize,
    /// With [`HeapFlags::EAGER_GROWTH`], grow once fewer than this many bytes are free.
    pub low_water: usize,
}
impl HeapConfig {
    /// Grow a page at a time, nothing else.
    pub const DEFAULT: Self = Self {
        flags: HeapFlags::empty(),
        growth_chunk: PAGE_SIZE,
        low_water: 0,
    };

    /// This config with `flags` set as well.
    pub const fn with_flags(self, flags: HeapFlags) -> Self {
        Self {
            flags: self.flags.with(flags),
            ..self
        }
    }
}
impl Default for HeapConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// The placement of one arena in the kernel's address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaConfig {
    /// The first address of the arena.
    pub base: usize,
    /// How much core to map before the heap starts.
    pub initial_size: usize,
    /// How far past `base` the arena may ever grow.
    pub window_len: usize,
    /// Tunables for the heap managing this arena.
    pub heap: HeapConfig,
}
impl ArenaConfig {
    /// The address range this arena may grow into.
    pub const fn window(&self) -> Window {
        Window::unlimited(self.base, self.window_len)
    }
}

/// The arenas of one memory instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryConfig {
    /// The byte heap.
    pub bytes: ArenaConfig,
    /// The page heap.
    pub pages: ArenaConfig,
}

/// The kernel's own heaps.
pub const PRODUCTION: MemoryConfig = MemoryConfig {
    bytes: ArenaConfig {
        base: 0xD000_0000,
        initial_size: PAGE_SIZE,
        window_len: 0x0800_0000,
        heap: HeapConfig {
            flags: HeapFlags::EAGER_GROWTH,
            growth_chunk: 4 * PAGE_SIZE,
            low_water: 1024,
        },
    },
    pages: ArenaConfig {
        base: 0xD800_0000,
        initial_size: 16 * PAGE_SIZE,
        window_len: 0x1000_0000,
        heap: HeapConfig {
            flags: HeapFlags::empty(),
            growth_chunk: 16 * PAGE_SIZE,
            low_water: 0,
        },
    },
};

/// The debugger's heaps, placed well away from the kernel's.
pub const DEBUG: MemoryConfig = MemoryConfig {
    bytes: ArenaConfig {
        base: 0xE800_0000,
        initial_size: 2 * PAGE_SIZE,
        window_len: 0x0200_0000,
        heap: HeapConfig::DEFAULT.with_flags(HeapFlags::VERIFY),
    },
    pages: ArenaConfig {
        base: 0xEC00_0000,
        initial_size: 4 * PAGE_SIZE,
        window_len: 0x0400_0000,
        heap: HeapConfig::DEFAULT.with_flags(HeapFlags::VERIFY),
    },
};
