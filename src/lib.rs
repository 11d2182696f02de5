//! Kernel memory management: a byte heap and a page heap over free lists, growing on demand
//! through the paging code.
//!
//! A [`Memory`] instance pairs the two heaps. The kernel runs on a [`KernelMemory`], and the
//! debugger gets its own [`DebugMemory`] at a separate address range with separate locks, so it
//! can allocate while the kernel heap is locked or broken.
//!
//! ```
//! use kmem::{PAGE_SIZE, growth::NoGrowth, config::PRODUCTION, instance::{KernelMemory, Role}};
//!
//! let bytes = Box::leak(vec![0_u8; 4 * PAGE_SIZE].into_boxed_slice());
//! let memory = KernelMemory::new(Role::Production, NoGrowth, NoGrowth, &PRODUCTION);
//! memory
//!     .init_bytes(bytes.as_mut_ptr().expose_provenance(), bytes.len())
//!     .expect("Arena is large enough");
//! let ptr = memory.alloc(100).expect("Arena has room");
//! memory.free(ptr).expect("Pointer came from this heap");
//! ```

#![no_std]

#[cfg(test)]
extern crate std;

pub mod arena;
pub mod block;
pub mod config;
#[cfg(all(target_arch = "riscv32", target_os = "none"))]
mod csr;
pub mod error;
pub mod flags;
pub mod free_list;
pub mod growth;
pub mod heap;
pub mod instance;
pub mod irq;
pub mod kdbg;
pub mod logger;
pub mod sync;
pub mod table;

pub use error::{Error, ErrorKind, InvalidFree, OutOfMemory, Result};
pub use growth::PageSource;
pub use instance::{DebugMemory, KernelMemory, Memory};

/// The size of a single page in memory.
pub const PAGE_SIZE: usize = 4096;
