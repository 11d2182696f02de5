//! Error types.

use core::{error, fmt};

/// A result defaulting to this crate's [`Error`].
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// A generic error that can be produced by the memory subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Error {
    /// The kind of the error.
    pub kind: ErrorKind,
}
impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self { kind }
    }
}
impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)
    }
}
impl error::Error for Error {}

/// Possible kinds of errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// See [`OutOfMemory`].
    OutOfMemory,
    /// See [`InvalidFree`].
    InvalidFree(InvalidFree),
    /// See [`GrowthFailure`].
    Growth(GrowthFailure),
    /// See [`InitError`].
    Init(InitError),
    /// See [`Corruption`].
    Corruption(Corruption),
}
impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory => fmt::Display::fmt(&OutOfMemory, f),
            Self::InvalidFree(e) => e.fmt(f),
            Self::Growth(e) => e.fmt(f),
            Self::Init(e) => e.fmt(f),
            Self::Corruption(e) => e.fmt(f),
        }
    }
}

macro_rules! impl_from_for_error {
    ($($ty:ident => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Error {
                fn from(err: $ty) -> Self {
                    ErrorKind::$variant(err).into()
                }
            }
        )*
    };
}
impl_from_for_error! {
    InvalidFree => InvalidFree,
    GrowthFailure => Growth,
    InitError => Init,
    Corruption => Corruption,
}
impl From<OutOfMemory> for Error {
    fn from(OutOfMemory: OutOfMemory) -> Self {
        ErrorKind::OutOfMemory.into()
    }
}

/// No free block fits the request and growing the arena didn't help.
///
/// This is a normal condition: the caller decides whether it's fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutOfMemory;
impl fmt::Display for OutOfMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Out of memory")
    }
}
impl error::Error for OutOfMemory {}

/// The page source couldn't extend the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrowthFailure {
    /// No physical memory left to back the new range.
    Exhausted,
    /// The paging code refused to create the mapping.
    MappingRejected,
    /// The requested range falls outside of the window reserved for the arena.
    OutOfWindow,
}
impl fmt::Display for GrowthFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Exhausted => "Physical memory exhausted",
            Self::MappingRejected => "Mapping rejected",
            Self::OutOfWindow => "Growth outside of the arena window",
        })
    }
}
impl error::Error for GrowthFailure {}

/// Growth failures surface to allocation callers as plain [`OutOfMemory`].
impl From<GrowthFailure> for OutOfMemory {
    fn from(_: GrowthFailure) -> Self {
        Self
    }
}

/// A `free` that doesn't match any live allocation.
///
/// This is a bug in the caller, not a resource condition. The free list is left untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidFree {
    /// The address given to `free`.
    pub addr: usize,
    /// What was wrong with it.
    pub kind: InvalidFreeKind,
}
impl fmt::Display for InvalidFree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid free of {:#x}: {}", self.addr, self.kind)
    }
}
impl error::Error for InvalidFree {}

/// The reasons a free can be rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidFreeKind {
    /// The heap was never initialized.
    Uninitialized,
    /// The address isn't inside the arena.
    OutOfBounds,
    /// The address isn't aligned to the heap's unit.
    Misaligned,
    /// No live allocation starts at this address (includes double frees).
    NotAllocated,
    /// The size given back doesn't match the size that was requested.
    SizeMismatch {
        /// The size recorded at allocation time.
        expected: usize,
        /// The size passed to `free`.
        given: usize,
    },
}
impl fmt::Display for InvalidFreeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uninitialized => f.write_str("heap not initialized"),
            Self::OutOfBounds => f.write_str("address outside of the arena"),
            Self::Misaligned => f.write_str("misaligned address"),
            Self::NotAllocated => f.write_str("not a live allocation (double free?)"),
            Self::SizeMismatch { expected, given } => {
                write!(f, "size mismatch ({given} given, {expected} allocated)")
            }
        }
    }
}

/// Reasons an arena can't be initialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitError {
    /// The usable size is below the minimum block size.
    TooSmall,
    /// `init` was already called on this heap.
    AlreadyInitialized,
    /// The range wraps around the address space (or starts at null).
    Overflow,
}
impl fmt::Display for InitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::TooSmall => "Arena smaller than the minimum block size",
            Self::AlreadyInitialized => "Arena already initialized",
            Self::Overflow => "Arena range overflows the address space",
        })
    }
}
impl error::Error for InitError {}

/// A broken heap invariant, found by the consistency checker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Corruption {
    /// Nothing covers the memory starting at this address.
    Gap {
        /// Start of the uncovered range.
        at: usize,
    },
    /// Two blocks claim the memory at this address.
    Overlap {
        /// Start of the second block.
        at: usize,
    },
    /// Two free blocks touch but weren't merged.
    Unmerged {
        /// Start of the second free block.
        at: usize,
    },
    /// A block isn't aligned to the heap unit or is below the minimum block size.
    BadBlock {
        /// Start of the block.
        at: usize,
    },
    /// The blocks extend past the arena limit.
    PastLimit {
        /// Start of the offending block.
        at: usize,
    },
    /// The running byte counters disagree with the block tables.
    Accounting,
}
impl fmt::Display for Corruption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Gap { at } => write!(f, "Gap in arena at {at:#x}"),
            Self::Overlap { at } => write!(f, "Overlapping blocks at {at:#x}"),
            Self::Unmerged { at } => write!(f, "Adjacent free blocks not merged at {at:#x}"),
            Self::BadBlock { at } => write!(f, "Malformed block at {at:#x}"),
            Self::PastLimit { at } => write!(f, "Block past the arena limit at {at:#x}"),
            Self::Accounting => f.write_str("Byte counters disagree with block tables"),
        }
    }
}
impl error::Error for Corruption {}
