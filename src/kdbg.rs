//! Heap inspection for the in-kernel debugger.
//!
//! Everything here either reads a heap with `try_lock` or allocates from the debugger's own
//! [`DebugMemory`], so it keeps working when the kernel heap is locked or corrupt.

use core::{
    fmt,
    panic::Location,
    ptr::NonNull,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};

use crate::{
    arena::Granularity,
    error::Corruption,
    growth::PageSource,
    heap::{Heap, HeapObserver},
    instance::{DebugMemory, Memory},
    sync::IrqSpinLock,
    table::{BlockTable, Entry},
};

/// What the tracker remembers about a live kernel allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UseRecord {
    /// The address handed out.
    pub start: usize,
    /// The size that was asked for.
    pub size: usize,
    /// Where the allocation was made.
    pub caller: Option<&'static Location<'static>>,
    /// The debugger heap block this record is charged to.
    charge: usize,
}
impl UseRecord {
    /// One past the last byte the caller may use.
    pub const fn end(&self) -> usize {
        self.start + if self.size == 0 { 1 } else { self.size }
    }

    /// Whether `addr` is inside the region.
    pub const fn contains(&self, addr: usize) -> bool {
        self.start <= addr && addr < self.end()
    }
}
impl Entry for UseRecord {
    const EMPTY: Self = Self {
        start: 0,
        size: 0,
        caller: None,
        charge: 0,
    };

    fn key(&self) -> usize {
        self.start
    }
}
impl fmt::Display for UseRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x} - {:#x} used by ", self.start, self.end())?;
        match self.caller {
            Some(caller) => write!(f, "{caller}"),
            None => f.write_str("<unknown>"),
        }
    }
}

/// Misuse of the kernel heap spotted by the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageFault {
    /// The address was freed but isn't tracked as live.
    DoubleFree {
        /// The address being freed.
        addr: usize,
    },
    /// The address isn't tracked, but allocations went untracked so it may well be live.
    Untracked {
        /// The address being freed.
        addr: usize,
    },
    /// The size given back doesn't match the size allocated.
    SizeMismatch {
        /// The address being freed.
        addr: usize,
        /// The size recorded at allocation.
        recorded: usize,
        /// The size given to `free`.
        given: usize,
    },
}
impl fmt::Display for UsageFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DoubleFree { addr } => write!(f, "Detected double free of address {addr:#x}"),
            Self::Untracked { addr } => write!(f, "Address {addr:#x} isn't tracked"),
            Self::SizeMismatch {
                addr,
                recorded,
                given,
            } => write!(f, "Size mismatch at address {addr:#x}: {recorded} != {given}"),
        }
    }
}

/// Tracks who owns each live kernel allocation.
///
/// Attach it to the kernel's memory with [`Memory::set_observer`] and turn it on with
/// [`Self::enable`]. Every record holds a small block of the debugger's byte heap, so when that
/// heap runs out new allocations simply go untracked.
pub struct MemUse<'d, S, const N: usize> {
    debug: &'d DebugMemory<S>,
    records: IrqSpinLock<BlockTable<UseRecord, N>>,
    enabled: AtomicBool,
    /// Allocations that went untracked.
    dropped: AtomicUsize,
    /// Faults detected so far.
    faults: AtomicUsize,
}
impl<'d, S: PageSource, const N: usize> MemUse<'d, S, N> {
    /// Create a disabled tracker charging its records to `debug`.
    pub const fn new(debug: &'d DebugMemory<S>) -> Self {
        Self {
            debug,
            records: IrqSpinLock::new(BlockTable::new()),
            enabled: AtomicBool::new(false),
            dropped: AtomicUsize::new(0),
            faults: AtomicUsize::new(0),
        }
    }

    /// Start tracking.
    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Release);
    }

    /// Stop tracking. Existing records are kept.
    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Release);
    }

    /// Whether allocations are being tracked.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// The number of allocations that went untracked.
    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }

    /// The number of faults detected.
    pub fn faults(&self) -> usize {
        self.faults.load(Ordering::Relaxed)
    }

    /// The number of live records, or `None` if the tracker is busy.
    pub fn tracked(&self) -> Option<usize> {
        Some(self.records.try_lock()?.len())
    }

    /// Remember that `size` bytes at `start` belong to `caller`.
    pub fn register(&self, start: usize, size: usize, caller: Option<&'static Location<'static>>) {
        if !self.is_enabled() {
            return;
        }
        let Some(charge) = self.debug.try_alloc(size_of::<UseRecord>()) else {
            self.drop_record();
            return;
        };
        let Some(mut records) = self.records.try_lock() else {
            self.refund(charge);
            self.drop_record();
            return;
        };
        let record = UseRecord {
            start,
            size,
            caller,
            charge: charge.as_ptr().expose_provenance(),
        };
        match records.search(start) {
            Ok(index) => {
                let stale = core::mem::replace(&mut records.as_slice_mut()[index], record);
                drop(records);
                if self.dropped() > 0 {
                    log::debug!("Replacing stale record {stale}");
                } else {
                    log::error!("Heap handed out {start:#x} twice, previously {stale}");
                    self.faults.fetch_add(1, Ordering::Relaxed);
                }
                self.refund_record(&stale);
            }
            Err(index) => {
                if records.insert_at(index, record).is_err() {
                    drop(records);
                    self.refund(charge);
                    self.drop_record();
                }
            }
        }
    }

    /// Forget the allocation at `start`, checking `size` against the recorded size if given.
    ///
    /// The record is dropped even on a size mismatch. A missing record is only reported as a
    /// double free while nothing has gone untracked.
    pub fn unregister(&self, start: usize, size: Option<usize>) -> Result<UseRecord, UsageFault> {
        let Some(mut records) = self.records.try_lock() else {
            self.drop_record();
            return Err(UsageFault::Untracked { addr: start });
        };
        let Ok(index) = records.search(start) else {
            drop(records);
            return Err(self.missing(start));
        };
        let record = records.remove(index);
        drop(records);
        self.refund_record(&record);
        self.check_size(record, size)
    }

    /// Check a free of `start` which the heap refused.
    ///
    /// The allocation is still live, so its record is kept.
    pub fn refused(&self, start: usize, size: Option<usize>) -> Result<UseRecord, UsageFault> {
        let record = {
            let Some(records) = self.records.try_lock() else {
                return Err(UsageFault::Untracked { addr: start });
            };
            records
                .search(start)
                .ok()
                .and_then(|index| records.get(index).copied())
        };
        match record {
            Some(record) => self.check_size(record, size),
            None => Err(self.missing(start)),
        }
    }

    /// The live region containing `addr`.
    pub fn lookup(&self, addr: usize) -> Option<UseRecord> {
        let records = self.records.try_lock()?;
        let index = records.lower_bound(addr.checked_add(1)?).checked_sub(1)?;
        let record = *records.get(index)?;
        record.contains(addr).then_some(record)
    }

    /// The live region directly below the one starting at or containing `addr`.
    ///
    /// This is the nearest record below, whether or not it ends right where the other region
    /// starts. Rounding and absorbed remainders leave gaps between neighbours, and freed blocks
    /// in between are skipped.
    pub fn bordering(&self, addr: usize) -> Option<UseRecord> {
        let records = self.records.try_lock()?;
        let owner = records.lower_bound(addr.checked_add(1)?).checked_sub(1)?;
        let index = if records.get(owner)?.contains(addr) {
            owner.checked_sub(1)?
        } else {
            owner
        };
        records.get(index).copied()
    }

    /// Write who owns `addr` and the region bordering it.
    pub fn report(&self, addr: usize, out: &mut dyn fmt::Write) -> fmt::Result {
        if self.records.is_locked() {
            return writeln!(out, "Allocation tracker busy");
        }
        let owner = self.lookup(addr);
        match owner {
            Some(owner) => writeln!(out, "  Memory region {owner}")?,
            None => writeln!(out, "Address not in use: {addr:#x}")?,
        }
        match self.bordering(owner.map_or(addr, |owner| owner.start)) {
            Some(border) => writeln!(out, "  Border region {border}"),
            None => writeln!(out, "No bordering region: {addr:#x}"),
        }
    }

    /// A free of `start` for which there's no record.
    fn missing(&self, start: usize) -> UsageFault {
        if self.dropped() > 0 {
            log::debug!("Free of untracked address {start:#x}");
            UsageFault::Untracked { addr: start }
        } else {
            self.fault(UsageFault::DoubleFree { addr: start })
        }
    }

    fn check_size(&self, record: UseRecord, size: Option<usize>) -> Result<UseRecord, UsageFault> {
        match size {
            Some(given) if given != record.size => Err(self.fault(UsageFault::SizeMismatch {
                addr: record.start,
                recorded: record.size,
                given,
            })),
            _ => Ok(record),
        }
    }

    fn fault(&self, fault: UsageFault) -> UsageFault {
        log::error!("{fault}");
        self.faults.fetch_add(1, Ordering::Relaxed);
        fault
    }

    fn drop_record(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    fn refund_record(&self, record: &UseRecord) {
        if let Some(charge) = NonNull::new(core::ptr::with_exposed_provenance_mut(record.charge)) {
            self.refund(charge);
        }
    }

    fn refund(&self, charge: NonNull<u8>) {
        match self.debug.try_free(charge) {
            Some(Ok(())) => (),
            Some(Err(e)) => log::error!("Allocation tracker lost its record: {e}"),
            None => log::warn!("Debugger heap busy, leaking a tracker record"),
        }
    }
}
impl<S: PageSource + Send, const N: usize> HeapObserver for MemUse<'_, S, N> {
    fn allocated(&self, addr: usize, size: usize, caller: &'static Location<'static>) {
        self.register(addr, size, Some(caller));
    }

    fn released(&self, addr: usize, size: Option<usize>, accepted: bool) {
        if !self.is_enabled() {
            return;
        }
        // Faults are logged as they're found.
        _ = if accepted {
            self.unregister(addr, size)
        } else {
            self.refused(addr, size)
        };
    }
}

/// Write the state of both heaps of `memory` without waiting on their locks.
pub fn dump_heap<S: PageSource, const N: usize>(
    memory: &Memory<S, N>,
    out: &mut dyn fmt::Write,
) -> fmt::Result {
    let role = memory.role();
    match memory.try_with_bytes(|heap| dump_one(heap, &mut *out)) {
        Some(result) => result?,
        None => writeln!(out, "{role} bytes: locked")?,
    }
    match memory.try_with_pages(|heap| dump_one(heap, &mut *out)) {
        Some(result) => result,
        None => writeln!(out, "{role} pages: locked"),
    }
}

fn dump_one<G: Granularity, S: PageSource, const N: usize>(
    heap: &Heap<G, S, N>,
    out: &mut dyn fmt::Write,
) -> fmt::Result {
    writeln!(out, "{}: {}", heap.name(), heap.stats())?;
    for block in heap.arena().free_list().blocks() {
        writeln!(out, "  free {block:?} ({:#x})", block.size())?;
    }
    Ok(())
}

/// Check both heaps of `memory`, or `None` if either is locked.
pub fn check_heap<S: PageSource, const N: usize>(
    memory: &Memory<S, N>,
) -> Option<Result<(), Corruption>> {
    let result = memory.try_check()?;
    if let Err(e) = result {
        log::error!("{} heap is corrupt: {e}", memory.role());
    }
    Some(result)
}
