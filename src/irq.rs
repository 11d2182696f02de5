//! Masking interrupts around heap mutations.
//!
//! On the kernel target this toggles the supervisor interrupt enable bit. Hosted builds (tests)
//! have no interrupts to mask, so the state is just carried around.

/// Whether interrupts were enabled before [`disable`] was called.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "Interrupts stay masked unless the state is restored"]
pub struct IrqState {
    /// Interrupts were enabled and must be turned back on.
    was_enabled: bool,
}

/// `sstatus.SIE`.
#[cfg(all(target_arch = "riscv32", target_os = "none"))]
const SSTATUS_SIE: usize = 1 << 1;

/// Mask interrupts on this hart, returning the previous state.
#[cfg(all(target_arch = "riscv32", target_os = "none"))]
pub fn disable() -> IrqState {
    // SAFETY: Masking interrupts can't break memory safety.
    let prev = unsafe { crate::csr::clear_csr_bits!(sstatus, SSTATUS_SIE) };
    IrqState {
        was_enabled: prev & SSTATUS_SIE != 0,
    }
}

/// Restore the interrupt state from before the matching [`disable`].
#[cfg(all(target_arch = "riscv32", target_os = "none"))]
pub fn restore(state: IrqState) {
    if state.was_enabled {
        // SAFETY: Interrupts were enabled when the matching `disable` ran, and the code holding
        // them off has finished.
        unsafe { crate::csr::set_csr_bits!(sstatus, SSTATUS_SIE) };
    }
}

/// Mask interrupts on this hart, returning the previous state.
#[cfg(not(all(target_arch = "riscv32", target_os = "none")))]
pub fn disable() -> IrqState {
    IrqState { was_enabled: false }
}

/// Restore the interrupt state from before the matching [`disable`].
#[cfg(not(all(target_arch = "riscv32", target_os = "none")))]
pub fn restore(state: IrqState) {
    debug_assert!(!state.was_enabled);
}
