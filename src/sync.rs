//! Synchronization

use core::{
    cell::UnsafeCell,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicBool, Ordering},
};

use crate::irq::{self, IrqState};

/// A lock which spins when contended, with interrupts masked while it's held.
///
/// Masking interrupts means an interrupt handler on the same hart can never find the lock held
/// by the code it interrupted.
pub struct IrqSpinLock<T: ?Sized> {
    /// The lock state.
    ///
    /// `false` means the lock is not held, and `true` means the lock is held.
    flag: AtomicBool,
    /// The value stored in the lock.
    value: UnsafeCell<T>,
}
impl<T> IrqSpinLock<T> {
    /// Construct an [`IrqSpinLock`] to wrap the given value.
    pub const fn new(value: T) -> Self {
        Self {
            flag: AtomicBool::new(false),
            value: UnsafeCell::new(value),
        }
    }

    /// Destruct the lock and return the inner value.
    ///
    /// This function does not have to lock because consuming the value means it cannot be in use
    /// anywhere else.
    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }

    /// Get an exclusive reference to the inner value from an exclusive reference to the outer
    /// value.
    ///
    /// This function does not have to lock because the exclusive reference to the value means it
    /// cannot be in use anywhere else.
    pub fn get_mut(&mut self) -> &mut T {
        self.value.get_mut()
    }
}

impl<T: ?Sized> IrqSpinLock<T> {
    /// Lock, returning an RAII guard.
    ///
    /// If the lock is already held, this spins until the holder releases it.
    pub fn lock(&self) -> IrqSpinLockGuard<'_, T> {
        loop {
            if let Some(guard) = self.try_lock() {
                return guard;
            }
            while self.is_locked() {
                core::hint::spin_loop();
            }
        }
    }

    /// Attempt to lock without spinning.
    ///
    /// Interrupts are left as they were if this fails.
    pub fn try_lock(&self) -> Option<IrqSpinLockGuard<'_, T>> {
        let irq = irq::disable();
        if self
            .flag
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            irq::restore(irq);
            return None;
        }
        Some(IrqSpinLockGuard {
            // SAFETY:
            // We've locked `flag`, so we have exclusive access.
            data: unsafe { &mut *self.value.get() },
            flag: &self.flag,
            irq,
        })
    }

    /// Whether someone holds the lock right now.
    ///
    /// Only useful as a hint, the answer may be stale by the time it's read.
    pub fn is_locked(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}
impl<T: Default> Default for IrqSpinLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

// UnsafeCell implements `Send` as appropriate, so we only need `Sync`.

// SAFETY:
// Sharing the lock between threads corresponds to sending the value to whichever thread locks
// it.
unsafe impl<T: ?Sized + Send> Sync for IrqSpinLock<T> {}

/// An RAII guard for an [`IrqSpinLock`].
///
/// This value is constructed by calling [`IrqSpinLock::lock`] and related methods. Dropping it
/// releases the lock and then restores interrupts.
pub struct IrqSpinLockGuard<'a, T: ?Sized> {
    data: &'a mut T,
    flag: &'a AtomicBool,
    irq: IrqState,
}
impl<T: ?Sized> Deref for IrqSpinLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        self.data
    }
}
impl<T: ?Sized> DerefMut for IrqSpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.data
    }
}
impl<T: ?Sized> Drop for IrqSpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
        irq::restore(self.irq);
    }
}
