//! # Interrupt-Safe Locking
//!
//! Locks that can safely be held even when interrupts occur.
//! These locks disable interrupts while held so that an interrupt handler
//! on the same CPU can never spin on a lock its own CPU already holds.

use crate::loom_of_fate::fair_spin_mutex::{FairSpinGuard, FairSpinMutex};
use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};

/// A data-carrying spinlock that disables interrupts while held
///
/// Built on the fair spin mutex, so waiters are served in arrival order.
/// Critical sections must be short and must never sleep.
pub struct IrqSpinlock<T> {
    mutex: FairSpinMutex,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Sync for IrqSpinlock<T> {}
unsafe impl<T: Send> Send for IrqSpinlock<T> {}

impl<T> IrqSpinlock<T> {
    pub const fn new(data: T, debug_name: &'static str) -> Self {
        Self {
            mutex: FairSpinMutex::new(debug_name),
            data: UnsafeCell::new(data),
        }
    }

    /// Acquire the lock, returning a guard that restores the interrupt
    /// level on drop
    pub fn lock(&self) -> IrqSpinlockGuard<'_, T> {
        IrqSpinlockGuard {
            lock: self,
            _hold: self.mutex.lock(),
        }
    }

    pub fn try_lock(&self) -> Option<IrqSpinlockGuard<'_, T>> {
        let hold = self.mutex.try_lock()?;
        Some(IrqSpinlockGuard { lock: self, _hold: hold })
    }

    /// DIAGNOSTIC: Check if the lock is currently held
    pub fn is_locked(&self) -> bool {
        self.mutex.is_locked()
    }

    pub fn debug_name(&self) -> &'static str {
        self.mutex.name()
    }
}

pub struct IrqSpinlockGuard<'a, T> {
    lock: &'a IrqSpinlock<T>,
    _hold: FairSpinGuard<'a>,
}

impl<T> Deref for IrqSpinlockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for IrqSpinlockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attunement::interrupts_disabled;
    use crate::mock;

    #[test]
    fn test_lock_basic() {
        mock::install();
        let lock = IrqSpinlock::new(42, "TEST");
        {
            let mut guard = lock.lock();
            assert_eq!(*guard, 42);
            *guard = 7;
            assert!(interrupts_disabled());
            assert!(lock.is_locked());
        }
        // Lock should be released after guard drops
        assert!(!lock.is_locked());
        assert!(!interrupts_disabled());
        assert_eq!(*lock.lock(), 7);
        assert_eq!(lock.debug_name(), "TEST");
    }
}
