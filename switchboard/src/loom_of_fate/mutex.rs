//! Sleeping mutex
//!
//! Passive mutual exclusion for sections that may block: contenders sleep
//! on a binary semaphore instead of spinning. Never take one while holding
//! an [`IrqSpinlock`](crate::mana_pool::IrqSpinlock).

use super::{current_thread, Semaphore, WaitError};
use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU64, Ordering};

const NO_OWNER: u64 = u64::MAX;

pub struct Mutex<T> {
    sem: Semaphore,
    owner: AtomicU64,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for Mutex<T> {}
unsafe impl<T: Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    pub const fn new(data: T) -> Self {
        Self {
            sem: Semaphore::new(1),
            owner: AtomicU64::new(NO_OWNER),
            data: UnsafeCell::new(data),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, T> {
        debug_assert!(!self.is_owned(), "sleeping mutex locked recursively");
        self.sem.down();
        self.acquired()
    }

    pub fn try_lock(&self) -> Result<MutexGuard<'_, T>, WaitError> {
        self.sem.try_down()?;
        Ok(self.acquired())
    }

    pub fn lock_timeout(&self, usec: u64) -> Result<MutexGuard<'_, T>, WaitError> {
        self.sem.down_timeout(usec)?;
        Ok(self.acquired())
    }

    pub fn is_locked(&self) -> bool {
        self.sem.count_get() == 0
    }

    /// Whether the current thread holds the mutex.
    pub fn is_owned(&self) -> bool {
        self.owner.load(Ordering::Relaxed) == current_thread().0
    }

    fn acquired(&self) -> MutexGuard<'_, T> {
        self.owner.store(current_thread().0, Ordering::Relaxed);
        MutexGuard { mutex: self }
    }
}

pub struct MutexGuard<'a, T> {
    mutex: &'a Mutex<T>,
}

impl<'a, T> MutexGuard<'a, T> {
    /// The mutex this guard unlocks.
    pub fn mutex(guard: &Self) -> &'a Mutex<T> {
        guard.mutex
    }
}

impl<T> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.owner.store(NO_OWNER, Ordering::Relaxed);
        self.mutex.sem.up();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock;
    use std::sync::Arc;
    use std::vec::Vec;

    #[test]
    fn test_try_lock_and_timeout_while_held() {
        mock::install();
        let mutex = Arc::new(Mutex::new(0u32));
        let guard = mutex.lock();
        assert!(mutex.is_locked());
        assert!(mutex.is_owned());

        let other = Arc::clone(&mutex);
        let attempt = mock::spawn(move || {
            let try_rc = other.try_lock().map(|_| ());
            let timed_rc = other.lock_timeout(1_000).map(|_| ());
            (try_rc, timed_rc)
        });
        assert_eq!(
            attempt.join().unwrap(),
            (Err(WaitError::WouldBlock), Err(WaitError::TimedOut))
        );

        drop(guard);
        assert!(!mutex.is_locked());
        assert!(!mutex.is_owned());
    }

    #[test]
    fn test_contended_increments() {
        mock::install();
        let mutex = Arc::new(Mutex::new(0u64));
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let mutex = Arc::clone(&mutex);
                mock::spawn(move || {
                    for _ in 0..500 {
                        *mutex.lock() += 1;
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(*mutex.lock(), 2000);
    }
}
