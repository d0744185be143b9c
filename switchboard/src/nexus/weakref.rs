//! Weak references with blocking teardown
//!
//! A `WeakRef<T>` lets one object reach another whose destruction it does
//! not control, the way an endpoint reaches its buffer. The cell holds the
//! pointee address and an access counter biased by one while the pointee is
//! alive:
//!
//! * [`hold`](WeakRef::hold) enters an access window (counter +1) unless the
//!   counter already drained to zero; the guard's drop leaves it again.
//! * [`destroy`](WeakRef::destroy), run once by the pointee's teardown,
//!   clears the address and removes the bias. If windows are still open it
//!   sleeps until the last one closes.
//!
//! The thread whose release moves the counter from one to zero is the only
//! one allowed to wake the destroyer. It marks the cell drained and takes the
//! destroyer under the destroyer lock, then wakes it after unlocking. The
//! destroyer sleeps until the cell is marked drained, never on the counter
//! itself: a failed `hold` may raise a drained counter for a moment.
//!
//! Cloning and dropping a `WeakRef` adjust the strong count of the cell
//! itself and never block.

use crate::loom_of_fate::{current_thread, thread_wait_finish, thread_wait_start, thread_wakeup};
use crate::loom_of_fate::{ThreadId, DEADLINE_NEVER};
use crate::mana_pool::slab::{FrameFlags, SlabObject, WEAKREF_CACHE};
use crate::mana_pool::IrqSpinlock;
use crate::nexus::IpcError;
use alloc::sync::Arc;
use core::fmt;
use core::marker::PhantomData;
use core::ops::Deref;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicBool, AtomicIsize, AtomicPtr, Ordering};

struct WeakRefCell<T> {
    /// Open access windows, plus one while the pointee is alive.
    access: AtomicIsize,
    inner: AtomicPtr<T>,
    destroyed: AtomicBool,
    /// Set by the release that moved `access` from one to zero.
    drained: AtomicBool,
    destroyer: IrqSpinlock<Option<ThreadId>>,
    _slot: SlabObject,
    _pointee: PhantomData<T>,
}

impl<T> WeakRefCell<T> {
    fn release(&self) {
        if self.access.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        let mut destroyer = self.destroyer.lock();
        self.drained.store(true, Ordering::Release);
        let thread = destroyer.take();
        drop(destroyer);

        if let Some(thread) = thread {
            thread_wakeup(thread);
        }
    }
}

pub struct WeakRef<T> {
    cell: Arc<WeakRefCell<T>>,
}

impl<T: Send + Sync> WeakRef<T> {
    /// New cell with one strong reference and the pointee alive.
    ///
    /// # Safety
    ///
    /// `inner` must stay valid for shared access until [`destroy`] has
    /// returned, and `destroy` must be called before the pointee goes away.
    ///
    /// [`destroy`]: WeakRef::destroy
    pub unsafe fn create(inner: NonNull<T>) -> Result<Self, IpcError> {
        let slot = WEAKREF_CACHE.alloc(FrameFlags::ATOMIC)?;
        Ok(Self {
            cell: Arc::new(WeakRefCell {
                access: AtomicIsize::new(1),
                inner: AtomicPtr::new(inner.as_ptr()),
                destroyed: AtomicBool::new(false),
                drained: AtomicBool::new(false),
                destroyer: IrqSpinlock::new(None, "weakref_t::destroyer"),
                _slot: slot,
                _pointee: PhantomData,
            }),
        })
    }

    /// Enter an access window. `None` once the pointee is being destroyed.
    pub fn hold(&self) -> Option<WeakRefGuard<'_, T>> {
        let cell = &*self.cell;

        // Pointee already gone: do not delay its destroyer.
        if cell.inner.load(Ordering::Relaxed).is_null() {
            return None;
        }

        // Acquire pairs with the AcqRel in destroy: either destroy sees this
        // window open, or this load sees the cleared address.
        if cell.access.fetch_add(1, Ordering::Acquire) == 0 {
            cell.access.fetch_sub(1, Ordering::Release);
            return None;
        }

        match NonNull::new(cell.inner.load(Ordering::Acquire)) {
            Some(pointee) => Some(WeakRefGuard { cell, pointee }),
            None => {
                cell.release();
                None
            }
        }
    }

    /// Clear the pointee and wait until every open access window is closed.
    /// Consumes one strong reference.
    ///
    /// # Panics
    ///
    /// If the cell has already been destroyed.
    pub fn destroy(self) {
        let cell = &*self.cell;
        if cell.destroyed.swap(true, Ordering::AcqRel) {
            panic!("weakref: destroyed twice");
        }

        cell.inner.store(ptr::null_mut(), Ordering::Release);

        let mut destroyer = cell.destroyer.lock();
        if cell.access.fetch_sub(1, Ordering::AcqRel) > 1 {
            log::trace!("weakref: waiting for holders to drain");
            while !cell.drained.load(Ordering::Acquire) {
                // Not interruptible: a pending interruption only turns this
                // into a re-check loop.
                let _ = thread_wait_start();
                *destroyer = Some(current_thread());
                drop(destroyer);

                thread_wait_finish(DEADLINE_NEVER);

                destroyer = cell.destroyer.lock();
            }
            *destroyer = None;
        }
        drop(destroyer);
    }
}

impl<T> WeakRef<T> {
    /// Strong references to the cell.
    pub fn strong_count(&self) -> usize {
        Arc::strong_count(&self.cell)
    }

    /// Open access windows, plus one while the pointee is alive.
    pub fn access_count(&self) -> isize {
        self.cell.access.load(Ordering::Acquire)
    }

    pub fn is_destroyed(&self) -> bool {
        self.cell.inner.load(Ordering::Acquire).is_null()
    }

    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.cell, &b.cell)
    }
}

impl<T> Clone for WeakRef<T> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
        }
    }
}

impl<T> fmt::Debug for WeakRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("WeakRef")
            .field("strong", &self.strong_count())
            .field("access", &self.access_count())
            .finish()
    }
}

/// An open access window. The pointee stays valid while the guard lives.
pub struct WeakRefGuard<'a, T> {
    cell: &'a WeakRefCell<T>,
    pointee: NonNull<T>,
}

impl<T> Deref for WeakRefGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: destroy cannot return while this window is open, and the
        // pointee outlives destroy.
        unsafe { self.pointee.as_ref() }
    }
}

impl<T> Drop for WeakRefGuard<'_, T> {
    fn drop(&mut self) {
        self.cell.release();
    }
}
