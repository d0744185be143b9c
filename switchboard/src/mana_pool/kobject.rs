//! Kernel objects
//!
//! A kernel object is reference counted and reachable from userspace only
//! through capability handles. [`Kobj`] is a counted pointer to one:
//! cloning adds a reference, dropping puts one. The put that reaches zero
//! runs the class's [`destroy`](KobjClass::destroy) hook and frees the
//! object.
//!
//! The hook gets `&T`, not `&mut T`. While it runs, other threads may still
//! be inside the object through a weak reference (see
//! [`WeakRef`](crate::nexus::WeakRef)); tearing those down is the hook's
//! job.

use alloc::boxed::Box;
use core::fmt;
use core::marker::PhantomData;
use core::mem::MaybeUninit;
use core::ops::Deref;
use core::ptr::{self, NonNull};
use core::sync::atomic::{self, AtomicUsize, Ordering};

/// A kind of kernel object.
pub trait KobjClass: Send + Sync + Sized {
    /// Class name for diagnostics.
    const NAME: &'static str;

    /// Called once, by the final put, before the memory is freed.
    fn destroy(&self) {}
}

struct KobjInner<T> {
    refcount: AtomicUsize,
    value: T,
}

/// Counted reference to a kernel object.
pub struct Kobj<T: KobjClass> {
    ptr: NonNull<KobjInner<T>>,
    _owns: PhantomData<KobjInner<T>>,
}

unsafe impl<T: KobjClass> Send for Kobj<T> {}
unsafe impl<T: KobjClass> Sync for Kobj<T> {}

impl<T: KobjClass> Kobj<T> {
    /// A new object with one reference.
    pub fn new(value: T) -> Self {
        let inner = Box::new(KobjInner {
            refcount: AtomicUsize::new(1),
            value,
        });
        Self::from_inner(NonNull::from(Box::leak(inner)))
    }

    /// Build an object that needs its own final address during
    /// construction (to hand out weak references to itself).
    ///
    /// `build` receives the address the value will live at. Nothing may be
    /// read through it until this function returns. On error the memory is
    /// released and nothing is destroyed.
    pub fn try_new_cyclic<E, F>(build: F) -> Result<Self, E>
    where
        F: FnOnce(NonNull<T>) -> Result<T, E>,
    {
        let raw = Box::into_raw(Box::new(MaybeUninit::<KobjInner<T>>::uninit())) as *mut KobjInner<T>;
        // SAFETY: `raw` comes from a live allocation; only the field address
        // is taken, nothing is read.
        let value_ptr = unsafe { NonNull::new_unchecked(ptr::addr_of_mut!((*raw).value)) };

        match build(value_ptr) {
            Ok(value) => {
                // SAFETY: `raw` is valid for writes and still uninitialized.
                unsafe {
                    raw.write(KobjInner {
                        refcount: AtomicUsize::new(1),
                        value,
                    });
                    Ok(Self::from_inner(NonNull::new_unchecked(raw)))
                }
            }
            Err(err) => {
                // SAFETY: reconstitute the uninitialized box to free it.
                drop(unsafe { Box::from_raw(raw as *mut MaybeUninit<KobjInner<T>>) });
                Err(err)
            }
        }
    }

    fn from_inner(ptr: NonNull<KobjInner<T>>) -> Self {
        Self {
            ptr,
            _owns: PhantomData,
        }
    }

    fn inner(&self) -> &KobjInner<T> {
        // SAFETY: the object lives as long as any reference to it.
        unsafe { self.ptr.as_ref() }
    }

    /// Current number of references.
    pub fn refcount(this: &Self) -> usize {
        this.inner().refcount.load(Ordering::Acquire)
    }

    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        a.ptr == b.ptr
    }

    /// Address of the object, stable for its whole life.
    pub fn as_ptr(this: &Self) -> *const T {
        &this.inner().value
    }
}

impl<T: KobjClass> Clone for Kobj<T> {
    fn clone(&self) -> Self {
        self.inner().refcount.fetch_add(1, Ordering::Relaxed);
        Self::from_inner(self.ptr)
    }
}

impl<T: KobjClass> Drop for Kobj<T> {
    fn drop(&mut self) {
        if self.inner().refcount.fetch_sub(1, Ordering::Release) != 1 {
            return;
        }
        atomic::fence(Ordering::Acquire);

        log::trace!("kobj: destroying {} at {:p}", T::NAME, self.ptr);
        self.inner().value.destroy();
        // SAFETY: this was the last reference; the memory came from a Box.
        drop(unsafe { Box::from_raw(self.ptr.as_ptr()) });
    }
}

impl<T: KobjClass> Deref for Kobj<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner().value
    }
}

impl<T: KobjClass> fmt::Debug for Kobj<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}@{:p}", T::NAME, self.ptr)
    }
}
