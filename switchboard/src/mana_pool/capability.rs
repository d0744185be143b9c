//! Capability handles - what userspace holds instead of pointers

use core::fmt;
use core::hash::{Hash, Hasher};
use core::marker::PhantomData;

/// Untyped handle into a task's capability table.
///
/// A slot index plus the generation the slot had when the handle was issued;
/// a handle outlives its capability only as a stale, rejected value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CapHandle {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl CapHandle {
    /// Userspace representation. Never zero.
    pub fn raw(&self) -> u64 {
        ((self.generation as u64) << 32) | (self.index as u64 + 1)
    }

    pub fn from_raw(raw: u64) -> Option<Self> {
        let index = (raw & 0xffff_ffff) as u32;
        if index == 0 {
            return None;
        }
        Some(Self {
            index: index - 1,
            generation: (raw >> 32) as u32,
        })
    }
}

impl fmt::Display for CapHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "cap#{:#x}", self.raw())
    }
}

/// Handle to a capability of a known object kind.
pub struct Handle<T> {
    raw: CapHandle,
    _kind: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    pub(crate) fn new(raw: CapHandle) -> Self {
        Self {
            raw,
            _kind: PhantomData,
        }
    }

    /// Forget the kind.
    pub fn untyped(&self) -> CapHandle {
        self.raw
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl<T> Eq for Handle<T> {}

impl<T> Hash for Handle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.raw.hash(state)
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Handle({})", self.raw)
    }
}

impl<T> From<Handle<T>> for CapHandle {
    fn from(handle: Handle<T>) -> Self {
        handle.raw
    }
}
