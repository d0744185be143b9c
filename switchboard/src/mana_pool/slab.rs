//! Object caches
//!
//! Every IPC object is drawn from a named cache. The heap does the actual
//! allocation; a cache accounts for its objects and enforces an optional
//! object limit, so that memory pressure can be provoked and observed per
//! object kind. An allocation is a [`SlabObject`] token that returns its
//! slot when dropped.
//!
//! [`FrameFlags::ATOMIC`] allocations never sleep: they fail with
//! [`IpcError::NoMemory`] when the cache is exhausted. Other allocations
//! sleep until a slot is freed.

use crate::loom_of_fate::WaitQueue;
use crate::nexus::IpcError;
use core::fmt;
use core::sync::atomic::{AtomicUsize, Ordering};

bitflags::bitflags! {
    /// Allocation behaviour
    pub struct FrameFlags: u32 {
        /// Fail instead of sleeping.
        const ATOMIC = 0b0001;
    }
}

const UNLIMITED: usize = usize::MAX;

pub struct SlabCache {
    name: &'static str,
    allocated: AtomicUsize,
    limit: AtomicUsize,
    /// Sleepers waiting for a slot to be freed.
    freed: WaitQueue,
}

impl SlabCache {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            allocated: AtomicUsize::new(0),
            limit: AtomicUsize::new(UNLIMITED),
            freed: WaitQueue::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Objects currently allocated from this cache.
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    pub fn limit(&self) -> Option<usize> {
        match self.limit.load(Ordering::Relaxed) {
            UNLIMITED => None,
            limit => Some(limit),
        }
    }

    /// Cap the number of live objects. Existing objects are never reclaimed.
    pub fn set_limit(&self, limit: Option<usize>) {
        self.limit.store(limit.unwrap_or(UNLIMITED), Ordering::Relaxed);
        // A raised limit may admit sleepers.
        self.freed.wake_all();
    }

    pub fn alloc(&'static self, flags: FrameFlags) -> Result<SlabObject, IpcError> {
        loop {
            if self.try_reserve() {
                return Ok(SlabObject { cache: self });
            }

            if flags.contains(FrameFlags::ATOMIC) {
                log::warn!("slab: cache {} exhausted ({} objects)", self.name, self.allocated());
                return Err(IpcError::NoMemory);
            }

            // Re-check under the queue lock: a free that lands after this
            // point signals a sleeper that is already queued.
            let prepared = self.freed.sleep_prepare();
            if self.has_room() {
                continue;
            }
            log::trace!("slab: waiting for a free {} object", self.name);
            let _ = prepared.sleep();
        }
    }

    fn has_room(&self) -> bool {
        self.allocated.load(Ordering::Acquire) < self.limit.load(Ordering::Relaxed)
    }

    fn try_reserve(&self) -> bool {
        let limit = self.limit.load(Ordering::Relaxed);
        let mut current = self.allocated.load(Ordering::Relaxed);
        while current < limit {
            match self.allocated.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
        false
    }

    fn free(&self) {
        self.allocated.fetch_sub(1, Ordering::AcqRel);
        self.freed.signal();
    }
}

impl fmt::Debug for SlabCache {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SlabCache")
            .field("name", &self.name)
            .field("allocated", &self.allocated())
            .field("limit", &self.limit())
            .finish()
    }
}

/// One allocated slot. Dropping it returns the slot to its cache.
pub struct SlabObject {
    cache: &'static SlabCache,
}

impl SlabObject {
    pub fn cache(&self) -> &'static SlabCache {
        self.cache
    }
}

impl Drop for SlabObject {
    fn drop(&mut self) {
        self.cache.free();
    }
}

impl fmt::Debug for SlabObject {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "SlabObject({})", self.cache.name)
    }
}

pub static CALL_CACHE: SlabCache = SlabCache::new("call_t");
pub static PHONE_CACHE: SlabCache = SlabCache::new("phone_t");
pub static ANSWERBOX_CACHE: SlabCache = SlabCache::new("answerbox_t");
pub static WEAKREF_CACHE: SlabCache = SlabCache::new("weakref_t");
pub static IPC_BUFFER_CACHE: SlabCache = SlabCache::new("ipc_buffer_t");
pub static IPC_ENDPOINT_CACHE: SlabCache = SlabCache::new("ipc_endpoint_t");
pub static IPC_BLOB_CACHE: SlabCache = SlabCache::new("ipc_blob_t");

/// Every cache used by the IPC core.
pub fn caches() -> [&'static SlabCache; 7] {
    [
        &CALL_CACHE,
        &PHONE_CACHE,
        &ANSWERBOX_CACHE,
        &WEAKREF_CACHE,
        &IPC_BUFFER_CACHE,
        &IPC_ENDPOINT_CACHE,
        &IPC_BLOB_CACHE,
    ]
}

pub fn print_caches() {
    crate::kprintln!("{:<16} {:>10} {:>10}", "cache", "allocated", "limit");
    for cache in caches() {
        match cache.limit() {
            Some(limit) => crate::kprintln!("{:<16} {:>10} {:>10}", cache.name(), cache.allocated(), limit),
            None => crate::kprintln!("{:<16} {:>10} {:>10}", cache.name(), cache.allocated(), "-"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock;

    #[test]
    fn test_atomic_alloc_fails_when_exhausted() {
        mock::install();
        static CACHE: SlabCache = SlabCache::new("test_atomic");
        CACHE.set_limit(Some(2));

        let first = CACHE.alloc(FrameFlags::ATOMIC).unwrap();
        let _second = CACHE.alloc(FrameFlags::ATOMIC).unwrap();
        assert_eq!(CACHE.alloc(FrameFlags::ATOMIC).unwrap_err(), IpcError::NoMemory);
        assert_eq!(CACHE.allocated(), 2);

        drop(first);
        assert_eq!(CACHE.allocated(), 1);
        assert!(CACHE.alloc(FrameFlags::ATOMIC).is_ok());
    }

    #[test]
    fn test_blocking_alloc_waits_for_free() {
        mock::install();
        static CACHE: SlabCache = SlabCache::new("test_blocking");
        CACHE.set_limit(Some(1));

        let held = CACHE.alloc(FrameFlags::empty()).unwrap();
        let waiter = mock::spawn(|| CACHE.alloc(FrameFlags::empty()).map(|_| ()));
        assert!(mock::wait_until(|| CACHE.freed.sleeper_count() == 1));

        drop(held);
        assert_eq!(waiter.join().unwrap(), Ok(()));
        assert_eq!(CACHE.allocated(), 0);
    }

    #[test]
    fn test_print_caches_lists_every_cache() {
        mock::install();
        print_caches();
        let output = mock::console_output();
        for cache in caches() {
            assert!(output.contains(cache.name()));
        }
    }
}
