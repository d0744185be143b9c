//! Fair spin mutex
//!
//! The lock underneath every [`IrqSpinlock`](crate::mana_pool::IrqSpinlock).
//! Holding it keeps interrupts disabled on the holding CPU; the saved level
//! comes back when the guard drops.
//!
//! Two variants share one contract. With the `smp` feature the ticket variant
//! is exported: contenders are served strictly in arrival order, and the
//! number of contenders is bounded by the 16-bit ticket space. Exceeding
//! [`MAX_WAITING`] is a design-limit violation and panics. Without `smp`,
//! disabling interrupts is already exclusion and the lock only tracks that it
//! is held.

#[cfg(feature = "smp")]
pub use ticket::{FairSpinGuard, FairSpinMutex};
#[cfg(not(feature = "smp"))]
pub use uniprocessor::{FairSpinGuard, FairSpinMutex};

/// Maximum number of CPUs that may be queued on one fair spin mutex.
pub const MAX_WAITING: u16 = u16::MAX / 2;

pub mod ticket {
    use super::MAX_WAITING;
    use crate::attunement::IplGuard;
    use crate::loom_of_fate;
    use core::hint::spin_loop;
    use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

    const TICKET_SHIFT: u32 = 16;
    const TICKET_INC: u32 = 1 << TICKET_SHIFT;
    const TICKET_MASK: u32 = 0xffff_0000;
    const GATE_MASK: u32 = 0x0000_ffff;

    /// Owner slot value while nobody holds the lock.
    const NO_OWNER: usize = usize::MAX;

    #[inline]
    fn gate(ticketgate: u32) -> u16 {
        (ticketgate & GATE_MASK) as u16
    }

    #[inline]
    fn ticket(ticketgate: u32) -> u16 {
        (ticketgate >> TICKET_SHIFT) as u16
    }

    /// CPUs holding or waiting for the lock.
    #[inline]
    fn cpus_waiting(ticketgate: u32) -> u16 {
        ticket(ticketgate).wrapping_sub(gate(ticketgate))
    }

    /// Ticket lock. The gate (low half) is the ticket being served, the
    /// ticket (high half) is the next one to hand out. Both wrap.
    pub struct FairSpinMutex {
        ticketgate: AtomicU32,
        owner: AtomicUsize,
        name: &'static str,
    }

    impl FairSpinMutex {
        pub const fn new(name: &'static str) -> Self {
            Self::with_ticketgate(0, name)
        }

        const fn with_ticketgate(ticketgate: u32, name: &'static str) -> Self {
            Self {
                ticketgate: AtomicU32::new(ticketgate),
                owner: AtomicUsize::new(NO_OWNER),
                name,
            }
        }

        pub fn name(&self) -> &'static str {
            self.name
        }

        /// Spin until the lock is ours.
        ///
        /// # Panics
        ///
        /// When more than [`MAX_WAITING`] CPUs are queued on this lock.
        pub fn lock(&self) -> FairSpinGuard<'_> {
            let ipl = IplGuard::disable();
            debug_assert!(!self.is_owned(), "fair spin mutex {} locked recursively", self.name);

            let mut ticketgate = self.ticketgate.fetch_add(TICKET_INC, Ordering::Acquire);
            let my_ticket = ticket(ticketgate);

            if cpus_waiting(ticketgate) > MAX_WAITING {
                panic!(
                    "Too many processors locking fair mutex {} at the same time",
                    self.name
                );
            }

            while gate(ticketgate) != my_ticket {
                spin_loop();
                ticketgate = self.ticketgate.load(Ordering::Acquire);
            }

            self.owner.store(loom_of_fate::cpu_id(), Ordering::Relaxed);
            FairSpinGuard { mutex: self, _ipl: ipl }
        }

        /// Take the lock only if nobody holds it or waits for it.
        pub fn try_lock(&self) -> Option<FairSpinGuard<'_>> {
            let ipl = IplGuard::disable();

            let ticketgate = self.ticketgate.load(Ordering::Relaxed);
            if gate(ticketgate) != ticket(ticketgate) {
                return None;
            }

            self.ticketgate
                .compare_exchange(
                    ticketgate,
                    ticketgate.wrapping_add(TICKET_INC),
                    Ordering::Acquire,
                    Ordering::Relaxed,
                )
                .ok()?;

            self.owner.store(loom_of_fate::cpu_id(), Ordering::Relaxed);
            Some(FairSpinGuard { mutex: self, _ipl: ipl })
        }

        pub fn is_locked(&self) -> bool {
            let ticketgate = self.ticketgate.load(Ordering::Relaxed);
            gate(ticketgate) != ticket(ticketgate)
        }

        /// Whether the current CPU holds the lock.
        pub fn is_owned(&self) -> bool {
            self.is_locked() && self.owner.load(Ordering::Relaxed) == loom_of_fate::cpu_id()
        }

        fn unlock(&self) {
            self.owner.store(NO_OWNER, Ordering::Relaxed);

            // Only the holder moves the gate, so the gate read here is stable.
            let ticketgate = self.ticketgate.load(Ordering::Relaxed);
            if gate(ticketgate) < u16::MAX {
                self.ticketgate.fetch_add(1, Ordering::Release);
                return;
            }

            // Gate wraps to zero; the ticket half may still be moving.
            let mut current = ticketgate;
            while let Err(actual) = self.ticketgate.compare_exchange_weak(
                current,
                current & TICKET_MASK,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                current = actual;
            }
        }
    }

    /// Holds the lock and the saved interrupt level. Field order matters:
    /// the lock is released in `drop`, the level restored after.
    #[must_use = "the lock is released as soon as the guard is dropped"]
    pub struct FairSpinGuard<'a> {
        mutex: &'a FairSpinMutex,
        _ipl: IplGuard,
    }

    impl Drop for FairSpinGuard<'_> {
        fn drop(&mut self) {
            self.mutex.unlock();
        }
    }

}

pub mod uniprocessor {
    use crate::attunement::IplGuard;
    use core::sync::atomic::{AtomicBool, Ordering};

    /// With a single CPU, disabled interrupts are exclusion enough.
    pub struct FairSpinMutex {
        locked: AtomicBool,
        name: &'static str,
    }

    impl FairSpinMutex {
        pub const fn new(name: &'static str) -> Self {
            Self {
                locked: AtomicBool::new(false),
                name,
            }
        }

        pub fn name(&self) -> &'static str {
            self.name
        }

        pub fn lock(&self) -> FairSpinGuard<'_> {
            let ipl = IplGuard::disable();
            debug_assert!(!self.is_locked(), "fair spin mutex {} locked recursively", self.name);
            self.locked.store(true, Ordering::Relaxed);
            FairSpinGuard { mutex: self, _ipl: ipl }
        }

        /// Always succeeds.
        pub fn try_lock(&self) -> Option<FairSpinGuard<'_>> {
            Some(self.lock())
        }

        pub fn is_locked(&self) -> bool {
            self.locked.load(Ordering::Relaxed)
        }

        pub fn is_owned(&self) -> bool {
            self.is_locked()
        }
    }

    #[must_use = "the lock is released as soon as the guard is dropped"]
    pub struct FairSpinGuard<'a> {
        mutex: &'a FairSpinMutex,
        _ipl: IplGuard,
    }

    impl Drop for FairSpinGuard<'_> {
        fn drop(&mut self) {
            self.mutex.locked.store(false, Ordering::Relaxed);
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::attunement::interrupts_disabled;
        use crate::mock;

        #[test]
        fn test_try_lock_always_succeeds_when_free() {
            mock::install();
            let mutex = FairSpinMutex::new("up");
            {
                let guard = mutex.try_lock();
                assert!(guard.is_some());
                assert!(interrupts_disabled());
                assert!(mutex.is_owned());
            }
            assert!(!mutex.is_locked());
            assert!(!interrupts_disabled());
        }
    }
}
