//! Threads as the blocking primitives see them.

use core::fmt;

/// A unique identifier for a thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadId(pub u64);

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "thread#{}", self.0)
    }
}

/// Absolute point in time (microseconds on the scheduler clock) at which a
/// wait gives up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Deadline {
    At(u64),
    Never,
}

/// Wait without a time limit.
pub const DEADLINE_NEVER: Deadline = Deadline::Never;

impl Deadline {
    /// A deadline `usec` microseconds from now.
    pub fn after_usec(usec: u64) -> Self {
        Deadline::At(super::now_usec().saturating_add(usec))
    }

    pub fn has_passed(&self, now: u64) -> bool {
        match *self {
            Deadline::At(at) => now >= at,
            Deadline::Never => false,
        }
    }

    /// Microseconds left at `now`, `None` for [`Deadline::Never`].
    pub fn remaining(&self, now: u64) -> Option<u64> {
        match *self {
            Deadline::At(at) => Some(at.saturating_sub(now)),
            Deadline::Never => None,
        }
    }
}

/// The scheduler seam.
pub trait Scheduler: Sync {
    fn current_thread(&self) -> ThreadId;

    /// Arm the current thread's wake token. `false` means an interruption is
    /// pending and the caller must not block.
    fn thread_wait_start(&self) -> bool;

    /// Block until the wake token fires or `deadline` passes. Returns `true`
    /// if the deadline passed without a wakeup.
    fn thread_wait_finish(&self, deadline: Deadline) -> bool;

    fn thread_wakeup(&self, thread: ThreadId);

    fn now_usec(&self) -> u64;

    fn cpu_id(&self) -> usize;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deadline_ordering_and_expiry() {
        assert!(Deadline::At(5) < DEADLINE_NEVER);
        assert!(Deadline::At(10).has_passed(10));
        assert!(!Deadline::At(10).has_passed(9));
        assert!(!DEADLINE_NEVER.has_passed(u64::MAX));
        assert_eq!(Deadline::At(10).remaining(4), Some(6));
        assert_eq!(Deadline::At(10).remaining(40), Some(0));
        assert_eq!(DEADLINE_NEVER.remaining(0), None);
    }
}
