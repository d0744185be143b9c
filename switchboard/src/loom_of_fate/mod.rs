//! # The Loom of Fate - blocking and waking
//!
//! The scheduler's thread-selection policy lives elsewhere. What the IPC
//! core needs from it is narrow: who is running, begin a wait, commit the
//! wait with an optional deadline, and wake a particular thread. That seam
//! is [`Scheduler`]; every blocking primitive here is built on it.
//!
//! ## Wait protocol
//! `thread_wait_start()` arms the current thread's wake token,
//! `thread_wakeup(t)` fires it, and `thread_wait_finish(deadline)` returns as
//! soon as the token has fired or the deadline has passed. A wakeup issued
//! between start and finish is never lost.

pub mod condvar;
pub mod fair_spin_mutex;
pub mod mutex;
pub mod semaphore;
pub mod thread;
pub mod wait_queue;

pub use condvar::CondVar;
pub use fair_spin_mutex::{FairSpinGuard, FairSpinMutex};
pub use mutex::{Mutex, MutexGuard};
pub use semaphore::Semaphore;
pub use thread::{Deadline, Scheduler, ThreadId, DEADLINE_NEVER};
pub use wait_queue::{WaitQueue, WaitQueueGuard};

use core::fmt;
use spin::Once;

static LOOM: Once<&'static dyn Scheduler> = Once::new();

/// Install the scheduler seam. Only the first call has an effect.
pub fn install(scheduler: &'static dyn Scheduler) {
    LOOM.call_once(|| scheduler);
}

fn loom() -> &'static dyn Scheduler {
    *LOOM.get().expect("loom_of_fate: no scheduler installed")
}

pub fn current_thread() -> ThreadId {
    loom().current_thread()
}

/// Arm the current thread's wake token. Returns `false` if the thread has
/// an interruption pending and must not block.
pub fn thread_wait_start() -> bool {
    loom().thread_wait_start()
}

/// Block until woken or until `deadline`. Returns `true` on timeout.
pub fn thread_wait_finish(deadline: Deadline) -> bool {
    loom().thread_wait_finish(deadline)
}

pub fn thread_wakeup(thread: ThreadId) {
    loom().thread_wakeup(thread)
}

/// Monotonic time in microseconds.
pub fn now_usec() -> u64 {
    loom().now_usec()
}

pub fn cpu_id() -> usize {
    loom().cpu_id()
}

/// Outcome of a blocking wait that did not end with the awaited event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitError {
    /// The deadline passed first.
    TimedOut,
    /// A non-blocking attempt found nothing to take.
    WouldBlock,
    /// The thread had an interruption pending.
    Interrupted,
}

impl fmt::Display for WaitError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            WaitError::TimedOut => write!(f, "Wait timed out"),
            WaitError::WouldBlock => write!(f, "Operation would block"),
            WaitError::Interrupted => write!(f, "Wait interrupted"),
        }
    }
}
