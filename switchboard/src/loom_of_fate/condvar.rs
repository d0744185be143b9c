//! Condition variable paired with the sleeping [`Mutex`].

use super::{Deadline, Mutex, MutexGuard, WaitError, WaitQueue, DEADLINE_NEVER};

pub struct CondVar {
    queue: WaitQueue,
}

impl Default for CondVar {
    fn default() -> Self {
        Self::new()
    }
}

impl CondVar {
    pub const fn new() -> Self {
        Self {
            queue: WaitQueue::new(),
        }
    }

    /// Wake one waiter. Without waiters nothing happens and nothing is
    /// remembered for later ones.
    pub fn signal(&self) {
        self.queue.signal();
    }

    pub fn broadcast(&self) {
        self.queue.wake_all();
    }

    pub fn wait<'a, T>(&self, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
        let (guard, rc) = self.wait_until(guard, DEADLINE_NEVER);
        debug_assert!(rc.is_ok(), "uninterruptible condvar wait failed: {:?}", rc);
        guard
    }

    /// Wait for at most `usec` microseconds; zero gives up at once.
    pub fn wait_timeout<'a, T>(
        &self,
        guard: MutexGuard<'a, T>,
        usec: u64,
    ) -> (MutexGuard<'a, T>, Result<(), WaitError>) {
        let mutex = MutexGuard::mutex(&guard);
        // Registered on the queue before the mutex is released.
        let prepared = self.queue.sleep_prepare();
        drop(guard);
        let rc = prepared.sleep_timeout(usec);
        (mutex.lock(), rc)
    }

    pub fn wait_until<'a, T>(
        &self,
        guard: MutexGuard<'a, T>,
        deadline: Deadline,
    ) -> (MutexGuard<'a, T>, Result<(), WaitError>) {
        let mutex: &'a Mutex<T> = MutexGuard::mutex(&guard);
        let prepared = self.queue.sleep_prepare();
        drop(guard);
        let rc = prepared.sleep_until(deadline);
        (mutex.lock(), rc)
    }
}
