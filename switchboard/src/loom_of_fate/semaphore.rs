//! Counting semaphore over a wait queue's wakeup balance.

use super::{WaitError, WaitQueue};

pub struct Semaphore {
    queue: WaitQueue,
}

impl Semaphore {
    pub const fn new(count: usize) -> Self {
        Self {
            queue: WaitQueue::with_balance(count),
        }
    }

    /// Block until the count can be decremented.
    pub fn down(&self) {
        let rc = self.queue.sleep();
        debug_assert!(rc.is_ok(), "uninterruptible semaphore wait failed: {:?}", rc);
    }

    pub fn try_down(&self) -> Result<(), WaitError> {
        if self.queue.try_down() {
            Ok(())
        } else {
            Err(WaitError::WouldBlock)
        }
    }

    /// Like [`down`](Self::down) but gives up after `usec` microseconds.
    /// With `usec == 0` this never blocks and reports
    /// [`WaitError::TimedOut`] rather than `WouldBlock`.
    pub fn down_timeout(&self, usec: u64) -> Result<(), WaitError> {
        self.queue.sleep_timeout(usec)
    }

    pub fn up(&self) {
        self.queue.wake_one();
    }

    /// Number of `down` calls that would currently succeed without blocking.
    pub fn count_get(&self) -> usize {
        self.queue.count_get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loom_of_fate::now_usec;
    use crate::mock;
    use std::sync::Arc;

    #[test]
    fn test_down_timeout_zero_returns_immediately() {
        mock::install();
        let sem = Semaphore::new(0);
        let start = now_usec();
        assert_eq!(sem.down_timeout(0), Err(WaitError::TimedOut));
        // Non-blocking: far below any scheduler tick.
        assert!(now_usec() - start < 100_000);
        assert_eq!(sem.count_get(), 0);
    }

    #[test]
    fn test_try_down_distinguishes_would_block() {
        mock::install();
        let sem = Semaphore::new(1);
        assert_eq!(sem.try_down(), Ok(()));
        assert_eq!(sem.try_down(), Err(WaitError::WouldBlock));
        sem.up();
        assert_eq!(sem.count_get(), 1);
    }

    #[test]
    fn test_up_wakes_blocked_down() {
        mock::install();
        let sem = Arc::new(Semaphore::new(0));
        let sem_c = Arc::clone(&sem);
        let waiter = mock::spawn(move || sem_c.down_timeout(5_000_000));
        mock::pause(20);
        sem.up();
        assert_eq!(waiter.join().unwrap(), Ok(()));
        assert_eq!(sem.count_get(), 0);
    }
}
