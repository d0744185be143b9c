//! Wait queue - the sleep primitive under every blocking operation
//!
//! A wait queue is a FIFO of sleeping threads plus a wakeup balance. A wakeup
//! that finds nobody asleep can be banked ([`WaitQueue::wake_one`]) so that
//! the next sleeper returns at once; semaphores are exactly this balance.
//! A closed queue never blocks again.
//!
//! A sleeper owns a ticket in the queue. Wakers dequeue the ticket under the
//! queue lock before waking the thread, so a sleeper that finds its ticket
//! gone was woken, even if its own deadline passed at the same moment.

use super::{current_thread, thread_wait_finish, thread_wait_start, thread_wakeup};
use super::{Deadline, ThreadId, WaitError, DEADLINE_NEVER};
use crate::mana_pool::interrupt_lock::{IrqSpinlock, IrqSpinlockGuard};
use alloc::collections::VecDeque;

struct Sleeper {
    thread: ThreadId,
    ticket: u64,
}

struct WaitQueueState {
    /// Wakeups that found no sleeper and will satisfy future ones.
    wakeup_balance: usize,
    sleepers: VecDeque<Sleeper>,
    next_ticket: u64,
    closed: bool,
}

pub struct WaitQueue {
    state: IrqSpinlock<WaitQueueState>,
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl WaitQueue {
    pub const fn new() -> Self {
        Self::with_balance(0)
    }

    /// A queue whose first `count` sleeps return without blocking.
    pub const fn with_balance(count: usize) -> Self {
        Self {
            state: IrqSpinlock::new(
                WaitQueueState {
                    wakeup_balance: count,
                    sleepers: VecDeque::new(),
                    next_ticket: 0,
                    closed: false,
                },
                "wait_queue",
            ),
        }
    }

    /// Lock the queue in preparation for sleeping.
    ///
    /// The returned guard keeps the queue locked (and interrupts disabled)
    /// until it is turned into a sleep. Anything the caller releases in
    /// between cannot race with a wakeup aimed at this queue.
    pub fn sleep_prepare(&self) -> WaitQueueGuard<'_> {
        WaitQueueGuard {
            queue: self,
            state: self.state.lock(),
        }
    }

    /// Sleep with no time limit.
    pub fn sleep(&self) -> Result<(), WaitError> {
        self.sleep_prepare().sleep_until(DEADLINE_NEVER)
    }

    /// Sleep for at most `usec` microseconds. Zero never blocks.
    pub fn sleep_timeout(&self, usec: u64) -> Result<(), WaitError> {
        self.sleep_prepare().sleep_timeout(usec)
    }

    pub fn sleep_until(&self, deadline: Deadline) -> Result<(), WaitError> {
        self.sleep_prepare().sleep_until(deadline)
    }

    /// Consume one banked wakeup without sleeping. A closed queue always
    /// succeeds.
    pub fn try_down(&self) -> bool {
        let mut state = self.state.lock();
        if state.closed {
            return true;
        }
        if state.wakeup_balance > 0 {
            state.wakeup_balance -= 1;
            return true;
        }
        false
    }

    /// Wake the first sleeper, or bank the wakeup if nobody sleeps.
    pub fn wake_one(&self) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        if !Self::wake_first(&mut state) {
            state.wakeup_balance += 1;
        }
    }

    /// Wake the first sleeper if there is one. Never banks.
    pub fn signal(&self) {
        let mut state = self.state.lock();
        Self::wake_first(&mut state);
    }

    /// Wake every sleeper and forget banked wakeups.
    pub fn wake_all(&self) {
        let mut state = self.state.lock();
        state.wakeup_balance = 0;
        Self::wake_everyone(&mut state);
    }

    /// Wake every sleeper; from now on nobody blocks on this queue.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.wakeup_balance = 0;
        state.closed = true;
        Self::wake_everyone(&mut state);
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Number of sleeps that would currently succeed without blocking.
    pub fn count_get(&self) -> usize {
        self.state.lock().wakeup_balance
    }

    pub fn count_set(&self, count: usize) {
        self.state.lock().wakeup_balance = count;
    }

    pub fn sleeper_count(&self) -> usize {
        self.state.lock().sleepers.len()
    }

    fn wake_first(state: &mut WaitQueueState) -> bool {
        match state.sleepers.pop_front() {
            Some(sleeper) => {
                thread_wakeup(sleeper.thread);
                true
            }
            None => false,
        }
    }

    fn wake_everyone(state: &mut WaitQueueState) {
        while Self::wake_first(state) {}
    }
}

/// A locked wait queue, about to be slept on.
pub struct WaitQueueGuard<'a> {
    queue: &'a WaitQueue,
    state: IrqSpinlockGuard<'a, WaitQueueState>,
}

impl WaitQueueGuard<'_> {
    pub fn sleep(self) -> Result<(), WaitError> {
        self.block(DEADLINE_NEVER, false)
    }

    /// Zero microseconds means "do not block at all".
    pub fn sleep_timeout(self, usec: u64) -> Result<(), WaitError> {
        if usec == 0 {
            return self.block(DEADLINE_NEVER, true);
        }
        self.block(Deadline::after_usec(usec), false)
    }

    pub fn sleep_until(self, deadline: Deadline) -> Result<(), WaitError> {
        self.block(deadline, false)
    }

    fn block(self, deadline: Deadline, non_blocking: bool) -> Result<(), WaitError> {
        let WaitQueueGuard { queue, mut state } = self;

        if state.closed {
            return Ok(());
        }
        if state.wakeup_balance > 0 {
            state.wakeup_balance -= 1;
            return Ok(());
        }
        if non_blocking {
            return Err(WaitError::TimedOut);
        }
        if !thread_wait_start() {
            return Err(WaitError::Interrupted);
        }

        let ticket = state.next_ticket;
        state.next_ticket = state.next_ticket.wrapping_add(1);
        state.sleepers.push_back(Sleeper {
            thread: current_thread(),
            ticket,
        });

        loop {
            drop(state);
            let timed_out = thread_wait_finish(deadline);
            state = queue.state.lock();

            let Some(position) = state.sleepers.iter().position(|s| s.ticket == ticket) else {
                // Dequeued by a waker.
                return Ok(());
            };

            if timed_out {
                state.sleepers.remove(position);
                return Err(WaitError::TimedOut);
            }

            // Spurious wakeup: re-arm while still queued.
            if !thread_wait_start() {
                state.sleepers.remove(position);
                return Err(WaitError::Interrupted);
            }
        }
    }
}
