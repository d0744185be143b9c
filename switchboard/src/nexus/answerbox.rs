//! Answerboxes - a task's inbound queue of calls and answers

use super::call::{answer_undelivered, ipc_answer, Call, IpcData};
use super::phone::{Phone, PhoneState};
use super::task::TaskId;
use super::IpcError;
use crate::loom_of_fate::{Deadline, WaitError, WaitQueue};
use crate::mana_pool::slab::{FrameFlags, SlabObject, ANSWERBOX_CACHE};
use crate::mana_pool::{IrqSpinlock, IrqSpinlockGuard, Kobj, KobjClass};
use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::vec::Vec;

pub(crate) struct AnswerboxState {
    /// Cleared once, by `deactivate`. An inactive box accepts no phones
    /// and no calls.
    pub(crate) active: bool,
    /// One reference per connected phone.
    pub(crate) connected_phones: VecDeque<Kobj<Phone>>,
    calls: VecDeque<Box<Call>>,
    answers: VecDeque<Box<Call>>,
    /// Calls handed to the owner and not answered yet.
    dispatched: usize,
}

impl AnswerboxState {
    /// Take `phone` off the connected list, returning the list's reference.
    pub(crate) fn unlink(&mut self, phone: &Kobj<Phone>) -> Option<Kobj<Phone>> {
        let position = self
            .connected_phones
            .iter()
            .position(|connected| Kobj::ptr_eq(connected, phone))?;
        self.connected_phones.remove(position)
    }
}

pub struct Answerbox {
    owner: TaskId,
    state: IrqSpinlock<AnswerboxState>,
    /// One wakeup per queued call or answer.
    queue: WaitQueue,
    _slot: SlabObject,
}

impl KobjClass for Answerbox {
    const NAME: &'static str = "answerbox";

    fn destroy(&self) {
        self.deactivate();
    }
}

impl Answerbox {
    pub fn new(owner: TaskId) -> Result<Kobj<Answerbox>, IpcError> {
        let slot = ANSWERBOX_CACHE.alloc(FrameFlags::empty())?;
        Ok(Kobj::new(Answerbox {
            owner,
            state: IrqSpinlock::new(
                AnswerboxState {
                    active: true,
                    connected_phones: VecDeque::new(),
                    calls: VecDeque::new(),
                    answers: VecDeque::new(),
                    dispatched: 0,
                },
                "answerbox_t::lock",
            ),
            queue: WaitQueue::new(),
            _slot: slot,
        }))
    }

    pub(crate) fn lock_state(&self) -> IrqSpinlockGuard<'_, AnswerboxState> {
        self.state.lock()
    }

    pub fn owner(&self) -> TaskId {
        self.owner
    }

    pub fn is_active(&self) -> bool {
        self.state.lock().active
    }

    pub fn connected_count(&self) -> usize {
        self.state.lock().connected_phones.len()
    }

    pub fn is_connected(&self, phone: &Kobj<Phone>) -> bool {
        self.state
            .lock()
            .connected_phones
            .iter()
            .any(|connected| Kobj::ptr_eq(connected, phone))
    }

    /// Calls waiting to be picked up.
    pub fn pending_calls(&self) -> usize {
        self.state.lock().calls.len()
    }

    /// Calls picked up and not answered yet.
    pub fn dispatched_calls(&self) -> usize {
        self.state.lock().dispatched
    }

    /// Queue a request. An inactive box hands the call back.
    pub(crate) fn enqueue_call(&self, call: Box<Call>) -> Result<(), Box<Call>> {
        let mut state = self.state.lock();
        if !state.active {
            return Err(call);
        }
        log::trace!("answerbox: call {:?} queued for {}", call.id(), self.owner);
        state.calls.push_back(call);
        drop(state);

        self.queue.wake_one();
        Ok(())
    }

    /// Queue an answer. An inactive box drops it.
    pub(crate) fn enqueue_answer(&self, call: Box<Call>) {
        let mut state = self.state.lock();
        if !state.active {
            drop(state);
            log::debug!("answerbox: owner {} gone, dropping answer", self.owner);
            drop(call);
            return;
        }
        state.answers.push_back(call);
        drop(state);

        self.queue.wake_one();
    }

    /// Next answer, or else next call, sleeping until `deadline`.
    ///
    /// # Returns
    /// * `Err(Hangup)` - the box is deactivated and drained
    /// * `Err(TimedOut)` - nothing arrived before `deadline`
    /// * `Err(Interrupted)` - the sleep was interrupted
    pub fn wait_for_call(&self, deadline: Deadline) -> Result<Box<Call>, IpcError> {
        self.wait(|queue| queue.sleep_until(deadline))
    }

    /// Like [`wait_for_call`](Self::wait_for_call), never sleeping.
    pub fn try_wait_for_call(&self) -> Result<Box<Call>, IpcError> {
        self.wait(|queue| match queue.sleep_timeout(0) {
            Err(WaitError::TimedOut) => Err(WaitError::WouldBlock),
            other => other,
        })
    }

    fn wait(&self, sleep: impl Fn(&WaitQueue) -> Result<(), WaitError>) -> Result<Box<Call>, IpcError> {
        loop {
            {
                let state = self.state.lock();
                if !state.active && state.calls.is_empty() && state.answers.is_empty() {
                    return Err(IpcError::Hangup);
                }
            }

            sleep(&self.queue)?;

            let mut state = self.state.lock();
            if let Some(answer) = state.answers.pop_front() {
                return Ok(answer);
            }
            if let Some(call) = state.calls.pop_front() {
                if !call.is_hangup() {
                    state.dispatched += 1;
                }
                return Ok(call);
            }
            // Woken by deactivation with nothing queued.
        }
    }

    /// Answer a call picked up from this box.
    pub fn answer(&self, call: Box<Call>, reply: IpcData) {
        ipc_answer(self, call, reply);
    }

    pub(crate) fn dispatch_done(&self) {
        let mut state = self.state.lock();
        state.dispatched = state.dispatched.saturating_sub(1);
    }

    /// Disconnect `phone` from this box. `false` if it was not connected
    /// here (it hung up or was slammed first).
    pub fn slam(&self, phone: &Kobj<Phone>) -> bool {
        let mut inner = phone.lock_inner();
        let unlinked = {
            let mut state = self.state.lock();
            state.unlink(phone)
        };
        let Some(unlinked) = unlinked else {
            return false;
        };

        debug_assert_eq!(inner.state, PhoneState::Connected);
        inner.state = PhoneState::Slammed;
        let callee = inner.callee.take();
        drop(inner);

        log::debug!("answerbox: slammed {:?}", phone);
        drop(unlinked);
        drop(callee);
        true
    }

    /// Refuse everything from now on. Every connected phone is slammed and
    /// every pending call is answered with `Hangup`. Idempotent.
    pub fn deactivate(&self) {
        let was_active = core::mem::replace(&mut self.state.lock().active, false);
        if was_active {
            log::debug!("answerbox: deactivating box of {}", self.owner);
        }

        // Phone lock comes first, so take a snapshot of the front phone,
        // drop the box lock and slam through the phone.
        loop {
            let front = self.state.lock().connected_phones.front().cloned();
            let Some(phone) = front else {
                break;
            };
            self.slam(&phone);
        }

        let (calls, answers) = {
            let mut state = self.state.lock();
            state.dispatched = 0;
            (
                core::mem::take(&mut state.calls),
                core::mem::take(&mut state.answers),
            )
        };
        // Closed rather than woken: a waiter between its active check and
        // its sleep must not block either.
        self.queue.close();

        for call in calls {
            answer_undelivered(call, IpcError::Hangup);
        }
        drop(answers);
    }

    /// Console dump of the box and its connected phones.
    pub fn print_state(&self) {
        let (active, phones, calls, answers, dispatched) = {
            let state = self.state.lock();
            let phones: Vec<Kobj<Phone>> = state.connected_phones.iter().cloned().collect();
            (
                state.active,
                phones,
                state.calls.len(),
                state.answers.len(),
                state.dispatched,
            )
        };
        crate::kprintln!(
            "answerbox of {}: active={} calls={} dispatched={} answers={}",
            self.owner,
            active,
            calls,
            dispatched,
            answers
        );
        for phone in &phones {
            crate::kprintln!("  connected: {:?} from {}", phone, phone.caller());
        }
    }
}
