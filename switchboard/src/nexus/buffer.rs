//! IPC buffers - bounded byte queues fed by endpoints
//!
//! A buffer owns a byte budget (`size`). Every queued message is charged
//! its [`Message::size`] against the budget until it is read. Endpoints may
//! set part of the budget aside as a reservation, so that their next write
//! cannot fail for lack of space; one maximum-length message worth of space
//! is never reservable.
//!
//! Endpoints reach the buffer through a [`WeakRef`]. The buffer's destroy
//! hook destroys that reference, which waits for every writer still inside
//! the buffer, before any queued message is dropped.

use super::message::{Message, MessageFlags};
use super::weakref::WeakRef;
use super::IpcError;
use crate::loom_of_fate::{Deadline, WaitError, WaitQueue};
use crate::mana_pool::slab::{FrameFlags, SlabObject, IPC_BUFFER_CACHE};
use crate::mana_pool::{IrqSpinlock, Kobj, KobjClass};
use alloc::collections::VecDeque;

struct BufferState {
    /// Queued messages with the bytes charged for each.
    messages: VecDeque<(Message, usize)>,
    used: usize,
    reserved: usize,
    destroyed: bool,
    /// Handed out to endpoints; taken by the destroy hook.
    weakref: Option<WeakRef<IpcBuffer>>,
}

impl BufferState {
    fn free(&self, size: usize) -> usize {
        size.saturating_sub(self.used + self.reserved)
    }
}

pub struct IpcBuffer {
    size: usize,
    /// Largest message accepted, header included.
    max_message_len: usize,
    state: IrqSpinlock<BufferState>,
    /// Holds one token: only one reader at a time.
    read_queue: WaitQueue,
    /// One wakeup per queued message.
    readable: WaitQueue,
    _slot: SlabObject,
}

impl KobjClass for IpcBuffer {
    const NAME: &'static str = "ipc_buffer";

    fn destroy(&self) {
        let (weakref, messages) = {
            let mut state = self.state.lock();
            state.destroyed = true;
            (
                state.weakref.take(),
                core::mem::take(&mut state.messages),
            )
        };
        log::debug!("ipc_buffer: destroying, {} messages unread", messages.len());

        self.readable.close();
        self.read_queue.close();

        // Writers still inside the buffer finish before anything goes away.
        if let Some(weakref) = weakref {
            weakref.destroy();
        }
        drop(messages);
    }
}

impl IpcBuffer {
    /// New buffer of `size` bytes taking messages of up to
    /// `max_message_len` payload bytes.
    ///
    /// # Returns
    /// * `Err(TooLarge)` - a maximum-length message would not fit
    pub fn create(size: usize, max_message_len: usize) -> Result<Kobj<IpcBuffer>, IpcError> {
        let max_message_len = max_message_len
            .checked_add(Message::HEADER)
            .ok_or(IpcError::TooLarge)?;
        if max_message_len > size {
            return Err(IpcError::TooLarge);
        }

        let slot = IPC_BUFFER_CACHE.alloc(FrameFlags::empty())?;
        Kobj::try_new_cyclic::<IpcError, _>(|this| {
            // SAFETY: the destroy hook destroys the weak reference before the
            // buffer's memory is released.
            let weakref = unsafe { WeakRef::create(this)? };
            Ok(IpcBuffer {
                size,
                max_message_len,
                state: IrqSpinlock::new(
                    BufferState {
                        messages: VecDeque::new(),
                        used: 0,
                        reserved: 0,
                        destroyed: false,
                        weakref: Some(weakref),
                    },
                    "ipc_buffer_t::lock",
                ),
                read_queue: WaitQueue::with_balance(1),
                readable: WaitQueue::new(),
                _slot: slot,
            })
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn max_message_len(&self) -> usize {
        self.max_message_len
    }

    /// Bytes charged for queued messages.
    pub fn used(&self) -> usize {
        self.state.lock().used
    }

    pub fn reserved(&self) -> usize {
        self.state.lock().reserved
    }

    pub fn queued(&self) -> usize {
        self.state.lock().messages.len()
    }

    pub(crate) fn weakref(&self) -> Result<WeakRef<IpcBuffer>, IpcError> {
        self.state.lock().weakref.clone().ok_or(IpcError::Hangup)
    }

    /// Next message, sleeping until `deadline`.
    ///
    /// # Returns
    /// * `Err(Hangup)` - the buffer is being destroyed
    /// * `Err(TimedOut)` - nothing arrived before `deadline`
    pub fn read(&self, deadline: Deadline) -> Result<Message, IpcError> {
        self.read_with(|queue| queue.sleep_until(deadline))
    }

    /// Next message if one is queued, `Err(WouldBlock)` otherwise.
    pub fn try_read(&self) -> Result<Message, IpcError> {
        self.read_with(|queue| match queue.sleep_timeout(0) {
            Err(WaitError::TimedOut) => Err(WaitError::WouldBlock),
            other => other,
        })
    }

    fn read_with(&self, sleep: impl Fn(&WaitQueue) -> Result<(), WaitError>) -> Result<Message, IpcError> {
        sleep(&self.read_queue)?;
        let result = self.read_locked(&sleep);
        self.read_queue.wake_one();
        result
    }

    fn read_locked(&self, sleep: &impl Fn(&WaitQueue) -> Result<(), WaitError>) -> Result<Message, IpcError> {
        loop {
            sleep(&self.readable)?;

            let mut state = self.state.lock();
            if state.destroyed {
                return Err(IpcError::Hangup);
            }
            if let Some((message, charged)) = state.messages.pop_front() {
                state.used -= charged;
                return Ok(message);
            }
        }
    }

    /// Set `bytes` of the budget aside for one endpoint.
    pub(crate) fn reserve(&self, bytes: usize) -> Result<(), IpcError> {
        let mut state = self.state.lock();
        if state.destroyed {
            return Err(IpcError::Hangup);
        }
        let reservable = state.free(self.size).saturating_sub(self.max_message_len);
        if bytes > reservable {
            return Err(IpcError::ReserveFailed);
        }
        state.reserved += bytes;
        Ok(())
    }

    /// Queue a message written through an endpoint holding `reservation`
    /// bytes. The reservation is spent only if the message is queued.
    pub(crate) fn push(&self, message: Message, reservation: usize) -> Result<(), IpcError> {
        let needed = message.size();
        let mut state = self.state.lock();

        let rejected = if state.destroyed {
            Some((IpcError::Hangup, message))
        } else if state.free(self.size) + reservation < needed {
            Some((IpcError::LimitExceeded, message))
        } else {
            state.reserved -= reservation;
            state.used += needed;
            state.messages.push_back((message, needed));
            None
        };
        drop(state);

        if let Some((err, message)) = rejected {
            drop(message);
            return Err(err);
        }
        self.readable.wake_one();
        Ok(())
    }

    /// An endpoint went away: return its reservation and tell the reader.
    pub(crate) fn endpoint_dropped(&self, endpoint_tag: usize, reservation: usize) {
        let mut flags = MessageFlags::OBJECT_DROPPED;
        if reservation > 0 {
            flags |= MessageFlags::RESERVATION_RELEASED;
        }
        let notice = Message::automatic(endpoint_tag, flags);

        let mut state = self.state.lock();
        if state.destroyed {
            return;
        }
        state.reserved -= reservation;
        // Kernel notices are not charged against the budget.
        state.messages.push_back((notice, 0));
        drop(state);

        self.readable.wake_one();
    }
}
