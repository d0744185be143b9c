//! # The Nexus
//!
//! The Inter-Process Communication core.
//! Every service, driver and filesystem talks to every other exclusively
//! through the Nexus.
//!
//! ## Architecture
//! - A [`Phone`] is a task's outbound connection slot. It connects once to
//!   an [`Answerbox`] and then carries asynchronous [`Call`]s into it;
//!   answers return to the caller's own answerbox.
//! - An [`IpcBuffer`] receives byte [`Message`]s written through any number
//!   of [`Endpoint`]s. Endpoints reach their buffer through a [`WeakRef`],
//!   so either side may be destroyed first.
//! - An [`IpcBlob`] is an immutable chunk of bytes handed between tasks like
//!   any other capability.
//! - Objects are reference counted ([`Kobj`](crate::mana_pool::Kobj)) and
//!   named by per-task capability handles ([`Task`]).
//!
//! ## Lock order
//! Phone mutex, then answerbox spinlock. Final puts of kernel objects happen
//! after the locks of the object being put are released.

pub mod answerbox;
pub mod blob;
pub mod buffer;
pub mod call;
pub mod endpoint;
pub mod message;
pub mod phone;
pub mod task;
pub mod weakref;


pub use answerbox::Answerbox;
pub use blob::IpcBlob;
pub use buffer::IpcBuffer;
pub use call::{ipc_answer, ipc_call_async, Call, CallFlags, CallId, IpcData};
pub use endpoint::Endpoint;
pub use message::{Message, MessageFlags};
pub use phone::{PendingConnect, Phone, PhoneState};
pub use task::{Task, TaskId};
pub use weakref::{WeakRef, WeakRefGuard};

use crate::loom_of_fate::WaitError;
use crate::mana_pool::CapabilityError;
use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpcError {
    /// An object cache is exhausted
    NoMemory,
    /// Too many unanswered calls on the phone, or no room in the buffer
    LimitExceeded,
    /// The object is not in a state that allows the operation
    InvalidState,
    /// The other side is gone
    Hangup,
    /// The phone has not been connected yet
    NotConnected,
    /// A message or length limit is larger than allowed
    TooLarge,
    /// The buffer cannot set aside the requested reservation
    ReserveFailed,
    /// A read reaches past the end of the data
    OutOfRange,
    TimedOut,
    WouldBlock,
    Interrupted,
    InvalidHandle,
    WrongType,
    TableFull,
}

impl fmt::Display for IpcError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            IpcError::NoMemory => write!(f, "Out of memory"),
            IpcError::LimitExceeded => write!(f, "Limit exceeded"),
            IpcError::InvalidState => write!(f, "Invalid state"),
            IpcError::Hangup => write!(f, "Peer hung up"),
            IpcError::NotConnected => write!(f, "Phone not connected"),
            IpcError::TooLarge => write!(f, "Too large"),
            IpcError::ReserveFailed => write!(f, "Reservation failed"),
            IpcError::OutOfRange => write!(f, "Out of range"),
            IpcError::TimedOut => fmt::Display::fmt(&WaitError::TimedOut, f),
            IpcError::WouldBlock => fmt::Display::fmt(&WaitError::WouldBlock, f),
            IpcError::Interrupted => fmt::Display::fmt(&WaitError::Interrupted, f),
            IpcError::InvalidHandle => fmt::Display::fmt(&CapabilityError::InvalidHandle, f),
            IpcError::WrongType => fmt::Display::fmt(&CapabilityError::WrongType, f),
            IpcError::TableFull => fmt::Display::fmt(&CapabilityError::TableFull, f),
        }
    }
}

impl From<WaitError> for IpcError {
    fn from(err: WaitError) -> Self {
        match err {
            WaitError::TimedOut => IpcError::TimedOut,
            WaitError::WouldBlock => IpcError::WouldBlock,
            WaitError::Interrupted => IpcError::Interrupted,
        }
    }
}

impl From<CapabilityError> for IpcError {
    fn from(err: CapabilityError) -> Self {
        match err {
            CapabilityError::InvalidHandle => IpcError::InvalidHandle,
            CapabilityError::WrongType => IpcError::WrongType,
            CapabilityError::TableFull => IpcError::TableFull,
        }
    }
}
