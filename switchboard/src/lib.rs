//! # Switchboard - the IPC core of the Heartwood
//!
//! Tasks talk to each other only through this crate. A task holds capability
//! handles to kernel objects (phones, answerboxes, IPC buffers, endpoints);
//! a phone connects once to an answerbox and carries asynchronous calls into
//! it, replies travel back to the caller's own answerbox. Buffers and
//! endpoints form the byte-message path, where endpoints reach their buffer
//! through a weak reference so that either side can be torn down first.
//!
//! The platform is consumed through narrow seams installed at boot:
//! [`attunement::InterruptController`], [`loom_of_fate::Scheduler`] and
//! [`console::ConsoleSink`].

#![cfg_attr(not(test), no_std)]

extern crate alloc;

#[macro_use]
pub mod console;

pub mod attunement;
pub mod config;
pub mod loom_of_fate;
pub mod mana_pool;
pub mod nexus;

#[cfg(test)]
mod mock;

// Re-export key types
pub use loom_of_fate::{Deadline, ThreadId, WaitError, DEADLINE_NEVER};
pub use mana_pool::{CapHandle, CapabilityError, Handle, KernelObject, Kobj};
pub use nexus::{Answerbox, Call, Endpoint, IpcBlob, IpcBuffer, IpcData, IpcError, Message, Phone, Task};
