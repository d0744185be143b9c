//! Message definitions - the packets carried from endpoints into buffers

use crate::config::IPC_MESSAGE_ARGS;
use crate::mana_pool::KernelObject;
use alloc::vec::Vec;
use core::mem::size_of;

bitflags::bitflags! {
    pub struct MessageFlags: u32 {
        /// The writer broke the protocol; the reader should drop the peer.
        const PROTOCOL_ERROR       = 0b00001;
        /// The endpoint's reservation went back to the buffer.
        const RESERVATION_RELEASED = 0b00010;
        /// The endpoint the message names was destroyed.
        const OBJECT_DROPPED       = 0b00100;
        const STATUS               = 0b01000;
        /// Posted by the kernel, not by a writer.
        const AUTOMATIC            = 0b10000;
    }
}

/// A message written through an endpoint
#[derive(Debug)]
pub struct Message {
    /// Tag of the endpoint the message came through, set on write
    pub endpoint_tag: usize,

    pub flags: MessageFlags,

    pub args: [usize; IPC_MESSAGE_ARGS],

    /// Inline payload
    pub data: Vec<u8>,

    /// Capabilities travelling with the message
    pub objects: Vec<KernelObject>,
}

impl Message {
    /// Bytes every message costs on top of its payload: total length,
    /// object count, tag, then the arguments.
    pub const HEADER: usize = (3 + IPC_MESSAGE_ARGS) * size_of::<usize>();

    pub fn new(args: [usize; IPC_MESSAGE_ARGS]) -> Self {
        Self {
            endpoint_tag: 0,
            flags: MessageFlags::empty(),
            args,
            data: Vec::new(),
            objects: Vec::new(),
        }
    }

    pub fn with_data(mut self, data: &[u8]) -> Self {
        self.data.extend_from_slice(data);
        self
    }

    pub fn with_object(mut self, object: impl Into<KernelObject>) -> Self {
        self.objects.push(object.into());
        self
    }

    pub(crate) fn automatic(endpoint_tag: usize, flags: MessageFlags) -> Self {
        Self {
            endpoint_tag,
            flags: flags | MessageFlags::AUTOMATIC,
            ..Self::new([0; IPC_MESSAGE_ARGS])
        }
    }

    /// Bytes the message occupies in a buffer.
    pub fn size(&self) -> usize {
        Self::HEADER + self.data.len() + self.objects.len() * size_of::<usize>()
    }

    pub fn is_automatic(&self) -> bool {
        self.flags.contains(MessageFlags::AUTOMATIC)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mana_pool::slab::FrameFlags;
    use crate::mock;
    use crate::nexus::{Phone, TaskId};

    #[test]
    fn test_size_counts_header_data_and_objects() {
        mock::install();
        let word = size_of::<usize>();
        let plain = Message::new([1, 2, 3, 4, 5, 6]);
        assert_eq!(plain.size(), Message::HEADER);

        let phone = Phone::new(TaskId(1), FrameFlags::empty()).unwrap();
        let loaded = Message::new([0; IPC_MESSAGE_ARGS])
            .with_data(b"hello")
            .with_object(phone);
        assert_eq!(loaded.size(), Message::HEADER + 5 + word);
        assert!(!loaded.is_automatic());
    }

    #[test]
    fn test_automatic_messages_are_flagged() {
        let dropped = Message::automatic(9, MessageFlags::OBJECT_DROPPED);
        assert_eq!(dropped.endpoint_tag, 9);
        assert!(dropped.is_automatic());
        assert!(dropped.flags.contains(MessageFlags::OBJECT_DROPPED));
    }
}
