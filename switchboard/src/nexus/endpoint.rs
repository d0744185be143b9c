//! Endpoints - write handles into an IPC buffer
//!
//! An endpoint does not keep its buffer alive. Every write enters the buffer
//! through the endpoint's weak reference and fails with `Hangup` once the
//! buffer is being destroyed.

use super::buffer::IpcBuffer;
use super::message::{Message, MessageFlags};
use super::weakref::WeakRef;
use super::IpcError;
use crate::mana_pool::slab::{FrameFlags, SlabObject, IPC_ENDPOINT_CACHE};
use crate::mana_pool::{Kobj, KobjClass};
use core::sync::atomic::{AtomicUsize, Ordering};

pub struct Endpoint {
    buffer: WeakRef<IpcBuffer>,
    /// Copied into every message written through this endpoint.
    tag: usize,
    /// Largest message accepted, header included.
    max_len: usize,
    /// Bytes set aside in the buffer for the next write.
    reservation: AtomicUsize,
    _slot: SlabObject,
}

impl KobjClass for Endpoint {
    const NAME: &'static str = "endpoint";

    fn destroy(&self) {
        let reservation = self.reservation.swap(0, Ordering::AcqRel);
        match self.buffer.hold() {
            Some(buffer) => buffer.endpoint_dropped(self.tag, reservation),
            None => log::trace!("endpoint: tag {:#x} outlived its buffer", self.tag),
        }
    }
}

impl Endpoint {
    /// New endpoint writing into `buffer`.
    ///
    /// `max_len` limits the payload of each message, zero meaning the
    /// buffer's own limit. `reserve` payload bytes are set aside for the
    /// endpoint's next write.
    ///
    /// # Returns
    /// * `Err(TooLarge)` - `max_len` exceeds the buffer's limit
    /// * `Err(ReserveFailed)` - the buffer cannot set `reserve` aside
    /// * `Err(Hangup)` - the buffer is being destroyed
    pub fn create(
        buffer: &Kobj<IpcBuffer>,
        tag: usize,
        reserve: usize,
        max_len: usize,
    ) -> Result<Kobj<Endpoint>, IpcError> {
        let max_len = match max_len {
            0 => buffer.max_message_len(),
            len => len.checked_add(Message::HEADER).ok_or(IpcError::TooLarge)?,
        };
        if max_len > buffer.max_message_len() {
            return Err(IpcError::TooLarge);
        }

        let reserve = match reserve {
            0 => 0,
            bytes => bytes
                .checked_add(Message::HEADER)
                .ok_or(IpcError::ReserveFailed)?,
        };

        let weakref = buffer.weakref()?;
        let slot = IPC_ENDPOINT_CACHE.alloc(FrameFlags::empty())?;
        buffer.reserve(reserve)?;

        log::debug!("endpoint: tag {:#x} created, reserving {} bytes", tag, reserve);
        Ok(Kobj::new(Endpoint {
            buffer: weakref,
            tag,
            max_len,
            reservation: AtomicUsize::new(reserve),
            _slot: slot,
        }))
    }

    pub fn tag(&self) -> usize {
        self.tag
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }

    pub fn reservation(&self) -> usize {
        self.reservation.load(Ordering::Acquire)
    }

    /// Queue `message` in the buffer. Never blocks.
    ///
    /// The endpoint's reservation is spent first, then shared space.
    ///
    /// # Returns
    /// * `Err(TooLarge)` - the message exceeds the endpoint's limit
    /// * `Err(LimitExceeded)` - not enough room in the buffer
    /// * `Err(Hangup)` - the buffer is gone
    pub fn write(&self, mut message: Message) -> Result<(), IpcError> {
        if message.size() > self.max_len {
            return Err(IpcError::TooLarge);
        }

        let Some(buffer) = self.buffer.hold() else {
            return Err(IpcError::Hangup);
        };

        message.endpoint_tag = self.tag;
        message.flags.remove(MessageFlags::AUTOMATIC);

        let reservation = self.reservation.swap(0, Ordering::AcqRel);
        let result = buffer.push(message, reservation);
        if result.is_err() && reservation > 0 {
            self.reservation.fetch_add(reservation, Ordering::AcqRel);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IPC_MESSAGE_ARGS;
    use crate::loom_of_fate::DEADLINE_NEVER;
    use crate::mock;
    use crate::nexus::weakref::WeakRefGuard;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    fn message(first: usize) -> Message {
        let mut args = [0; IPC_MESSAGE_ARGS];
        args[0] = first;
        Message::new(args)
    }

    #[test]
    fn test_write_tags_and_delivers() {
        mock::install();
        let buffer = IpcBuffer::create(4096, 64).unwrap();
        let endpoint = Endpoint::create(&buffer, 0x51, 0, 0).unwrap();
        assert_eq!(endpoint.max_len(), buffer.max_message_len());

        let mut forged = message(3);
        forged.flags = MessageFlags::AUTOMATIC;
        endpoint.write(forged).unwrap();

        let received = buffer.read(DEADLINE_NEVER).unwrap();
        assert_eq!(received.endpoint_tag, 0x51);
        assert_eq!(received.args[0], 3);
        assert!(!received.is_automatic());
    }

    #[test]
    fn test_length_limits() {
        mock::install();
        let buffer = IpcBuffer::create(4096, 64).unwrap();
        assert_eq!(Endpoint::create(&buffer, 1, 0, 65).err(), Some(IpcError::TooLarge));

        let endpoint = Endpoint::create(&buffer, 1, 0, 8).unwrap();
        assert_eq!(endpoint.max_len(), 8 + Message::HEADER);
        assert_eq!(
            endpoint.write(message(0).with_data(&[0; 9])),
            Err(IpcError::TooLarge)
        );
        assert!(endpoint.write(message(0).with_data(&[0; 8])).is_ok());
    }

    #[test]
    fn test_reservation_accounting() {
        mock::install();
        let size = 4 * Message::HEADER;
        let buffer = IpcBuffer::create(size, 0).unwrap();

        // One maximum-length message must stay unreserved.
        assert_eq!(
            Endpoint::create(&buffer, 1, 2 * Message::HEADER + 1, 0).err(),
            Some(IpcError::ReserveFailed)
        );
        assert_eq!(buffer.reserved(), 0);

        let plain = Endpoint::create(&buffer, 2, 0, 0).unwrap();
        assert_eq!(plain.reservation(), 0);
        assert_eq!(buffer.reserved(), 0);

        let reserved = Endpoint::create(&buffer, 3, 8, 0).unwrap();
        assert_eq!(reserved.reservation(), 8 + Message::HEADER);
        assert_eq!(buffer.reserved(), 8 + Message::HEADER);
    }

    #[test]
    fn test_reserved_write_succeeds_when_shared_space_is_gone() {
        mock::install();
        let size = 4 * Message::HEADER;
        let buffer = IpcBuffer::create(size, 0).unwrap();
        let guaranteed = Endpoint::create(&buffer, 1, 1, 0).unwrap();

        let other = Endpoint::create(&buffer, 2, 0, 0).unwrap();
        other.write(message(0)).unwrap();
        other.write(message(0)).unwrap();
        assert_eq!(other.write(message(0)), Err(IpcError::LimitExceeded));

        guaranteed.write(message(1)).unwrap();
        assert_eq!(guaranteed.reservation(), 0);
        assert_eq!(buffer.reserved(), 0);
        assert_eq!(buffer.used(), 3 * Message::HEADER);
    }

    #[test]
    fn test_failed_write_keeps_reservation() {
        mock::install();
        let size = 6 * Message::HEADER;
        let buffer = IpcBuffer::create(size, 2 * Message::HEADER).unwrap();
        let endpoint = Endpoint::create(&buffer, 1, 1, 0).unwrap();
        assert_eq!(endpoint.reservation(), 1 + Message::HEADER);

        let filler = Endpoint::create(&buffer, 2, 0, 0).unwrap();
        while filler.write(message(0)).is_ok() {}

        // Too large for the reservation and the shared space together.
        let big = message(0).with_data(&vec![0; 2 * Message::HEADER]);
        assert_eq!(endpoint.write(big), Err(IpcError::LimitExceeded));
        assert_eq!(endpoint.reservation(), 1 + Message::HEADER);
        assert_eq!(buffer.reserved(), 1 + Message::HEADER);
    }

    #[test]
    fn test_drop_posts_automatic_message() {
        mock::install();
        let buffer = IpcBuffer::create(4096, 64).unwrap();
        let endpoint = Endpoint::create(&buffer, 0x77, 16, 0).unwrap();
        assert_eq!(buffer.reserved(), 16 + Message::HEADER);

        drop(endpoint);
        assert_eq!(buffer.reserved(), 0);

        let notice = buffer.try_read().unwrap();
        assert_eq!(notice.endpoint_tag, 0x77);
        assert!(notice.flags.contains(
            MessageFlags::OBJECT_DROPPED | MessageFlags::AUTOMATIC | MessageFlags::RESERVATION_RELEASED
        ));
        assert_eq!(buffer.used(), 0);
    }

    #[test]
    fn test_write_after_buffer_destroyed() {
        mock::install();
        let buffer = IpcBuffer::create(4096, 64).unwrap();
        let endpoint = Endpoint::create(&buffer, 1, 16, 0).unwrap();
        endpoint.write(message(1)).unwrap();

        drop(buffer);
        assert_eq!(endpoint.write(message(2)), Err(IpcError::Hangup));
        // Dropping the endpoint of a dead buffer posts nothing.
        drop(endpoint);
    }

    #[test]
    fn test_buffer_destroy_waits_for_writer() {
        mock::install();
        let buffer = IpcBuffer::create(4096, 64).unwrap();
        let endpoint = Endpoint::create(&buffer, 1, 0, 0).unwrap();
        let destroyed = Arc::new(AtomicBool::new(false));

        // A writer inside the buffer, as during Endpoint::write.
        let held: WeakRefGuard<'_, IpcBuffer> = endpoint.buffer.hold().unwrap();

        let destroyer = {
            let destroyed = Arc::clone(&destroyed);
            mock::spawn(move || {
                drop(buffer);
                destroyed.store(true, Ordering::SeqCst);
            })
        };
        assert!(mock::wait_until(|| endpoint.buffer.is_destroyed()));
        mock::pause(20);
        assert!(!destroyed.load(Ordering::SeqCst));

        // The buffer is still readable memory, but closed for writes.
        assert_eq!(held.push(message(0), 0), Err(IpcError::Hangup));
        drop(held);

        destroyer.join().unwrap();
        assert!(destroyed.load(Ordering::SeqCst));
        assert_eq!(endpoint.write(message(0)), Err(IpcError::Hangup));
    }
}
