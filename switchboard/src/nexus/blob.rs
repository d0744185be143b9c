//! IPC blobs - immutable chunks of data passed around as capabilities
//!
//! A blob is filled once, at creation, and read any number of times by
//! whoever holds a capability to it. Its creator may release the data early;
//! holders that keep the object beyond that see `InvalidState` on read.

use super::IpcError;
use crate::config::IPC_BLOB_SIZE_LIMIT;
use crate::mana_pool::slab::{FrameFlags, SlabObject, IPC_BLOB_CACHE};
use crate::mana_pool::{IrqSpinlock, Kobj, KobjClass};
use alloc::boxed::Box;

pub struct IpcBlob {
    /// `None` once released.
    data: IrqSpinlock<Option<Box<[u8]>>>,
    size: usize,
    _slot: SlabObject,
}

impl KobjClass for IpcBlob {
    const NAME: &'static str = "blob";
}

impl IpcBlob {
    /// New blob holding a copy of `data`.
    ///
    /// # Returns
    /// * `Err(TooLarge)` - `data` exceeds `IPC_BLOB_SIZE_LIMIT`
    pub fn create(data: &[u8]) -> Result<Kobj<IpcBlob>, IpcError> {
        if data.len() > IPC_BLOB_SIZE_LIMIT {
            return Err(IpcError::TooLarge);
        }
        let slot = IPC_BLOB_CACHE.alloc(FrameFlags::empty())?;
        Ok(Kobj::new(IpcBlob {
            data: IrqSpinlock::new(Some(Box::from(data)), "ipc_blob_t.lock"),
            size: data.len(),
            _slot: slot,
        }))
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_released(&self) -> bool {
        self.data.lock().is_none()
    }

    /// Copy `dest.len()` bytes starting at `offset` into `dest`.
    ///
    /// # Returns
    /// * `Err(OutOfRange)` - the range reaches past the end of the blob
    /// * `Err(InvalidState)` - the data was released
    pub fn read(&self, offset: usize, dest: &mut [u8]) -> Result<(), IpcError> {
        let data = self.data.lock();
        let Some(data) = data.as_ref() else {
            return Err(IpcError::InvalidState);
        };
        let end = offset
            .checked_add(dest.len())
            .filter(|&end| end <= data.len())
            .ok_or(IpcError::OutOfRange)?;
        dest.copy_from_slice(&data[offset..end]);
        Ok(())
    }

    /// Free the data now, whoever still holds the object. `false` if it was
    /// already released.
    pub fn release(&self) -> bool {
        let data = self.data.lock().take();
        // Freed outside the lock.
        data.is_some()
    }
}
