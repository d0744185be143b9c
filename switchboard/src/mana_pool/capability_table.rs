//! Capability Table - per-task handle arena
//!
//! The capability table enforces the "opaque handle" model:
//! - userspace only sees [`CapHandle`] values, meaningless without the table
//! - the kernel maps a handle to a referenced [`KernelObject`]
//! - every use goes through a bounds- and generation-checked lookup
//!
//! Slots are reused; the generation counter makes a handle to a freed slot
//! stale instead of silently naming whatever lives there now.

use super::capability::{CapHandle, Handle};
use super::kobject::Kobj;
use super::object_manager::{KernelObject, KobjKind};
use crate::config::MAX_CAPABILITIES;
use crate::loom_of_fate::Mutex;
use alloc::vec::Vec;
use core::fmt;

/// Errors that can occur during capability table operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapabilityError {
    /// No live capability under this handle
    InvalidHandle,
    /// The capability names an object of another kind
    WrongType,
    /// Capability table is full
    TableFull,
}

impl fmt::Display for CapabilityError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CapabilityError::InvalidHandle => write!(f, "Invalid capability handle"),
            CapabilityError::WrongType => write!(f, "Capability names another kind of object"),
            CapabilityError::TableFull => write!(f, "Capability table is full"),
        }
    }
}

struct Slot {
    generation: u32,
    object: Option<KernelObject>,
}

struct TableState {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
}

impl TableState {
    fn slot(&self, handle: CapHandle) -> Result<&KernelObject, CapabilityError> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.object.as_ref())
            .ok_or(CapabilityError::InvalidHandle)
    }

    fn place(&mut self, object: KernelObject) -> CapHandle {
        self.live += 1;
        match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.object = Some(object);
                CapHandle {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot {
                    generation: 0,
                    object: Some(object),
                });
                CapHandle { index, generation: 0 }
            }
        }
    }

    fn take(&mut self, handle: CapHandle) -> Option<KernelObject> {
        let slot = self
            .slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)?;
        let object = slot.object.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        self.live -= 1;
        Some(object)
    }
}

/// Capability table - maps opaque handles to kernel object references
///
/// Each live entry holds one reference on its object. Lookups hand out new
/// references; removal hands the table's reference back to the caller so
/// that a final put happens outside the table lock.
pub struct CapabilityTable {
    state: Mutex<TableState>,
}

impl Default for CapabilityTable {
    fn default() -> Self {
        Self::new()
    }
}

impl CapabilityTable {
    /// Create a new empty capability table
    pub const fn new() -> Self {
        Self {
            state: Mutex::new(TableState {
                slots: Vec::new(),
                free: Vec::new(),
                live: 0,
            }),
        }
    }

    /// Insert an object reference, returning its handle
    ///
    /// # Returns
    /// * `Err(TableFull)` - if the table holds `MAX_CAPABILITIES` entries;
    ///   the object is dropped
    pub fn insert(&self, object: KernelObject) -> Result<CapHandle, CapabilityError> {
        let mut state = self.state.lock();
        if state.live >= MAX_CAPABILITIES {
            drop(state);
            drop(object);
            return Err(CapabilityError::TableFull);
        }
        Ok(state.place(object))
    }

    /// Insert every object in `objects`, or none of them
    ///
    /// On success `objects` is left empty and the handles come back in the
    /// same order. On `Err(TableFull)` `objects` is untouched.
    pub fn insert_all(&self, objects: &mut Vec<KernelObject>) -> Result<Vec<CapHandle>, CapabilityError> {
        let mut state = self.state.lock();
        if state.live + objects.len() > MAX_CAPABILITIES {
            return Err(CapabilityError::TableFull);
        }
        Ok(objects.drain(..).map(|object| state.place(object)).collect())
    }

    pub fn insert_kind<T: KobjKind>(&self, object: Kobj<T>) -> Result<Handle<T>, CapabilityError> {
        self.insert(T::wrap(object)).map(Handle::new)
    }

    /// New reference to the object under `handle`, whatever its kind.
    pub fn shallow_lookup(&self, handle: CapHandle) -> Result<KernelObject, CapabilityError> {
        self.state.lock().slot(handle).map(KernelObject::clone)
    }

    /// New reference to the `T` under `handle`
    ///
    /// # Returns
    /// * `Err(InvalidHandle)` - no live capability under this handle
    /// * `Err(WrongType)` - the capability names something other than a `T`
    pub fn lookup<T: KobjKind>(&self, handle: Handle<T>) -> Result<Kobj<T>, CapabilityError> {
        let state = self.state.lock();
        let object = state.slot(handle.untyped())?;
        T::peek(object).cloned().ok_or(CapabilityError::WrongType)
    }

    /// Remove a capability, handing its reference to the caller
    pub fn remove(&self, handle: CapHandle) -> Result<KernelObject, CapabilityError> {
        self.state.lock().take(handle).ok_or(CapabilityError::InvalidHandle)
    }

    /// Remove the `T` under `handle`. A capability of another kind stays in
    /// the table.
    pub fn remove_kind<T: KobjKind>(&self, handle: Handle<T>) -> Result<Kobj<T>, CapabilityError> {
        let mut state = self.state.lock();
        let object = state.slot(handle.untyped())?;
        let removed = T::peek(object).cloned().ok_or(CapabilityError::WrongType)?;
        let object = state.take(handle.untyped());
        drop(state);
        drop(object);
        Ok(removed)
    }

    /// Handles and new references of every `T` in the table.
    pub fn objects_of<T: KobjKind>(&self) -> Vec<(Handle<T>, Kobj<T>)> {
        let state = self.state.lock();
        state
            .slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| {
                let object = T::peek(slot.object.as_ref()?)?;
                let handle = CapHandle {
                    index: index as u32,
                    generation: slot.generation,
                };
                Some((Handle::new(handle), object.clone()))
            })
            .collect()
    }

    /// Take every capability out of the table.
    pub fn drain(&self) -> Vec<KernelObject> {
        let mut state = self.state.lock();
        let mut objects = Vec::with_capacity(state.live);
        let TableState { slots, free, live } = &mut *state;
        for (index, slot) in slots.iter_mut().enumerate() {
            if let Some(object) = slot.object.take() {
                slot.generation = slot.generation.wrapping_add(1);
                free.push(index as u32);
                objects.push(object);
            }
        }
        *live = 0;
        objects
    }

    /// Get number of capabilities in table
    pub fn len(&self) -> usize {
        self.state.lock().live
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mana_pool::object_manager::ObjectType;
    use crate::mana_pool::slab::FrameFlags;
    use crate::mock;
    use crate::nexus::{Answerbox, Phone, TaskId};

    #[test]
    fn test_insert_and_lookup() {
        mock::install();
        let table = CapabilityTable::new();
        let phone = Phone::new(TaskId(1), FrameFlags::empty()).unwrap();

        let handle = table.insert_kind(phone.clone()).unwrap();
        assert_eq!(Kobj::refcount(&phone), 2);

        let found = table.lookup(handle).unwrap();
        assert!(Kobj::ptr_eq(&found, &phone));
        assert_eq!(Kobj::refcount(&phone), 3);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_wrong_type() {
        mock::install();
        let table = CapabilityTable::new();
        let answerbox = Answerbox::new(TaskId(1)).unwrap();
        let raw = table.insert(answerbox.into()).unwrap();

        let as_phone: Handle<Phone> = Handle::new(raw);
        assert_eq!(table.lookup(as_phone).err(), Some(CapabilityError::WrongType));
        assert!(table.shallow_lookup(raw).is_ok());
    }

    #[test]
    fn test_removed_handle_goes_stale() {
        mock::install();
        let table = CapabilityTable::new();
        let phone = Phone::new(TaskId(1), FrameFlags::empty()).unwrap();
        let first = table.insert_kind(phone.clone()).unwrap();

        let removed = table.remove(first.untyped()).unwrap();
        drop(removed);
        assert_eq!(Kobj::refcount(&phone), 1);
        assert_eq!(table.remove(first.untyped()).err(), Some(CapabilityError::InvalidHandle));

        // The slot is reused, the old handle stays dead.
        let second = table.insert_kind(phone.clone()).unwrap();
        assert_eq!(second.untyped().index, first.untyped().index);
        assert_ne!(second, first);
        assert_eq!(table.lookup(first).err(), Some(CapabilityError::InvalidHandle));
        assert!(table.lookup(second).is_ok());
    }

    #[test]
    fn test_remove_kind_checks_type() {
        mock::install();
        let table = CapabilityTable::new();
        let phone = Phone::new(TaskId(1), FrameFlags::empty()).unwrap();
        let handle = table.insert_kind(phone.clone()).unwrap();

        let as_answerbox: Handle<Answerbox> = Handle::new(handle.untyped());
        assert_eq!(table.remove_kind(as_answerbox).err(), Some(CapabilityError::WrongType));
        assert_eq!(table.len(), 1);

        let removed = table.remove_kind(handle).unwrap();
        assert!(Kobj::ptr_eq(&removed, &phone));
        assert!(table.is_empty());
        assert_eq!(table.remove_kind(handle).err(), Some(CapabilityError::InvalidHandle));
        drop(removed);
        assert_eq!(Kobj::refcount(&phone), 1);
    }

    #[test]
    fn test_table_full() {
        mock::install();
        let table = CapabilityTable::new();
        let phone = Phone::new(TaskId(1), FrameFlags::empty()).unwrap();

        // Fill table to capacity
        for _ in 0..MAX_CAPABILITIES {
            assert!(table.insert_kind(phone.clone()).is_ok());
        }

        // Next insert should fail, without leaking the reference
        assert_eq!(table.insert_kind(phone.clone()).err(), Some(CapabilityError::TableFull));
        assert_eq!(Kobj::refcount(&phone), MAX_CAPABILITIES + 1);

        let mut more = vec![KernelObject::from(phone.clone())];
        assert_eq!(table.insert_all(&mut more), Err(CapabilityError::TableFull));
        assert_eq!(more.len(), 1);
        drop(more);

        let drained = table.drain();
        assert_eq!(drained.len(), MAX_CAPABILITIES);
        assert!(table.is_empty());
        drop(drained);
        assert_eq!(Kobj::refcount(&phone), 1);
    }

    #[test]
    fn test_insert_all_keeps_order() {
        mock::install();
        let table = CapabilityTable::new();
        let phone = Phone::new(TaskId(1), FrameFlags::empty()).unwrap();
        let answerbox = Answerbox::new(TaskId(1)).unwrap();
        let mut objects = vec![KernelObject::from(phone.clone()), KernelObject::from(answerbox.clone())];

        let handles = table.insert_all(&mut objects).unwrap();
        assert!(objects.is_empty());
        assert_eq!(handles.len(), 2);
        assert_eq!(table.shallow_lookup(handles[0]).unwrap().object_type(), ObjectType::Phone);
        assert_eq!(table.shallow_lookup(handles[1]).unwrap().object_type(), ObjectType::Answerbox);
        assert!(table.insert_all(&mut objects).unwrap().is_empty());
        answerbox.deactivate();
    }

    #[test]
    fn test_objects_of_filters_by_kind() {
        mock::install();
        let table = CapabilityTable::new();
        let phone = Phone::new(TaskId(1), FrameFlags::empty()).unwrap();
        let phone_handle = table.insert_kind(phone).unwrap();
        table.insert(Answerbox::new(TaskId(1)).unwrap().into()).unwrap();

        let phones = table.objects_of::<Phone>();
        assert_eq!(phones.len(), 1);
        assert_eq!(phones[0].0, phone_handle);
    }
}
