//! Tasks - capability tables and answerboxes bound together
//!
//! A task is what the IPC core sees of a process: a name, a capability
//! table and the answerbox its calls and answers arrive in. The methods
//! here are the syscall-shaped entry points; each resolves handles in the
//! task's own table and hands the objects to the layer underneath.

use super::answerbox::Answerbox;
use super::blob::IpcBlob;
use super::buffer::IpcBuffer;
use super::call::{ipc_call_async, Call, CallId, IpcData};
use super::endpoint::Endpoint;
use super::message::Message;
use super::phone::Phone;
use super::IpcError;
use crate::loom_of_fate::Deadline;
use crate::mana_pool::slab::FrameFlags;
use crate::mana_pool::{CapHandle, CapabilityTable, Handle, KernelObject, Kobj, KobjKind};
use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "task{}", self.0)
    }
}

pub struct Task {
    id: TaskId,
    name: String,
    capabilities: CapabilityTable,
    answerbox: Kobj<Answerbox>,
}

impl Task {
    pub fn new(id: TaskId, name: &str) -> Result<Self, IpcError> {
        Ok(Self {
            id,
            name: String::from(name),
            capabilities: CapabilityTable::new(),
            answerbox: Answerbox::new(id)?,
        })
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capabilities(&self) -> &CapabilityTable {
        &self.capabilities
    }

    pub fn answerbox(&self) -> &Kobj<Answerbox> {
        &self.answerbox
    }

    /// New reference to the `T` under `handle`.
    pub fn lookup<T: KobjKind>(&self, handle: Handle<T>) -> Result<Kobj<T>, IpcError> {
        Ok(self.capabilities.lookup(handle)?)
    }

    fn install<T: KobjKind>(&self, object: Kobj<T>) -> Result<Handle<T>, IpcError> {
        Ok(self.capabilities.insert_kind(object)?)
    }

    // ---- phones and calls ----

    pub fn phone_alloc(&self) -> Result<Handle<Phone>, IpcError> {
        let phone = Phone::new(self.id, FrameFlags::empty())?;
        self.install(phone)
    }

    /// Connect one of our phones to `callee`'s answerbox.
    ///
    /// # Returns
    /// * `Err(InvalidState)` - the phone was used before
    /// * `Err(Hangup)` - `callee` no longer accepts connections; the phone
    ///   stays `Connecting` and can only be hung up
    pub fn phone_connect(&self, phone: Handle<Phone>, callee: &Task) -> Result<(), IpcError> {
        let phone = self.lookup(phone)?;
        let pending = Phone::request_connect(&phone)?;
        if !Phone::connect(pending, &callee.answerbox) {
            return Err(IpcError::Hangup);
        }
        log::debug!("{} ({}): connected to {}", self.id, self.name, callee.id);
        Ok(())
    }

    /// Call through `phone`; the answer arrives in our own answerbox.
    pub fn call_async(&self, phone: Handle<Phone>, data: IpcData) -> Result<CallId, IpcError> {
        let phone = self.lookup(phone)?;
        ipc_call_async(&phone, Some(&self.answerbox), data)
    }

    pub fn wait_for_call(&self, deadline: Deadline) -> Result<Box<Call>, IpcError> {
        self.answerbox.wait_for_call(deadline)
    }

    pub fn try_wait_for_call(&self) -> Result<Box<Call>, IpcError> {
        self.answerbox.try_wait_for_call()
    }

    pub fn answer(&self, call: Box<Call>, reply: IpcData) {
        self.answerbox.answer(call, reply);
    }

    pub fn hangup(&self, phone: Handle<Phone>) -> Result<(), IpcError> {
        Phone::hangup(&self.lookup(phone)?)
    }

    // ---- capabilities ----

    /// Drop the capability under `handle`.
    pub fn kobj_put(&self, handle: CapHandle) -> Result<(), IpcError> {
        let object = self.capabilities.remove(handle)?;
        drop(object);
        Ok(())
    }

    /// Take the capability under `handle` out of the table, to hand it to
    /// another task.
    pub fn detach(&self, handle: CapHandle) -> Result<KernelObject, IpcError> {
        Ok(self.capabilities.remove(handle)?)
    }

    /// Install the capabilities carried by `message`, all or none.
    ///
    /// # Returns
    /// * `Err(TableFull)` - no room for every object; the message keeps them
    pub fn accept_message(&self, message: &mut Message) -> Result<Vec<CapHandle>, IpcError> {
        Ok(self.capabilities.insert_all(&mut message.objects)?)
    }

    // ---- buffers and endpoints ----

    pub fn buffer_create(&self, size: usize, max_message_len: usize) -> Result<Handle<IpcBuffer>, IpcError> {
        let buffer = IpcBuffer::create(size, max_message_len)?;
        self.install(buffer)
    }

    pub fn endpoint_create(
        &self,
        buffer: Handle<IpcBuffer>,
        tag: usize,
        reserve: usize,
        max_len: usize,
    ) -> Result<Handle<Endpoint>, IpcError> {
        let buffer = self.lookup(buffer)?;
        let endpoint = Endpoint::create(&buffer, tag, reserve, max_len)?;
        drop(buffer);
        self.install(endpoint)
    }

    pub fn endpoint_write(&self, endpoint: Handle<Endpoint>, message: Message) -> Result<(), IpcError> {
        self.lookup(endpoint)?.write(message)
    }

    pub fn buffer_read(&self, buffer: Handle<IpcBuffer>, deadline: Deadline) -> Result<Message, IpcError> {
        self.lookup(buffer)?.read(deadline)
    }

    // ---- blobs ----

    pub fn blob_create(&self, data: &[u8]) -> Result<Handle<IpcBlob>, IpcError> {
        let blob = IpcBlob::create(data)?;
        self.install(blob)
    }

    pub fn blob_read(&self, blob: Handle<IpcBlob>, offset: usize, dest: &mut [u8]) -> Result<(), IpcError> {
        self.lookup(blob)?.read(offset, dest)
    }

    /// Drop the capability and free the blob's data, even if other tasks
    /// still hold the blob.
    pub fn blob_destroy(&self, blob: Handle<IpcBlob>) -> Result<(), IpcError> {
        let blob = self.capabilities.remove_kind(blob)?;
        blob.release();
        Ok(())
    }

    // ---- diagnostics and teardown ----

    /// Console dump of every phone the task holds.
    pub fn print_phones(&self) {
        crate::kprintln!("{} ({}): phones", self.id, self.name);
        for (handle, phone) in self.capabilities.objects_of::<Phone>() {
            crate::kprint!("  {} ", handle.untyped());
            Phone::print_state(&phone);
        }
    }

    /// Hang up every phone, deactivate the answerbox and drop every
    /// capability. Idempotent.
    pub fn teardown(&self) {
        log::debug!("{} ({}): tearing down", self.id, self.name);
        for (_, phone) in self.capabilities.objects_of::<Phone>() {
            // Phones that never connected or were slammed have nothing to
            // hang up.
            let _ = Phone::hangup(&phone);
        }
        self.answerbox.deactivate();

        let objects = self.capabilities.drain();
        drop(objects);
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("capabilities", &self.capabilities.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loom_of_fate::DEADLINE_NEVER;
    use crate::mana_pool::CapabilityError;
    use crate::mock;
    use crate::nexus::call::IPC_FIRST_USER_METHOD;
    use crate::nexus::phone::PhoneState;

    #[test]
    fn test_handles_are_per_task() {
        mock::install();
        let a = Task::new(TaskId(1), "a").unwrap();
        let b = Task::new(TaskId(2), "b").unwrap();
        let phone = a.phone_alloc().unwrap();

        assert!(a.lookup(phone).is_ok());
        assert_eq!(b.lookup(phone).err(), Some(IpcError::InvalidHandle));
        assert_eq!(a.lookup(phone).unwrap().caller(), TaskId(1));
    }

    #[test]
    fn test_kobj_put_invalidates_handle() {
        mock::install();
        let task = Task::new(TaskId(1), "a").unwrap();
        let phone = task.phone_alloc().unwrap();
        task.kobj_put(phone.untyped()).unwrap();
        assert_eq!(task.kobj_put(phone.untyped()), Err(IpcError::InvalidHandle));
        assert_eq!(task.hangup(phone), Err(IpcError::InvalidHandle));
        assert!(task.capabilities().is_empty());
    }

    #[test]
    fn test_wrong_kind_of_handle() {
        mock::install();
        let task = Task::new(TaskId(1), "a").unwrap();
        let buffer = task.buffer_create(4096, 64).unwrap();
        let as_phone: Handle<Phone> = Handle::new(buffer.untyped());
        assert_eq!(task.hangup(as_phone), Err(IpcError::WrongType));
        assert_eq!(
            CapabilityError::WrongType,
            task.capabilities().lookup(as_phone).unwrap_err()
        );
    }

    #[test]
    fn test_call_through_tasks() {
        mock::install();
        let client = Task::new(TaskId(1), "client").unwrap();
        let server = Task::new(TaskId(2), "server").unwrap();
        let phone = client.phone_alloc().unwrap();
        client.phone_connect(phone, &server).unwrap();
        assert_eq!(
            client.phone_connect(phone, &server),
            Err(IpcError::InvalidState)
        );

        let id = client
            .call_async(phone, IpcData::method(IPC_FIRST_USER_METHOD))
            .unwrap();
        let call = server.wait_for_call(DEADLINE_NEVER).unwrap();
        assert_eq!(call.sender(), Some(client.id()));
        server.answer(call, IpcData::method(7));

        let answer = client.wait_for_call(DEADLINE_NEVER).unwrap();
        assert_eq!(answer.id(), id);
        assert_eq!(answer.retval(), Some(Ok(7)));
    }

    #[test]
    fn test_blob_destroy_frees_shared_data() {
        mock::install();
        let owner = Task::new(TaskId(1), "owner").unwrap();
        let blob = owner.blob_create(b"shared").unwrap();
        let elsewhere = owner.lookup(blob).unwrap();

        let mut dest = [0u8; 6];
        owner.blob_read(blob, 0, &mut dest).unwrap();
        assert_eq!(&dest, b"shared");

        let as_phone: Handle<Phone> = Handle::new(blob.untyped());
        assert_eq!(owner.hangup(as_phone), Err(IpcError::WrongType));
        let phone = owner.phone_alloc().unwrap();
        let as_blob: Handle<IpcBlob> = Handle::new(phone.untyped());
        assert_eq!(owner.blob_destroy(as_blob), Err(IpcError::WrongType));
        assert!(owner.lookup(phone).is_ok());

        owner.blob_destroy(blob).unwrap();
        assert_eq!(owner.blob_read(blob, 0, &mut dest), Err(IpcError::InvalidHandle));
        assert_eq!(elsewhere.read(0, &mut dest), Err(IpcError::InvalidState));
    }

    #[test]
    fn test_teardown_is_idempotent() {
        mock::install();
        let task = Task::new(TaskId(1), "a").unwrap();
        let phone = task.phone_alloc().unwrap();
        let kept = task.lookup(phone).unwrap();

        task.teardown();
        task.teardown();
        assert!(task.capabilities().is_empty());
        assert!(!task.answerbox().is_active());
        assert_eq!(kept.state(), PhoneState::Free);
        assert_eq!(Kobj::refcount(&kept), 1);
    }

    #[test]
    fn test_print_phones() {
        mock::install();
        let task = Task::new(TaskId(31), "printer").unwrap();
        task.phone_alloc().unwrap();
        task.print_phones();
        let output = mock::console_output();
        assert!(output.contains("task31 (printer): phones"));
        assert!(output.contains("caller=task31"));
    }
}
