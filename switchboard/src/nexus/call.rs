//! Calls - the asynchronous request/answer unit carried by phones

use super::answerbox::Answerbox;
use super::phone::{Phone, PhoneState};
use super::task::TaskId;
use super::IpcError;
use crate::config::IPC_CALL_LEN;
use crate::mana_pool::slab::{FrameFlags, SlabObject, CALL_CACHE};
use crate::mana_pool::Kobj;
use alloc::boxed::Box;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

/// Method number of the call a phone sends when it hangs up.
pub const IPC_M_PHONE_HUNGUP: usize = 1;

/// First method number free for protocols.
pub const IPC_FIRST_USER_METHOD: usize = 1024;

bitflags::bitflags! {
    pub struct CallFlags: u32 {
        /// The call carries its answer.
        const ANSWERED       = 0b0001;
        /// The call announces a hangup.
        const HANGUP         = 0b0010;
        /// Nobody waits for the answer; it is dropped.
        const DISCARD_ANSWER = 0b0100;
        /// One-way notification.
        const NOTIFICATION   = 0b1000;
    }
}

/// Payload of a request or an answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IpcData {
    pub imethod: usize,
    pub args: [usize; IPC_CALL_LEN],
    /// Label of the phone the request came through, set by the kernel.
    pub label: usize,
}

impl IpcData {
    pub fn new(imethod: usize, args: [usize; IPC_CALL_LEN]) -> Self {
        Self {
            imethod,
            args,
            label: 0,
        }
    }

    pub fn method(imethod: usize) -> Self {
        Self::new(imethod, [0; IPC_CALL_LEN])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallId(pub u64);

static NEXT_CALL_ID: AtomicU64 = AtomicU64::new(1);

pub struct Call {
    id: CallId,
    request: IpcData,
    answer: Option<Result<IpcData, IpcError>>,
    flags: CallFlags,
    /// The phone the call travels through; keeps the phone alive until the
    /// call is answered and consumed.
    pub(crate) phone: Option<Kobj<Phone>>,
    /// Where the answer goes.
    pub(crate) caller_box: Option<Kobj<Answerbox>>,
    _slot: SlabObject,
}

impl Call {
    pub fn alloc(flags: FrameFlags) -> Result<Box<Call>, IpcError> {
        let slot = CALL_CACHE.alloc(flags)?;
        Ok(Box::new(Call {
            id: CallId(NEXT_CALL_ID.fetch_add(1, Ordering::Relaxed)),
            request: IpcData::default(),
            answer: None,
            flags: CallFlags::empty(),
            phone: None,
            caller_box: None,
            _slot: slot,
        }))
    }

    pub fn id(&self) -> CallId {
        self.id
    }

    pub fn request(&self) -> &IpcData {
        &self.request
    }

    pub fn flags(&self) -> CallFlags {
        self.flags
    }

    pub fn is_answered(&self) -> bool {
        self.flags.contains(CallFlags::ANSWERED)
    }

    pub fn is_hangup(&self) -> bool {
        self.flags.contains(CallFlags::HANGUP)
    }

    /// The answer, once the call has been answered.
    pub fn reply(&self) -> Option<Result<&IpcData, IpcError>> {
        self.answer.as_ref().map(|answer| answer.as_ref().map_err(|err| *err))
    }

    /// The answer's return word, or the error the call was answered with.
    pub fn retval(&self) -> Option<Result<usize, IpcError>> {
        self.reply().map(|reply| reply.map(|data| data.imethod))
    }

    /// Task that made the call.
    pub fn sender(&self) -> Option<TaskId> {
        self.phone.as_ref().map(|phone| phone.caller())
    }

    pub(crate) fn prepare_hangup(&mut self, phone: Kobj<Phone>) {
        self.request = IpcData::method(IPC_M_PHONE_HUNGUP);
        self.request.label = phone.label();
        self.flags = CallFlags::HANGUP | CallFlags::DISCARD_ANSWER;
        self.phone = Some(phone);
        self.caller_box = None;
    }

    /// Record the answer and release the phone's call slot. Returns where
    /// the answer must be delivered, if anywhere.
    fn set_answer(&mut self, answer: Result<IpcData, IpcError>) -> Option<Kobj<Answerbox>> {
        self.answer = Some(answer);
        self.flags.insert(CallFlags::ANSWERED);
        if let Some(phone) = &self.phone {
            phone.remove_call();
        }
        if self.flags.contains(CallFlags::DISCARD_ANSWER) {
            return None;
        }
        self.caller_box.take()
    }
}

impl fmt::Debug for Call {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Call")
            .field("id", &self.id)
            .field("request", &self.request)
            .field("answer", &self.answer)
            .field("flags", &self.flags)
            .finish()
    }
}

/// Send `data` through `phone` without waiting for the answer.
///
/// The answer arrives in `caller_box`; without one it is discarded.
///
/// # Returns
/// * `Err(Hangup)` - the phone was slammed or hung up
/// * `Err(NotConnected)` - the phone never finished connecting
/// * `Err(LimitExceeded)` - too many unanswered calls on this phone
/// * `Err(NoMemory)` - no call structure available
pub fn ipc_call_async(
    phone: &Kobj<Phone>,
    caller_box: Option<&Kobj<Answerbox>>,
    data: IpcData,
) -> Result<CallId, IpcError> {
    let inner = phone.lock_inner();
    match inner.state {
        PhoneState::Connected => {}
        PhoneState::Slammed | PhoneState::Hungup => return Err(IpcError::Hangup),
        PhoneState::Free | PhoneState::Connecting => return Err(IpcError::NotConnected),
    }

    let Some(callee) = inner.callee.as_ref() else {
        return Err(IpcError::Hangup);
    };

    if !phone.within_call_limit() {
        return Err(IpcError::LimitExceeded);
    }

    let mut call = Call::alloc(FrameFlags::ATOMIC)?;
    call.request = data;
    call.request.label = phone.label();
    call.phone = Some(phone.clone());
    match caller_box {
        Some(caller_box) => call.caller_box = Some(caller_box.clone()),
        None => call.flags.insert(CallFlags::DISCARD_ANSWER),
    }
    let id = call.id;

    phone.add_call();
    if let Err(rejected) = callee.enqueue_call(call) {
        phone.remove_call();
        drop(inner);
        drop(rejected);
        return Err(IpcError::Hangup);
    }
    Ok(id)
}

/// Answer `call`, dispatched from `callee_box`, with `reply`.
pub fn ipc_answer(callee_box: &Answerbox, call: Box<Call>, reply: IpcData) {
    callee_box.dispatch_done();
    deliver_answer(call, Ok(reply));
}

/// Answer a call that will never be dispatched.
pub(crate) fn answer_undelivered(call: Box<Call>, err: IpcError) {
    deliver_answer(call, Err(err));
}

fn deliver_answer(mut call: Box<Call>, answer: Result<IpcData, IpcError>) {
    log::trace!("ipc: answering call {:?}", call.id);
    match call.set_answer(answer) {
        Some(caller_box) => caller_box.enqueue_answer(call),
        None => drop(call),
    }
}
