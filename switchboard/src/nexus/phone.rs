//! Phones - a task's outbound connection slots
//!
//! ```text
//!  Free --request_connect--> Connecting --connect--> Connected
//!                                |                      |   \
//!                              hangup                hangup  slam
//!                                v                      v     v
//!                              Hungup                Hungup  Slammed
//! ```
//!
//! `Hungup` and `Slammed` are terminal. The callee answerbox is referenced
//! exactly while the phone is `Connected`; the answerbox in turn holds a
//! reference to every connected phone. Hangup and slam each break that
//! cycle from their side.

use super::answerbox::Answerbox;
use super::call::Call;
use super::task::TaskId;
use super::IpcError;
use crate::config::MAX_ASYNC_CALLS;
use crate::loom_of_fate::{Mutex, MutexGuard};
use crate::mana_pool::slab::{FrameFlags, SlabObject, PHONE_CACHE};
use crate::mana_pool::{Kobj, KobjClass};
use alloc::boxed::Box;
use core::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhoneState {
    Free,
    Connecting,
    Connected,
    /// Disconnected by the callee.
    Slammed,
    /// Disconnected by the caller.
    Hungup,
}

impl PhoneState {
    pub fn is_terminal(self) -> bool {
        matches!(self, PhoneState::Slammed | PhoneState::Hungup)
    }
}

pub(crate) struct PhoneInner {
    pub(crate) state: PhoneState,
    /// Set exactly while `Connected`.
    pub(crate) callee: Option<Kobj<Answerbox>>,
    /// Pre-allocated so that hangup never allocates.
    hangup_call: Option<Box<Call>>,
}

pub struct Phone {
    caller: TaskId,
    label: AtomicUsize,
    active_calls: AtomicUsize,
    inner: Mutex<PhoneInner>,
    _slot: SlabObject,
}

impl KobjClass for Phone {
    const NAME: &'static str = "phone";
}

/// A phone in `Connecting` state on its way to an answerbox. Owns the
/// phone reference the answerbox will keep once connected.
#[must_use = "dropping the token abandons the connection attempt"]
pub struct PendingConnect {
    phone: Kobj<Phone>,
}

impl PendingConnect {
    pub fn phone(&self) -> &Kobj<Phone> {
        &self.phone
    }
}

impl Phone {
    pub fn new(caller: TaskId, flags: FrameFlags) -> Result<Kobj<Phone>, IpcError> {
        let slot = PHONE_CACHE.alloc(flags)?;
        let hangup_call = Call::alloc(flags)?;
        Ok(Kobj::new(Phone {
            caller,
            label: AtomicUsize::new(0),
            active_calls: AtomicUsize::new(0),
            inner: Mutex::new(PhoneInner {
                state: PhoneState::Free,
                callee: None,
                hangup_call: Some(hangup_call),
            }),
            _slot: slot,
        }))
    }

    pub(crate) fn lock_inner(&self) -> MutexGuard<'_, PhoneInner> {
        self.inner.lock()
    }

    pub fn caller(&self) -> TaskId {
        self.caller
    }

    pub fn state(&self) -> PhoneState {
        self.inner.lock().state
    }

    /// Opaque tag the callee sees on every call from this phone.
    pub fn set_label(&self, label: usize) {
        self.label.store(label, Ordering::Relaxed);
    }

    pub fn label(&self) -> usize {
        self.label.load(Ordering::Relaxed)
    }

    pub fn active_calls(&self) -> usize {
        self.active_calls.load(Ordering::Acquire)
    }

    pub fn within_call_limit(&self) -> bool {
        self.active_calls() < MAX_ASYNC_CALLS
    }

    pub fn add_call(&self) {
        self.active_calls.fetch_add(1, Ordering::AcqRel);
    }

    pub fn remove_call(&self) {
        let previous = self.active_calls.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "phone call count underflow");
    }

    /// `Free -> Connecting`. The returned token carries a new reference to
    /// the phone for the answerbox.
    pub fn request_connect(phone: &Kobj<Phone>) -> Result<PendingConnect, IpcError> {
        let mut inner = phone.inner.lock();
        if inner.state != PhoneState::Free {
            return Err(IpcError::InvalidState);
        }
        inner.state = PhoneState::Connecting;
        drop(inner);

        log::debug!("phone {:?}: connecting", phone);
        Ok(PendingConnect {
            phone: phone.clone(),
        })
    }

    /// `Connecting -> Connected`, if `callee` is active at this moment.
    ///
    /// Takes the phone lock, then the answerbox lock. On success the
    /// answerbox keeps the token's reference; otherwise the reference is
    /// dropped and the phone is left as it was.
    pub fn connect(pending: PendingConnect, callee: &Kobj<Answerbox>) -> bool {
        let PendingConnect { phone } = pending;

        let mut inner = phone.inner.lock();
        let connected = {
            let mut boxed = callee.lock_state();
            if boxed.active && inner.state == PhoneState::Connecting {
                boxed.connected_phones.push_back(phone.clone());
                true
            } else {
                false
            }
        };
        if connected {
            inner.state = PhoneState::Connected;
            inner.callee = Some(callee.clone());
        }
        drop(inner);

        if connected {
            log::debug!("phone {:?}: connected to {:?}", phone, callee);
        } else {
            log::debug!("phone {:?}: connection refused by {:?}", phone, callee);
        }
        // The token's reference goes here, outside both locks.
        drop(phone);
        connected
    }

    /// Caller-side disconnect. Never allocates.
    ///
    /// # Returns
    /// * `Err(Hangup)` - the callee slammed the phone first
    /// * `Err(InvalidState)` - the phone was never connected or is already
    ///   hung up
    pub fn hangup(phone: &Kobj<Phone>) -> Result<(), IpcError> {
        let mut inner = phone.inner.lock();
        match inner.state {
            PhoneState::Free | PhoneState::Hungup => return Err(IpcError::InvalidState),
            PhoneState::Slammed => return Err(IpcError::Hangup),
            PhoneState::Connecting => {
                inner.state = PhoneState::Hungup;
                drop(inner);
                log::debug!("phone {:?}: hung up while connecting", phone);
                return Ok(());
            }
            PhoneState::Connected => {}
        }

        let callee = inner.callee.take();
        inner.state = PhoneState::Hungup;

        let mut unlinked = None;
        let mut rejected = None;
        if let Some(callee) = &callee {
            unlinked = callee.lock_state().unlink(phone);

            if let Some(mut call) = inner.hangup_call.take() {
                call.prepare_hangup(phone.clone());
                phone.add_call();
                if let Err(call) = callee.enqueue_call(call) {
                    phone.remove_call();
                    rejected = Some(call);
                }
            }
        }
        drop(inner);

        log::debug!("phone {:?}: hung up", phone);
        drop(rejected);
        drop(unlinked);
        drop(callee);
        Ok(())
    }

    /// Console dump of the phone's state.
    pub fn print_state(phone: &Kobj<Phone>) {
        let inner = phone.inner.lock();
        match &inner.callee {
            Some(callee) => crate::kprintln!(
                "{:?}: {:?} caller={} label={:#x} calls={} callee={:?}",
                phone,
                inner.state,
                phone.caller,
                phone.label(),
                phone.active_calls(),
                callee
            ),
            None => crate::kprintln!(
                "{:?}: {:?} caller={} label={:#x} calls={}",
                phone,
                inner.state,
                phone.caller,
                phone.label(),
                phone.active_calls()
            ),
        }
    }
}
