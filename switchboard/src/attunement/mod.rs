//! # The Attunement Layer - interrupt priority levels
//!
//! Spinlock critical sections run with interrupts disabled. The architecture
//! code behind [`InterruptController`] knows how; this layer only saves the
//! previous level and puts it back on every exit path through [`IplGuard`].

use core::marker::PhantomData;
use spin::Once;

/// A saved interrupt priority level, opaque to everything but the controller
/// that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipl(pub usize);

/// Architecture interrupt control.
pub trait InterruptController: Sync {
    /// Disable interrupts, returning the level to restore later.
    fn interrupts_disable(&self) -> Ipl;
    fn interrupts_restore(&self, ipl: Ipl);
    fn interrupts_disabled(&self) -> bool;
}

static CONTROLLER: Once<&'static dyn InterruptController> = Once::new();

/// Install the interrupt controller. Only the first call has an effect.
pub fn install(controller: &'static dyn InterruptController) {
    CONTROLLER.call_once(|| controller);
}

fn controller() -> &'static dyn InterruptController {
    *CONTROLLER
        .get()
        .expect("attunement: no interrupt controller installed")
}

pub fn interrupts_disable() -> Ipl {
    controller().interrupts_disable()
}

pub fn interrupts_restore(ipl: Ipl) {
    controller().interrupts_restore(ipl)
}

pub fn interrupts_disabled() -> bool {
    controller().interrupts_disabled()
}

/// Interrupts stay disabled for the lifetime of the guard; the saved level
/// is restored on drop.
///
/// The guard is tied to the CPU that created it and is therefore `!Send`.
#[must_use = "interrupts are restored as soon as the guard is dropped"]
pub struct IplGuard {
    ipl: Ipl,
    _not_send: PhantomData<*const ()>,
}

impl IplGuard {
    pub fn disable() -> Self {
        Self {
            ipl: interrupts_disable(),
            _not_send: PhantomData,
        }
    }

    /// The level that will be restored.
    pub fn saved(&self) -> Ipl {
        self.ipl
    }
}

impl Drop for IplGuard {
    fn drop(&mut self) {
        interrupts_restore(self.ipl);
    }
}

/// Run `f` with interrupts disabled.
pub fn without_interrupts<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    let _ipl = IplGuard::disable();
    f()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock;

    #[test]
    fn test_guard_restores_previous_level() {
        mock::install();
        assert!(!interrupts_disabled());
        {
            let _outer = IplGuard::disable();
            assert!(interrupts_disabled());
            {
                let _inner = IplGuard::disable();
                assert!(interrupts_disabled());
            }
            // The inner guard restores "disabled", not "enabled".
            assert!(interrupts_disabled());
        }
        assert!(!interrupts_disabled());
    }

    #[test]
    fn test_without_interrupts_restores_on_panic() {
        mock::install();
        let result = std::panic::catch_unwind(|| {
            without_interrupts(|| panic!("inside critical section"));
        });
        assert!(result.is_err());
        assert!(!interrupts_disabled());
    }
}
