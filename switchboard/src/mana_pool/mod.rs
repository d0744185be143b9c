//! # The Mana Pool
//!
//! Where kernel objects come from and how they are named: object caches,
//! interrupt-safe locks for the data inside objects, the counted kernel
//! object pointer and the per-task capability tables.

pub mod capability;
pub mod capability_table;
pub mod interrupt_lock;
pub mod kobject;
pub mod object_manager;
pub mod slab;

pub use capability::{CapHandle, Handle};
pub use capability_table::{CapabilityError, CapabilityTable};
pub use interrupt_lock::{IrqSpinlock, IrqSpinlockGuard};
pub use kobject::{Kobj, KobjClass};
pub use object_manager::{KernelObject, KobjKind, ObjectType};
pub use slab::{FrameFlags, SlabCache, SlabObject};
