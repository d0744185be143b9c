//! Object Manager - the kinds of kernel objects a capability can name

use super::kobject::{Kobj, KobjClass};
use crate::nexus::{Answerbox, Endpoint, IpcBlob, IpcBuffer, Phone};
use core::fmt;

/// Type of a kernel object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectType {
    Phone,
    Answerbox,
    IpcBuffer,
    Endpoint,
    IpcBlob,
}

/// A reference to a kernel object of any kind.
#[derive(Clone)]
pub enum KernelObject {
    Phone(Kobj<Phone>),
    Answerbox(Kobj<Answerbox>),
    IpcBuffer(Kobj<IpcBuffer>),
    Endpoint(Kobj<Endpoint>),
    IpcBlob(Kobj<IpcBlob>),
}

impl KernelObject {
    pub fn object_type(&self) -> ObjectType {
        match self {
            KernelObject::Phone(_) => ObjectType::Phone,
            KernelObject::Answerbox(_) => ObjectType::Answerbox,
            KernelObject::IpcBuffer(_) => ObjectType::IpcBuffer,
            KernelObject::Endpoint(_) => ObjectType::Endpoint,
            KernelObject::IpcBlob(_) => ObjectType::IpcBlob,
        }
    }

    /// Borrow the object as a `T`, if it is one.
    pub fn as_kind<T: KobjKind>(&self) -> Option<&Kobj<T>> {
        T::peek(self)
    }
}

impl fmt::Debug for KernelObject {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            KernelObject::Phone(obj) => fmt::Debug::fmt(obj, f),
            KernelObject::Answerbox(obj) => fmt::Debug::fmt(obj, f),
            KernelObject::IpcBuffer(obj) => fmt::Debug::fmt(obj, f),
            KernelObject::Endpoint(obj) => fmt::Debug::fmt(obj, f),
            KernelObject::IpcBlob(obj) => fmt::Debug::fmt(obj, f),
        }
    }
}

/// Kernel object classes that capabilities can name, with conversions in and
/// out of [`KernelObject`].
pub trait KobjKind: KobjClass {
    const TYPE: ObjectType;

    fn wrap(obj: Kobj<Self>) -> KernelObject;

    fn peek(obj: &KernelObject) -> Option<&Kobj<Self>>;
}

macro_rules! kobj_kind {
    ($ty:ident) => {
        impl KobjKind for $ty {
            const TYPE: ObjectType = ObjectType::$ty;

            fn wrap(obj: Kobj<Self>) -> KernelObject {
                KernelObject::$ty(obj)
            }

            fn peek(obj: &KernelObject) -> Option<&Kobj<Self>> {
                match obj {
                    KernelObject::$ty(obj) => Some(obj),
                    _ => None,
                }
            }
        }

        impl From<Kobj<$ty>> for KernelObject {
            fn from(obj: Kobj<$ty>) -> Self {
                KernelObject::$ty(obj)
            }
        }
    };
}

kobj_kind!(Phone);
kobj_kind!(Answerbox);
kobj_kind!(IpcBuffer);
kobj_kind!(Endpoint);
kobj_kind!(IpcBlob);
