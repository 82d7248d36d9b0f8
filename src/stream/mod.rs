//! Stream types and typed stream wrappers
//!
//! Every unidirectional stream starts with a varint naming its type. Types
//! 0 to 3 are reserved singletons: a peer may open at most one of each per
//! connection. Other types are handed to the application.

mod typed;

pub use typed::{ReadableStream, RequestStream, WritableStream};

pub(crate) use typed::{ConnHandle, ConnRef};

use crate::varint;
use std::fmt;

/// HTTP/3 unidirectional stream type (RFC 9114 Section 6.2)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamType(pub u64);

impl StreamType {
    pub const CONTROL: Self = Self(0x00);
    pub const PUSH: Self = Self(0x01);
    pub const QPACK_ENCODER: Self = Self(0x02);
    pub const QPACK_DECODER: Self = Self(0x03);

    /// Number of reserved singleton types
    pub const RESERVED: usize = 4;

    /// Control, push or one of the QPACK streams
    pub fn is_reserved(self) -> bool {
        self.0 < Self::RESERVED as u64
    }

    /// Reserved grease value of the form `0x1f * N + 0x21`
    pub fn is_grease(self) -> bool {
        self.0 >= 0x21 && (self.0 - 0x21) % 0x1f == 0
    }

    /// Whether a stream of this type may be opened locally
    pub fn is_valid(self) -> bool {
        self.0 <= varint::MAX && !self.is_grease()
    }

    fn slot(self) -> Option<usize> {
        self.is_reserved().then_some(self.0 as usize)
    }
}

impl fmt::Display for StreamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::CONTROL => f.write_str("control stream"),
            Self::PUSH => f.write_str("push stream"),
            Self::QPACK_ENCODER => f.write_str("QPACK encoder stream"),
            Self::QPACK_DECODER => f.write_str("QPACK decoder stream"),
            Self(t) => write!(f, "stream type {:#x}", t),
        }
    }
}

/// One entry per reserved stream type
#[derive(Debug)]
pub(crate) struct StreamSlots<T> {
    slots: [Option<T>; StreamType::RESERVED],
}

impl<T> StreamSlots<T> {
    pub fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| None),
        }
    }

    /// Record `value` for a reserved type
    ///
    /// Hands `value` back if the slot is already taken or `ty` is not
    /// reserved.
    pub fn claim(&mut self, ty: StreamType, value: T) -> Result<(), T> {
        match ty.slot() {
            Some(i) if self.slots[i].is_none() => {
                self.slots[i] = Some(value);
                Ok(())
            }
            _ => Err(value),
        }
    }

    pub fn get(&self, ty: StreamType) -> Option<&T> {
        ty.slot().and_then(|i| self.slots[i].as_ref())
    }

    pub fn is_claimed(&self, ty: StreamType) -> bool {
        ty.slot().is_some_and(|i| self.slots[i].is_some())
    }
}
