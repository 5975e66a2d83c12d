//! Packed 32-bit opcodes.
//!
//! ```text
//!  31      27 26   23 22                    0
//! ┌──────────┬───────┬───────────────────────┐
//! │ category │ codec │         index         │
//! │  5 bits  │ 4 bits│        23 bits        │
//! └──────────┴───────┴───────────────────────┘
//! ```
//!
//! Categories occupy contiguous, increasing numeric bands, so an opcode is
//! classified by comparing the raw value against band bounds without
//! extracting any field.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CodecError;
use crate::messaging::codec::SerializerTag;

const INDEX_BITS: u32 = 23;
const SERIALIZER_BITS: u32 = 4;
const SERIALIZER_SHIFT: u32 = INDEX_BITS;
const CATEGORY_SHIFT: u32 = INDEX_BITS + SERIALIZER_BITS;

/// Largest index a category can hold.
pub const MAX_INDEX: u32 = (1 << INDEX_BITS) - 1;
const SERIALIZER_MASK: u32 = (1 << SERIALIZER_BITS) - 1;

const fn band_start(category: u32) -> u32 {
    category << CATEGORY_SHIFT
}

const fn band_end(category: u32) -> u32 {
    band_start(category) | ((1 << CATEGORY_SHIFT) - 1)
}

const MESSAGE_START: u32 = band_start(1);
const MESSAGE_END: u32 = band_end(1);
const REQUEST_START: u32 = band_start(2);
const REQUEST_END: u32 = band_end(2);
const RESPONSE_START: u32 = band_start(3);
const RESPONSE_END: u32 = band_end(3);
const ROUTE_MESSAGE_START: u32 = band_start(4);
const ROUTE_MESSAGE_END: u32 = band_end(4);
const ROUTE_REQUEST_START: u32 = band_start(5);
const ROUTE_REQUEST_END: u32 = band_end(5);
const ROUTE_RESPONSE_START: u32 = band_start(6);
const ROUTE_RESPONSE_END: u32 = band_end(6);
const ADDRESSABLE_MESSAGE_START: u32 = band_start(7);
const ADDRESSABLE_MESSAGE_END: u32 = band_end(7);
const ADDRESSABLE_REQUEST_START: u32 = band_start(8);
const ADDRESSABLE_REQUEST_END: u32 = band_end(8);
const ADDRESSABLE_RESPONSE_START: u32 = band_start(9);
const ADDRESSABLE_RESPONSE_END: u32 = band_end(9);

/// Message category, stored in the top five bits of an opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum OpCodeCategory {
    Message = 1,
    Request = 2,
    Response = 3,
    RouteMessage = 4,
    RouteRequest = 5,
    RouteResponse = 6,
    AddressableMessage = 7,
    AddressableRequest = 8,
    AddressableResponse = 9,
}

impl OpCodeCategory {
    /// The response band answering this request band, if any.
    pub fn response_category(self) -> Option<OpCodeCategory> {
        match self {
            OpCodeCategory::Request => Some(OpCodeCategory::Response),
            OpCodeCategory::RouteRequest => Some(OpCodeCategory::RouteResponse),
            OpCodeCategory::AddressableRequest => Some(OpCodeCategory::AddressableResponse),
            _ => None,
        }
    }
}

/// How the dispatcher handles a frame, decided by opcode band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    /// One-way message to the scene.
    Message,
    /// Request to the scene, answered on the sender's channel.
    Request,
    /// Answer to a pending call.
    Response,
    /// One-way message to an entity in the scene.
    RouteMessage,
    /// Request to an entity in the scene.
    RouteRequest,
    /// Outside every known band.
    Unsupported,
}

/// Packed category, serializer tag and per-category index.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OpCode(u32);

impl OpCode {
    /// Pack an opcode. `index` is truncated to 23 bits.
    pub const fn new(category: OpCodeCategory, serializer: SerializerTag, index: u32) -> Self {
        OpCode(
            ((category as u32) << CATEGORY_SHIFT)
                | (((serializer as u32) & SERIALIZER_MASK) << SERIALIZER_SHIFT)
                | (index & MAX_INDEX),
        )
    }

    pub const fn from_raw(raw: u32) -> Self {
        OpCode(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub const fn index(self) -> u32 {
        self.0 & MAX_INDEX
    }

    /// The category field, if it names a known category.
    pub fn category(self) -> Option<OpCodeCategory> {
        match self.0 >> CATEGORY_SHIFT {
            1 => Some(OpCodeCategory::Message),
            2 => Some(OpCodeCategory::Request),
            3 => Some(OpCodeCategory::Response),
            4 => Some(OpCodeCategory::RouteMessage),
            5 => Some(OpCodeCategory::RouteRequest),
            6 => Some(OpCodeCategory::RouteResponse),
            7 => Some(OpCodeCategory::AddressableMessage),
            8 => Some(OpCodeCategory::AddressableRequest),
            9 => Some(OpCodeCategory::AddressableResponse),
            _ => None,
        }
    }

    /// The codec selected by the serializer field.
    pub fn serializer(self) -> Result<SerializerTag, CodecError> {
        SerializerTag::try_from(((self.0 >> SERIALIZER_SHIFT) & SERIALIZER_MASK) as u8)
    }

    /// Classify by numeric band.
    pub fn classify(self) -> FrameKind {
        match self.0 {
            MESSAGE_START..=MESSAGE_END => FrameKind::Message,
            REQUEST_START..=REQUEST_END => FrameKind::Request,
            RESPONSE_START..=RESPONSE_END => FrameKind::Response,
            ROUTE_MESSAGE_START..=ROUTE_MESSAGE_END => FrameKind::RouteMessage,
            ROUTE_REQUEST_START..=ROUTE_REQUEST_END => FrameKind::RouteRequest,
            ROUTE_RESPONSE_START..=ROUTE_RESPONSE_END => FrameKind::Response,
            ADDRESSABLE_MESSAGE_START..=ADDRESSABLE_MESSAGE_END => FrameKind::RouteMessage,
            ADDRESSABLE_REQUEST_START..=ADDRESSABLE_REQUEST_END => FrameKind::RouteRequest,
            ADDRESSABLE_RESPONSE_START..=ADDRESSABLE_RESPONSE_END => FrameKind::Response,
            _ => FrameKind::Unsupported,
        }
    }
}

impl fmt::Debug for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OpCode({:#010x})", self.0)
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}
