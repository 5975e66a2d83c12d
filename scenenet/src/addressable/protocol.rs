//! Wire messages of the addressable directory.
//!
//! All requests live in the addressable-request band and are sent as route
//! requests to the scene route of the hosting scene, where the
//! [`AddressableRegistry`](super::AddressableRegistry) is installed.

use serde::{Deserialize, Serialize};

use crate::error::RegistryError;
use crate::messaging::{
    ErrorCode, Message, MessageRegistryBuilder, OpCode, OpCodeCategory, Request, Response, RouteId,
    SerializerTag,
};

const fn request_opcode(index: u32) -> OpCode {
    OpCode::new(OpCodeCategory::AddressableRequest, SerializerTag::MessagePack, index)
}

const fn response_opcode(index: u32) -> OpCode {
    OpCode::new(OpCodeCategory::AddressableResponse, SerializerTag::MessagePack, index)
}

macro_rules! addressable_response {
    ($name:ident, $index:expr) => {
        impl Message for $name {
            const OPCODE: OpCode = response_opcode($index);
        }

        impl Response for $name {
            fn error_code(&self) -> ErrorCode {
                self.error
            }

            fn set_error_code(&mut self, code: ErrorCode) {
                self.error = code;
            }
        }
    };
}

/// Map `id` to `route`, optionally under the per-id lock.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressableAddRequest {
    pub id: u64,
    pub route: RouteId,
    pub exclusive: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressableAddResponse {
    pub error: ErrorCode,
}

/// Resolve `id`; answers `RouteId::NONE` for unknown ids.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressableGetRequest {
    pub id: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressableGetResponse {
    pub error: ErrorCode,
    pub route: RouteId,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressableRemoveRequest {
    pub id: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressableRemoveResponse {
    pub error: ErrorCode,
}

/// Take and hold the per-id lock until a matching unlock.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressableLockRequest {
    pub id: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressableLockResponse {
    pub error: ErrorCode,
}

/// Release a held lock, moving the id to `route` unless it is `NONE`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressableUnlockRequest {
    pub id: u64,
    pub route: RouteId,
    /// Call site, reported when no lock is held.
    pub source: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressableUnlockResponse {
    pub error: ErrorCode,
}

impl Message for AddressableAddRequest {
    const OPCODE: OpCode = request_opcode(1);
}
impl Request for AddressableAddRequest {
    type Response = AddressableAddResponse;
}
addressable_response!(AddressableAddResponse, 1);

impl Message for AddressableGetRequest {
    const OPCODE: OpCode = request_opcode(2);
}
impl Request for AddressableGetRequest {
    type Response = AddressableGetResponse;
}
addressable_response!(AddressableGetResponse, 2);

impl Message for AddressableRemoveRequest {
    const OPCODE: OpCode = request_opcode(3);
}
impl Request for AddressableRemoveRequest {
    type Response = AddressableRemoveResponse;
}
addressable_response!(AddressableRemoveResponse, 3);

impl Message for AddressableLockRequest {
    const OPCODE: OpCode = request_opcode(4);
}
impl Request for AddressableLockRequest {
    type Response = AddressableLockResponse;
}
addressable_response!(AddressableLockResponse, 4);

impl Message for AddressableUnlockRequest {
    const OPCODE: OpCode = request_opcode(5);
}
impl Request for AddressableUnlockRequest {
    type Response = AddressableUnlockResponse;
}
addressable_response!(AddressableUnlockResponse, 5);

/// Add the addressable messages to a registry under construction.
pub fn register_protocol(builder: &mut MessageRegistryBuilder) -> Result<(), RegistryError> {
    builder
        .request::<AddressableAddRequest>()?
        .request::<AddressableGetRequest>()?
        .request::<AddressableRemoveRequest>()?
        .request::<AddressableLockRequest>()?
        .request::<AddressableUnlockRequest>()?;
    Ok(())
}
