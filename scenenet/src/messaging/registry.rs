//! Startup-built opcode table.
//!
//! The registry maps opcodes to their message types and back. It is built
//! once per process with [`MessageRegistryBuilder`], frozen into an
//! `Arc<MessageRegistry>` and handed to every scene. Opcodes missing from
//! the registry are treated as unsupported by the dispatcher.
//!
//! For requests the registry also stores a function that encodes a default
//! response carrying only an [`ErrorCode`]; this is how the dispatcher
//! answers "route not found" or a failed handler for any request type.

use std::any::{type_name, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{CodecError, DispatchError, RegistryError};
use crate::messaging::{
    error_response, ErrorCode, Message, OpCode, OpCodeCategory, Request, Response,
};

type ErrorResponseFn = fn(ErrorCode) -> Result<Vec<u8>, CodecError>;

/// What the registry knows about one opcode.
#[derive(Debug, Clone)]
pub struct MessageInfo {
    pub name: &'static str,
    pub opcode: OpCode,
    pub category: OpCodeCategory,
    /// Response opcode, for requests.
    pub response: Option<OpCode>,
    type_id: TypeId,
    error_response: Option<ErrorResponseFn>,
}

/// Bidirectional opcode ↔ type table.
#[derive(Debug, Default)]
pub struct MessageRegistry {
    by_opcode: HashMap<OpCode, MessageInfo>,
    by_type: HashMap<TypeId, OpCode>,
}

impl MessageRegistry {
    pub fn builder() -> MessageRegistryBuilder {
        MessageRegistryBuilder::default()
    }

    pub fn info(&self, opcode: OpCode) -> Option<&MessageInfo> {
        self.by_opcode.get(&opcode)
    }

    pub fn contains(&self, opcode: OpCode) -> bool {
        self.by_opcode.contains_key(&opcode)
    }

    /// Opcode registered for `M`.
    pub fn opcode_of<M: 'static>(&self) -> Option<OpCode> {
        self.by_type.get(&TypeId::of::<M>()).copied()
    }

    /// Type name for logging; `"unregistered"` when unknown.
    pub fn name_of(&self, opcode: OpCode) -> &'static str {
        self.info(opcode).map(|i| i.name).unwrap_or("unregistered")
    }

    pub fn len(&self) -> usize {
        self.by_opcode.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_opcode.is_empty()
    }

    /// Encode the error answer to a `request` opcode.
    ///
    /// Returns the response opcode and its payload.
    pub fn error_response(
        &self,
        request: OpCode,
        code: ErrorCode,
    ) -> Result<(OpCode, Vec<u8>), DispatchError> {
        let info = self
            .info(request)
            .ok_or(DispatchError::Unsupported(request))?;
        match (info.response, info.error_response) {
            (Some(response), Some(build)) => Ok((response, build(code)?)),
            _ => Err(DispatchError::NoResponseType(request)),
        }
    }
}

/// Collects message definitions before freezing them into a registry.
///
/// ```rust,ignore
/// let mut builder = MessageRegistry::builder();
/// builder.request::<Ping>()?.message::<Chat>()?;
/// register_protocol(&mut builder)?;
/// let registry = builder.build();
/// ```
#[derive(Debug, Default)]
pub struct MessageRegistryBuilder {
    registry: MessageRegistry,
}

impl MessageRegistryBuilder {
    /// Register a one-way message type.
    pub fn message<M: Message>(&mut self) -> Result<&mut Self, RegistryError> {
        let category = expect_category::<M>(
            &[
                OpCodeCategory::Message,
                OpCodeCategory::RouteMessage,
                OpCodeCategory::AddressableMessage,
            ],
            "message",
        )?;
        self.insert(MessageInfo {
            name: type_name::<M>(),
            opcode: M::OPCODE,
            category,
            response: None,
            type_id: TypeId::of::<M>(),
            error_response: None,
        })?;
        Ok(self)
    }

    /// Register a request type together with its response type.
    pub fn request<R: Request>(&mut self) -> Result<&mut Self, RegistryError> {
        let category = expect_category::<R>(
            &[
                OpCodeCategory::Request,
                OpCodeCategory::RouteRequest,
                OpCodeCategory::AddressableRequest,
            ],
            "request",
        )?;
        let Some(response_category) = R::Response::OPCODE
            .category()
            .filter(|c| Some(*c) == category.response_category())
        else {
            return Err(RegistryError::CategoryMismatch {
                name: type_name::<R::Response>(),
                opcode: R::Response::OPCODE,
                expected: "matching response",
            });
        };

        self.insert(MessageInfo {
            name: type_name::<R::Response>(),
            opcode: R::Response::OPCODE,
            category: response_category,
            response: None,
            type_id: TypeId::of::<R::Response>(),
            error_response: None,
        })?;
        self.insert(MessageInfo {
            name: type_name::<R>(),
            opcode: R::OPCODE,
            category,
            response: Some(R::Response::OPCODE),
            type_id: TypeId::of::<R>(),
            error_response: Some(encode_error_response::<R::Response>),
        })?;
        Ok(self)
    }

    /// Freeze the registry.
    pub fn build(self) -> Arc<MessageRegistry> {
        Arc::new(self.registry)
    }

    fn insert(&mut self, info: MessageInfo) -> Result<(), RegistryError> {
        if let Some(existing) = self.registry.by_opcode.get(&info.opcode) {
            if existing.type_id == info.type_id {
                return Ok(());
            }
            return Err(RegistryError::DuplicateOpCode {
                opcode: info.opcode,
                existing: existing.name,
                new: info.name,
            });
        }
        self.registry.by_type.insert(info.type_id, info.opcode);
        self.registry.by_opcode.insert(info.opcode, info);
        Ok(())
    }
}

fn expect_category<M: Message>(
    allowed: &[OpCodeCategory],
    expected: &'static str,
) -> Result<OpCodeCategory, RegistryError> {
    match M::OPCODE.category() {
        Some(category) if allowed.contains(&category) => Ok(category),
        _ => Err(RegistryError::CategoryMismatch {
            name: type_name::<M>(),
            opcode: M::OPCODE,
            expected,
        }),
    }
}

fn encode_error_response<R: Response>(code: ErrorCode) -> Result<Vec<u8>, CodecError> {
    R::OPCODE.serializer()?.encode(&error_response::<R>(code))
}
