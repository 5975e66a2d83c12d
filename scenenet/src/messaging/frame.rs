//! Framed packets exchanged between scenes.

use crate::error::{CallError, CodecError};
use crate::messaging::{Message, OpCode, Response, RouteId};

/// One packet: `{opcode, rpc_id, route_id, payload}`.
///
/// `rpc_id` is zero for one-way traffic and echoes the request's id on
/// responses. `route_id` is the destination scene or entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub opcode: OpCode,
    pub rpc_id: u32,
    pub route_id: RouteId,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Serialize `message` with the codec its opcode names.
    pub fn encode<M: Message>(rpc_id: u32, route_id: RouteId, message: &M) -> Result<Self, CodecError> {
        Ok(Self {
            opcode: M::OPCODE,
            rpc_id,
            route_id,
            payload: M::OPCODE.serializer()?.encode(message)?,
        })
    }

    /// Deserialize the payload with the codec named by this frame's opcode.
    pub fn decode<M: Message>(&self) -> Result<M, CodecError> {
        self.opcode.serializer()?.decode(&self.payload)
    }

    /// Decode an answer to a call, checking its opcode first.
    pub fn decode_response<R: Response>(&self) -> Result<R, CallError> {
        if self.opcode != R::OPCODE {
            return Err(CallError::UnexpectedResponse {
                expected: R::OPCODE,
                actual: self.opcode,
            });
        }
        Ok(self.decode()?)
    }
}
