//! Opcodes, frames, codecs and the dispatch path between scenes.
//!
//! - [`opcode`]: packed opcodes and band classification
//! - [`route`]: scene and route identifiers
//! - [`codec`]: serializer tags and codecs
//! - [`message`]: message traits and error codes
//! - [`registry`]: the startup opcode table
//! - [`pending`]: calls awaiting a response
//! - [`dispatcher`]: per-frame handling on the receiving scene

pub mod codec;
pub mod dispatcher;
pub mod frame;
pub mod message;
pub mod opcode;
pub mod pending;
pub mod registry;
pub mod route;

pub use codec::{JsonCodec, MessageCodec, MessagePackCodec, SerializerTag};
pub use dispatcher::dispatch;
pub use frame::Frame;
pub use message::{error_response, ErrorCode, Message, Request, Response};
pub use opcode::{FrameKind, OpCode, OpCodeCategory, MAX_INDEX};
pub use pending::{PendingCall, PendingCalls};
pub use registry::{MessageInfo, MessageRegistry, MessageRegistryBuilder};
pub use route::{RouteId, RouteIdFactory, SceneId};
