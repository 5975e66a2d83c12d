//! Message definitions and response error codes.
//!
//! Every wire type implements [`Message`] and names its opcode. Requests
//! name their response type; responses carry an [`ErrorCode`] so any
//! request can be answered with an error without knowing the response's
//! other fields.
//!
//! # Example
//!
//! ```rust
//! use serde::{Deserialize, Serialize};
//! use scenenet::messaging::{
//!     ErrorCode, Message, OpCode, OpCodeCategory, Request, Response, SerializerTag,
//! };
//!
//! #[derive(Serialize, Deserialize)]
//! struct Ping { seq: u32 }
//!
//! #[derive(Serialize, Deserialize, Default)]
//! struct Pong { seq: u32, error: ErrorCode }
//!
//! impl Message for Ping {
//!     const OPCODE: OpCode = OpCode::new(OpCodeCategory::Request, SerializerTag::Json, 1);
//! }
//! impl Request for Ping {
//!     type Response = Pong;
//! }
//! impl Message for Pong {
//!     const OPCODE: OpCode = OpCode::new(OpCodeCategory::Response, SerializerTag::Json, 1);
//! }
//! impl Response for Pong {
//!     fn error_code(&self) -> ErrorCode { self.error }
//!     fn set_error_code(&mut self, code: ErrorCode) { self.error = code; }
//! }
//! ```

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::messaging::OpCode;

/// Stable numeric result code carried by every response.
///
/// Zero is success; every other constant is distinct so callers can branch
/// without string matching.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ErrorCode(pub u32);

impl ErrorCode {
    pub const SUCCESS: ErrorCode = ErrorCode(0);
    /// The call could not be completed (relay or nested call failure).
    pub const ERR_RPC_FAIL: ErrorCode = ErrorCode(100_000_002);
    /// No entity exists at the target route.
    pub const ERR_NOT_FOUND_ROUTE: ErrorCode = ErrorCode(100_000_003);
    /// A forwarded call timed out.
    pub const ERR_ROUTE_TIMEOUT: ErrorCode = ErrorCode(100_000_004);
    /// The request handler returned an error.
    pub const ERR_HANDLER_FAILED: ErrorCode = ErrorCode(100_000_005);
    /// No handler is registered for the request opcode.
    pub const ERR_NO_HANDLER: ErrorCode = ErrorCode(100_000_006);
    /// The entity at the route is not of the handler's type.
    pub const ERR_ENTITY_TYPE_MISMATCH: ErrorCode = ErrorCode(100_000_007);
    /// Addressable unlock without an outstanding lock.
    pub const ERR_ADDRESSABLE_NOT_LOCKED: ErrorCode = ErrorCode(100_000_008);
    /// Addressable lock wait failed.
    pub const ERR_ADDRESSABLE_LOCK_FAILED: ErrorCode = ErrorCode(100_000_009);

    pub const fn is_success(self) -> bool {
        self.0 == 0
    }

    fn name(self) -> Option<&'static str> {
        Some(match self {
            ErrorCode::SUCCESS => "SUCCESS",
            ErrorCode::ERR_RPC_FAIL => "ERR_RPC_FAIL",
            ErrorCode::ERR_NOT_FOUND_ROUTE => "ERR_NOT_FOUND_ROUTE",
            ErrorCode::ERR_ROUTE_TIMEOUT => "ERR_ROUTE_TIMEOUT",
            ErrorCode::ERR_HANDLER_FAILED => "ERR_HANDLER_FAILED",
            ErrorCode::ERR_NO_HANDLER => "ERR_NO_HANDLER",
            ErrorCode::ERR_ENTITY_TYPE_MISMATCH => "ERR_ENTITY_TYPE_MISMATCH",
            ErrorCode::ERR_ADDRESSABLE_NOT_LOCKED => "ERR_ADDRESSABLE_NOT_LOCKED",
            ErrorCode::ERR_ADDRESSABLE_LOCK_FAILED => "ERR_ADDRESSABLE_LOCK_FAILED",
            _ => return None,
        })
    }
}

impl fmt::Debug for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{name}"),
            None => write!(f, "ErrorCode({})", self.0),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{name} ({})", self.0),
            None => write!(f, "error {}", self.0),
        }
    }
}

/// A type that travels in a frame payload.
pub trait Message: Serialize + DeserializeOwned + 'static {
    const OPCODE: OpCode;
}

/// A message answered by exactly one [`Response`].
pub trait Request: Message {
    type Response: Response;
}

/// Answer to a [`Request`].
///
/// `Default` plus [`Response::set_error_code`] is enough to synthesize an
/// error answer for any request.
pub trait Response: Message + Default {
    fn error_code(&self) -> ErrorCode;

    fn set_error_code(&mut self, code: ErrorCode);
}

/// A default response carrying only `code`.
pub fn error_response<R: Response>(code: ErrorCode) -> R {
    let mut response = R::default();
    response.set_error_code(code);
    response
}
