//! Error types for the scenenet runtime.
//!
//! Every fallible operation in the crate returns one of the enums below.
//! Programming errors (double completion, double dispose, unlock without a
//! matching lock) are surfaced as `Err` values and logged at `error!` by the
//! component that detected them; they never panic.

use thiserror::Error;

use crate::messaging::{ErrorCode, OpCode, RouteId, SceneId};
use crate::task::TaskStatus;

/// Outcome of a task that did not succeed.
///
/// Cloneable so a single fault can be handed to every observer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    /// The task was canceled through its cancellation token.
    #[error("task canceled")]
    Canceled,

    /// The task's deadline elapsed before a result was produced.
    #[error("task timed out")]
    Timeout,

    /// The peer producing the result went away.
    #[error("peer disconnected")]
    Disconnected,

    /// The producer reported a failure.
    #[error("task failed: {0}")]
    Failed(String),

    /// The result was already taken by another observer.
    #[error("task result already consumed")]
    Consumed,
}

/// Returned when a task is completed more than once.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompletionError {
    /// The task already left the pending state.
    #[error("task already completed with status {status:?}")]
    AlreadyCompleted {
        /// Status the task settled in first.
        status: TaskStatus,
    },
}

/// Errors from the coroutine lock.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LockError {
    /// A ticket was disposed twice.
    #[error("wait ticket for key {key} in namespace {namespace} already disposed")]
    AlreadyDisposed { namespace: u32, key: u64 },

    /// The wait was canceled before ownership was granted.
    #[error("lock wait for key {key} in namespace {namespace} canceled")]
    Canceled { namespace: u32, key: u64 },
}

/// Errors from the addressable registry, service and client.
#[derive(Debug, Error)]
pub enum AddressableError {
    /// `unlock` was called for an id that holds no outstanding lock.
    #[error("addressable {id} is not locked (unlock from {source_site})")]
    NotLocked { id: u64, source_site: String },

    /// Waiting on the per-id lock failed.
    #[error("addressable lock failed: {0}")]
    Lock(#[from] LockError),

    /// The RPC to the hosting scene failed.
    #[error("addressable call failed: {0}")]
    Call(#[from] CallError),

    /// The hosting scene answered with a non-success code.
    #[error("addressable {id} operation rejected with {code}")]
    Remote { id: u64, code: ErrorCode },

    /// The id currently resolves to no route.
    #[error("addressable {id} has no route")]
    NotFound { id: u64 },

    /// The client was configured without any hosting scene.
    #[error("no addressable host scenes configured")]
    NoHosts,

    /// The scene the client belongs to has been dropped.
    #[error("owning scene is gone")]
    SceneGone,

    /// Installing the registry on a scene failed.
    #[error("addressable install failed: {0}")]
    Registry(#[from] RegistryError),

    #[error("addressable install failed: {0}")]
    Scene(#[from] SceneError),
}

/// Errors from the serialization layer.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Failed to encode a message to bytes.
    #[error("encode error: {0}")]
    Encode(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Failed to decode bytes to a message.
    #[error("decode error: {0}")]
    Decode(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// The opcode carries a serializer tag no codec is registered for.
    #[error("unknown serializer tag {0}")]
    UnknownSerializer(u8),
}

/// Errors raised while building the opcode registry or registering handlers.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Two distinct types claim the same opcode.
    #[error("opcode {opcode} registered by both {existing} and {new}")]
    DuplicateOpCode {
        opcode: OpCode,
        existing: &'static str,
        new: &'static str,
    },

    /// The opcode's category band does not match the declared message kind.
    #[error("{name} uses opcode {opcode} outside the {expected} band")]
    CategoryMismatch {
        name: &'static str,
        opcode: OpCode,
        expected: &'static str,
    },

    /// A handler was registered for an opcode missing from the registry.
    #[error("{name} (opcode {opcode}) is not registered")]
    Unregistered { name: &'static str, opcode: OpCode },

    /// A handler already exists for the opcode.
    #[error("handler for opcode {0} already registered")]
    DuplicateHandler(OpCode),
}

/// Errors raised while dispatching a single inbound frame.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The opcode is outside every known band or unregistered.
    #[error("unsupported opcode {0}")]
    Unsupported(OpCode),

    /// No error response can be synthesized for this request opcode.
    #[error("opcode {0} has no registered response type")]
    NoResponseType(OpCode),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Errors surfaced to the caller of `send`/`call`.
#[derive(Debug, Error)]
pub enum CallError {
    /// No response arrived before the rpc deadline.
    #[error("call timed out")]
    Timeout,

    /// The call was canceled by its token.
    #[error("call canceled")]
    Canceled,

    /// The destination became unreachable.
    #[error("destination disconnected")]
    Disconnected,

    /// The response frame carried an unexpected opcode.
    #[error("expected response opcode {expected}, got {actual}")]
    UnexpectedResponse { expected: OpCode, actual: OpCode },

    #[error("call failed: {0}")]
    Failed(String),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

impl From<TaskError> for CallError {
    fn from(error: TaskError) -> Self {
        match error {
            TaskError::Timeout => CallError::Timeout,
            TaskError::Canceled => CallError::Canceled,
            TaskError::Disconnected => CallError::Disconnected,
            TaskError::Failed(reason) => CallError::Failed(reason),
            TaskError::Consumed => CallError::Failed("response already consumed".to_string()),
        }
    }
}

/// Errors returned by message and request handlers.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Generic handler failure, answered with `ERR_HANDLER_FAILED`.
    #[error("handler failed: {0}")]
    Failed(String),

    /// Answer the request with this specific error code.
    #[error("handler rejected request with {0}")]
    Code(ErrorCode),

    /// The entity at the target route is not of the handler's type.
    #[error("entity at route is not a {expected}")]
    EntityTypeMismatch { expected: &'static str },

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("nested call failed: {0}")]
    Call(#[from] CallError),

    #[error("addressable error: {0}")]
    Addressable(#[from] AddressableError),
}

impl HandlerError {
    /// Error code sent back to the caller when this error ends a request.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            HandlerError::Code(code) => *code,
            HandlerError::EntityTypeMismatch { .. } => ErrorCode::ERR_ENTITY_TYPE_MISMATCH,
            HandlerError::Call(CallError::Timeout) => ErrorCode::ERR_ROUTE_TIMEOUT,
            HandlerError::Call(_) => ErrorCode::ERR_RPC_FAIL,
            HandlerError::Failed(_) | HandlerError::Codec(_) | HandlerError::Addressable(_) => {
                ErrorCode::ERR_HANDLER_FAILED
            }
        }
    }
}

/// Errors from the scene-local entity table.
#[derive(Debug, Error)]
pub enum SceneError {
    /// An entity or relay already occupies the route.
    #[error("route {0} already in use")]
    RouteInUse(RouteId),

    /// The route belongs to another scene.
    #[error("route {route} does not belong to scene {scene}")]
    ForeignRoute { route: RouteId, scene: SceneId },
}

/// Errors from the in-process transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// No mailbox is attached for the destination scene.
    #[error("unknown scene {0}")]
    UnknownScene(SceneId),

    /// A mailbox is already attached for the scene.
    #[error("scene {0} already attached")]
    SceneExists(SceneId),

    /// Scene 0 cannot be attached.
    #[error("scene 0 is reserved")]
    ReservedScene,
}

/// Errors from the shard scheduler.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// A worker thread could not be started.
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] std::io::Error),

    /// The worker owning the shard has exited.
    #[error("worker thread is gone")]
    WorkerGone,

    /// The scheduler was configured with zero pooled workers.
    #[error("pooled policy requires at least one worker")]
    NoWorkers,
}

/// Errors from loading or validating runtime configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A field holds a value the runtime cannot operate with.
    #[error("invalid {field}: {reason}")]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
}
