//! # Scenenet
//!
//! Location-transparent actors and RPC routing for sharded servers.
//!
//! Logical entities ("addressable actors") live on scenes, single-threaded
//! partitions pinned to worker threads. Any scene can reach an actor by its
//! stable 64-bit id without knowing where it currently runs.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ addressable   registry · service · client (id → route)       │
//! ├──────────────────────────────────────────────────────────────┤
//! │ messaging     opcodes · registry · dispatcher · pending calls │
//! ├──────────────────────────────┬───────────────────────────────┤
//! │ scene                        │ transport                     │
//! │ Scene · Shard · Scheduler    │ Network · Mailbox             │
//! ├──────────────────────────────┴───────────────────────────────┤
//! │ lock    FIFO per-key coroutine lock                          │
//! │ task    single-assignment tasks · pools · cancellation       │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Everything that waits, waits on a [`task::Task`]: lock grants, pending
//! calls and timers all complete tasks, and a scene's executor resumes
//! whoever awaited them.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use scenenet::addressable::{register_protocol, AddressableService};
//! use scenenet::prelude::*;
//!
//! let mut builder = MessageRegistry::builder();
//! register_protocol(&mut builder).unwrap();
//! let registry = builder.build();
//!
//! let mut scheduler = ShardScheduler::new(
//!     Network::new(),
//!     registry,
//!     SchedulingPolicy::Pooled { workers: 2 },
//!     RuntimeConfig::default(),
//! )
//! .unwrap();
//! scheduler
//!     .add_shard(SceneId(1), |scene| {
//!         AddressableService::install(scene).unwrap();
//!     })
//!     .unwrap();
//! ```

pub mod addressable;
pub mod config;
pub mod error;
pub mod lock;
pub mod messaging;
pub mod scene;
pub mod task;
pub mod transport;

pub use config::RuntimeConfig;
pub use error::{
    AddressableError, CallError, CodecError, CompletionError, ConfigError, DispatchError,
    HandlerError, LockError, RegistryError, SceneError, SchedulerError, TaskError, TransportError,
};
pub use messaging::{ErrorCode, MessageRegistry, OpCode, RouteId, SceneId};

/// Commonly used types.
pub mod prelude {
    pub use crate::addressable::{AddressableClient, AddressableDirectory};
    pub use crate::config::RuntimeConfig;
    pub use crate::error::{CallError, HandlerError};
    pub use crate::lock::{CoroutineLock, LockNamespace, WaitTicket};
    pub use crate::messaging::{
        ErrorCode, Message, MessageRegistry, OpCode, OpCodeCategory, Request, Response, RouteId,
        SceneId, SerializerTag,
    };
    pub use crate::scene::{Scene, SchedulingPolicy, Shard, ShardScheduler};
    pub use crate::task::{CancellationToken, Task, TaskStatus};
    pub use crate::transport::Network;
}
