//! Location-transparent addressing of actors by logical id.
//!
//! An addressable actor is registered under a stable `u64` id and may move
//! between scenes; callers reach it through the id alone.
//!
//! - [`AddressableRegistry`]: the id → route table of one hosting scene,
//!   serialized per id through a coroutine lock.
//! - [`AddressableService`]: installs a registry on a hosting scene and
//!   answers the wire protocol in [`protocol`].
//! - [`AddressableClient`]: resolves ids through the hosting scenes and
//!   forwards calls, retrying while an actor is between routes.
//!
//! Both the registry and the client implement [`AddressableDirectory`].
//!
//! # Migration
//!
//! ```text
//! lock_route(id)            writes and reads through the lock now wait
//! ... move the actor ...
//! unlock_route(id, new)     table updated, next waiter granted
//! ```

mod client;
pub mod protocol;
mod registry;
mod service;

pub use client::AddressableClient;
pub use protocol::register_protocol;
pub use registry::AddressableRegistry;
pub use service::AddressableService;

use async_trait::async_trait;

use crate::error::AddressableError;
use crate::messaging::RouteId;

/// Resolves addressable ids to routes.
#[async_trait(?Send)]
pub trait AddressableDirectory {
    /// Current route of `id`; `RouteId::NONE` when the id is unknown.
    async fn lookup(&self, id: u64) -> Result<RouteId, AddressableError>;

    /// Map `id` to `route` under the id's lock.
    async fn register(&self, id: u64, route: RouteId) -> Result<(), AddressableError>;

    async fn unregister(&self, id: u64) -> Result<(), AddressableError>;

    /// Hold the id's lock until [`unlock_route`](Self::unlock_route).
    async fn lock_route(&self, id: u64) -> Result<(), AddressableError>;

    /// Release the held lock, moving the id to `route` unless it is `NONE`.
    ///
    /// `source` names the call site and is reported when no lock is held.
    async fn unlock_route(&self, id: u64, route: RouteId, source: &str) -> Result<(), AddressableError>;
}
