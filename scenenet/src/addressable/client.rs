//! Calls addressable actors by logical id from any scene.
//!
//! # Call Flow
//!
//! ```text
//! call_addressable(id, request)
//!   1. wait on the per-id call lock (ADDRESSABLE_CALL namespace)
//!   2. resolve id → route (cache, else Get on the hosting scene)
//!   3. route == NONE        → answer ERR_NOT_FOUND_ROUTE
//!   4. call the route
//!   5. ERR_NOT_FOUND_ROUTE  → forget the route, sleep, go to 2
//!                             (at most addressable_retry_limit times)
//!   6. anything else        → return the response
//! ```
//!
//! The hosting scene of an id is `hosts[id % hosts.len()]`.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::{Rc, Weak};

use async_trait::async_trait;
use tracing::{debug, error, warn};

use crate::addressable::protocol::{
    AddressableAddRequest, AddressableGetRequest, AddressableLockRequest,
    AddressableRemoveRequest, AddressableUnlockRequest,
};
use crate::addressable::AddressableDirectory;
use crate::error::AddressableError;
use crate::lock::LockNamespace;
use crate::messaging::{error_response, ErrorCode, Message, Request, Response, RouteId, SceneId};
use crate::scene::Scene;

/// Directory client bound to one scene.
pub struct AddressableClient {
    scene: Weak<Scene>,
    hosts: Vec<SceneId>,
    routes: RefCell<HashMap<u64, RouteId>>,
}

impl AddressableClient {
    pub fn new(scene: &Rc<Scene>, hosts: Vec<SceneId>) -> Self {
        Self {
            scene: Rc::downgrade(scene),
            hosts,
            routes: RefCell::new(HashMap::new()),
        }
    }

    pub fn hosts(&self) -> &[SceneId] {
        &self.hosts
    }

    /// Scene route of the registry responsible for `id`.
    pub fn host_of(&self, id: u64) -> Result<RouteId, AddressableError> {
        if self.hosts.is_empty() {
            return Err(AddressableError::NoHosts);
        }
        let host = self.hosts[(id % self.hosts.len() as u64) as usize];
        Ok(RouteId::for_scene(host))
    }

    /// Cached route of `id`, if any.
    pub fn cached_route(&self, id: u64) -> Option<RouteId> {
        self.routes.borrow().get(&id).copied()
    }

    fn scene(&self) -> Result<Rc<Scene>, AddressableError> {
        self.scene.upgrade().ok_or(AddressableError::SceneGone)
    }

    async fn request<R: Request>(&self, id: u64, request: &R) -> Result<R::Response, AddressableError> {
        let host = self.host_of(id)?;
        let scene = self.scene()?;
        let response = scene.call(host, request).await?;
        let code = response.error_code();
        if !code.is_success() {
            error!(id, %host, %code, request = std::any::type_name::<R>(), "addressable request rejected");
            return Err(AddressableError::Remote { id, code });
        }
        Ok(response)
    }

    async fn resolve(&self, id: u64) -> Result<RouteId, AddressableError> {
        if let Some(route) = self.cached_route(id) {
            return Ok(route);
        }
        let route = self.request(id, &AddressableGetRequest { id }).await?.route;
        if !route.is_none() {
            self.routes.borrow_mut().insert(id, route);
        }
        Ok(route)
    }

    /// Call the actor registered as `id`, following it if it moves.
    ///
    /// Calls to one id are serialized. When the id resolves to no route the
    /// answer is an `ERR_NOT_FOUND_ROUTE` response.
    pub async fn call_addressable<R: Request>(
        &self,
        id: u64,
        request: &R,
    ) -> Result<R::Response, AddressableError> {
        let scene = self.scene()?;
        let limit = scene.config().addressable_retry_limit();
        let retry_delay = scene.config().addressable_retry_delay();
        let _ticket = scene
            .coroutine_locks()
            .wait(LockNamespace::ADDRESSABLE_CALL, id, Some("call_addressable"))
            .await?;

        let mut failures = 0;
        loop {
            let route = self.resolve(id).await?;
            if route.is_none() {
                debug!(id, "addressable has no route");
                return Ok(error_response(ErrorCode::ERR_NOT_FOUND_ROUTE));
            }

            let response = scene.call(route, request).await?;
            match response.error_code() {
                ErrorCode::ERR_NOT_FOUND_ROUTE => {
                    self.routes.borrow_mut().remove(&id);
                    failures += 1;
                    if failures > limit {
                        error!(id, %route, failures, "addressable route not found, giving up");
                        return Ok(response);
                    }
                    warn!(id, %route, failures, "addressable route not found, retrying");
                    scene.delay(retry_delay).await.map_err(|_| AddressableError::SceneGone)?;
                }
                ErrorCode::ERR_ROUTE_TIMEOUT => {
                    error!(id, %route, request = R::OPCODE.raw(), "addressable route timed out");
                    return Ok(response);
                }
                _ => return Ok(response),
            }
        }
    }

    /// Send a one-way route message to the actor registered as `id`.
    pub async fn send_addressable<M: Message>(&self, id: u64, message: &M) -> Result<(), AddressableError> {
        let route = self.resolve(id).await?;
        if route.is_none() {
            return Err(AddressableError::NotFound { id });
        }
        self.scene()?.send(route, message)?;
        Ok(())
    }
}

impl fmt::Debug for AddressableClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddressableClient")
            .field("hosts", &self.hosts)
            .field("cached", &self.routes.borrow().len())
            .finish()
    }
}

#[async_trait(?Send)]
impl AddressableDirectory for AddressableClient {
    async fn lookup(&self, id: u64) -> Result<RouteId, AddressableError> {
        let route = self.request(id, &AddressableGetRequest { id }).await?.route;
        if route.is_none() {
            self.routes.borrow_mut().remove(&id);
        } else {
            self.routes.borrow_mut().insert(id, route);
        }
        Ok(route)
    }

    async fn register(&self, id: u64, route: RouteId) -> Result<(), AddressableError> {
        let request = AddressableAddRequest {
            id,
            route,
            exclusive: true,
        };
        self.request(id, &request).await?;
        self.routes.borrow_mut().insert(id, route);
        Ok(())
    }

    async fn unregister(&self, id: u64) -> Result<(), AddressableError> {
        self.request(id, &AddressableRemoveRequest { id }).await?;
        self.routes.borrow_mut().remove(&id);
        Ok(())
    }

    async fn lock_route(&self, id: u64) -> Result<(), AddressableError> {
        self.request(id, &AddressableLockRequest { id }).await?;
        Ok(())
    }

    async fn unlock_route(&self, id: u64, route: RouteId, source: &str) -> Result<(), AddressableError> {
        let request = AddressableUnlockRequest {
            id,
            route,
            source: source.to_owned(),
        };
        self.request(id, &request).await?;
        self.routes.borrow_mut().remove(&id);
        Ok(())
    }
}
