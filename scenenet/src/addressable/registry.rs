//! In-process address table guarded by per-id coroutine locks.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use async_trait::async_trait;
use tracing::{debug, error, info};

use crate::addressable::AddressableDirectory;
use crate::error::AddressableError;
use crate::lock::{CoroutineLock, WaitTicket};
use crate::messaging::RouteId;

/// Maps addressable ids to routes.
///
/// Every operation on an id runs under that id's coroutine lock, so
/// operations on one id never interleave and are applied in arrival order.
/// [`lock`](Self::lock) keeps the ticket until [`unlock`](Self::unlock);
/// reads through [`route_of`](Self::route_of) still see the last known
/// route meanwhile.
pub struct AddressableRegistry {
    table: RefCell<HashMap<u64, RouteId>>,
    held: RefCell<HashMap<u64, WaitTicket>>,
    lock: Rc<CoroutineLock>,
}

impl AddressableRegistry {
    pub fn new(lock: Rc<CoroutineLock>) -> Self {
        Self {
            table: RefCell::new(HashMap::new()),
            held: RefCell::new(HashMap::new()),
            lock,
        }
    }

    /// Map `id` to `route`. With `exclusive` the write waits for the id's lock.
    pub async fn add(&self, id: u64, route: RouteId, exclusive: bool) -> Result<(), AddressableError> {
        let _ticket = if exclusive {
            Some(self.lock.wait(id, Some("add")).await?)
        } else {
            None
        };
        self.table.borrow_mut().insert(id, route);
        info!(id, %route, "addressable added");
        Ok(())
    }

    /// Current route of `id`, or `RouteId::NONE` when unknown.
    pub async fn get(&self, id: u64) -> Result<RouteId, AddressableError> {
        let _ticket = self.lock.wait(id, Some("get")).await?;
        Ok(self.route_of(id))
    }

    /// Forget `id`. Returns the route it had.
    pub async fn remove(&self, id: u64) -> Result<Option<RouteId>, AddressableError> {
        let _ticket = self.lock.wait(id, Some("remove")).await?;
        let removed = self.table.borrow_mut().remove(&id);
        info!(id, route = ?removed, "addressable removed");
        Ok(removed)
    }

    /// Take the lock of `id` and keep it until [`unlock`](Self::unlock).
    pub async fn lock(&self, id: u64) -> Result<(), AddressableError> {
        let ticket = self.lock.wait(id, Some("lock")).await?;
        debug!(id, "addressable locked");
        self.held.borrow_mut().insert(id, ticket);
        Ok(())
    }

    /// Release the lock taken by [`lock`](Self::lock).
    ///
    /// A non-`NONE` `route` replaces the mapping first. Without a held lock
    /// the call is reported with `source` and the table is left unchanged.
    pub fn unlock(&self, id: u64, route: RouteId, source: &str) -> Result<(), AddressableError> {
        let Some(ticket) = self.held.borrow_mut().remove(&id) else {
            error!(id, %route, source, "addressable unlock without a held lock");
            return Err(AddressableError::NotLocked {
                id,
                source_site: source.to_owned(),
            });
        };
        if !route.is_none() {
            self.table.borrow_mut().insert(id, route);
        }
        debug!(id, %route, source, "addressable unlocked");
        ticket.dispose()?;
        Ok(())
    }

    /// Last known route of `id`, without waiting for its lock.
    pub fn route_of(&self, id: u64) -> RouteId {
        self.table
            .borrow()
            .get(&id)
            .copied()
            .unwrap_or(RouteId::NONE)
    }

    /// Whether `id` is held by [`lock`](Self::lock).
    pub fn is_locked(&self, id: u64) -> bool {
        self.held.borrow().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.table.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for AddressableRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddressableRegistry")
            .field("entries", &self.table.borrow().len())
            .field("locked", &self.held.borrow().len())
            .finish()
    }
}

#[async_trait(?Send)]
impl AddressableDirectory for AddressableRegistry {
    async fn lookup(&self, id: u64) -> Result<RouteId, AddressableError> {
        self.get(id).await
    }

    async fn register(&self, id: u64, route: RouteId) -> Result<(), AddressableError> {
        self.add(id, route, true).await
    }

    async fn unregister(&self, id: u64) -> Result<(), AddressableError> {
        self.remove(id).await.map(|_| ())
    }

    async fn lock_route(&self, id: u64) -> Result<(), AddressableError> {
        self.lock(id).await
    }

    async fn unlock_route(&self, id: u64, route: RouteId, source: &str) -> Result<(), AddressableError> {
        self.unlock(id, route, source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::LockNamespace;
    use crate::messaging::SceneId;
    use crate::task::TaskPool;
    use futures::task::noop_waker_ref;
    use std::future::Future;
    use std::pin::pin;
    use std::task::{Context, Poll};
    use std::time::Duration;

    fn registry() -> AddressableRegistry {
        AddressableRegistry::new(CoroutineLock::new(
            LockNamespace::ADDRESSABLE,
            TaskPool::new(16),
            Duration::from_secs(30),
        ))
    }

    fn route(sequence: u32) -> RouteId {
        RouteId::new(0, SceneId(5), sequence)
    }

    #[tokio::test]
    async fn test_add_get_remove_round_trip() {
        let registry = registry();
        registry
            .add(1001, route(5), false)
            .await
            .expect("add should succeed");
        assert_eq!(registry.get(1001).await.expect("get"), route(5));

        assert_eq!(registry.remove(1001).await.expect("remove"), Some(route(5)));
        assert_eq!(registry.get(1001).await.expect("get"), RouteId::NONE);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_unlock_without_lock_leaves_table_unchanged() {
        let registry = registry();
        registry.add(7, route(1), true).await.expect("add");

        let result = registry.unlock(7, route(2), "test");
        assert!(matches!(
            result,
            Err(AddressableError::NotLocked { id: 7, ref source_site }) if source_site == "test"
        ));
        assert_eq!(registry.route_of(7), route(1));
    }

    #[tokio::test]
    async fn test_lock_then_unlock_moves_the_route() {
        let registry = registry();
        registry.add(9, route(1), false).await.expect("add");
        registry.lock(9).await.expect("lock");
        assert!(registry.is_locked(9));

        registry.unlock(9, route(2), "migration").expect("unlock");
        assert!(!registry.is_locked(9));
        assert_eq!(registry.get(9).await.expect("get"), route(2));
    }

    #[test]
    fn test_locked_id_blocks_writes_until_unlock() {
        let registry = registry();
        let mut cx = Context::from_waker(noop_waker_ref());

        let mut lock = pin!(registry.lock(3));
        assert!(matches!(lock.as_mut().poll(&mut cx), Poll::Ready(Ok(()))));

        let mut get = pin!(registry.get(3));
        assert!(get.as_mut().poll(&mut cx).is_pending());
        assert_eq!(registry.route_of(3), RouteId::NONE);

        registry.unlock(3, route(8), "test").expect("unlock");
        match get.as_mut().poll(&mut cx) {
            Poll::Ready(Ok(found)) => assert_eq!(found, route(8)),
            other => panic!("get should resolve after unlock, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unlock_with_none_keeps_route() {
        let registry = registry();
        registry.add(4, route(6), false).await.expect("add");
        registry.lock(4).await.expect("lock");
        registry.unlock(4, RouteId::NONE, "test").expect("unlock");
        assert_eq!(registry.route_of(4), route(6));
    }
}
