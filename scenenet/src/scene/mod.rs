//! Scenes: single-threaded execution partitions.
//!
//! A [`Scene`] is everything one shard owns: its handler table, pending
//! calls, entity table, coroutine locks, timers and task pools. Only the
//! worker running the scene's [`Shard`] touches that state, so none of it
//! needs a lock. Scenes talk to each other only through frames.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────── Shard ────────────────────────┐
//! │ Mailbox ──drain──► dispatch ──► handlers / pending    │
//! │                         │                             │
//! │                   Scene::spawn ──► LocalPool          │
//! │                                                       │
//! │ tick(now): timers ─► pending sweep ─► lock timeouts   │
//! └───────────────────────────────────────────────────────┘
//! ```
//!
//! Handlers receive the scene as an `Rc<Scene>` argument; they can issue
//! further calls, which resume when the response frame reaches this
//! scene's mailbox.

mod entity;
mod scheduler;
mod shard;
mod timer;

pub use entity::{EntitySlot, EntityTable};
pub use scheduler::{SchedulingPolicy, ShardScheduler};
pub use shard::Shard;
pub use timer::TimerQueue;

use std::any::{type_name, Any};
use std::cell::Cell;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::executor::LocalSpawner;
use futures::task::LocalSpawnExt;
use futures::FutureExt;
use tracing::{debug, error, warn};

use crate::config::RuntimeConfig;
use crate::error::{CallError, HandlerError, RegistryError, SceneError, TaskError};
use crate::lock::CoroutineLockComponent;
use crate::messaging::dispatcher::{
    message_handler, request_handler, route_message_handler, route_request_handler, HandlerTable,
};
use crate::messaging::{
    Frame, FrameKind, Message, MessageRegistry, OpCode, PendingCall, PendingCalls, Request,
    RouteId, RouteIdFactory, SceneId,
};
use crate::task::{CancellationToken, Task, TaskPools};
use crate::transport::Transport;

/// Shard-local context shared by every handler running on one scene.
pub struct Scene {
    id: SceneId,
    route_id: RouteId,
    config: RuntimeConfig,
    registry: Arc<MessageRegistry>,
    transport: Arc<dyn Transport>,
    handlers: HandlerTable,
    pending: PendingCalls,
    entities: EntityTable,
    locks: CoroutineLockComponent,
    timers: TimerQueue,
    route_ids: RouteIdFactory,
    pools: TaskPools,
    spawner: LocalSpawner,
    last_sweep: Cell<Instant>,
    self_ref: Weak<Scene>,
}

impl Scene {
    pub fn new(
        id: SceneId,
        registry: Arc<MessageRegistry>,
        transport: Arc<dyn Transport>,
        config: RuntimeConfig,
        spawner: LocalSpawner,
    ) -> Rc<Self> {
        let pools = TaskPools::new(config.task_pool_capacity());
        let locks = CoroutineLockComponent::new(pools.pool::<()>(), config.lock_timeout());
        Rc::new_cyclic(|self_ref| Self {
            id,
            route_id: RouteId::for_scene(id),
            pending: PendingCalls::new(config.random_rpc_seed()),
            handlers: HandlerTable::default(),
            entities: EntityTable::default(),
            timers: TimerQueue::default(),
            route_ids: RouteIdFactory::new(id),
            last_sweep: Cell::new(Instant::now()),
            self_ref: self_ref.clone(),
            locks,
            pools,
            config,
            registry,
            transport,
            spawner,
        })
    }

    pub fn id(&self) -> SceneId {
        self.id
    }

    /// Route addressing the scene itself.
    pub fn route_id(&self) -> RouteId {
        self.route_id
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<MessageRegistry> {
        &self.registry
    }

    pub fn coroutine_locks(&self) -> &CoroutineLockComponent {
        &self.locks
    }

    pub fn task_pools(&self) -> &TaskPools {
        &self.pools
    }

    pub(crate) fn pending(&self) -> &PendingCalls {
        &self.pending
    }

    pub(crate) fn handlers(&self) -> &HandlerTable {
        &self.handlers
    }

    pub(crate) fn entities(&self) -> &EntityTable {
        &self.entities
    }

    pub(crate) fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Number of calls awaiting a response.
    pub fn pending_calls(&self) -> usize {
        self.pending.len()
    }

    /// Run `future` on this scene's executor.
    ///
    /// A panic inside `future` ends that future only; it is logged and the
    /// executor keeps running the scene's other work.
    pub fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + 'static,
    {
        let id = self.id;
        let guarded = AssertUnwindSafe(future).catch_unwind().map(move |outcome| {
            if let Err(panic) = outcome {
                error!(scene = %id, reason = panic_reason(panic.as_ref()), "scene task panicked");
            }
        });
        if let Err(error) = self.spawner.spawn_local(guarded) {
            error!(scene = %self.id, %error, "failed to spawn scene task");
        }
    }

    // ---------------------------------------------------------------------
    // Messaging
    // ---------------------------------------------------------------------

    /// Send a one-way message to `to`.
    pub fn send<M: Message>(&self, to: RouteId, message: &M) -> Result<(), CallError> {
        let frame = Frame::encode(0, to, message)?;
        self.transport.send(self.id, to.scene(), frame)?;
        Ok(())
    }

    /// Call `to` and await its response.
    pub async fn call<R: Request>(&self, to: RouteId, request: &R) -> Result<R::Response, CallError> {
        let payload = R::OPCODE.serializer()?.encode(request)?;
        let frame = self.call_raw(to, R::OPCODE, payload, None).await?;
        frame.decode_response::<R::Response>()
    }

    /// Like [`call`](Self::call), ending with [`CallError::Canceled`] when
    /// `token` fires first.
    pub async fn call_with_cancel<R: Request>(
        &self,
        to: RouteId,
        request: &R,
        token: &CancellationToken,
    ) -> Result<R::Response, CallError> {
        let payload = R::OPCODE.serializer()?.encode(request)?;
        let frame = self.call_raw(to, R::OPCODE, payload, Some(token)).await?;
        frame.decode_response::<R::Response>()
    }

    /// Register a pending call and send the encoded request.
    ///
    /// The returned task fails with `Disconnected` immediately when the
    /// destination scene is unknown, and with `Timeout` once the rpc
    /// deadline passes without an answer.
    pub(crate) fn call_raw(
        &self,
        target: RouteId,
        opcode: OpCode,
        payload: Vec<u8>,
        cancel: Option<&CancellationToken>,
    ) -> Task<Frame> {
        let task = self.pools.rent::<Frame>();
        if cancel.is_some_and(CancellationToken::is_canceled) {
            let _ = task.cancel();
            return task;
        }

        let rpc_id = self.pending.next_rpc_id();
        let now = Instant::now();
        let deadline = now + self.config.rpc_timeout();
        self.pending.register(
            rpc_id,
            PendingCall::new(task.clone(), opcode, target, now, deadline),
        );
        if let Some(token) = cancel {
            let scene = self.self_ref.clone();
            self.pending.link_cancellation(rpc_id, token, move || {
                if let Some(scene) = scene.upgrade() {
                    scene.pending.fail(rpc_id, TaskError::Canceled);
                }
            });
        }

        let frame = Frame {
            opcode,
            rpc_id,
            route_id: target,
            payload,
        };
        if let Err(error) = self.transport.send(self.id, target.scene(), frame) {
            warn!(scene = %self.id, %target, %opcode, rpc_id, %error, "request not sent");
            self.pending.fail(rpc_id, TaskError::Disconnected);
        }
        task
    }

    // ---------------------------------------------------------------------
    // Entities
    // ---------------------------------------------------------------------

    /// Host `entity` on a fresh route of this scene.
    pub fn add_entity<E: 'static>(&self, entity: Rc<E>) -> RouteId {
        loop {
            let route = self.route_ids.next();
            if self
                .entities
                .insert(route, EntitySlot::Local(entity.clone()))
                .is_ok()
            {
                debug!(scene = %self.id, %route, entity = type_name::<E>(), "entity added");
                return route;
            }
        }
    }

    /// Host `entity` on a specific route of this scene.
    pub fn add_entity_at<E: 'static>(&self, route: RouteId, entity: Rc<E>) -> Result<(), SceneError> {
        self.check_local(route)?;
        self.entities.insert(route, EntitySlot::Local(entity))?;
        debug!(scene = %self.id, %route, entity = type_name::<E>(), "entity added");
        Ok(())
    }

    /// Forward route traffic for a fresh local route to `target`.
    pub fn add_relay(&self, target: RouteId) -> RouteId {
        loop {
            let route = self.route_ids.next();
            if self.entities.insert(route, EntitySlot::Relay(target)).is_ok() {
                debug!(scene = %self.id, %route, %target, "relay added");
                return route;
            }
        }
    }

    /// Returns whether something was hosted at `route`.
    pub fn remove_entity(&self, route: RouteId) -> bool {
        let removed = self.entities.remove(route).is_some();
        if removed {
            debug!(scene = %self.id, %route, "entity removed");
        }
        removed
    }

    pub fn get_entity<E: 'static>(&self, route: RouteId) -> Option<Rc<E>> {
        self.entities.get(route)
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    fn check_local(&self, route: RouteId) -> Result<(), SceneError> {
        if route.scene() != self.id {
            return Err(SceneError::ForeignRoute {
                route,
                scene: self.id,
            });
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Timers
    // ---------------------------------------------------------------------

    /// A task completing on the first tick at least `duration` from now.
    pub fn delay(&self, duration: Duration) -> Task<()> {
        self.delay_until(Instant::now() + duration)
    }

    pub fn delay_until(&self, deadline: Instant) -> Task<()> {
        let task = self.pools.rent::<()>();
        self.timers.schedule(deadline, task.clone());
        task
    }

    // ---------------------------------------------------------------------
    // Handler registration
    // ---------------------------------------------------------------------

    /// Handle one-way messages of type `M` sent to this scene.
    pub fn register_message<M, F, Fut>(&self, handler: F) -> Result<(), RegistryError>
    where
        M: Message,
        F: Fn(Rc<Scene>, M) -> Fut + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + 'static,
    {
        self.check_handler::<M>(FrameKind::Message, "message")?;
        self.handlers
            .insert(M::OPCODE, message_handler::<M, F, Fut>(handler))
    }

    /// Answer requests of type `R` sent to this scene.
    pub fn register_request<R, F, Fut>(&self, handler: F) -> Result<(), RegistryError>
    where
        R: Request,
        F: Fn(Rc<Scene>, R) -> Fut + 'static,
        Fut: Future<Output = Result<R::Response, HandlerError>> + 'static,
    {
        self.check_handler::<R>(FrameKind::Request, "request")?;
        self.handlers
            .insert(R::OPCODE, request_handler::<R, F, Fut>(handler))
    }

    /// Handle route messages of type `M` addressed to entities of type `E`.
    pub fn register_route_message<M, E, F, Fut>(&self, handler: F) -> Result<(), RegistryError>
    where
        M: Message,
        E: 'static,
        F: Fn(Rc<Scene>, Rc<E>, M) -> Fut + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + 'static,
    {
        self.check_handler::<M>(FrameKind::RouteMessage, "route message")?;
        self.handlers
            .insert(M::OPCODE, route_message_handler::<M, E, F, Fut>(handler))
    }

    /// Answer route requests of type `R` addressed to entities of type `E`.
    pub fn register_route_request<R, E, F, Fut>(&self, handler: F) -> Result<(), RegistryError>
    where
        R: Request,
        E: 'static,
        F: Fn(Rc<Scene>, Rc<E>, R) -> Fut + 'static,
        Fut: Future<Output = Result<R::Response, HandlerError>> + 'static,
    {
        self.check_handler::<R>(FrameKind::RouteRequest, "route request")?;
        self.handlers
            .insert(R::OPCODE, route_request_handler::<R, E, F, Fut>(handler))
    }

    /// Number of registered handlers.
    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    fn check_handler<M: Message>(&self, kind: FrameKind, expected: &'static str) -> Result<(), RegistryError> {
        if !self.registry.contains(M::OPCODE) {
            return Err(RegistryError::Unregistered {
                name: type_name::<M>(),
                opcode: M::OPCODE,
            });
        }
        if M::OPCODE.classify() != kind {
            return Err(RegistryError::CategoryMismatch {
                name: type_name::<M>(),
                opcode: M::OPCODE,
                expected,
            });
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Lifecycle
    // ---------------------------------------------------------------------

    /// Periodic work: fire timers, sweep expired calls, report overdue lock waits.
    pub fn tick(&self, now: Instant) {
        self.timers.fire(now);
        let since_sweep = now.saturating_duration_since(self.last_sweep.get());
        if since_sweep >= self.config.pending_sweep_interval() {
            self.last_sweep.set(now);
            self.pending.sweep(now);
        }
        self.locks.check_timeouts(now);
    }

    /// Fail every pending call and cancel every timer.
    pub fn shutdown(&self) {
        let calls = self.pending.fail_all(TaskError::Disconnected);
        let timers = self.timers.cancel_all();
        debug!(scene = %self.id, calls, timers, "scene shut down");
    }
}

impl std::fmt::Debug for Scene {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scene")
            .field("id", &self.id)
            .field("entities", &self.entities.len())
            .field("pending", &self.pending.len())
            .field("handlers", &self.handlers.len())
            .finish()
    }
}


/// Human-readable text of a caught panic payload.
pub(crate) fn panic_reason(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::{ErrorCode, OpCodeCategory, Response, SerializerTag};
    use crate::task::TaskStatus;
    use crate::transport::Network;
    use futures::executor::LocalPool;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Default, Serialize, Deserialize)]
    struct Echo {
        text: String,
    }

    #[derive(Debug, Default, Serialize, Deserialize)]
    struct EchoReply {
        error: u32,
        text: String,
    }

    impl Message for Echo {
        const OPCODE: OpCode = OpCode::new(OpCodeCategory::Request, SerializerTag::Json, 40);
    }

    impl Request for Echo {
        type Response = EchoReply;
    }

    impl Message for EchoReply {
        const OPCODE: OpCode = OpCode::new(OpCodeCategory::Response, SerializerTag::Json, 40);
    }

    impl Response for EchoReply {
        fn error_code(&self) -> ErrorCode {
            ErrorCode(self.error)
        }

        fn set_error_code(&mut self, code: ErrorCode) {
            self.error = code.0;
        }
    }

    fn scene(pool: &LocalPool, config: RuntimeConfig) -> Rc<Scene> {
        let mut builder = MessageRegistry::builder();
        builder.request::<Echo>().expect("echo registers");
        let network = Network::new();
        network.attach(SceneId(1)).expect("scene attaches");
        Scene::new(SceneId(1), builder.build(), network, config, pool.spawner())
    }

    #[test]
    fn test_entities_get_distinct_local_routes() {
        let pool = LocalPool::new();
        let scene = scene(&pool, RuntimeConfig::default());

        let a = scene.add_entity(Rc::new(1u32));
        let b = scene.add_entity(Rc::new(2u32));
        assert_ne!(a, b);
        assert_eq!(a.scene(), SceneId(1));
        assert_eq!(scene.get_entity::<u32>(b).map(|v| *v), Some(2));

        let foreign = RouteId::new(0, SceneId(2), 1);
        assert!(matches!(
            scene.add_entity_at(foreign, Rc::new(3u32)),
            Err(SceneError::ForeignRoute { .. })
        ));
        assert!(scene.remove_entity(a));
        assert!(!scene.remove_entity(a));
    }

    #[test]
    fn test_call_to_unknown_scene_fails_without_waiting() {
        let mut pool = LocalPool::new();
        let scene = scene(&pool, RuntimeConfig::default());

        let result = pool.run_until(scene.call(RouteId::for_scene(SceneId(9)), &Echo::default()));
        assert!(matches!(result, Err(CallError::Disconnected)));
        assert_eq!(scene.pending_calls(), 0);
    }

    #[test]
    fn test_canceled_token_cancels_the_call() {
        let mut pool = LocalPool::new();
        let scene = scene(&pool, RuntimeConfig::default());
        let token = CancellationToken::new();
        token.cancel();

        let result = pool.run_until(scene.call_with_cancel(
            RouteId::for_scene(SceneId(9)),
            &Echo::default(),
            &token,
        ));
        assert!(matches!(result, Err(CallError::Canceled)));
    }

    #[test]
    fn test_tick_fires_delays_and_sweeps_calls() {
        let config = RuntimeConfig::builder()
            .rpc_timeout(Duration::from_millis(5))
            .pending_sweep_interval(Duration::from_millis(1))
            .build()
            .expect("valid config");
        let pool = LocalPool::new();
        let scene = scene(&pool, config);

        let delay = scene.delay(Duration::from_millis(1));
        let call = scene.call_raw(scene.route_id(), Echo::OPCODE, Vec::new(), None);
        assert_eq!(scene.pending_calls(), 1);

        scene.tick(Instant::now() + Duration::from_secs(1));
        assert_eq!(delay.status(), TaskStatus::Succeeded);
        assert_eq!(call.error(), Some(TaskError::Timeout));
        assert_eq!(scene.pending_calls(), 0);
    }

    #[test]
    fn test_handler_registration_checks_registry_and_kind() {
        let pool = LocalPool::new();
        let scene = scene(&pool, RuntimeConfig::default());

        scene
            .register_request::<Echo, _, _>(|_, req| async move {
                Ok(EchoReply {
                    error: 0,
                    text: req.text,
                })
            })
            .expect("first registration succeeds");
        assert!(matches!(
            scene.register_request::<Echo, _, _>(|_, _| async { Ok(EchoReply::default()) }),
            Err(RegistryError::DuplicateHandler(_))
        ));
        assert!(matches!(
            scene.register_route_request::<Echo, u32, _, _>(|_, _, _| async {
                Ok(EchoReply::default())
            }),
            Err(RegistryError::CategoryMismatch { .. })
        ));
        assert_eq!(scene.handler_count(), 1);
    }

    #[test]
    fn test_shutdown_disconnects_pending_calls() {
        let pool = LocalPool::new();
        let scene = scene(&pool, RuntimeConfig::default());
        let call = scene.call_raw(scene.route_id(), Echo::OPCODE, Vec::new(), None);
        let timer = scene.delay(Duration::from_secs(60));

        scene.shutdown();
        assert_eq!(call.error(), Some(TaskError::Disconnected));
        assert_eq!(timer.status(), TaskStatus::Canceled);
    }
}
