//! Shared fixtures: test messages, entities and a single-threaded cluster
//! of shards driven by hand.

#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use scenenet::addressable::register_protocol;
use scenenet::error::HandlerError;
use scenenet::messaging::{
    ErrorCode, Message, MessageRegistry, OpCode, OpCodeCategory, Request, Response, RouteId,
    SceneId, SerializerTag,
};
use scenenet::scene::{Scene, Shard};
use scenenet::transport::Network;
use scenenet::RuntimeConfig;
use serde::{Deserialize, Serialize};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .with_test_writer()
        .try_init();
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// Scene-level request; value 0 makes the handler fail.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Ping {
    pub value: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Pong {
    pub error: ErrorCode,
    pub value: u32,
}

impl Message for Ping {
    const OPCODE: OpCode = OpCode::new(OpCodeCategory::Request, SerializerTag::Json, 1);
}

impl Request for Ping {
    type Response = Pong;
}

impl Message for Pong {
    const OPCODE: OpCode = OpCode::new(OpCodeCategory::Response, SerializerTag::Json, 1);
}

impl Response for Pong {
    fn error_code(&self) -> ErrorCode {
        self.error
    }

    fn set_error_code(&mut self, code: ErrorCode) {
        self.error = code;
    }
}

/// Route request answered by a [`Greeter`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Greet {
    pub name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GreetReply {
    pub error: ErrorCode,
    pub text: String,
}

impl Message for Greet {
    const OPCODE: OpCode = OpCode::new(OpCodeCategory::RouteRequest, SerializerTag::MessagePack, 1);
}

impl Request for Greet {
    type Response = GreetReply;
}

impl Message for GreetReply {
    const OPCODE: OpCode = OpCode::new(OpCodeCategory::RouteResponse, SerializerTag::MessagePack, 1);
}

impl Response for GreetReply {
    fn error_code(&self) -> ErrorCode {
        self.error
    }

    fn set_error_code(&mut self, code: ErrorCode) {
        self.error = code;
    }
}

/// One-way route message counted by a [`Greeter`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Poke;

impl Message for Poke {
    const OPCODE: OpCode = OpCode::new(OpCodeCategory::RouteMessage, SerializerTag::Json, 1);
}

/// Request registered in the opcode table but never handled.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Orphan;

impl Message for Orphan {
    const OPCODE: OpCode = OpCode::new(OpCodeCategory::Request, SerializerTag::Json, 2);
}

impl Request for Orphan {
    type Response = Pong;
}

pub struct Greeter {
    pub prefix: String,
    pub pokes: Cell<u32>,
}

impl Greeter {
    pub fn new(prefix: &str) -> Rc<Self> {
        Rc::new(Self {
            prefix: prefix.to_string(),
            pokes: Cell::new(0),
        })
    }
}

pub fn registry() -> Arc<MessageRegistry> {
    let mut builder = MessageRegistry::builder();
    builder
        .request::<Ping>()
        .expect("ping registers")
        .request::<Orphan>()
        .expect("orphan registers")
        .request::<Greet>()
        .expect("greet registers")
        .message::<Poke>()
        .expect("poke registers");
    register_protocol(&mut builder).expect("addressable protocol registers");
    builder.build()
}

/// Ping answers `value + 1`; zero fails.
pub fn install_ping(scene: &Rc<Scene>) {
    scene
        .register_request::<Ping, _, _>(|_, ping| async move {
            if ping.value == 0 {
                return Err(HandlerError::Failed("zero".to_string()));
            }
            Ok(Pong {
                error: ErrorCode::SUCCESS,
                value: ping.value + 1,
            })
        })
        .expect("ping handler registers");
}

/// `Ping` echoes the value back; 0 panics inside the handler.
pub fn install_volatile_ping(scene: &Rc<Scene>) {
    scene
        .register_request::<Ping, _, _>(|_, ping| async move {
            if ping.value == 0 {
                panic!("ping handler blew up");
            }
            Ok(Pong {
                error: ErrorCode::SUCCESS,
                value: ping.value,
            })
        })
        .expect("volatile ping handler registers");
}

/// Greeter handlers for `Greet` and `Poke`.
pub fn install_greeter(scene: &Rc<Scene>) {
    scene
        .register_route_request::<Greet, Greeter, _, _>(|_, greeter, greet| async move {
            Ok(GreetReply {
                error: ErrorCode::SUCCESS,
                text: format!("{} {}", greeter.prefix, greet.name),
            })
        })
        .expect("greet handler registers");
    scene
        .register_route_message::<Poke, Greeter, _, _>(|_, greeter, _| async move {
            greeter.pokes.set(greeter.pokes.get() + 1);
            Ok(())
        })
        .expect("poke handler registers");
}

// ---------------------------------------------------------------------------
// Cluster
// ---------------------------------------------------------------------------

/// Several shards on one network, cycled on the test thread.
pub struct Cluster {
    pub network: Arc<Network>,
    pub shards: Vec<Shard>,
}

impl Cluster {
    pub fn new(scenes: &[u16], config: RuntimeConfig) -> Self {
        let network = Network::new();
        let registry = registry();
        let shards = scenes
            .iter()
            .map(|id| {
                Shard::new(SceneId(*id), network.clone(), registry.clone(), config.clone())
                    .expect("shard attaches")
            })
            .collect();
        Self { network, shards }
    }

    pub fn scene(&self, id: u16) -> Rc<Scene> {
        self.shards
            .iter()
            .find(|s| s.id() == SceneId(id))
            .map(|s| s.scene().clone())
            .expect("scene exists")
    }

    /// One cycle of every shard. Returns deliveries handled.
    pub fn cycle(&mut self) -> usize {
        let now = Instant::now();
        self.shards.iter_mut().map(|s| s.run_cycle(now)).sum()
    }

    /// Cycle until `slot` is filled, sleeping briefly while idle.
    pub fn run_until<T>(&mut self, slot: &Rc<RefCell<Option<T>>>, budget: Duration) -> T {
        let deadline = Instant::now() + budget;
        loop {
            if let Some(value) = slot.borrow_mut().take() {
                return value;
            }
            assert!(Instant::now() < deadline, "cluster did not settle in {budget:?}");
            if self.cycle() == 0 {
                std::thread::sleep(Duration::from_millis(1));
            }
        }
    }

    /// Spawn `future` on scene `id` and cycle until it finishes.
    pub fn block_on<T, F>(&mut self, id: u16, future: F) -> T
    where
        T: 'static,
        F: Future<Output = T> + 'static,
    {
        let slot = spawn_capture(&self.scene(id), future);
        self.run_until(&slot, Duration::from_secs(5))
    }
}

/// Spawn `future` on `scene`, storing its output in the returned slot.
pub fn spawn_capture<T, F>(scene: &Rc<Scene>, future: F) -> Rc<RefCell<Option<T>>>
where
    T: 'static,
    F: Future<Output = T> + 'static,
{
    let slot = Rc::new(RefCell::new(None));
    let out = slot.clone();
    scene.spawn(async move {
        let value = future.await;
        *out.borrow_mut() = Some(value);
    });
    slot
}

/// A route on scene `id` that hosts nothing.
pub fn vacant_route(id: u16) -> RouteId {
    RouteId::new(0, SceneId(id), 0x00ff_fff0)
}
