//! Shard scheduler: pins scenes to worker threads.
//!
//! Every worker owns a ring of [`Shard`]s and repeatedly runs one cycle of
//! each (drain, run, tick, run) before moving the shard to the back of the
//! ring. A shard is built on its worker and never leaves it, so scene state
//! is only ever touched by that one thread.
//!
//! Two placements are supported:
//!
//! - [`SchedulingPolicy::Dedicated`]: one worker per shard.
//! - [`SchedulingPolicy::Pooled`]: a fixed set of workers, shards assigned
//!   round-robin.
//!
//! Workers sleep on their command channel for up to one tick interval when
//! no shard had work. Mailbox pushes send a coalesced `Wake` so an idle
//! worker reacts to new frames immediately.

use std::collections::{HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use tracing::{debug, error, info, warn};

use crate::config::RuntimeConfig;
use crate::error::{SchedulerError, TransportError};
use crate::messaging::{MessageRegistry, SceneId};
use crate::scene::{panic_reason, Scene, Shard};
use crate::transport::Network;

/// Initializer run on the worker right after the shard is built.
type ShardInit = Box<dyn FnOnce(&Rc<Scene>) + Send>;

/// How shards are placed on worker threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulingPolicy {
    /// One dedicated thread per shard.
    Dedicated,
    /// A fixed pool of worker threads sharing all shards.
    Pooled { workers: usize },
}

enum Command {
    Attach {
        scene: SceneId,
        init: ShardInit,
        ack: Sender<Result<(), TransportError>>,
    },
    Wake,
    Shutdown,
}

struct WorkerHandle {
    commands: Sender<Command>,
    join: Option<thread::JoinHandle<()>>,
    shards: usize,
}

/// Runs scenes on worker threads.
///
/// # Example
///
/// ```rust,no_run
/// use scenenet::scene::{SchedulingPolicy, ShardScheduler};
/// use scenenet::transport::Network;
/// use scenenet::{MessageRegistry, RuntimeConfig, SceneId};
///
/// let network = Network::new();
/// let registry = MessageRegistry::builder().build();
/// let mut scheduler = ShardScheduler::new(
///     network,
///     registry,
///     SchedulingPolicy::Pooled { workers: 2 },
///     RuntimeConfig::default(),
/// )
/// .unwrap();
/// scheduler
///     .add_shard(SceneId(1), |scene| {
///         tracing::info!(scene = %scene.id(), "scene ready");
///     })
///     .unwrap();
/// scheduler.shutdown();
/// ```
pub struct ShardScheduler {
    network: Arc<Network>,
    registry: Arc<MessageRegistry>,
    config: RuntimeConfig,
    policy: SchedulingPolicy,
    workers: Vec<WorkerHandle>,
    placement: HashMap<SceneId, usize>,
    next_worker: usize,
}

impl ShardScheduler {
    pub fn new(
        network: Arc<Network>,
        registry: Arc<MessageRegistry>,
        policy: SchedulingPolicy,
        config: RuntimeConfig,
    ) -> Result<Self, SchedulerError> {
        let mut scheduler = Self {
            network,
            registry,
            config,
            policy,
            workers: Vec::new(),
            placement: HashMap::new(),
            next_worker: 0,
        };
        if let SchedulingPolicy::Pooled { workers } = policy {
            if workers == 0 {
                return Err(SchedulerError::NoWorkers);
            }
            for _ in 0..workers {
                scheduler.spawn_worker()?;
            }
        }
        info!(?policy, "shard scheduler started");
        Ok(scheduler)
    }

    pub fn policy(&self) -> SchedulingPolicy {
        self.policy
    }

    pub fn network(&self) -> &Arc<Network> {
        &self.network
    }

    /// Start scene `scene` on a worker and run `init` on it there.
    ///
    /// Returns once the shard is attached to the network.
    pub fn add_shard<F>(&mut self, scene: SceneId, init: F) -> Result<(), SchedulerError>
    where
        F: FnOnce(&Rc<Scene>) + Send + 'static,
    {
        if self.network.contains(scene) {
            return Err(TransportError::SceneExists(scene).into());
        }
        let worker = match self.policy {
            SchedulingPolicy::Dedicated => self.spawn_worker()?,
            SchedulingPolicy::Pooled { .. } => {
                let index = self.next_worker % self.workers.len();
                self.next_worker += 1;
                index
            }
        };

        if let Err(error) = self.attach_on(worker, scene, Box::new(init)) {
            if self.policy == SchedulingPolicy::Dedicated {
                self.retire_worker(worker);
            }
            return Err(error);
        }

        self.workers[worker].shards += 1;
        self.placement.insert(scene, worker);
        debug!(%scene, worker, "shard placed");
        Ok(())
    }

    /// Run `work` on the worker owning `scene`, in mailbox order.
    pub fn post<F>(&self, scene: SceneId, work: F) -> Result<(), SchedulerError>
    where
        F: FnOnce(&Rc<Scene>) + Send + 'static,
    {
        self.network.post(scene, Box::new(work))?;
        Ok(())
    }

    /// Index of the worker running `scene`.
    pub fn worker_of(&self, scene: SceneId) -> Option<usize> {
        self.placement.get(&scene).copied()
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn shard_count(&self) -> usize {
        self.placement.len()
    }

    /// Stop every worker and drop its shards. Idempotent.
    pub fn shutdown(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        for worker in &self.workers {
            let _ = worker.commands.send(Command::Shutdown);
        }
        for (index, mut worker) in self.workers.drain(..).enumerate() {
            if let Some(join) = worker.join.take() {
                if join.join().is_err() {
                    warn!(worker = index, shards = worker.shards, "worker panicked");
                }
            }
        }
        self.placement.clear();
        info!("shard scheduler stopped");
    }

    fn attach_on(
        &self,
        worker: usize,
        scene: SceneId,
        init: ShardInit,
    ) -> Result<(), SchedulerError> {
        let (ack_tx, ack_rx) = bounded(1);
        self.workers[worker]
            .commands
            .send(Command::Attach {
                scene,
                init,
                ack: ack_tx,
            })
            .map_err(|_| SchedulerError::WorkerGone)?;
        ack_rx.recv().map_err(|_| SchedulerError::WorkerGone)??;
        Ok(())
    }

    /// Stop a dedicated worker that never received its shard.
    fn retire_worker(&mut self, index: usize) {
        if index + 1 != self.workers.len() {
            return;
        }
        let Some(mut worker) = self.workers.pop() else {
            return;
        };
        let _ = worker.commands.send(Command::Shutdown);
        if let Some(join) = worker.join.take() {
            if join.join().is_err() {
                warn!(worker = index, "worker panicked");
            }
        }
        debug!(worker = index, "unused dedicated worker stopped");
    }

    fn spawn_worker(&mut self) -> Result<usize, SchedulerError> {
        let index = self.workers.len();
        let (tx, rx) = unbounded();
        let network = self.network.clone();
        let registry = self.registry.clone();
        let config = self.config.clone();
        let wake_tx = tx.clone();

        let join = thread::Builder::new()
            .name(format!("scenenet-worker-{index}"))
            .spawn(move || Worker::new(index, rx, wake_tx, network, registry, config).run())
            .map_err(SchedulerError::Spawn)?;

        self.workers.push(WorkerHandle {
            commands: tx,
            join: Some(join),
            shards: 0,
        });
        Ok(index)
    }
}

impl Drop for ShardScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for ShardScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardScheduler")
            .field("policy", &self.policy)
            .field("workers", &self.workers.len())
            .field("shards", &self.placement.len())
            .finish()
    }
}

struct Worker {
    index: usize,
    commands: Receiver<Command>,
    wake: Sender<Command>,
    woken: Arc<AtomicBool>,
    network: Arc<Network>,
    registry: Arc<MessageRegistry>,
    config: RuntimeConfig,
    idle_wait: Duration,
    shards: VecDeque<Shard>,
}

impl Worker {
    fn new(
        index: usize,
        commands: Receiver<Command>,
        wake: Sender<Command>,
        network: Arc<Network>,
        registry: Arc<MessageRegistry>,
        config: RuntimeConfig,
    ) -> Self {
        Self {
            index,
            commands,
            wake,
            woken: Arc::new(AtomicBool::new(false)),
            idle_wait: config.tick_interval(),
            network,
            registry,
            config,
            shards: VecDeque::new(),
        }
    }

    fn run(mut self) {
        debug!(worker = self.index, "worker started");
        loop {
            let mut stop = false;
            loop {
                match self.commands.try_recv() {
                    Ok(command) => {
                        if self.handle(command) {
                            stop = true;
                            break;
                        }
                    }
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        stop = true;
                        break;
                    }
                }
            }
            if stop {
                break;
            }

            self.woken.store(false, Ordering::SeqCst);
            let mut handled = 0;
            for _ in 0..self.shards.len() {
                let Some(mut shard) = self.shards.pop_front() else {
                    break;
                };
                handled += shard.run_cycle(Instant::now());
                self.shards.push_back(shard);
            }

            if handled == 0 {
                match self.commands.recv_timeout(self.idle_wait) {
                    Ok(command) => {
                        if self.handle(command) {
                            break;
                        }
                    }
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        }

        let count = self.shards.len();
        self.shards.clear();
        debug!(worker = self.index, shards = count, "worker stopped");
    }

    /// Returns `true` on shutdown.
    fn handle(&mut self, command: Command) -> bool {
        match command {
            Command::Attach { scene, init, ack } => {
                let _ = ack.send(self.attach(scene, init));
                false
            }
            Command::Wake => false,
            Command::Shutdown => true,
        }
    }

    fn attach(&mut self, scene: SceneId, init: ShardInit) -> Result<(), TransportError> {
        let mut shard = Shard::new(
            scene,
            self.network.clone(),
            self.registry.clone(),
            self.config.clone(),
        )?;

        let woken = self.woken.clone();
        let wake = self.wake.clone();
        shard.mailbox().set_notifier(Arc::new(move || {
            if !woken.swap(true, Ordering::SeqCst) {
                let _ = wake.send(Command::Wake);
            }
        }));

        let scene_ref = shard.scene();
        if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(|| init(scene_ref))) {
            error!(
                worker = self.index,
                %scene,
                reason = panic_reason(panic.as_ref()),
                "shard initializer panicked"
            );
        }
        shard.run_cycle(Instant::now());
        self.shards.push_back(shard);
        debug!(worker = self.index, %scene, "shard attached");
        Ok(())
    }
}
