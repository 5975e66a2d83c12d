//! One scene together with its executor and mailbox.

use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::Arc;
use std::time::Instant;

use futures::executor::LocalPool;
use tracing::{error, trace};

use crate::config::RuntimeConfig;
use crate::error::TransportError;
use crate::messaging::{dispatch, MessageRegistry, SceneId};
use crate::scene::{panic_reason, Scene};
use crate::transport::{Delivery, Mailbox, Network, Transport};

/// A scene driven by its own single-threaded executor.
///
/// A shard is created on the thread that runs it and never moves. Each
/// [`run_cycle`](Self::run_cycle) drains the mailbox in arrival order, lets
/// the spawned handlers progress, ticks the scene and lets them progress
/// again.
pub struct Shard {
    scene: Rc<Scene>,
    pool: LocalPool,
    mailbox: Arc<Mailbox>,
    network: Arc<Network>,
}

impl Shard {
    /// Attach scene `id` to `network` and build its context.
    pub fn new(
        id: SceneId,
        network: Arc<Network>,
        registry: Arc<MessageRegistry>,
        config: RuntimeConfig,
    ) -> Result<Self, TransportError> {
        let mailbox = network.attach(id)?;
        let pool = LocalPool::new();
        let transport: Arc<dyn Transport> = network.clone();
        let scene = Scene::new(id, registry, transport, config, pool.spawner());
        Ok(Self {
            scene,
            pool,
            mailbox,
            network,
        })
    }

    pub fn id(&self) -> SceneId {
        self.scene.id()
    }

    pub fn scene(&self) -> &Rc<Scene> {
        &self.scene
    }

    pub fn mailbox(&self) -> &Arc<Mailbox> {
        &self.mailbox
    }

    /// Drain, run, tick, run. Returns how many deliveries were handled.
    pub fn run_cycle(&mut self, now: Instant) -> usize {
        let deliveries = self.mailbox.drain();
        let handled = deliveries.len();
        for delivery in deliveries {
            match delivery {
                Delivery::Frame { from, frame } => dispatch(&self.scene, from, frame),
                Delivery::Post(work) => {
                    let scene = &self.scene;
                    if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(|| work(scene))) {
                        error!(
                            scene = %scene.id(),
                            reason = panic_reason(panic.as_ref()),
                            "posted work panicked"
                        );
                    }
                }
            }
        }
        self.pool.run_until_stalled();
        self.scene.tick(now);
        self.pool.run_until_stalled();
        if handled > 0 {
            trace!(scene = %self.id(), handled, "shard cycle");
        }
        handled
    }
}

impl Drop for Shard {
    fn drop(&mut self) {
        self.network.detach(self.scene.id());
        self.scene.shutdown();
        self.pool.run_until_stalled();
    }
}

impl std::fmt::Debug for Shard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shard")
            .field("scene", &self.scene)
            .field("queued", &self.mailbox.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TaskError;
    use crate::messaging::RouteId;
    use std::cell::Cell;

    fn registry() -> Arc<MessageRegistry> {
        MessageRegistry::builder().build()
    }

    #[test]
    fn test_posts_run_in_arrival_order() {
        let network = Network::new();
        let mut shard = Shard::new(SceneId(4), network.clone(), registry(), RuntimeConfig::default())
            .expect("shard attaches");
        let seen = Rc::new(Cell::new(0u32));
        let counter = seen.clone();
        shard.scene().spawn(async move {
            counter.set(counter.get() + 1);
        });
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        for n in 1..=3u32 {
            let order = order.clone();
            network
                .post(SceneId(4), Box::new(move |_| order.lock().push(n)))
                .expect("post delivered");
        }

        assert_eq!(shard.run_cycle(Instant::now()), 3);
        assert_eq!(*order.lock(), vec![1, 2, 3]);
        assert_eq!(seen.get(), 1);
        assert_eq!(shard.run_cycle(Instant::now()), 0);
    }

    #[test]
    fn test_duplicate_scene_is_rejected() {
        let network = Network::new();
        let _first = Shard::new(SceneId(5), network.clone(), registry(), RuntimeConfig::default())
            .expect("first shard attaches");
        assert!(matches!(
            Shard::new(SceneId(5), network, registry(), RuntimeConfig::default()),
            Err(TransportError::SceneExists(_))
        ));
    }

    #[test]
    fn test_drop_detaches_and_disconnects_calls() {
        let network = Network::new();
        let shard = Shard::new(SceneId(6), network.clone(), registry(), RuntimeConfig::default())
            .expect("shard attaches");
        let call = shard.scene().call_raw(
            RouteId::for_scene(SceneId(6)),
            crate::messaging::OpCode::from_raw(0x1000_0001),
            Vec::new(),
            None,
        );

        drop(shard);
        assert!(!network.contains(SceneId(6)));
        assert_eq!(call.error(), Some(TaskError::Disconnected));
    }
}
