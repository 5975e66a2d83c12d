//! In-process transport between scenes.
//!
//! Every scene owns a [`Mailbox`]: a thread-safe FIFO of inbound frames and
//! posted closures. The [`Network`] maps scene ids to mailboxes and is the
//! [`Transport`] scenes send through. Several schedulers (one per simulated
//! process) may share one network.
//!
//! ```text
//!  scene A ──send(A, B, frame)──► Network ──push──► Mailbox(B) ──notify──► worker
//!                                                       │
//!                                   shard B drains ◄────┘ on its next cycle
//! ```
//!
//! Delivery is in order and duplicate-free per sender/receiver pair.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace};

use crate::error::TransportError;
use crate::messaging::{Frame, SceneId};
use crate::scene::Scene;

/// Closure run on a scene's own worker.
pub type PostedWork = Box<dyn FnOnce(&Rc<Scene>) + Send>;

/// Sends frames between scenes.
pub trait Transport: Send + Sync + 'static {
    /// Queue `frame` for scene `to`, tagged with the sending scene.
    fn send(&self, from: SceneId, to: SceneId, frame: Frame) -> Result<(), TransportError>;
}

/// One queued mailbox entry.
pub enum Delivery {
    /// A frame and the scene it came from, which is the reply channel.
    Frame { from: SceneId, frame: Frame },
    /// Work posted from outside the scene.
    Post(PostedWork),
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Delivery::Frame { from, frame } => f
                .debug_struct("Frame")
                .field("from", from)
                .field("opcode", &frame.opcode)
                .field("rpc_id", &frame.rpc_id)
                .finish(),
            Delivery::Post(_) => f.write_str("Post"),
        }
    }
}

type Notifier = Arc<dyn Fn() + Send + Sync>;

/// Inbound queue of one scene.
pub struct Mailbox {
    scene: SceneId,
    queue: Mutex<VecDeque<Delivery>>,
    notifier: Mutex<Option<Notifier>>,
}

impl Mailbox {
    pub fn new(scene: SceneId) -> Self {
        Self {
            scene,
            queue: Mutex::new(VecDeque::new()),
            notifier: Mutex::new(None),
        }
    }

    pub fn scene(&self) -> SceneId {
        self.scene
    }

    /// Called after every push, typically to wake the owning worker.
    pub fn set_notifier(&self, notifier: Notifier) {
        *self.notifier.lock() = Some(notifier);
    }

    pub fn push(&self, delivery: Delivery) {
        self.queue.lock().push_back(delivery);
        let notifier = self.notifier.lock().clone();
        if let Some(notify) = notifier {
            notify();
        }
    }

    /// Take everything queued so far, in arrival order.
    pub fn drain(&self) -> VecDeque<Delivery> {
        std::mem::take(&mut *self.queue.lock())
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Scene directory shared by every shard of one or more schedulers.
#[derive(Default)]
pub struct Network {
    mailboxes: RwLock<HashMap<SceneId, Arc<Mailbox>>>,
}

impl Network {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create the mailbox for `scene`.
    pub fn attach(&self, scene: SceneId) -> Result<Arc<Mailbox>, TransportError> {
        if scene.0 == 0 {
            return Err(TransportError::ReservedScene);
        }
        let mut mailboxes = self.mailboxes.write();
        if mailboxes.contains_key(&scene) {
            return Err(TransportError::SceneExists(scene));
        }
        let mailbox = Arc::new(Mailbox::new(scene));
        mailboxes.insert(scene, Arc::clone(&mailbox));
        debug!(%scene, "scene attached to network");
        Ok(mailbox)
    }

    /// Remove the mailbox for `scene`; later sends to it fail.
    pub fn detach(&self, scene: SceneId) -> bool {
        let removed = self.mailboxes.write().remove(&scene).is_some();
        if removed {
            debug!(%scene, "scene detached from network");
        }
        removed
    }

    pub fn contains(&self, scene: SceneId) -> bool {
        self.mailboxes.read().contains_key(&scene)
    }

    pub fn scenes(&self) -> Vec<SceneId> {
        let mut scenes: Vec<_> = self.mailboxes.read().keys().copied().collect();
        scenes.sort();
        scenes
    }

    /// Run `work` on the worker owning `scene`.
    pub fn post(&self, scene: SceneId, work: PostedWork) -> Result<(), TransportError> {
        self.mailbox(scene)?.push(Delivery::Post(work));
        Ok(())
    }

    fn mailbox(&self, scene: SceneId) -> Result<Arc<Mailbox>, TransportError> {
        self.mailboxes
            .read()
            .get(&scene)
            .cloned()
            .ok_or(TransportError::UnknownScene(scene))
    }
}

impl Transport for Network {
    fn send(&self, from: SceneId, to: SceneId, frame: Frame) -> Result<(), TransportError> {
        trace!(%from, %to, opcode = %frame.opcode, rpc_id = frame.rpc_id, "frame sent");
        self.mailbox(to)?.push(Delivery::Frame { from, frame });
        Ok(())
    }
}

impl fmt::Debug for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Network")
            .field("scenes", &self.scenes())
            .finish()
    }
}
