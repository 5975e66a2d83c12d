//! Scene and route identifiers.
//!
//! A [`RouteId`] names a physical destination: the scene it lives on plus a
//! per-scene sequence. Layout:
//!
//! ```text
//!  63  62          40 39          24 23            0
//! ┌───┬──────────────┬──────────────┬──────────────┐
//! │ 0 │   time (23)  │  scene (16)  │ sequence (24)│
//! └───┴──────────────┴──────────────┴──────────────┘
//! ```
//!
//! Sequence 0 addresses the scene itself; [`RouteId::NONE`] is "no route".

use std::cell::Cell;
use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};

const SEQUENCE_BITS: u32 = 24;
const SCENE_BITS: u32 = 16;
const TIME_BITS: u32 = 23;
const SCENE_SHIFT: u32 = SEQUENCE_BITS;
const TIME_SHIFT: u32 = SEQUENCE_BITS + SCENE_BITS;

const SEQUENCE_MASK: u64 = (1 << SEQUENCE_BITS) - 1;
const SCENE_MASK: u64 = (1 << SCENE_BITS) - 1;
const TIME_MASK: u64 = (1 << TIME_BITS) - 1;

/// Identifies one scene (shard) across every process sharing a network.
///
/// Scene 0 is reserved: its scene route would equal [`RouteId::NONE`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct SceneId(pub u16);

impl fmt::Display for SceneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "scene-{}", self.0)
    }
}

/// Physical address of a scene or of an entity hosted by a scene.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RouteId(u64);

impl RouteId {
    /// Sentinel for "no route".
    pub const NONE: RouteId = RouteId(0);

    pub const fn new(time: u32, scene: SceneId, sequence: u32) -> Self {
        RouteId(
            ((time as u64 & TIME_MASK) << TIME_SHIFT)
                | ((scene.0 as u64 & SCENE_MASK) << SCENE_SHIFT)
                | (sequence as u64 & SEQUENCE_MASK),
        )
    }

    /// The route of the scene itself.
    pub const fn for_scene(scene: SceneId) -> Self {
        Self::new(0, scene, 0)
    }

    pub const fn from_raw(raw: u64) -> Self {
        RouteId(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    pub const fn is_none(self) -> bool {
        self.0 == 0
    }

    pub const fn scene(self) -> SceneId {
        SceneId(((self.0 >> SCENE_SHIFT) & SCENE_MASK) as u16)
    }

    pub const fn sequence(self) -> u32 {
        (self.0 & SEQUENCE_MASK) as u32
    }

    pub const fn time(self) -> u32 {
        ((self.0 >> TIME_SHIFT) & TIME_MASK) as u32
    }
}

impl fmt::Debug for RouteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RouteId({self})")
    }
}

impl fmt::Display for RouteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            return write!(f, "none");
        }
        write!(f, "{}/{}@{}", self.scene().0, self.sequence(), self.time())
    }
}

/// Mints entity routes for one scene.
///
/// The time field is seconds since the factory was created, modulo 2^23; the
/// sequence restarts at 1 every second and rolls the time forward if it
/// overflows. Rolling forward from the last time value wraps to 0.
#[derive(Debug)]
pub struct RouteIdFactory {
    scene: SceneId,
    epoch: Instant,
    last_time: Cell<u32>,
    sequence: Cell<u32>,
}

impl RouteIdFactory {
    pub fn new(scene: SceneId) -> Self {
        Self {
            scene,
            epoch: Instant::now(),
            last_time: Cell::new(0),
            sequence: Cell::new(0),
        }
    }

    pub fn scene(&self) -> SceneId {
        self.scene
    }

    /// A route on this scene never returned before.
    pub fn next(&self) -> RouteId {
        let elapsed = (self.epoch.elapsed().as_secs() & TIME_MASK) as u32;
        if elapsed > self.last_time.get() {
            self.last_time.set(elapsed);
            self.sequence.set(0);
        }
        let mut sequence = self.sequence.get() + 1;
        if u64::from(sequence) > SEQUENCE_MASK {
            let rolled = (u64::from(self.last_time.get()) + 1) & TIME_MASK;
            self.last_time.set(rolled as u32);
            sequence = 1;
        }
        self.sequence.set(sequence);
        RouteId::new(self.last_time.get(), self.scene, sequence)
    }
}
