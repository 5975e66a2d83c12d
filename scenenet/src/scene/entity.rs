//! Scene-local entity table.

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::error::SceneError;
use crate::messaging::RouteId;

/// What lives at a route of this scene.
#[derive(Clone)]
pub enum EntitySlot {
    /// A local entity, handed to route handlers after a downcast.
    Local(Rc<dyn Any>),
    /// Forward everything addressed here to another route.
    Relay(RouteId),
}

impl std::fmt::Debug for EntitySlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntitySlot::Local(_) => f.write_str("Local"),
            EntitySlot::Relay(target) => write!(f, "Relay({target})"),
        }
    }
}

#[derive(Default)]
pub struct EntityTable {
    slots: RefCell<HashMap<RouteId, EntitySlot>>,
}

impl EntityTable {
    pub fn insert(&self, route: RouteId, slot: EntitySlot) -> Result<(), SceneError> {
        let mut slots = self.slots.borrow_mut();
        if slots.contains_key(&route) {
            return Err(SceneError::RouteInUse(route));
        }
        slots.insert(route, slot);
        Ok(())
    }

    pub fn remove(&self, route: RouteId) -> Option<EntitySlot> {
        self.slots.borrow_mut().remove(&route)
    }

    pub fn slot(&self, route: RouteId) -> Option<EntitySlot> {
        self.slots.borrow().get(&route).cloned()
    }

    /// The local entity at `route`, if it is an `E`.
    pub fn get<E: 'static>(&self, route: RouteId) -> Option<Rc<E>> {
        match self.slot(route)? {
            EntitySlot::Local(entity) => entity.downcast::<E>().ok(),
            EntitySlot::Relay(_) => None,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
