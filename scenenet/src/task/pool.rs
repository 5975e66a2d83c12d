//! Bounded free lists of task state.

use std::any::{Any, TypeId};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use tracing::trace;

use super::{SharedState, Task, TaskState};

/// Counters describing pool usage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Tasks handed out by [`TaskPool::rent`].
    pub rented: u64,
    /// States returned to the free list.
    pub recycled: u64,
    /// States dropped because the free list was full.
    pub discarded: u64,
}

pub(crate) struct PoolShared<T: 'static> {
    free: RefCell<Vec<SharedState<T>>>,
    capacity: usize,
    rented: Cell<u64>,
    recycled: Cell<u64>,
    discarded: Cell<u64>,
}

impl<T: 'static> PoolShared<T> {
    pub(crate) fn give_back(&self, state: SharedState<T>) {
        let mut free = self.free.borrow_mut();
        if free.len() >= self.capacity {
            self.discarded.set(self.discarded.get() + 1);
            return;
        }
        free.push(state);
        self.recycled.set(self.recycled.get() + 1);
    }
}

/// Free list of task states for one result type.
///
/// Cloning a pool shares the same free list.
pub struct TaskPool<T: 'static> {
    shared: Rc<PoolShared<T>>,
}

impl<T: 'static> TaskPool<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            shared: Rc::new(PoolShared {
                free: RefCell::new(Vec::new()),
                capacity,
                rented: Cell::new(0),
                recycled: Cell::new(0),
                discarded: Cell::new(0),
            }),
        }
    }

    /// Hand out a pending task, reusing recycled state when available.
    pub fn rent(&self) -> Task<T> {
        self.shared.rented.set(self.shared.rented.get() + 1);
        let state = self
            .shared
            .free
            .borrow_mut()
            .pop()
            .unwrap_or_else(|| Rc::new(RefCell::new(TaskState::pending())));
        Task::from_pool(state, Rc::downgrade(&self.shared))
    }

    /// Number of states ready for reuse.
    pub fn len(&self) -> usize {
        self.shared.free.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            rented: self.shared.rented.get(),
            recycled: self.shared.recycled.get(),
            discarded: self.shared.discarded.get(),
        }
    }
}

impl<T: 'static> Clone for TaskPool<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Rc::clone(&self.shared),
        }
    }
}

/// One [`TaskPool`] per result type, created on first use.
pub struct TaskPools {
    capacity: usize,
    pools: RefCell<HashMap<TypeId, Box<dyn Any>>>,
}

impl TaskPools {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            pools: RefCell::new(HashMap::new()),
        }
    }

    /// The pool for `T`.
    pub fn pool<T: 'static>(&self) -> TaskPool<T> {
        let mut pools = self.pools.borrow_mut();
        let entry = pools.entry(TypeId::of::<T>()).or_insert_with(|| {
            trace!(
                task_type = std::any::type_name::<T>(),
                capacity = self.capacity,
                "creating task pool"
            );
            Box::new(TaskPool::<T>::new(self.capacity))
        });
        match entry.downcast_ref::<TaskPool<T>>() {
            Some(pool) => pool.clone(),
            None => TaskPool::new(self.capacity),
        }
    }

    /// Rent a task from the pool for `T`.
    pub fn rent<T: 'static>(&self) -> Task<T> {
        self.pool::<T>().rent()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pools_are_shared_per_type() {
        let pools = TaskPools::new(4);
        drop(pools.rent::<u32>());
        drop(pools.rent::<String>());

        assert_eq!(pools.pool::<u32>().len(), 1);
        assert_eq!(pools.pool::<String>().len(), 1);
        assert_eq!(pools.pool::<u32>().capacity(), 4);
        assert_eq!(pools.pool::<u64>().len(), 0);
    }
}
