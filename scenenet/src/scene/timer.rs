//! Deadline-ordered timers fired by the scene tick.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::time::Instant;

use crate::task::Task;

#[derive(Default)]
pub struct TimerQueue {
    timers: RefCell<BTreeMap<(Instant, u64), Task<()>>>,
    next_id: Cell<u64>,
}

impl TimerQueue {
    /// Complete `task` on the first [`fire`](Self::fire) at or after `deadline`.
    pub fn schedule(&self, deadline: Instant, task: Task<()>) {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        self.timers.borrow_mut().insert((deadline, id), task);
    }

    /// Complete every timer due at `now`, earliest first.
    pub fn fire(&self, now: Instant) -> usize {
        let due = {
            let mut timers = self.timers.borrow_mut();
            let later = timers.split_off(&(now, u64::MAX));
            std::mem::replace(&mut *timers, later)
        };
        let count = due.len();
        for task in due.into_values() {
            if !task.is_completed() {
                let _ = task.complete(());
            }
        }
        count
    }

    /// Cancel every outstanding timer.
    pub fn cancel_all(&self) -> usize {
        let timers = std::mem::take(&mut *self.timers.borrow_mut());
        let count = timers.len();
        for task in timers.into_values() {
            if !task.is_completed() {
                let _ = task.cancel();
            }
        }
        count
    }

    pub fn len(&self) -> usize {
        self.timers.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
