//! Cooperative cancellation signal.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

/// Handle returned by [`CancellationToken::register`], used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CancelRegistration(u64);

#[derive(Default)]
struct CancelState {
    canceled: bool,
    next_id: u64,
    callbacks: Vec<(u64, Box<dyn FnOnce()>)>,
}

/// A set of callbacks fired once on cancel.
///
/// Canceling runs every registered callback exactly once, in registration
/// order, and is idempotent. Clones share the same signal.
#[derive(Clone, Default)]
pub struct CancellationToken {
    state: Rc<RefCell<CancelState>>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_canceled(&self) -> bool {
        self.state.borrow().canceled
    }

    /// Register `callback` to run on cancel.
    ///
    /// On an already canceled token the callback runs immediately and
    /// `None` is returned.
    pub fn register<F>(&self, callback: F) -> Option<CancelRegistration>
    where
        F: FnOnce() + 'static,
    {
        let mut state = self.state.borrow_mut();
        if state.canceled {
            drop(state);
            callback();
            return None;
        }
        state.next_id += 1;
        let id = state.next_id;
        state.callbacks.push((id, Box::new(callback)));
        Some(CancelRegistration(id))
    }

    /// Remove a callback. Returns `false` if it already ran or was removed.
    pub fn unregister(&self, registration: CancelRegistration) -> bool {
        let mut state = self.state.borrow_mut();
        let before = state.callbacks.len();
        state.callbacks.retain(|(id, _)| *id != registration.0);
        state.callbacks.len() != before
    }

    /// Fire the signal.
    pub fn cancel(&self) {
        let callbacks = {
            let mut state = self.state.borrow_mut();
            if state.canceled {
                return;
            }
            state.canceled = true;
            std::mem::take(&mut state.callbacks)
        };
        for (_, callback) in callbacks {
            callback();
        }
    }

    /// Number of callbacks still waiting for cancellation.
    pub fn registered(&self) -> usize {
        self.state.borrow().callbacks.len()
    }
}

impl fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("CancellationToken")
            .field("canceled", &state.canceled)
            .field("registered", &state.callbacks.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_cancel_runs_callbacks_once_in_order() {
        let token = CancellationToken::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        for i in 0..3 {
            let log = log.clone();
            token.register(move || log.borrow_mut().push(i));
        }

        token.cancel();
        token.cancel();
        assert_eq!(*log.borrow(), vec![0, 1, 2]);
        assert!(token.is_canceled());
    }

    #[test]
    fn test_unregistered_callback_never_runs() {
        let token = CancellationToken::new();
        let fired = Rc::new(Cell::new(false));
        let flag = fired.clone();
        let registration = token.register(move || flag.set(true)).unwrap();

        assert!(token.unregister(registration));
        assert!(!token.unregister(registration));
        token.cancel();
        assert!(!fired.get());
    }

    #[test]
    fn test_register_after_cancel_runs_immediately() {
        let token = CancellationToken::new();
        token.cancel();
        let fired = Rc::new(Cell::new(false));
        let flag = fired.clone();
        assert!(token.register(move || flag.set(true)).is_none());
        assert!(fired.get());
    }

    #[test]
    fn test_callback_may_unregister_during_cancel() {
        let token = CancellationToken::new();
        let inner = token.clone();
        let second = Rc::new(Cell::new(None));
        let slot = second.clone();
        token.register(move || {
            if let Some(registration) = slot.get() {
                inner.unregister(registration);
            }
        });
        second.set(token.register(|| {}));
        token.cancel();
        assert_eq!(token.registered(), 0);
    }
}
