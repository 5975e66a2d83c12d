//! Single-assignment tasks with ordered continuations.
//!
//! A [`Task`] is the one suspension point of the runtime: locks, pending
//! calls and timers all hand out tasks and complete them later. A task
//! leaves [`TaskStatus::Pending`] exactly once; completing it again is a
//! programming error that is logged and returned as [`CompletionError`].
//!
//! # Single-Threaded Design
//!
//! Tasks use `Rc<RefCell<..>>` and never cross threads. Every scene owns its
//! own [`TaskPools`] and drives its tasks from its shard's executor.
//!
//! ```text
//!   Pending ──complete()──► Succeeded
//!      │   ──fail()──────► Faulted
//!      └── ──cancel()────► Canceled
//! ```
//!
//! # Pooling
//!
//! Tasks rented from a [`TaskPool`] return their state to the pool when the
//! last handle is dropped. The state is reset first so a re-rented task
//! starts pending with no result, continuation or cancellation link left
//! over from its previous use.

mod cancel;
mod pool;

pub use cancel::{CancelRegistration, CancellationToken};
pub use pool::{PoolStats, TaskPool, TaskPools};

use std::any::type_name;
use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::mem;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll, Waker};

use serde::{Deserialize, Serialize};
use tracing::error;

use crate::error::{CompletionError, TaskError};
use pool::PoolShared;

/// Lifecycle state of a [`Task`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    Pending,
    Succeeded,
    Faulted,
    Canceled,
}

type Continuation<T> = Box<dyn FnOnce(&Task<T>)>;

pub(crate) type SharedState<T> = Rc<RefCell<TaskState<T>>>;

pub(crate) struct TaskState<T: 'static> {
    status: TaskStatus,
    outcome: Option<Result<T, TaskError>>,
    continuations: Vec<Continuation<T>>,
    wakers: Vec<Waker>,
    observed: bool,
    cancel_link: Option<(CancellationToken, CancelRegistration)>,
}

impl<T: 'static> TaskState<T> {
    pub(crate) fn pending() -> Self {
        Self {
            status: TaskStatus::Pending,
            outcome: None,
            continuations: Vec::new(),
            wakers: Vec::new(),
            observed: false,
            cancel_link: None,
        }
    }
}

/// A deferred result produced exactly once.
///
/// Handles are cheap clones of the same shared state. Awaiting a task yields
/// `Result<T, TaskError>`; the value is moved out to the first observer and
/// later observers get [`TaskError::Consumed`].
///
/// # Example
///
/// ```rust
/// use scenenet::task::{Task, TaskStatus};
///
/// let task = Task::new();
/// task.continue_with(|t| assert_eq!(t.status(), TaskStatus::Succeeded));
/// task.complete(7).unwrap();
/// assert!(task.complete(8).is_err());
/// assert_eq!(task.take_result(), Some(Ok(7)));
/// ```
pub struct Task<T: 'static> {
    state: SharedState<T>,
    pool: Option<Weak<PoolShared<T>>>,
}

impl<T: 'static> Task<T> {
    /// Create a fresh, unpooled pending task.
    pub fn new() -> Self {
        Self {
            state: Rc::new(RefCell::new(TaskState::pending())),
            pool: None,
        }
    }

    /// Create a task that already succeeded.
    pub fn completed(value: T) -> Self {
        let task = Self::new();
        {
            let mut state = task.state.borrow_mut();
            state.status = TaskStatus::Succeeded;
            state.outcome = Some(Ok(value));
        }
        task
    }

    pub(crate) fn from_pool(state: SharedState<T>, pool: Weak<PoolShared<T>>) -> Self {
        Self {
            state,
            pool: Some(pool),
        }
    }

    pub fn status(&self) -> TaskStatus {
        self.state.borrow().status
    }

    pub fn is_completed(&self) -> bool {
        self.status() != TaskStatus::Pending
    }

    /// Whether the task returns to a pool when its last handle drops.
    pub fn is_pooled(&self) -> bool {
        self.pool.is_some()
    }

    /// Succeed with `value`.
    pub fn complete(&self, value: T) -> Result<(), CompletionError> {
        self.settle(Ok(value))
    }

    /// Fault with `error`. [`TaskError::Canceled`] settles as canceled.
    pub fn fail(&self, error: TaskError) -> Result<(), CompletionError> {
        self.settle(Err(error))
    }

    pub fn cancel(&self) -> Result<(), CompletionError> {
        self.settle(Err(TaskError::Canceled))
    }

    /// Run `callback` once the task completes.
    ///
    /// Callbacks run in attachment order. On an already completed task the
    /// callback runs immediately in the caller's context.
    pub fn continue_with<F>(&self, callback: F)
    where
        F: FnOnce(&Task<T>) + 'static,
    {
        let mut state = self.state.borrow_mut();
        state.observed = true;
        if state.status == TaskStatus::Pending {
            state.continuations.push(Box::new(callback));
            return;
        }
        drop(state);
        callback(self);
    }

    /// Move the outcome out of a completed task.
    ///
    /// Returns `None` while pending and [`TaskError::Consumed`] once another
    /// observer took the value.
    pub fn take_result(&self) -> Option<Result<T, TaskError>> {
        let mut state = self.state.borrow_mut();
        if state.status == TaskStatus::Pending {
            return None;
        }
        state.observed = true;
        Some(state.outcome.take().unwrap_or(Err(TaskError::Consumed)))
    }

    /// The error of a faulted or canceled task.
    pub fn error(&self) -> Option<TaskError> {
        let mut state = self.state.borrow_mut();
        match &state.outcome {
            Some(Err(error)) => {
                let error = error.clone();
                state.observed = true;
                Some(error)
            }
            _ => None,
        }
    }

    /// Cancel this task when `token` fires.
    ///
    /// The link is removed once the task completes or is recycled.
    pub fn with_cancellation(&self, token: &CancellationToken) {
        if self.is_completed() {
            return;
        }
        let weak = Rc::downgrade(&self.state);
        let registration = token.register(move || {
            if let Some(state) = weak.upgrade() {
                let task = Task { state, pool: None };
                if task.status() == TaskStatus::Pending {
                    let _ = task.cancel();
                }
            }
        });
        if let Some(registration) = registration {
            self.state.borrow_mut().cancel_link = Some((token.clone(), registration));
        }
    }

    fn settle(&self, outcome: Result<T, TaskError>) -> Result<(), CompletionError> {
        let status = match &outcome {
            Ok(_) => TaskStatus::Succeeded,
            Err(TaskError::Canceled) => TaskStatus::Canceled,
            Err(_) => TaskStatus::Faulted,
        };

        let (continuations, wakers, link) = {
            let mut state = self.state.borrow_mut();
            if state.status != TaskStatus::Pending {
                let current = state.status;
                drop(state);
                error!(
                    task_type = type_name::<T>(),
                    status = ?current,
                    "task completed more than once"
                );
                return Err(CompletionError::AlreadyCompleted { status: current });
            }
            state.status = status;
            state.outcome = Some(outcome);
            (
                mem::take(&mut state.continuations),
                mem::take(&mut state.wakers),
                state.cancel_link.take(),
            )
        };

        if let Some((token, registration)) = link {
            token.unregister(registration);
        }
        for continuation in continuations {
            continuation(self);
        }
        for waker in wakers {
            waker.wake();
        }
        Ok(())
    }
}

impl<T: 'static> Default for Task<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: 'static> Clone for Task<T> {
    fn clone(&self) -> Self {
        Self {
            state: Rc::clone(&self.state),
            pool: self.pool.clone(),
        }
    }
}

impl<T: 'static> fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("type", &type_name::<T>())
            .field("status", &self.status())
            .field("pooled", &self.is_pooled())
            .finish()
    }
}

impl<T: 'static> Future for Task<T> {
    type Output = Result<T, TaskError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.state.borrow_mut();
        if state.status == TaskStatus::Pending {
            if !state.wakers.iter().any(|w| w.will_wake(cx.waker())) {
                state.wakers.push(cx.waker().clone());
            }
            return Poll::Pending;
        }
        state.observed = true;
        Poll::Ready(state.outcome.take().unwrap_or(Err(TaskError::Consumed)))
    }
}

impl<T: 'static> Drop for Task<T> {
    fn drop(&mut self) {
        if Rc::strong_count(&self.state) != 1 {
            return;
        }

        let (link, stale) = {
            let Ok(mut state) = self.state.try_borrow_mut() else {
                return;
            };
            if state.status == TaskStatus::Faulted && !state.observed {
                if let Some(Err(error)) = &state.outcome {
                    error!(
                        task_type = type_name::<T>(),
                        %error,
                        "faulted task dropped without being observed"
                    );
                }
            }
            let link = state.cancel_link.take();
            let stale = match self.pool.as_ref().and_then(Weak::upgrade) {
                Some(_) => {
                    state.status = TaskStatus::Pending;
                    state.outcome = None;
                    state.wakers.clear();
                    state.observed = false;
                    mem::take(&mut state.continuations)
                }
                None => Vec::new(),
            };
            (link, stale)
        };

        if let Some((token, registration)) = link {
            token.unregister(registration);
        }
        drop(stale);

        if let Some(pool) = self.pool.as_ref().and_then(Weak::upgrade) {
            pool.give_back(Rc::clone(&self.state));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tracing_subscriber::layer::{self, Layer};
    use tracing_subscriber::prelude::*;

    #[test]
    fn test_second_completion_is_rejected_and_result_kept() {
        let task = Task::new();
        task.complete(1).unwrap();

        assert_eq!(
            task.complete(2),
            Err(CompletionError::AlreadyCompleted {
                status: TaskStatus::Succeeded
            })
        );
        assert!(task.fail(TaskError::Timeout).is_err());
        assert_eq!(task.status(), TaskStatus::Succeeded);
        assert_eq!(task.take_result(), Some(Ok(1)));
    }

    #[test]
    fn test_failure_is_single_assignment_too() {
        let task: Task<u32> = Task::new();
        task.fail(TaskError::Failed("boom".into())).unwrap();
        assert!(task.complete(3).is_err());
        assert_eq!(task.status(), TaskStatus::Faulted);
        assert_eq!(task.error(), Some(TaskError::Failed("boom".into())));
    }

    #[test]
    fn test_continuations_run_in_attachment_order() {
        let order = Rc::new(RefCell::new(Vec::new()));
        let task = Task::new();
        for i in 0..3 {
            let order = order.clone();
            task.continue_with(move |_| order.borrow_mut().push(i));
        }
        assert!(order.borrow().is_empty());

        task.complete(()).unwrap();
        assert_eq!(*order.borrow(), vec![0, 1, 2]);
    }

    #[test]
    fn test_continuation_on_completed_task_runs_immediately() {
        let ran = Rc::new(Cell::new(false));
        let task = Task::completed("done");
        let flag = ran.clone();
        task.continue_with(move |t| {
            assert_eq!(t.status(), TaskStatus::Succeeded);
            flag.set(true);
        });
        assert!(ran.get());
    }

    #[tokio::test]
    async fn test_awaiting_resumes_on_completion() {
        let task = Task::new();
        let producer = task.clone();
        let (result, ()) = tokio::join!(task, async move {
            tokio::task::yield_now().await;
            producer.complete(42u64).unwrap();
        });
        assert_eq!(result, Ok(42));
    }

    #[tokio::test]
    async fn test_second_observer_sees_consumed() {
        let task = Task::completed(5u8);
        let other = task.clone();
        assert_eq!(task.await, Ok(5));
        assert_eq!(other.await, Err(TaskError::Consumed));
    }

    #[test]
    fn test_cancellation_token_cancels_linked_task() {
        let token = CancellationToken::new();
        let task: Task<u32> = Task::new();
        task.with_cancellation(&token);

        token.cancel();
        assert_eq!(task.status(), TaskStatus::Canceled);
        assert_eq!(task.take_result(), Some(Err(TaskError::Canceled)));
    }

    #[test]
    fn test_completed_task_unlinks_from_token() {
        let token = CancellationToken::new();
        let task = Task::new();
        task.with_cancellation(&token);
        assert_eq!(token.registered(), 1);

        task.complete(()).unwrap();
        assert_eq!(token.registered(), 0);
        token.cancel();
        assert_eq!(task.status(), TaskStatus::Succeeded);
    }

    #[test]
    fn test_rented_task_starts_clean_after_recycling() {
        let pool: TaskPool<u32> = TaskPool::new(8);
        let calls = Rc::new(Cell::new(0));

        let task = pool.rent();
        let counter = calls.clone();
        task.continue_with(move |_| counter.set(counter.get() + 1));
        task.complete(10).unwrap();
        let first = Rc::as_ptr(&task.state);
        drop(task);
        assert_eq!(pool.len(), 1);

        let again = pool.rent();
        assert_eq!(Rc::as_ptr(&again.state), first);
        assert_eq!(again.status(), TaskStatus::Pending);
        assert_eq!(again.take_result(), None);

        again.complete(11).unwrap();
        assert_eq!(calls.get(), 1);
        assert_eq!(again.take_result(), Some(Ok(11)));
    }

    #[test]
    fn test_live_clone_prevents_recycling() {
        let pool: TaskPool<()> = TaskPool::new(8);
        let task = pool.rent();
        let held = task.clone();
        drop(task);
        assert_eq!(pool.len(), 0);
        drop(held);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_recycled_task_drops_cancel_link() {
        let pool: TaskPool<()> = TaskPool::new(8);
        let token = CancellationToken::new();
        let task = pool.rent();
        task.with_cancellation(&token);
        drop(task);

        assert_eq!(token.registered(), 0);
        let again = pool.rent();
        token.cancel();
        assert_eq!(again.status(), TaskStatus::Pending);
    }

    #[test]
    fn test_pool_is_bounded() {
        let pool: TaskPool<u8> = TaskPool::new(2);
        let tasks: Vec<_> = (0..3).map(|_| pool.rent()).collect();
        drop(tasks);

        assert_eq!(pool.len(), 2);
        let stats = pool.stats();
        assert_eq!(stats.rented, 3);
        assert_eq!(stats.recycled, 2);
        assert_eq!(stats.discarded, 1);
    }

    /// Counts `error!` events emitted while installed.
    struct ErrorCounter {
        errors: Arc<AtomicUsize>,
    }

    impl<S: tracing::Subscriber> Layer<S> for ErrorCounter {
        fn on_event(&self, event: &tracing::Event<'_>, _ctx: layer::Context<'_, S>) {
            if *event.metadata().level() == tracing::Level::ERROR {
                self.errors.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    fn errors_logged_by(scenario: impl FnOnce()) -> usize {
        let errors = Arc::new(AtomicUsize::new(0));
        let subscriber = tracing_subscriber::registry().with(ErrorCounter {
            errors: errors.clone(),
        });
        tracing::subscriber::with_default(subscriber, scenario);
        errors.load(Ordering::SeqCst)
    }

    #[test]
    fn test_unobserved_fault_is_logged_on_drop() {
        let logged = errors_logged_by(|| {
            let task: Task<u32> = Task::new();
            task.fail(TaskError::Failed("lost".into())).unwrap();
            drop(task);
        });
        assert_eq!(logged, 1);
    }

    #[test]
    fn test_observed_fault_is_not_logged_on_drop() {
        let logged = errors_logged_by(|| {
            let inspected: Task<u32> = Task::new();
            inspected.fail(TaskError::Timeout).unwrap();
            assert_eq!(inspected.error(), Some(TaskError::Timeout));
            drop(inspected);

            let taken: Task<u32> = Task::new();
            taken.fail(TaskError::Disconnected).unwrap();
            assert_eq!(taken.take_result(), Some(Err(TaskError::Disconnected)));
            drop(taken);
        });
        assert_eq!(logged, 0);
    }

    #[test]
    fn test_fault_is_logged_once_when_last_handle_drops() {
        let logged = errors_logged_by(|| {
            let pool: TaskPool<u32> = TaskPool::new(4);
            let task = pool.rent();
            let clone = task.clone();
            task.fail(TaskError::Failed("lost".into())).unwrap();
            drop(task);
            drop(clone);
        });
        assert_eq!(logged, 1);
    }
}
