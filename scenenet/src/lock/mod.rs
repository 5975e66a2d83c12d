//! FIFO per-key asynchronous mutex.
//!
//! A [`CoroutineLock`] serializes operations on one logical key inside one
//! namespace. The first waiter for a key is granted immediately; later
//! waiters queue behind it and are granted strictly in arrival order as
//! each [`WaitTicket`] is disposed.
//!
//! ```text
//! queues: HashMap<key, LockQueue>
//!
//!   key 1001 ─► [holder] ◄─ waiters: t2 ─► t3 ─► t4
//!   key 1002 ─► [holder]    (no waiters)
//! ```
//!
//! A queue exists exactly while someone holds the key. Releasing with an
//! empty wait-line removes the queue.
//!
//! There is no re-entrancy: a holder waiting again on the same key waits
//! forever.
//!
//! # Timeouts
//!
//! Tickets carry a deadline. [`CoroutineLock::check_timeouts`] reports a
//! ticket that waited past its deadline once, as a warning and in
//! [`LockStats::timeouts`], and leaves it queued.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use tracing::{error, trace, warn};

use crate::error::LockError;
use crate::task::{CancellationToken, Task, TaskPool, TaskStatus};

/// Identifies an independent family of lock keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LockNamespace(pub u32);

impl LockNamespace {
    /// Per-id serialization of the addressable registry.
    pub const ADDRESSABLE: LockNamespace = LockNamespace(1);
    /// Per-id serialization of addressable client calls.
    pub const ADDRESSABLE_CALL: LockNamespace = LockNamespace(2);
    /// First namespace free for application use.
    pub const USER: LockNamespace = LockNamespace(1000);
}

impl fmt::Display for LockNamespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Counters for one lock namespace.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LockStats {
    /// Tickets granted so far.
    pub granted: u64,
    /// Tickets reported as waiting past their deadline.
    pub timeouts: u64,
    /// Tickets currently queued behind a holder.
    pub waiting: usize,
}

struct TicketState {
    key: u64,
    tag: Option<String>,
    deadline: Instant,
    task: Task<()>,
    canceled: Cell<bool>,
    timeout_reported: Cell<bool>,
    disposed: Cell<bool>,
}

impl TicketState {
    /// Still waiting for a grant.
    fn is_waiting(&self) -> bool {
        !self.canceled.get() && self.task.status() == TaskStatus::Pending
    }
}

#[derive(Default)]
struct LockQueue {
    holder: Option<Rc<TicketState>>,
    waiters: VecDeque<Rc<TicketState>>,
}

/// All locks of a scene, one per namespace.
pub struct CoroutineLockComponent {
    locks: RefCell<HashMap<LockNamespace, Rc<CoroutineLock>>>,
    pool: TaskPool<()>,
    default_timeout: Duration,
}

impl CoroutineLockComponent {
    pub fn new(pool: TaskPool<()>, default_timeout: Duration) -> Self {
        Self {
            locks: RefCell::new(HashMap::new()),
            pool,
            default_timeout,
        }
    }

    /// The lock for `namespace`, created on first use.
    pub fn lock(&self, namespace: LockNamespace) -> Rc<CoroutineLock> {
        self.locks
            .borrow_mut()
            .entry(namespace)
            .or_insert_with(|| {
                CoroutineLock::new(namespace, self.pool.clone(), self.default_timeout)
            })
            .clone()
    }

    /// Shorthand for `lock(namespace).wait(key, tag)`.
    pub fn wait(&self, namespace: LockNamespace, key: u64, tag: Option<&str>) -> LockWait {
        self.lock(namespace).wait(key, tag)
    }

    /// Release the current holder of `key` without its ticket.
    ///
    /// The holder's ticket counts as disposed afterwards.
    pub fn release(&self, namespace: LockNamespace, key: u64) {
        let lock = self.locks.borrow().get(&namespace).cloned();
        match lock {
            Some(lock) => lock.release(key),
            None => warn!(%namespace, key, "release on unknown lock namespace"),
        }
    }

    /// Report overdue tickets across every namespace.
    pub fn check_timeouts(&self, now: Instant) -> usize {
        let locks: Vec<_> = self.locks.borrow().values().cloned().collect();
        locks.iter().map(|lock| lock.check_timeouts(now)).sum()
    }
}

/// Per-key FIFO mutex for one namespace.
pub struct CoroutineLock {
    namespace: LockNamespace,
    queues: RefCell<HashMap<u64, LockQueue>>,
    pool: TaskPool<()>,
    default_timeout: Duration,
    granted: Cell<u64>,
    timeouts: Cell<u64>,
    self_ref: Weak<CoroutineLock>,
}

impl CoroutineLock {
    pub fn new(namespace: LockNamespace, pool: TaskPool<()>, default_timeout: Duration) -> Rc<Self> {
        Rc::new_cyclic(|self_ref| Self {
            namespace,
            queues: RefCell::new(HashMap::new()),
            pool,
            default_timeout,
            granted: Cell::new(0),
            timeouts: Cell::new(0),
            self_ref: self_ref.clone(),
        })
    }

    pub fn namespace(&self) -> LockNamespace {
        self.namespace
    }

    /// Wait for ownership of `key` with the default timeout.
    pub fn wait(&self, key: u64, tag: Option<&str>) -> LockWait {
        self.wait_with(key, tag, self.default_timeout, None)
    }

    /// Wait for ownership of `key`; the wait ends early when `token` fires.
    pub fn wait_cancellable(
        &self,
        key: u64,
        tag: Option<&str>,
        token: &CancellationToken,
    ) -> LockWait {
        self.wait_with(key, tag, self.default_timeout, Some(token))
    }

    /// Wait for ownership of `key`, reporting it if not granted in `timeout`.
    pub fn wait_with(
        &self,
        key: u64,
        tag: Option<&str>,
        timeout: Duration,
        token: Option<&CancellationToken>,
    ) -> LockWait {
        let ticket = Rc::new(TicketState {
            key,
            tag: tag.map(str::to_owned),
            deadline: Instant::now() + timeout,
            task: self.pool.rent(),
            canceled: Cell::new(false),
            timeout_reported: Cell::new(false),
            disposed: Cell::new(false),
        });

        let granted_now = {
            let mut queues = self.queues.borrow_mut();
            match queues.get_mut(&key) {
                Some(queue) => {
                    queue.waiters.push_back(Rc::clone(&ticket));
                    trace!(
                        namespace = %self.namespace,
                        key,
                        tag = ?ticket.tag,
                        position = queue.waiters.len(),
                        "queued lock wait"
                    );
                    false
                }
                None => {
                    queues.insert(key, LockQueue::default());
                    true
                }
            }
        };

        if granted_now {
            self.grant(&ticket);
        } else if let Some(token) = token {
            ticket.task.with_cancellation(token);
        }

        LockWait {
            lock: self.self_ref.upgrade(),
            namespace: self.namespace,
            ticket: Some(ticket),
        }
    }

    /// Hand ownership of `key` to the next live waiter.
    ///
    /// The current holder's ticket is marked disposed, so disposing or
    /// dropping it later releases nothing. Canceled waiters are skipped. The
    /// queue is removed once no waiter remains.
    pub fn release(&self, key: u64) {
        loop {
            let next = {
                let mut queues = self.queues.borrow_mut();
                let Some(queue) = queues.get_mut(&key) else {
                    warn!(namespace = %self.namespace, key, "release of a key nobody holds");
                    return;
                };
                if let Some(holder) = queue.holder.take() {
                    holder.disposed.set(true);
                }
                match queue.waiters.pop_front() {
                    Some(next) => next,
                    None => {
                        queues.remove(&key);
                        trace!(namespace = %self.namespace, key, "lock queue drained");
                        return;
                    }
                }
            };
            if !next.is_waiting() {
                continue;
            }
            self.grant(&next);
            return;
        }
    }

    fn grant(&self, ticket: &Rc<TicketState>) {
        if let Some(queue) = self.queues.borrow_mut().get_mut(&ticket.key) {
            queue.holder = Some(Rc::clone(ticket));
        }
        self.granted.set(self.granted.get() + 1);
        trace!(namespace = %self.namespace, key = ticket.key, tag = ?ticket.tag, "lock granted");
        let _ = ticket.task.complete(());
    }

    /// Warn once about every queued ticket past its deadline.
    ///
    /// Overdue tickets stay queued. Returns the number newly reported.
    pub fn check_timeouts(&self, now: Instant) -> usize {
        let queues = self.queues.borrow();
        let mut reported = 0;
        for ticket in queues.values().flat_map(|q| q.waiters.iter()) {
            if !ticket.is_waiting() || ticket.timeout_reported.get() || now < ticket.deadline {
                continue;
            }
            ticket.timeout_reported.set(true);
            reported += 1;
            warn!(
                namespace = %self.namespace,
                key = ticket.key,
                tag = ?ticket.tag,
                "coroutine lock wait exceeded its timeout"
            );
        }
        self.timeouts.set(self.timeouts.get() + reported as u64);
        reported
    }

    /// Whether someone currently holds `key`.
    pub fn is_locked(&self, key: u64) -> bool {
        self.queues.borrow().contains_key(&key)
    }

    /// Number of live waiters queued behind the holder of `key`.
    pub fn queue_len(&self, key: u64) -> usize {
        self.queues
            .borrow()
            .get(&key)
            .map(|q| q.waiters.iter().filter(|t| t.is_waiting()).count())
            .unwrap_or(0)
    }

    pub fn stats(&self) -> LockStats {
        let waiting = self
            .queues
            .borrow()
            .values()
            .flat_map(|q| q.waiters.iter())
            .filter(|t| t.is_waiting())
            .count();
        LockStats {
            granted: self.granted.get(),
            timeouts: self.timeouts.get(),
            waiting,
        }
    }
}

/// Future resolving to a [`WaitTicket`] once ownership is granted.
///
/// Dropping the future before it resolves withdraws from the queue; a grant
/// that was never handed out is released to the next waiter.
pub struct LockWait {
    lock: Option<Rc<CoroutineLock>>,
    namespace: LockNamespace,
    ticket: Option<Rc<TicketState>>,
}

impl Future for LockWait {
    type Output = Result<WaitTicket, LockError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let namespace = self.namespace.0;
        let Some(ticket) = self.ticket.as_ref() else {
            return Poll::Ready(Err(LockError::Canceled { namespace, key: 0 }));
        };
        let key = ticket.key;
        let mut task = ticket.task.clone();
        match Pin::new(&mut task).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(())) => match (self.lock.take(), self.ticket.take()) {
                (Some(lock), Some(state)) => Poll::Ready(Ok(WaitTicket { lock, state })),
                _ => Poll::Ready(Err(LockError::Canceled { namespace, key })),
            },
            Poll::Ready(Err(_)) => {
                if let Some(ticket) = self.ticket.take() {
                    ticket.canceled.set(true);
                }
                Poll::Ready(Err(LockError::Canceled { namespace, key }))
            }
        }
    }
}

impl Drop for LockWait {
    fn drop(&mut self) {
        let Some(ticket) = self.ticket.take() else {
            return;
        };
        match ticket.task.status() {
            TaskStatus::Pending => {
                ticket.canceled.set(true);
                let _ = ticket.task.cancel();
            }
            TaskStatus::Succeeded => {
                if ticket.disposed.replace(true) {
                    return;
                }
                if let Some(lock) = &self.lock {
                    lock.release(ticket.key);
                }
            }
            TaskStatus::Faulted | TaskStatus::Canceled => ticket.canceled.set(true),
        }
    }
}

/// Ownership of one key. Dispose (or drop) to grant the next waiter.
///
/// A ticket whose key was released through [`CoroutineLock::release`] is
/// already disposed; disposing it again is rejected and dropping it releases
/// nothing.
pub struct WaitTicket {
    lock: Rc<CoroutineLock>,
    state: Rc<TicketState>,
}

impl WaitTicket {
    pub fn key(&self) -> u64 {
        self.state.key
    }

    pub fn tag(&self) -> Option<&str> {
        self.state.tag.as_deref()
    }

    pub fn is_disposed(&self) -> bool {
        self.state.disposed.get()
    }

    /// Release ownership. A second call is reported and rejected.
    pub fn dispose(&self) -> Result<(), LockError> {
        if self.state.disposed.replace(true) {
            error!(
                namespace = %self.lock.namespace,
                key = self.state.key,
                tag = ?self.state.tag,
                "wait ticket disposed twice"
            );
            return Err(LockError::AlreadyDisposed {
                namespace: self.lock.namespace.0,
                key: self.state.key,
            });
        }
        self.lock.release(self.state.key);
        Ok(())
    }
}

impl Drop for WaitTicket {
    fn drop(&mut self) {
        if !self.state.disposed.replace(true) {
            self.lock.release(self.state.key);
        }
    }
}

impl fmt::Debug for WaitTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitTicket")
            .field("namespace", &self.lock.namespace)
            .field("key", &self.state.key)
            .field("tag", &self.state.tag)
            .field("disposed", &self.state.disposed.get())
            .finish()
    }
}
