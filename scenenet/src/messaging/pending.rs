//! Pending calls awaiting a response frame.
//!
//! # Architecture
//!
//! ```text
//! Request Flow:
//!   1. next_rpc_id() picks a fresh non-zero id
//!   2. register() stores the caller's Task<Frame> with a deadline
//!   3. the request frame is sent carrying the rpc id
//!
//! Response Flow:
//!   4. a response frame arrives on the caller's scene
//!   5. complete() removes the entry and completes the task
//!
//! Timeout Flow:
//!   4. sweep(now) finds the deadline elapsed
//!   5. the entry is removed and its task fails with TaskError::Timeout
//! ```
//!
//! A response whose rpc id is not pending (already timed out, canceled or
//! stale) is logged and dropped.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::time::Instant;

use tracing::{debug, warn};

use crate::error::TaskError;
use crate::messaging::{Frame, OpCode, RouteId};
use crate::task::{CancelRegistration, CancellationToken, Task};

/// One in-flight request.
pub struct PendingCall {
    task: Task<Frame>,
    opcode: OpCode,
    target: RouteId,
    sent_at: Instant,
    deadline: Instant,
    cancel: Option<(CancellationToken, CancelRegistration)>,
}

impl PendingCall {
    pub fn new(task: Task<Frame>, opcode: OpCode, target: RouteId, sent_at: Instant, deadline: Instant) -> Self {
        Self {
            task,
            opcode,
            target,
            sent_at,
            deadline,
            cancel: None,
        }
    }

    fn unlink(&mut self) {
        if let Some((token, registration)) = self.cancel.take() {
            token.unregister(registration);
        }
    }
}

/// Table of in-flight requests keyed by rpc id.
pub struct PendingCalls {
    calls: RefCell<HashMap<u32, PendingCall>>,
    next_rpc_id: Cell<u32>,
}

impl PendingCalls {
    /// `random_seed` starts the id sequence at a random value.
    pub fn new(random_seed: bool) -> Self {
        let start = if random_seed {
            rand::random::<u32>().max(1)
        } else {
            1
        };
        Self {
            calls: RefCell::new(HashMap::new()),
            next_rpc_id: Cell::new(start),
        }
    }

    /// A non-zero id not currently in flight.
    pub fn next_rpc_id(&self) -> u32 {
        let calls = self.calls.borrow();
        loop {
            let id = self.next_rpc_id.get();
            self.next_rpc_id.set(id.wrapping_add(1));
            if id != 0 && !calls.contains_key(&id) {
                return id;
            }
        }
    }

    pub fn register(&self, rpc_id: u32, call: PendingCall) {
        if let Some(mut replaced) = self.calls.borrow_mut().insert(rpc_id, call) {
            warn!(rpc_id, "rpc id reused while still pending");
            replaced.unlink();
        }
    }

    /// Cancel the call when `token` fires.
    pub fn link_cancellation<F>(&self, rpc_id: u32, token: &CancellationToken, on_cancel: F)
    where
        F: FnOnce() + 'static,
    {
        if let Some(registration) = token.register(on_cancel) {
            match self.calls.borrow_mut().get_mut(&rpc_id) {
                Some(call) => call.cancel = Some((token.clone(), registration)),
                None => {
                    token.unregister(registration);
                }
            }
        }
    }

    /// Complete the call waiting on `rpc_id` with `frame`.
    ///
    /// Returns `false` (and logs) when no such call is pending.
    pub fn complete(&self, rpc_id: u32, frame: Frame) -> bool {
        let removed = self.calls.borrow_mut().remove(&rpc_id);
        let Some(mut call) = removed else {
            warn!(rpc_id, opcode = %frame.opcode, "response for unknown or expired rpc id");
            return false;
        };
        call.unlink();
        debug!(
            rpc_id,
            opcode = %call.opcode,
            target = %call.target,
            elapsed_us = call.sent_at.elapsed().as_micros() as u64,
            "call completed"
        );
        let _ = call.task.complete(frame);
        true
    }

    /// Fail the call waiting on `rpc_id`.
    pub fn fail(&self, rpc_id: u32, error: TaskError) -> bool {
        let removed = self.calls.borrow_mut().remove(&rpc_id);
        let Some(mut call) = removed else {
            return false;
        };
        call.unlink();
        debug!(rpc_id, opcode = %call.opcode, %error, "call failed");
        let _ = call.task.fail(error);
        true
    }

    /// Time out every call whose deadline is at or before `now`.
    pub fn sweep(&self, now: Instant) -> usize {
        let expired: Vec<(u32, PendingCall)> = {
            let mut calls = self.calls.borrow_mut();
            let ids: Vec<u32> = calls
                .iter()
                .filter(|(_, call)| call.deadline <= now)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| calls.remove(&id).map(|call| (id, call)))
                .collect()
        };
        let count = expired.len();
        for (rpc_id, mut call) in expired {
            call.unlink();
            warn!(rpc_id, opcode = %call.opcode, target = %call.target, "call timed out");
            let _ = call.task.fail(TaskError::Timeout);
        }
        count
    }

    /// Fail every pending call, e.g. when the owning scene shuts down.
    pub fn fail_all(&self, error: TaskError) -> usize {
        let drained: Vec<PendingCall> = self.calls.borrow_mut().drain().map(|(_, c)| c).collect();
        let count = drained.len();
        for mut call in drained {
            call.unlink();
            let _ = call.task.fail(error.clone());
        }
        count
    }

    pub fn len(&self) -> usize {
        self.calls.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, rpc_id: u32) -> bool {
        self.calls.borrow().contains_key(&rpc_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::{OpCodeCategory, SceneId, SerializerTag};
    use crate::task::TaskStatus;
    use std::time::Duration;

    const OP: OpCode = OpCode::new(OpCodeCategory::Request, SerializerTag::Json, 1);

    fn call(task: &Task<Frame>, timeout: Duration) -> PendingCall {
        let now = Instant::now();
        PendingCall::new(task.clone(), OP, RouteId::for_scene(SceneId(1)), now, now + timeout)
    }

    fn response(rpc_id: u32) -> Frame {
        Frame {
            opcode: OpCode::new(OpCodeCategory::Response, SerializerTag::Json, 1),
            rpc_id,
            route_id: RouteId::NONE,
            payload: b"{}".to_vec(),
        }
    }

    #[test]
    fn test_ids_are_sequential_and_skip_zero() {
        let pending = PendingCalls::new(false);
        assert_eq!(pending.next_rpc_id(), 1);
        assert_eq!(pending.next_rpc_id(), 2);

        pending.next_rpc_id.set(u32::MAX);
        assert_eq!(pending.next_rpc_id(), u32::MAX);
        assert_eq!(pending.next_rpc_id(), 1);
    }

    #[test]
    fn test_ids_in_flight_are_skipped() {
        let pending = PendingCalls::new(false);
        let task = Task::new();
        pending.register(2, call(&task, Duration::from_secs(5)));
        assert_eq!(pending.next_rpc_id(), 1);
        assert_eq!(pending.next_rpc_id(), 3);
    }

    #[test]
    fn test_random_seed_never_yields_zero() {
        let pending = PendingCalls::new(true);
        for _ in 0..100 {
            assert_ne!(pending.next_rpc_id(), 0);
        }
    }

    #[test]
    fn test_response_completes_matching_call() {
        let pending = PendingCalls::new(false);
        let task = Task::new();
        pending.register(7, call(&task, Duration::from_secs(5)));

        assert!(pending.complete(7, response(7)));
        assert!(pending.is_empty());
        assert_eq!(task.take_result().unwrap().unwrap().rpc_id, 7);
        assert!(!pending.complete(7, response(7)));
    }

    #[test]
    fn test_sweep_times_out_expired_calls_only() {
        let pending = PendingCalls::new(false);
        let short = Task::new();
        let long = Task::new();
        pending.register(1, call(&short, Duration::from_millis(10)));
        pending.register(2, call(&long, Duration::from_secs(60)));

        let swept = pending.sweep(Instant::now() + Duration::from_secs(1));
        assert_eq!(swept, 1);
        assert_eq!(short.error(), Some(TaskError::Timeout));
        assert_eq!(long.status(), TaskStatus::Pending);
        assert!(pending.contains(2));
    }

    #[test]
    fn test_cancellation_removes_the_call() {
        let pending = std::rc::Rc::new(PendingCalls::new(false));
        let token = CancellationToken::new();
        let task = Task::new();
        pending.register(4, call(&task, Duration::from_secs(5)));
        let table = pending.clone();
        pending.link_cancellation(4, &token, move || {
            table.fail(4, TaskError::Canceled);
        });

        token.cancel();
        assert_eq!(task.status(), TaskStatus::Canceled);
        assert!(pending.is_empty());
    }

    #[test]
    fn test_completion_unlinks_the_token() {
        let pending = PendingCalls::new(false);
        let token = CancellationToken::new();
        let task = Task::new();
        pending.register(5, call(&task, Duration::from_secs(5)));
        pending.link_cancellation(5, &token, || {});
        assert_eq!(token.registered(), 1);

        pending.complete(5, response(5));
        assert_eq!(token.registered(), 0);
    }

    #[test]
    fn test_fail_all_disconnects_everyone() {
        let pending = PendingCalls::new(false);
        let tasks: Vec<Task<Frame>> = (0..3).map(|_| Task::new()).collect();
        for (i, task) in tasks.iter().enumerate() {
            pending.register(i as u32 + 1, call(task, Duration::from_secs(5)));
        }
        assert_eq!(pending.fail_all(TaskError::Disconnected), 3);
        assert!(tasks
            .iter()
            .all(|t| t.error() == Some(TaskError::Disconnected)));
    }
}
