//! Inbound frame dispatch.
//!
//! Each frame is classified by its opcode band and handled on the scene
//! that received it:
//!
//! | Kind           | Handling                                                  |
//! |----------------|-----------------------------------------------------------|
//! | `Message`      | scene handler, no answer                                  |
//! | `Request`      | scene handler, answer sent back to the sender's scene     |
//! | `Response`     | completes the pending call with the same rpc id           |
//! | `RouteMessage` | entity handler; dropped when the entity is missing        |
//! | `RouteRequest` | entity handler; `ERR_NOT_FOUND_ROUTE` when it is missing  |
//! | `Unsupported`  | logged and dropped                                        |
//!
//! Route-class frames addressed to a relay slot are forwarded to the relay
//! target; forwarded requests are answered with the target's response under
//! the original rpc id.
//!
//! Errors are contained per frame: they are logged with opcode, rpc id and
//! channel, turned into an error response when the sender waits for one,
//! and never stop the scene. A panicking handler counts as a failed one and
//! is answered with `ERR_HANDLER_FAILED`.

use std::any::{type_name, Any};
use std::cell::RefCell;
use std::collections::HashMap;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;

use futures::future::LocalBoxFuture;
use futures::FutureExt;
use tracing::{debug, error, warn};

use crate::error::{HandlerError, RegistryError, TaskError};
use crate::messaging::{ErrorCode, Frame, FrameKind, Message, OpCode, Request, RouteId, SceneId};
use crate::scene::{panic_reason, EntitySlot, Scene};

/// Encoded answer produced by a request handler.
pub(crate) struct Reply {
    opcode: OpCode,
    payload: Vec<u8>,
}

impl Reply {
    fn encode<M: Message>(message: &M) -> Result<Self, HandlerError> {
        Ok(Self {
            opcode: M::OPCODE,
            payload: M::OPCODE.serializer()?.encode(message)?,
        })
    }
}

pub(crate) type HandlerFuture = LocalBoxFuture<'static, Result<Option<Reply>, HandlerError>>;

pub(crate) type ErasedHandler = Rc<dyn Fn(Rc<Scene>, Option<Rc<dyn Any>>, Frame) -> HandlerFuture>;

/// Per-scene opcode → handler table.
#[derive(Default)]
pub(crate) struct HandlerTable {
    handlers: RefCell<HashMap<OpCode, ErasedHandler>>,
}

impl HandlerTable {
    pub(crate) fn insert(&self, opcode: OpCode, handler: ErasedHandler) -> Result<(), RegistryError> {
        let mut handlers = self.handlers.borrow_mut();
        if handlers.contains_key(&opcode) {
            return Err(RegistryError::DuplicateHandler(opcode));
        }
        handlers.insert(opcode, handler);
        Ok(())
    }

    pub(crate) fn get(&self, opcode: OpCode) -> Option<ErasedHandler> {
        self.handlers.borrow().get(&opcode).cloned()
    }

    pub(crate) fn len(&self) -> usize {
        self.handlers.borrow().len()
    }
}

fn downcast<E: 'static>(entity: Option<Rc<dyn Any>>) -> Result<Rc<E>, HandlerError> {
    entity
        .and_then(|e| e.downcast::<E>().ok())
        .ok_or(HandlerError::EntityTypeMismatch {
            expected: type_name::<E>(),
        })
}

async fn run_message<Fut>(call: Result<Fut, HandlerError>) -> Result<Option<Reply>, HandlerError>
where
    Fut: Future<Output = Result<(), HandlerError>>,
{
    call?.await?;
    Ok(None)
}

async fn run_request<R, Fut>(call: Result<Fut, HandlerError>) -> Result<Option<Reply>, HandlerError>
where
    R: Message,
    Fut: Future<Output = Result<R, HandlerError>>,
{
    let response = call?.await?;
    Ok(Some(Reply::encode(&response)?))
}

pub(crate) fn message_handler<M, F, Fut>(handler: F) -> ErasedHandler
where
    M: Message,
    F: Fn(Rc<Scene>, M) -> Fut + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + 'static,
{
    Rc::new(move |scene, _entity, frame| {
        let call = frame
            .decode::<M>()
            .map(|message| handler(scene, message))
            .map_err(HandlerError::from);
        run_message(call).boxed_local()
    })
}

pub(crate) fn request_handler<R, F, Fut>(handler: F) -> ErasedHandler
where
    R: Request,
    F: Fn(Rc<Scene>, R) -> Fut + 'static,
    Fut: Future<Output = Result<R::Response, HandlerError>> + 'static,
{
    Rc::new(move |scene, _entity, frame| {
        let call = frame
            .decode::<R>()
            .map(|request| handler(scene, request))
            .map_err(HandlerError::from);
        run_request::<R::Response, _>(call).boxed_local()
    })
}

pub(crate) fn route_message_handler<M, E, F, Fut>(handler: F) -> ErasedHandler
where
    M: Message,
    E: 'static,
    F: Fn(Rc<Scene>, Rc<E>, M) -> Fut + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + 'static,
{
    Rc::new(move |scene, entity, frame| {
        let call = downcast::<E>(entity).and_then(|entity| {
            let message = frame.decode::<M>()?;
            Ok(handler(scene, entity, message))
        });
        run_message(call).boxed_local()
    })
}

pub(crate) fn route_request_handler<R, E, F, Fut>(handler: F) -> ErasedHandler
where
    R: Request,
    E: 'static,
    F: Fn(Rc<Scene>, Rc<E>, R) -> Fut + 'static,
    Fut: Future<Output = Result<R::Response, HandlerError>> + 'static,
{
    Rc::new(move |scene, entity, frame| {
        let call = downcast::<E>(entity).and_then(|entity| {
            let request = frame.decode::<R>()?;
            Ok(handler(scene, entity, request))
        });
        run_request::<R::Response, _>(call).boxed_local()
    })
}

#[derive(Debug, Clone, Copy)]
struct Header {
    opcode: OpCode,
    rpc_id: u32,
    route_id: RouteId,
}

impl Header {
    fn of(frame: &Frame) -> Self {
        Self {
            opcode: frame.opcode,
            rpc_id: frame.rpc_id,
            route_id: frame.route_id,
        }
    }
}

/// Handle one inbound frame received from scene `from`.
pub fn dispatch(scene: &Rc<Scene>, from: SceneId, frame: Frame) {
    let kind = frame.opcode.classify();
    if kind == FrameKind::Unsupported || !scene.registry().contains(frame.opcode) {
        error!(
            scene = %scene.id(),
            channel = %from,
            opcode = %frame.opcode,
            rpc_id = frame.rpc_id,
            ?kind,
            "unsupported opcode, frame dropped"
        );
        return;
    }

    match kind {
        FrameKind::Response => {
            scene.pending().complete(frame.rpc_id, frame);
        }
        FrameKind::Message | FrameKind::Request => {
            let handler = scene.handlers().get(frame.opcode);
            invoke(scene, from, handler, None, frame, kind == FrameKind::Request);
        }
        FrameKind::RouteMessage | FrameKind::RouteRequest => {
            route(scene, from, frame, kind == FrameKind::RouteRequest);
        }
        FrameKind::Unsupported => {}
    }
}

fn route(scene: &Rc<Scene>, from: SceneId, frame: Frame, expects_reply: bool) {
    match scene.entities().slot(frame.route_id) {
        Some(EntitySlot::Local(entity)) => {
            let handler = scene.handlers().get(frame.opcode);
            invoke(scene, from, handler, Some(entity), frame, expects_reply);
        }
        Some(EntitySlot::Relay(target)) => relay(scene, from, target, frame, expects_reply),
        None if expects_reply => {
            debug!(
                scene = %scene.id(),
                channel = %from,
                route_id = %frame.route_id,
                rpc_id = frame.rpc_id,
                "route request for missing entity"
            );
            reply_error(scene, from, Header::of(&frame), ErrorCode::ERR_NOT_FOUND_ROUTE);
        }
        None => {
            debug!(
                scene = %scene.id(),
                channel = %from,
                route_id = %frame.route_id,
                opcode = %frame.opcode,
                "route message for missing entity dropped"
            );
        }
    }
}

fn invoke(
    scene: &Rc<Scene>,
    from: SceneId,
    handler: Option<ErasedHandler>,
    entity: Option<Rc<dyn Any>>,
    frame: Frame,
    expects_reply: bool,
) {
    let header = Header::of(&frame);
    let Some(handler) = handler else {
        warn!(
            scene = %scene.id(),
            channel = %from,
            opcode = %header.opcode,
            name = scene.registry().name_of(header.opcode),
            "no handler registered"
        );
        if expects_reply {
            reply_error(scene, from, header, ErrorCode::ERR_NO_HANDLER);
        }
        return;
    };

    let invoked = panic::catch_unwind(AssertUnwindSafe(|| {
        handler(Rc::clone(scene), entity, frame)
    }));
    let future = match invoked {
        Ok(future) => future,
        Err(panic) => {
            handler_panicked(scene, from, header, expects_reply, panic.as_ref());
            return;
        }
    };
    let owner = Rc::clone(scene);
    scene.spawn(async move {
        match AssertUnwindSafe(future).catch_unwind().await {
            Err(panic) => handler_panicked(&owner, from, header, expects_reply, panic.as_ref()),
            Ok(Ok(Some(reply))) if expects_reply => send_reply(&owner, from, header, reply),
            Ok(Ok(_)) => {}
            Ok(Err(error)) => {
                error!(
                    scene = %owner.id(),
                    channel = %from,
                    opcode = %header.opcode,
                    rpc_id = header.rpc_id,
                    name = owner.registry().name_of(header.opcode),
                    %error,
                    "handler failed"
                );
                if expects_reply {
                    reply_error(&owner, from, header, error.error_code());
                }
            }
        }
    });
}

fn handler_panicked(
    scene: &Rc<Scene>,
    from: SceneId,
    header: Header,
    expects_reply: bool,
    panic: &(dyn Any + Send),
) {
    error!(
        scene = %scene.id(),
        channel = %from,
        opcode = %header.opcode,
        rpc_id = header.rpc_id,
        name = scene.registry().name_of(header.opcode),
        reason = panic_reason(panic),
        "handler panicked"
    );
    if expects_reply {
        reply_error(scene, from, header, ErrorCode::ERR_HANDLER_FAILED);
    }
}

fn relay(scene: &Rc<Scene>, from: SceneId, target: RouteId, frame: Frame, expects_reply: bool) {
    let header = Header::of(&frame);
    if !expects_reply {
        let forwarded = Frame {
            route_id: target,
            ..frame
        };
        if let Err(error) = scene.transport().send(scene.id(), target.scene(), forwarded) {
            warn!(scene = %scene.id(), %target, %error, "relay forward failed");
        }
        return;
    }

    let call = scene.call_raw(target, frame.opcode, frame.payload, None);
    let owner = Rc::clone(scene);
    scene.spawn(async move {
        match call.await {
            Ok(response) => send_reply(
                &owner,
                from,
                header,
                Reply {
                    opcode: response.opcode,
                    payload: response.payload,
                },
            ),
            Err(error) => {
                warn!(
                    scene = %owner.id(),
                    channel = %from,
                    %target,
                    rpc_id = header.rpc_id,
                    %error,
                    "relayed request failed"
                );
                let code = if error == TaskError::Timeout {
                    ErrorCode::ERR_ROUTE_TIMEOUT
                } else {
                    ErrorCode::ERR_RPC_FAIL
                };
                reply_error(&owner, from, header, code);
            }
        }
    });
}

fn send_reply(scene: &Scene, to: SceneId, header: Header, reply: Reply) {
    let frame = Frame {
        opcode: reply.opcode,
        rpc_id: header.rpc_id,
        route_id: header.route_id,
        payload: reply.payload,
    };
    if let Err(error) = scene.transport().send(scene.id(), to, frame) {
        warn!(
            scene = %scene.id(),
            channel = %to,
            rpc_id = header.rpc_id,
            %error,
            "reply dropped, caller unreachable"
        );
    }
}

fn reply_error(scene: &Scene, to: SceneId, header: Header, code: ErrorCode) {
    match scene.registry().error_response(header.opcode, code) {
        Ok((opcode, payload)) => send_reply(scene, to, header, Reply { opcode, payload }),
        Err(error) => error!(
            scene = %scene.id(),
            channel = %to,
            opcode = %header.opcode,
            rpc_id = header.rpc_id,
            %code,
            %error,
            "cannot build error response"
        ),
    }
}
