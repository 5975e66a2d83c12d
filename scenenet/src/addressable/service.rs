//! Hosts an [`AddressableRegistry`] on a scene and answers the protocol.

use std::rc::Rc;

use tracing::info;

use crate::addressable::protocol::{
    AddressableAddRequest, AddressableAddResponse, AddressableGetRequest, AddressableGetResponse,
    AddressableLockRequest, AddressableLockResponse, AddressableRemoveRequest,
    AddressableRemoveResponse, AddressableUnlockRequest, AddressableUnlockResponse,
};
use crate::addressable::AddressableRegistry;
use crate::error::{AddressableError, HandlerError};
use crate::lock::LockNamespace;
use crate::messaging::ErrorCode;
use crate::scene::Scene;

fn code_of(error: &AddressableError) -> ErrorCode {
    match error {
        AddressableError::NotLocked { .. } => ErrorCode::ERR_ADDRESSABLE_NOT_LOCKED,
        AddressableError::Lock(_) => ErrorCode::ERR_ADDRESSABLE_LOCK_FAILED,
        _ => ErrorCode::ERR_HANDLER_FAILED,
    }
}

/// Installs the addressable directory on a hosting scene.
pub struct AddressableService;

impl AddressableService {
    /// Put a fresh registry at the scene's own route and register the
    /// add/get/remove/lock/unlock handlers.
    ///
    /// The scene's message registry must contain the addressable protocol
    /// (see [`register_protocol`](super::register_protocol)).
    pub fn install(scene: &Rc<Scene>) -> Result<Rc<AddressableRegistry>, AddressableError> {
        let lock = scene.coroutine_locks().lock(LockNamespace::ADDRESSABLE);
        let registry = Rc::new(AddressableRegistry::new(lock));
        scene.add_entity_at(scene.route_id(), registry.clone())?;

        scene.register_route_request::<AddressableAddRequest, AddressableRegistry, _, _>(
            |_, registry, request| async move {
                let error = match registry.add(request.id, request.route, request.exclusive).await {
                    Ok(()) => ErrorCode::SUCCESS,
                    Err(error) => code_of(&error),
                };
                Ok::<_, HandlerError>(AddressableAddResponse { error })
            },
        )?;

        scene.register_route_request::<AddressableGetRequest, AddressableRegistry, _, _>(
            |_, registry, request| async move {
                Ok::<_, HandlerError>(match registry.get(request.id).await {
                    Ok(route) => AddressableGetResponse {
                        error: ErrorCode::SUCCESS,
                        route,
                    },
                    Err(error) => AddressableGetResponse {
                        error: code_of(&error),
                        ..Default::default()
                    },
                })
            },
        )?;

        scene.register_route_request::<AddressableRemoveRequest, AddressableRegistry, _, _>(
            |_, registry, request| async move {
                let error = match registry.remove(request.id).await {
                    Ok(_) => ErrorCode::SUCCESS,
                    Err(error) => code_of(&error),
                };
                Ok::<_, HandlerError>(AddressableRemoveResponse { error })
            },
        )?;

        scene.register_route_request::<AddressableLockRequest, AddressableRegistry, _, _>(
            |_, registry, request| async move {
                let error = match registry.lock(request.id).await {
                    Ok(()) => ErrorCode::SUCCESS,
                    Err(error) => code_of(&error),
                };
                Ok::<_, HandlerError>(AddressableLockResponse { error })
            },
        )?;

        scene.register_route_request::<AddressableUnlockRequest, AddressableRegistry, _, _>(
            |_, registry, request| async move {
                let error = match registry.unlock(request.id, request.route, &request.source) {
                    Ok(()) => ErrorCode::SUCCESS,
                    Err(error) => code_of(&error),
                };
                Ok::<_, HandlerError>(AddressableUnlockResponse { error })
            },
        )?;

        info!(scene = %scene.id(), route = %scene.route_id(), "addressable service installed");
        Ok(registry)
    }
}
