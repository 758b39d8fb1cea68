//! Handler and stage registration.
//!
//! The registry is the immutable product of a
//! [`MediatorBuilder`](crate::MediatorBuilder): handler bindings keyed by
//! request type, notification handler lists in insertion order, and the
//! ordered stage lists (behaviors, processors, exception handlers) from
//! which per-type pipelines are assembled on first dispatch.
//!
//! Handlers are erased at registration time, while their concrete types
//! are still known: each binding becomes a closure that resolves the
//! handler instance per dispatch (honoring its [`Lifetime`]), downcasts
//! the erased request, and invokes the typed handler.
//!
//! [`Module`]s group registrations and declare the request types they
//! contain, which is what
//! [`validate_registrations`](crate::Mediator::validate_registrations)
//! cross-checks at startup.

use std::any::{self, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use futures::stream::{self, StreamExt};

use crate::error::{DispatchError, DynError};
use crate::mediator::{Exec, MediatorBuilder};
use crate::pipeline::stream::{
    AnyItem, AnyItemStream, ErasedStreamInvoke, GenericStreamBehavior, StreamPipeline,
};
use crate::pipeline::{
    AnyRequest, AnyResponse, ErasedHandlerInvoke, GenericBehavior, GenericExceptionHandler,
    GenericPostProcessor, GenericPreProcessor, RequestPipeline,
};
use crate::request::{
    HandlerFuture, Notification, NotificationHandler, Request, RequestHandler, StreamHandler,
    StreamRequest,
};

/// Lifetime of a handler binding.
///
/// Controls when the handler factory runs relative to dispatches and
/// scopes. Registering a ready-made instance is singleton by construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Lifetime {
    /// The factory runs once per dispatch.
    #[default]
    Transient,
    /// The factory runs once per scope; dispatches within one scope share
    /// the instance.
    Scoped,
    /// The factory runs once per process.
    Singleton,
}

/// Identifies a request or stream request type by `TypeId` plus its name.
#[derive(Debug, Clone, Copy)]
pub struct TypeKey {
    id: TypeId,
    name: &'static str,
}

impl TypeKey {
    /// Key for a request type.
    pub fn of_request<R: Request>() -> Self {
        Self {
            id: TypeId::of::<R>(),
            name: any::type_name::<R>(),
        }
    }

    /// Key for a stream request type.
    pub fn of_stream<R: StreamRequest>() -> Self {
        Self {
            id: TypeId::of::<R>(),
            name: any::type_name::<R>(),
        }
    }

    /// Fully qualified name of the type.
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub(crate) fn id(&self) -> TypeId {
        self.id
    }
}

/// The request and stream request types a [`Module`] declares.
#[derive(Debug, Clone, Default)]
pub struct ModuleManifest {
    requests: Vec<TypeKey>,
    streams: Vec<TypeKey>,
}

impl ModuleManifest {
    /// Creates an empty manifest.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a request type.
    #[must_use]
    pub fn request<R: Request>(mut self) -> Self {
        self.requests.push(TypeKey::of_request::<R>());
        self
    }

    /// Declares a stream request type.
    #[must_use]
    pub fn stream<R: StreamRequest>(mut self) -> Self {
        self.streams.push(TypeKey::of_stream::<R>());
        self
    }

    /// Declared request types.
    pub fn requests(&self) -> &[TypeKey] {
        &self.requests
    }

    /// Declared stream request types.
    pub fn streams(&self) -> &[TypeKey] {
        &self.streams
    }
}

/// A group of registrations with a manifest of the request types it
/// contains.
///
/// Modules are applied in the order they are passed to
/// [`MediatorBuilder::module`](crate::MediatorBuilder::module), which is
/// the registration order of everything they contain.
pub trait Module: Send + Sync {
    /// The request and stream request types this module declares.
    fn manifest(&self) -> ModuleManifest;

    /// Install this module's handlers and stages.
    fn register(&self, builder: MediatorBuilder) -> MediatorBuilder;
}

// ── Erased registrations ─────────────────────────────────────────────────────

pub(crate) type ErasedNotifyInvoke =
    Arc<dyn Fn(AnyRequest, Exec) -> HandlerFuture<Result<(), DynError>> + Send + Sync>;

pub(crate) struct RequestRegistration {
    pub(crate) type_name: &'static str,
    pub(crate) invoke: ErasedHandlerInvoke,
}

pub(crate) struct NotificationRegistration {
    pub(crate) handler_type: &'static str,
    pub(crate) invoke: ErasedNotifyInvoke,
}

pub(crate) struct StreamRegistration {
    pub(crate) type_name: &'static str,
    pub(crate) invoke: ErasedStreamInvoke,
}

pub(crate) fn erase_request_handler<R: Request>(
    factory: Arc<dyn Fn() -> Arc<dyn RequestHandler<R>> + Send + Sync>,
    lifetime: Lifetime,
) -> ErasedHandlerInvoke {
    let singleton: OnceLock<Arc<dyn RequestHandler<R>>> = OnceLock::new();
    Arc::new(move |request: AnyRequest, exec: Exec| {
        let handler = match lifetime {
            Lifetime::Singleton => Arc::clone(singleton.get_or_init(|| factory())),
            Lifetime::Scoped => {
                let factory = Arc::clone(&factory);
                exec.scope().scoped_instance(move || factory())
            }
            Lifetime::Transient => factory(),
        };
        Box::pin(async move {
            let request = request
                .downcast::<R>()
                .map_err(|_| DispatchError::type_mismatch(any::type_name::<R>()))?;
            handler
                .handle(request, exec)
                .await
                .map(|response| Box::new(response) as AnyResponse)
                .map_err(DispatchError::handler)
        })
    })
}

pub(crate) fn erase_notification_handler<N: Notification>(
    handler: Arc<dyn NotificationHandler<N>>,
) -> ErasedNotifyInvoke {
    Arc::new(move |notification: AnyRequest, exec: Exec| {
        let handler = Arc::clone(&handler);
        Box::pin(async move {
            let notification = notification
                .downcast::<N>()
                .map_err(|_| -> DynError { "notification type mismatch in publish".into() })?;
            handler.handle(notification, exec).await
        })
    })
}

pub(crate) fn erase_stream_handler<R: StreamRequest>(
    factory: Arc<dyn Fn() -> Arc<dyn StreamHandler<R>> + Send + Sync>,
    lifetime: Lifetime,
) -> ErasedStreamInvoke {
    let singleton: OnceLock<Arc<dyn StreamHandler<R>>> = OnceLock::new();
    Arc::new(move |request: AnyRequest, exec: Exec| -> AnyItemStream {
        let handler = match lifetime {
            Lifetime::Singleton => Arc::clone(singleton.get_or_init(|| factory())),
            Lifetime::Scoped => {
                let factory = Arc::clone(&factory);
                exec.scope().scoped_instance(move || factory())
            }
            Lifetime::Transient => factory(),
        };
        let request = match request.downcast::<R>() {
            Ok(request) => request,
            Err(_) => {
                let error = DispatchError::type_mismatch(any::type_name::<R>());
                return Box::pin(stream::once(async move { Err(error) }));
            }
        };
        Box::pin(handler.handle(request, exec).map(|item| {
            item.map(|value| Box::new(value) as AnyItem)
                .map_err(DispatchError::handler)
        }))
    })
}

// ── Stage entries ────────────────────────────────────────────────────────────

pub(crate) enum StageScope {
    /// Applies to every request type.
    Open,
    /// Applies to one request type.
    To(TypeId),
}

pub(crate) struct StageEntry<T> {
    scope: StageScope,
    stage: T,
}

impl<T: Clone> StageEntry<T> {
    pub(crate) fn open(stage: T) -> Self {
        Self {
            scope: StageScope::Open,
            stage,
        }
    }

    pub(crate) fn closed(key: TypeId, stage: T) -> Self {
        Self {
            scope: StageScope::To(key),
            stage,
        }
    }

    fn select(&self, key: TypeId) -> Option<T> {
        match self.scope {
            StageScope::Open => Some(self.stage.clone()),
            StageScope::To(id) if id == key => Some(self.stage.clone()),
            StageScope::To(_) => None,
        }
    }
}

// ── The registry ─────────────────────────────────────────────────────────────

/// Immutable registration store, shared by all scopes of one mediator.
#[derive(Default)]
pub(crate) struct Registry {
    requests: HashMap<TypeId, RequestRegistration>,
    notifications: HashMap<TypeId, Vec<NotificationRegistration>>,
    streams: HashMap<TypeId, StreamRegistration>,
    behaviors: Vec<StageEntry<Arc<dyn GenericBehavior>>>,
    pre_processors: Vec<StageEntry<Arc<dyn GenericPreProcessor>>>,
    post_processors: Vec<StageEntry<Arc<dyn GenericPostProcessor>>>,
    exception_handlers: Vec<StageEntry<Arc<dyn GenericExceptionHandler>>>,
    stream_behaviors: Vec<StageEntry<Arc<dyn GenericStreamBehavior>>>,
}

impl Registry {
    // A later registration for the same request type replaces the earlier
    // one (last write wins).
    pub(crate) fn insert_request(&mut self, key: TypeId, registration: RequestRegistration) {
        self.requests.insert(key, registration);
    }

    pub(crate) fn insert_notification(
        &mut self,
        key: TypeId,
        registration: NotificationRegistration,
    ) {
        self.notifications.entry(key).or_default().push(registration);
    }

    pub(crate) fn insert_stream(&mut self, key: TypeId, registration: StreamRegistration) {
        self.streams.insert(key, registration);
    }

    pub(crate) fn push_behavior(&mut self, entry: StageEntry<Arc<dyn GenericBehavior>>) {
        self.behaviors.push(entry);
    }

    pub(crate) fn push_pre_processor(&mut self, entry: StageEntry<Arc<dyn GenericPreProcessor>>) {
        self.pre_processors.push(entry);
    }

    pub(crate) fn push_post_processor(&mut self, entry: StageEntry<Arc<dyn GenericPostProcessor>>) {
        self.post_processors.push(entry);
    }

    pub(crate) fn push_exception_handler(
        &mut self,
        entry: StageEntry<Arc<dyn GenericExceptionHandler>>,
    ) {
        self.exception_handlers.push(entry);
    }

    pub(crate) fn push_stream_behavior(
        &mut self,
        entry: StageEntry<Arc<dyn GenericStreamBehavior>>,
    ) {
        self.stream_behaviors.push(entry);
    }

    pub(crate) fn has_request(&self, key: TypeId) -> bool {
        self.requests.contains_key(&key)
    }

    pub(crate) fn has_stream(&self, key: TypeId) -> bool {
        self.streams.contains_key(&key)
    }

    /// Name under which the boxed value's type was registered, if any.
    pub(crate) fn request_type_name(&self, key: TypeId) -> Option<&'static str> {
        self.requests.get(&key).map(|r| r.type_name)
    }

    pub(crate) fn stream_type_name(&self, key: TypeId) -> Option<&'static str> {
        self.streams.get(&key).map(|r| r.type_name)
    }

    pub(crate) fn notification_handlers(&self, key: TypeId) -> &[NotificationRegistration] {
        self.notifications
            .get(&key)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Assembles the request pipeline for one type. `implicit` is the
    /// causality stage, prepended so it executes outermost among
    /// behaviors.
    pub(crate) fn build_request_pipeline(
        &self,
        key: TypeId,
        type_name: &'static str,
        implicit: Option<Arc<dyn GenericBehavior>>,
    ) -> Result<RequestPipeline, DispatchError> {
        let registration = self
            .requests
            .get(&key)
            .ok_or(DispatchError::UnregisteredHandler { type_name })?;

        let mut behaviors: Vec<Arc<dyn GenericBehavior>> = implicit.into_iter().collect();
        behaviors.extend(self.behaviors.iter().filter_map(|entry| entry.select(key)));

        Ok(RequestPipeline::new(
            registration.type_name,
            behaviors,
            self.pre_processors
                .iter()
                .filter_map(|entry| entry.select(key))
                .collect(),
            self.post_processors
                .iter()
                .filter_map(|entry| entry.select(key))
                .collect(),
            self.exception_handlers
                .iter()
                .filter_map(|entry| entry.select(key))
                .collect(),
            Arc::clone(&registration.invoke),
        ))
    }

    pub(crate) fn build_stream_pipeline(
        &self,
        key: TypeId,
        type_name: &'static str,
    ) -> Result<StreamPipeline, DispatchError> {
        let registration = self
            .streams
            .get(&key)
            .ok_or(DispatchError::UnregisteredHandler { type_name })?;

        Ok(StreamPipeline::new(
            self.stream_behaviors
                .iter()
                .filter_map(|entry| entry.select(key))
                .collect(),
            Arc::clone(&registration.invoke),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Probe;
    impl Request for Probe {
        type Response = ();
    }

    #[test]
    fn build_without_registration_is_unregistered_handler() {
        let registry = Registry::default();
        let err = registry
            .build_request_pipeline(TypeId::of::<Probe>(), any::type_name::<Probe>(), None)
            .unwrap_err();
        assert!(matches!(err, DispatchError::UnregisteredHandler { .. }));
    }

    #[test]
    fn notification_handlers_default_to_empty() {
        let registry = Registry::default();
        assert!(registry
            .notification_handlers(TypeId::of::<Probe>())
            .is_empty());
    }

    #[test]
    fn manifest_records_declared_types() {
        let manifest = ModuleManifest::new().request::<Probe>();
        assert_eq!(manifest.requests().len(), 1);
        assert_eq!(manifest.requests()[0].name(), any::type_name::<Probe>());
        assert!(manifest.streams().is_empty());
    }
}
