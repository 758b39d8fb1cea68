//! The dispatcher façade — [`Mediator`], [`Scope`], and the builder.
//!
//! A [`Mediator`] is built once at startup from a [`MediatorBuilder`] and
//! shared for the process lifetime. It owns the registration store, the
//! process-wide wrapper cache (compiled pipelines, built lazily on first
//! dispatch of each request type and never evicted), and the configured
//! notification publisher.
//!
//! Dispatching happens through a [`Scope`]: a bounded lifetime with its
//! own optional [`PipelineContext`] shared by every dispatch inside it,
//! including nested sends issued from handlers. The mediator itself owns a
//! root scope and delegates to it, so simple hosts can call
//! [`Mediator::send`] directly; hosts that want per-unit-of-work telemetry
//! create one scope per unit with [`Mediator::create_scope`].
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use courier::{DynError, Exec, HandlerFuture, Mediator, Request, RequestHandler};
//!
//! struct Ping { message: String }
//! impl Request for Ping { type Response = String; }
//!
//! struct PingHandler;
//! impl RequestHandler<Ping> for PingHandler {
//!     fn handle(&self, request: Arc<Ping>, _exec: Exec) -> HandlerFuture<Result<String, DynError>> {
//!         Box::pin(async move { Ok(format!("Pong: {}", request.message)) })
//!     }
//! }
//!
//! # async fn run() -> Result<(), courier::DispatchError> {
//! let mediator = Mediator::builder().register::<Ping>(PingHandler).build();
//! let reply = mediator.send(Ping { message: "Hello".into() }).await?;
//! assert_eq!(reply, "Pong: Hello");
//! # Ok(())
//! # }
//! ```

use std::any::{self, Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::context::{causality, PipelineContext};
use crate::error::DispatchError;
use crate::pipeline::stream::{
    erase_stream_behavior, AnyItem, CancelGuard, GenericStreamBehavior, StreamBehavior,
    StreamPipeline,
};
use crate::pipeline::{
    erase_behavior, erase_exception_handler, erase_post_processor, erase_pre_processor,
    AnyResponse, Behavior, ExceptionHandler, GenericBehavior, GenericExceptionHandler,
    GenericPostProcessor, GenericPreProcessor, PostProcessor, PreProcessor, RequestPipeline,
};
use crate::publish::{NotificationJob, NotificationPublisher, SequentialPublisher};
use crate::registry::{
    erase_notification_handler, erase_request_handler, erase_stream_handler, Lifetime, Module,
    NotificationRegistration, Registry, RequestRegistration, StageEntry, StreamRegistration,
};
use crate::request::{
    DispatchStream, Notification, NotificationHandler, Request, RequestHandler, StreamHandler,
    StreamRequest,
};

// ── Per-dispatch environment ─────────────────────────────────────────────────

/// Per-dispatch environment handed to handlers and every pipeline stage.
///
/// Carries the originating [`Scope`] (for nested sends and context
/// access), the caller's cancellation token, and the name of the request
/// type being dispatched. Cloning is cheap.
#[derive(Clone)]
pub struct Exec {
    scope: Scope,
    cancel: CancellationToken,
    request_type: &'static str,
}

impl Exec {
    pub(crate) fn new(scope: Scope, cancel: CancellationToken, request_type: &'static str) -> Self {
        Self {
            scope,
            cancel,
            request_type,
        }
    }

    /// The scope this dispatch runs in. Nested sends issued through it
    /// share the scope's pipeline context.
    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// The scope's pipeline context, when enabled.
    pub fn context(&self) -> Option<Arc<PipelineContext>> {
        self.scope.context()
    }

    /// The caller's cancellation token. Stages and handlers must observe
    /// it at their suspension points.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Name of the request (or notification) type being dispatched.
    pub fn request_type(&self) -> &'static str {
        self.request_type
    }
}

// ── Wrapper cache ────────────────────────────────────────────────────────────

// Process-wide, append-only cache of compiled pipelines, keyed by request
// TypeId. Two racing first dispatches may both build; the loser discards
// its copy and adopts the entry that won, so the cached value is stable.
struct WrapperCache {
    requests: DashMap<TypeId, Arc<RequestPipeline>>,
    streams: DashMap<TypeId, Arc<StreamPipeline>>,
}

impl WrapperCache {
    fn new() -> Self {
        Self {
            requests: DashMap::new(),
            streams: DashMap::new(),
        }
    }

    fn request(
        &self,
        registry: &Registry,
        key: TypeId,
        type_name: &'static str,
        implicit: Option<Arc<dyn GenericBehavior>>,
    ) -> Result<Arc<RequestPipeline>, DispatchError> {
        if let Some(wrapper) = self.requests.get(&key) {
            return Ok(Arc::clone(&wrapper));
        }
        let built = Arc::new(registry.build_request_pipeline(key, type_name, implicit)?);
        debug!(request_type = type_name, "built request pipeline wrapper");
        let wrapper = self.requests.entry(key).or_insert(built);
        Ok(Arc::clone(&wrapper))
    }

    fn stream(
        &self,
        registry: &Registry,
        key: TypeId,
        type_name: &'static str,
    ) -> Result<Arc<StreamPipeline>, DispatchError> {
        if let Some(wrapper) = self.streams.get(&key) {
            return Ok(Arc::clone(&wrapper));
        }
        let built = Arc::new(registry.build_stream_pipeline(key, type_name)?);
        debug!(request_type = type_name, "built stream pipeline wrapper");
        let wrapper = self.streams.entry(key).or_insert(built);
        Ok(Arc::clone(&wrapper))
    }
}

struct MediatorShared {
    registry: Registry,
    wrappers: WrapperCache,
    publisher: Arc<dyn NotificationPublisher>,
    context_enabled: bool,
    causality: Option<Arc<dyn GenericBehavior>>,
}

impl MediatorShared {
    fn causality_stage(&self) -> Option<Arc<dyn GenericBehavior>> {
        self.causality.clone()
    }
}

// ── Scope ────────────────────────────────────────────────────────────────────

/// A bounded dispatch lifetime.
///
/// Every scope has its own [`PipelineContext`] (when the context is
/// enabled) and its own cache of [`Lifetime::Scoped`] handler instances.
/// Scopes share the mediator's registrations and wrapper cache. `Scope` is
/// cheap to clone; clones refer to the same scope.
#[derive(Clone)]
pub struct Scope {
    inner: Arc<ScopeInner>,
}

struct ScopeInner {
    shared: Arc<MediatorShared>,
    context: Option<Arc<PipelineContext>>,
    instances: Mutex<HashMap<TypeId, Box<dyn Any + Send + Sync>>>,
}

impl Scope {
    fn new(shared: Arc<MediatorShared>) -> Self {
        let context = shared
            .context_enabled
            .then(|| Arc::new(PipelineContext::new()));
        Self {
            inner: Arc::new(ScopeInner {
                shared,
                context,
                instances: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// The scope's pipeline context, or `None` when disabled.
    pub fn context(&self) -> Option<Arc<PipelineContext>> {
        self.inner.context.clone()
    }

    // Get-or-create a scoped instance keyed by its own type. Used by
    // handler bindings with `Lifetime::Scoped`.
    pub(crate) fn scoped_instance<T: Clone + Send + Sync + 'static>(
        &self,
        make: impl FnOnce() -> T,
    ) -> T {
        let key = TypeId::of::<T>();
        let mut instances = self.inner.instances.lock();
        if let Some(existing) = instances.get(&key).and_then(|value| value.downcast_ref::<T>()) {
            return existing.clone();
        }
        let value = make();
        instances.insert(key, Box::new(value.clone()));
        value
    }

    /// Dispatches a request to its sole handler and returns the typed
    /// response.
    pub async fn send<R: Request>(&self, request: R) -> Result<R::Response, DispatchError> {
        self.send_with(request, CancellationToken::new()).await
    }

    /// [`send`](Self::send) with a caller-supplied cancellation token.
    pub async fn send_with<R: Request>(
        &self,
        request: R,
        cancel: CancellationToken,
    ) -> Result<R::Response, DispatchError> {
        let shared = &self.inner.shared;
        let type_name = any::type_name::<R>();
        let wrapper = shared.wrappers.request(
            &shared.registry,
            TypeId::of::<R>(),
            type_name,
            shared.causality_stage(),
        )?;
        let exec = Exec::new(self.clone(), cancel, type_name);
        debug!(request_type = type_name, "dispatching request");
        let response = wrapper.execute(Arc::new(request), exec).await?;
        match response.downcast::<R::Response>() {
            Ok(response) => Ok(*response),
            Err(_) => Err(DispatchError::type_mismatch(any::type_name::<R::Response>())),
        }
    }

    /// Untyped send: dispatches a boxed request value by its runtime type.
    ///
    /// Fails with a contract violation when the value's type was never
    /// registered as a request — registration is what declares a type's
    /// response type, and an undeclared value cannot be dispatched.
    pub async fn send_boxed(
        &self,
        request: Box<dyn Any + Send + Sync>,
    ) -> Result<AnyResponse, DispatchError> {
        self.send_boxed_with(request, CancellationToken::new())
            .await
    }

    /// [`send_boxed`](Self::send_boxed) with a caller-supplied cancellation
    /// token.
    pub async fn send_boxed_with(
        &self,
        request: Box<dyn Any + Send + Sync>,
        cancel: CancellationToken,
    ) -> Result<AnyResponse, DispatchError> {
        let shared = &self.inner.shared;
        let key = (*request).type_id();
        let Some(type_name) = shared.registry.request_type_name(key) else {
            return Err(DispatchError::ContractViolation {
                message: "boxed value's type does not declare a response type \
                          (it was never registered as a request)"
                    .to_string(),
            });
        };
        let wrapper =
            shared
                .wrappers
                .request(&shared.registry, key, type_name, shared.causality_stage())?;
        let exec = Exec::new(self.clone(), cancel, type_name);
        debug!(request_type = type_name, "dispatching boxed request");
        wrapper.execute(Arc::from(request), exec).await
    }

    /// Publishes a notification to every handler registered for its type.
    ///
    /// With zero handlers this returns immediately as success. Fan-out is
    /// delegated to the configured publisher strategy.
    pub async fn publish<N: Notification>(&self, notification: N) -> Result<(), DispatchError> {
        self.publish_with(notification, CancellationToken::new())
            .await
    }

    /// [`publish`](Self::publish) with a caller-supplied cancellation
    /// token.
    pub async fn publish_with<N: Notification>(
        &self,
        notification: N,
        cancel: CancellationToken,
    ) -> Result<(), DispatchError> {
        let shared = &self.inner.shared;
        let type_name = any::type_name::<N>();
        let registrations = shared.registry.notification_handlers(TypeId::of::<N>());
        if registrations.is_empty() {
            debug!(notification_type = type_name, "publish with zero handlers");
            return Ok(());
        }
        let exec = Exec::new(self.clone(), cancel.clone(), type_name);
        let notification: Arc<dyn Any + Send + Sync> = Arc::new(notification);
        let jobs: Vec<NotificationJob> = registrations
            .iter()
            .map(|registration| {
                let invoke = Arc::clone(&registration.invoke);
                let notification = Arc::clone(&notification);
                let exec = exec.clone();
                NotificationJob::new(registration.handler_type, move || {
                    invoke(notification, exec)
                })
            })
            .collect();
        debug!(
            notification_type = type_name,
            handlers = jobs.len(),
            "publishing notification"
        );
        shared.publisher.publish(jobs, cancel).await
    }

    /// Creates the lazy response stream for a stream request.
    ///
    /// Construction resolves the handler (failing with
    /// [`DispatchError::UnregisteredHandler`] when absent) but does no
    /// work; iteration drives the pipeline.
    pub fn create_stream<R: StreamRequest>(
        &self,
        request: R,
    ) -> Result<DispatchStream<R::Item>, DispatchError> {
        self.create_stream_with(request, CancellationToken::new())
    }

    /// [`create_stream`](Self::create_stream) with a caller-supplied
    /// cancellation token. Cancelling the token mid-iteration terminates
    /// the sequence with one [`DispatchError::Cancelled`] item.
    pub fn create_stream_with<R: StreamRequest>(
        &self,
        request: R,
        cancel: CancellationToken,
    ) -> Result<DispatchStream<R::Item>, DispatchError> {
        let shared = &self.inner.shared;
        let type_name = any::type_name::<R>();
        let wrapper = shared
            .wrappers
            .stream(&shared.registry, TypeId::of::<R>(), type_name)?;
        let exec = Exec::new(self.clone(), cancel.clone(), type_name);
        debug!(request_type = type_name, "creating response stream");
        let erased = wrapper.execute(Arc::new(request), exec);
        let typed: DispatchStream<R::Item> = Box::pin(erased.map(|item| {
            item.and_then(|boxed| {
                boxed
                    .downcast::<R::Item>()
                    .map(|item| *item)
                    .map_err(|_| DispatchError::type_mismatch(any::type_name::<R::Item>()))
            })
        }));
        Ok(Box::pin(CancelGuard::new(typed, cancel)))
    }

    /// Untyped stream creation, with the same contract-violation rule as
    /// [`send_boxed`](Self::send_boxed).
    pub fn create_stream_boxed(
        &self,
        request: Box<dyn Any + Send + Sync>,
    ) -> Result<DispatchStream<AnyItem>, DispatchError> {
        self.create_stream_boxed_with(request, CancellationToken::new())
    }

    /// [`create_stream_boxed`](Self::create_stream_boxed) with a
    /// caller-supplied cancellation token.
    pub fn create_stream_boxed_with(
        &self,
        request: Box<dyn Any + Send + Sync>,
        cancel: CancellationToken,
    ) -> Result<DispatchStream<AnyItem>, DispatchError> {
        let shared = &self.inner.shared;
        let key = (*request).type_id();
        let Some(type_name) = shared.registry.stream_type_name(key) else {
            return Err(DispatchError::ContractViolation {
                message: "boxed value's type does not declare a stream item type \
                          (it was never registered as a stream request)"
                    .to_string(),
            });
        };
        let wrapper = shared.wrappers.stream(&shared.registry, key, type_name)?;
        let exec = Exec::new(self.clone(), cancel.clone(), type_name);
        let erased = wrapper.execute(Arc::from(request), exec);
        Ok(Box::pin(CancelGuard::new(erased, cancel)))
    }
}

// ── Mediator ─────────────────────────────────────────────────────────────────

/// The dispatcher. Built once from a [`MediatorBuilder`], then shared.
///
/// All dispatch methods delegate to the mediator's root scope; use
/// [`create_scope`](Self::create_scope) for per-unit-of-work contexts.
pub struct Mediator {
    shared: Arc<MediatorShared>,
    root: Scope,
}

impl Mediator {
    /// Starts configuring a new mediator.
    pub fn builder() -> MediatorBuilder {
        MediatorBuilder::new()
    }

    /// Creates a new scope with a fresh pipeline context (when enabled)
    /// and an empty scoped-instance cache.
    pub fn create_scope(&self) -> Scope {
        Scope::new(Arc::clone(&self.shared))
    }

    /// The root scope's pipeline context, when enabled.
    pub fn context(&self) -> Option<Arc<PipelineContext>> {
        self.root.context()
    }

    /// See [`Scope::send`].
    pub async fn send<R: Request>(&self, request: R) -> Result<R::Response, DispatchError> {
        self.root.send(request).await
    }

    /// See [`Scope::send_with`].
    pub async fn send_with<R: Request>(
        &self,
        request: R,
        cancel: CancellationToken,
    ) -> Result<R::Response, DispatchError> {
        self.root.send_with(request, cancel).await
    }

    /// See [`Scope::send_boxed`].
    pub async fn send_boxed(
        &self,
        request: Box<dyn Any + Send + Sync>,
    ) -> Result<AnyResponse, DispatchError> {
        self.root.send_boxed(request).await
    }

    /// See [`Scope::publish`].
    pub async fn publish<N: Notification>(&self, notification: N) -> Result<(), DispatchError> {
        self.root.publish(notification).await
    }

    /// See [`Scope::publish_with`].
    pub async fn publish_with<N: Notification>(
        &self,
        notification: N,
        cancel: CancellationToken,
    ) -> Result<(), DispatchError> {
        self.root.publish_with(notification, cancel).await
    }

    /// See [`Scope::create_stream`].
    pub fn create_stream<R: StreamRequest>(
        &self,
        request: R,
    ) -> Result<DispatchStream<R::Item>, DispatchError> {
        self.root.create_stream(request)
    }

    /// See [`Scope::create_stream_with`].
    pub fn create_stream_with<R: StreamRequest>(
        &self,
        request: R,
        cancel: CancellationToken,
    ) -> Result<DispatchStream<R::Item>, DispatchError> {
        self.root.create_stream_with(request, cancel)
    }

    /// See [`Scope::create_stream_boxed`].
    pub fn create_stream_boxed(
        &self,
        request: Box<dyn Any + Send + Sync>,
    ) -> Result<DispatchStream<AnyItem>, DispatchError> {
        self.root.create_stream_boxed(request)
    }

    /// Startup check: every request and stream request type declared by
    /// the given modules must have a registered handler.
    ///
    /// Misses are accumulated — the returned
    /// [`DispatchError::InvalidConfiguration`] lists every missing handler,
    /// not just the first. Idempotent; safe to call repeatedly.
    pub fn validate_registrations(&self, modules: &[&dyn Module]) -> Result<(), DispatchError> {
        let registry = &self.shared.registry;
        let mut problems = Vec::new();
        for module in modules {
            let manifest = module.manifest();
            for key in manifest.requests() {
                if !registry.has_request(key.id()) {
                    problems.push(format!(
                        "no request handler registered for `{}`",
                        key.name()
                    ));
                }
            }
            for key in manifest.streams() {
                if !registry.has_stream(key.id()) {
                    problems.push(format!("no stream handler registered for `{}`", key.name()));
                }
            }
        }
        if problems.is_empty() {
            Ok(())
        } else {
            warn!(missing = problems.len(), "registration validation failed");
            Err(DispatchError::InvalidConfiguration { problems })
        }
    }
}

// ── Builder ──────────────────────────────────────────────────────────────────

/// Configuration surface for a [`Mediator`].
///
/// Stage registration order is execution order: the first-registered
/// behavior executes outermost, pre/post processors and exception handlers
/// run in registration order. The pipeline context defaults to enabled;
/// causality tracking defaults to disabled; the publisher defaults to
/// [`SequentialPublisher`].
pub struct MediatorBuilder {
    registry: Registry,
    publisher: Arc<dyn NotificationPublisher>,
    context_enabled: bool,
    causality_enabled: bool,
    handler_lifetime: Lifetime,
}

impl Default for MediatorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl MediatorBuilder {
    /// Creates a builder with default settings.
    pub fn new() -> Self {
        Self {
            registry: Registry::default(),
            publisher: Arc::new(SequentialPublisher),
            context_enabled: true,
            causality_enabled: false,
            handler_lifetime: Lifetime::default(),
        }
    }

    /// Registers the handler instance for request type `R`.
    ///
    /// The instance is shared by every dispatch (singleton by
    /// construction). Registering a second handler for the same request
    /// type replaces the first — last write wins.
    #[must_use]
    pub fn register<R: Request>(mut self, handler: impl RequestHandler<R> + 'static) -> Self {
        let handler: Arc<dyn RequestHandler<R>> = Arc::new(handler);
        let factory: Arc<dyn Fn() -> Arc<dyn RequestHandler<R>> + Send + Sync> =
            Arc::new(move || Arc::clone(&handler));
        self.registry.insert_request(
            TypeId::of::<R>(),
            RequestRegistration {
                type_name: any::type_name::<R>(),
                invoke: erase_request_handler(factory, Lifetime::Singleton),
            },
        );
        self
    }

    /// Registers a handler factory for request type `R`, honoring the
    /// builder's current [`handler_lifetime`](Self::handler_lifetime).
    #[must_use]
    pub fn register_factory<R: Request>(
        mut self,
        factory: impl Fn() -> Arc<dyn RequestHandler<R>> + Send + Sync + 'static,
    ) -> Self {
        self.registry.insert_request(
            TypeId::of::<R>(),
            RequestRegistration {
                type_name: any::type_name::<R>(),
                invoke: erase_request_handler(Arc::new(factory), self.handler_lifetime),
            },
        );
        self
    }

    /// Registers an additional handler for notification type `N`.
    ///
    /// Unlike request handlers, notification handlers accumulate: every
    /// registered handler receives each published notification, in
    /// registration order under the sequential publisher.
    #[must_use]
    pub fn register_notification<N: Notification>(
        mut self,
        handler: impl NotificationHandler<N> + 'static,
    ) -> Self {
        let handler_type = any::type_name_of_val(&handler);
        self.registry.insert_notification(
            TypeId::of::<N>(),
            NotificationRegistration {
                handler_type,
                invoke: erase_notification_handler(Arc::new(handler)),
            },
        );
        self
    }

    /// Registers the stream handler instance for stream request type `R`.
    /// Last write wins, as with [`register`](Self::register).
    #[must_use]
    pub fn register_stream<R: StreamRequest>(
        mut self,
        handler: impl StreamHandler<R> + 'static,
    ) -> Self {
        let handler: Arc<dyn StreamHandler<R>> = Arc::new(handler);
        let factory: Arc<dyn Fn() -> Arc<dyn StreamHandler<R>> + Send + Sync> =
            Arc::new(move || Arc::clone(&handler));
        self.registry.insert_stream(
            TypeId::of::<R>(),
            StreamRegistration {
                type_name: any::type_name::<R>(),
                invoke: erase_stream_handler(factory, Lifetime::Singleton),
            },
        );
        self
    }

    /// Registers a stream handler factory for `R`, honoring the builder's
    /// current [`handler_lifetime`](Self::handler_lifetime).
    #[must_use]
    pub fn register_stream_factory<R: StreamRequest>(
        mut self,
        factory: impl Fn() -> Arc<dyn StreamHandler<R>> + Send + Sync + 'static,
    ) -> Self {
        self.registry.insert_stream(
            TypeId::of::<R>(),
            StreamRegistration {
                type_name: any::type_name::<R>(),
                invoke: erase_stream_handler(Arc::new(factory), self.handler_lifetime),
            },
        );
        self
    }

    /// Registers a behavior for request type `R`.
    #[must_use]
    pub fn behavior<R: Request>(mut self, behavior: impl Behavior<R> + 'static) -> Self {
        self.registry.push_behavior(StageEntry::closed(
            TypeId::of::<R>(),
            erase_behavior(Arc::new(behavior)),
        ));
        self
    }

    /// Registers a behavior that applies to every request type.
    #[must_use]
    pub fn generic_behavior(mut self, behavior: impl GenericBehavior + 'static) -> Self {
        self.registry
            .push_behavior(StageEntry::open(Arc::new(behavior)));
        self
    }

    /// Registers a pre-processor for request type `R`.
    #[must_use]
    pub fn pre_processor<R: Request>(mut self, processor: impl PreProcessor<R> + 'static) -> Self {
        self.registry.push_pre_processor(StageEntry::closed(
            TypeId::of::<R>(),
            erase_pre_processor(Arc::new(processor)),
        ));
        self
    }

    /// Registers a pre-processor that applies to every request type.
    #[must_use]
    pub fn generic_pre_processor(
        mut self,
        processor: impl GenericPreProcessor + 'static,
    ) -> Self {
        self.registry
            .push_pre_processor(StageEntry::open(Arc::new(processor)));
        self
    }

    /// Registers a post-processor for request type `R`.
    #[must_use]
    pub fn post_processor<R: Request>(
        mut self,
        processor: impl PostProcessor<R> + 'static,
    ) -> Self {
        self.registry.push_post_processor(StageEntry::closed(
            TypeId::of::<R>(),
            erase_post_processor(Arc::new(processor)),
        ));
        self
    }

    /// Registers a post-processor that applies to every request type.
    #[must_use]
    pub fn generic_post_processor(
        mut self,
        processor: impl GenericPostProcessor + 'static,
    ) -> Self {
        self.registry
            .push_post_processor(StageEntry::open(Arc::new(processor)));
        self
    }

    /// Registers an exception handler for request type `R`.
    #[must_use]
    pub fn exception_handler<R: Request>(
        mut self,
        handler: impl ExceptionHandler<R> + 'static,
    ) -> Self {
        self.registry.push_exception_handler(StageEntry::closed(
            TypeId::of::<R>(),
            erase_exception_handler(Arc::new(handler)),
        ));
        self
    }

    /// Registers an exception handler that applies to every request type.
    #[must_use]
    pub fn generic_exception_handler(
        mut self,
        handler: impl GenericExceptionHandler + 'static,
    ) -> Self {
        self.registry
            .push_exception_handler(StageEntry::open(Arc::new(handler)));
        self
    }

    /// Registers a stream behavior for stream request type `R`.
    #[must_use]
    pub fn stream_behavior<R: StreamRequest>(
        mut self,
        behavior: impl StreamBehavior<R> + 'static,
    ) -> Self {
        self.registry.push_stream_behavior(StageEntry::closed(
            TypeId::of::<R>(),
            erase_stream_behavior(Arc::new(behavior)),
        ));
        self
    }

    /// Registers a stream behavior that applies to every stream request
    /// type.
    #[must_use]
    pub fn generic_stream_behavior(
        mut self,
        behavior: impl GenericStreamBehavior + 'static,
    ) -> Self {
        self.registry
            .push_stream_behavior(StageEntry::open(Arc::new(behavior)));
        self
    }

    /// Replaces the notification publisher strategy.
    #[must_use]
    pub fn publisher(mut self, publisher: impl NotificationPublisher + 'static) -> Self {
        self.publisher = Arc::new(publisher);
        self
    }

    /// Enables or disables the scope-local pipeline context (default on).
    #[must_use]
    pub fn enable_pipeline_context(mut self, enabled: bool) -> Self {
        self.context_enabled = enabled;
        self
    }

    /// Enables or disables causality tracking (default off). Takes effect
    /// only while the pipeline context is also enabled.
    #[must_use]
    pub fn enable_causality_tracking(mut self, enabled: bool) -> Self {
        self.causality_enabled = enabled;
        self
    }

    /// Sets the lifetime applied to handler factories registered after
    /// this call (default [`Lifetime::Transient`]).
    #[must_use]
    pub fn handler_lifetime(mut self, lifetime: Lifetime) -> Self {
        self.handler_lifetime = lifetime;
        self
    }

    /// Applies a module's registrations.
    #[must_use]
    pub fn module(self, module: &dyn Module) -> Self {
        module.register(self)
    }

    /// Finalizes the configuration.
    pub fn build(self) -> Mediator {
        let causality =
            (self.causality_enabled && self.context_enabled).then(causality::causality_stage);
        let shared = Arc::new(MediatorShared {
            registry: self.registry,
            wrappers: WrapperCache::new(),
            publisher: self.publisher,
            context_enabled: self.context_enabled,
            causality,
        });
        let root = Scope::new(Arc::clone(&shared));
        Mediator { shared, root }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::CURRENT_REQUEST_ID_ITEM_KEY;
    use crate::pipeline::{ExceptionState, Next};
    use crate::pipeline::stream::StreamNext;
    use crate::publish::ParallelPublisher;
    use crate::registry::ModuleManifest;
    use crate::request::{DynError, HandlerFuture, ItemStream, StageFuture};
    use futures::stream;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    type Log = Arc<Mutex<Vec<String>>>;

    fn log_entry(log: &Log, entry: impl Into<String>) {
        log.lock().push(entry.into());
    }

    // ── Fixtures ──────────────────────────────────────────────────────────

    struct Ping {
        message: String,
    }
    impl Request for Ping {
        type Response = Pong;
    }

    #[derive(Debug, PartialEq)]
    struct Pong {
        reply: String,
    }

    struct PingHandler;
    impl RequestHandler<Ping> for PingHandler {
        fn handle(&self, request: Arc<Ping>, _exec: Exec) -> HandlerFuture<Result<Pong, DynError>> {
            Box::pin(async move {
                Ok(Pong {
                    reply: format!("Pong: {}", request.message),
                })
            })
        }
    }

    struct GetValue {
        input: i64,
    }
    impl Request for GetValue {
        type Response = i64;
    }

    struct ValueHandler;
    impl RequestHandler<GetValue> for ValueHandler {
        fn handle(
            &self,
            request: Arc<GetValue>,
            _exec: Exec,
        ) -> HandlerFuture<Result<i64, DynError>> {
            Box::pin(async move { Ok(request.input) })
        }
    }

    struct AddTen;
    impl Behavior<GetValue> for AddTen {
        fn handle(
            &self,
            request: Arc<GetValue>,
            exec: Exec,
            next: Next<GetValue>,
        ) -> HandlerFuture<Result<i64, DispatchError>> {
            Box::pin(async move {
                let request = Arc::new(GetValue {
                    input: request.input + 10,
                });
                next.run(request, exec).await
            })
        }
    }

    struct DoubleIt;
    impl Behavior<GetValue> for DoubleIt {
        fn handle(
            &self,
            request: Arc<GetValue>,
            exec: Exec,
            next: Next<GetValue>,
        ) -> HandlerFuture<Result<i64, DispatchError>> {
            Box::pin(async move {
                let request = Arc::new(GetValue {
                    input: request.input * 2,
                });
                next.run(request, exec).await
            })
        }
    }

    // ── Seed: ping/pong ───────────────────────────────────────────────────

    #[tokio::test]
    async fn ping_pong_round_trip() {
        let mediator = Mediator::builder().register::<Ping>(PingHandler).build();
        let pong = mediator
            .send(Ping {
                message: "Hello".into(),
            })
            .await
            .unwrap();
        assert_eq!(pong.reply, "Pong: Hello");
    }

    #[tokio::test]
    async fn send_without_handler_is_unregistered() {
        let mediator = Mediator::builder().build();
        let err = mediator
            .send(Ping {
                message: "Hello".into(),
            })
            .await
            .unwrap_err();
        match err {
            DispatchError::UnregisteredHandler { type_name } => {
                assert!(type_name.contains("Ping"));
            }
            other => panic!("expected UnregisteredHandler, got {other:?}"),
        }
    }

    // ── Seed: nested math via behaviors ───────────────────────────────────

    #[tokio::test]
    async fn behaviors_apply_in_registration_order() {
        let mediator = Mediator::builder()
            .register::<GetValue>(ValueHandler)
            .behavior::<GetValue>(AddTen)
            .behavior::<GetValue>(DoubleIt)
            .build();
        // AddTen is outermost: 5 -> 15 -> 30 by the time the handler runs.
        assert_eq!(mediator.send(GetValue { input: 5 }).await.unwrap(), 30);
    }

    // ── Stage ordering ────────────────────────────────────────────────────

    struct Traced;
    impl Request for Traced {
        type Response = ();
    }

    struct TracedHandler {
        log: Log,
    }
    impl RequestHandler<Traced> for TracedHandler {
        fn handle(&self, _request: Arc<Traced>, _exec: Exec) -> HandlerFuture<Result<(), DynError>> {
            let log = Arc::clone(&self.log);
            Box::pin(async move {
                log_entry(&log, "handler");
                Ok(())
            })
        }
    }

    struct TracedBehavior {
        name: &'static str,
        log: Log,
    }
    impl Behavior<Traced> for TracedBehavior {
        fn handle(
            &self,
            request: Arc<Traced>,
            exec: Exec,
            next: Next<Traced>,
        ) -> HandlerFuture<Result<(), DispatchError>> {
            let log = Arc::clone(&self.log);
            let name = self.name;
            Box::pin(async move {
                log_entry(&log, format!("{name}:before"));
                let response = next.run(request, exec).await;
                log_entry(&log, format!("{name}:after"));
                response
            })
        }
    }

    struct TracedPre {
        log: Log,
    }
    impl PreProcessor<Traced> for TracedPre {
        fn process<'a>(
            &'a self,
            _request: &'a Traced,
            _exec: &'a Exec,
        ) -> StageFuture<'a, Result<(), DynError>> {
            Box::pin(async move {
                log_entry(&self.log, "pre");
                Ok(())
            })
        }
    }

    struct TracedPost {
        log: Log,
    }
    impl PostProcessor<Traced> for TracedPost {
        fn process<'a>(
            &'a self,
            _request: &'a Traced,
            _response: &'a (),
            _exec: &'a Exec,
        ) -> StageFuture<'a, Result<(), DynError>> {
            Box::pin(async move {
                log_entry(&self.log, "post");
                Ok(())
            })
        }
    }

    #[tokio::test]
    async fn stages_run_in_documented_order() {
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let mediator = Mediator::builder()
            .register::<Traced>(TracedHandler {
                log: Arc::clone(&log),
            })
            .pre_processor::<Traced>(TracedPre {
                log: Arc::clone(&log),
            })
            .behavior::<Traced>(TracedBehavior {
                name: "behavior",
                log: Arc::clone(&log),
            })
            .post_processor::<Traced>(TracedPost {
                log: Arc::clone(&log),
            })
            .build();
        mediator.send(Traced).await.unwrap();
        assert_eq!(
            *log.lock(),
            vec!["pre", "behavior:before", "handler", "behavior:after", "post"]
        );
    }

    #[tokio::test]
    async fn first_registered_behavior_is_outermost() {
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let mediator = Mediator::builder()
            .register::<Traced>(TracedHandler {
                log: Arc::clone(&log),
            })
            .behavior::<Traced>(TracedBehavior {
                name: "b1",
                log: Arc::clone(&log),
            })
            .behavior::<Traced>(TracedBehavior {
                name: "b2",
                log: Arc::clone(&log),
            })
            .build();
        mediator.send(Traced).await.unwrap();
        assert_eq!(
            *log.lock(),
            vec!["b1:before", "b2:before", "handler", "b2:after", "b1:after"]
        );
    }

    // ── Short-circuit ─────────────────────────────────────────────────────

    struct ShortCircuit;
    impl Behavior<GetValue> for ShortCircuit {
        fn handle(
            &self,
            _request: Arc<GetValue>,
            _exec: Exec,
            _next: Next<GetValue>,
        ) -> HandlerFuture<Result<i64, DispatchError>> {
            Box::pin(async move { Ok(-1) })
        }
    }

    struct CountingHandler {
        calls: Arc<AtomicUsize>,
    }
    impl RequestHandler<GetValue> for CountingHandler {
        fn handle(
            &self,
            request: Arc<GetValue>,
            _exec: Exec,
        ) -> HandlerFuture<Result<i64, DynError>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move { Ok(request.input) })
        }
    }

    #[tokio::test]
    async fn behavior_short_circuit_skips_handler() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mediator = Mediator::builder()
            .register::<GetValue>(CountingHandler {
                calls: Arc::clone(&calls),
            })
            .behavior::<GetValue>(ShortCircuit)
            .build();
        assert_eq!(mediator.send(GetValue { input: 5 }).await.unwrap(), -1);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    // ── Seed: exception recovery ──────────────────────────────────────────

    struct FlakyRequest {
        fail: bool,
    }
    impl Request for FlakyRequest {
        type Response = String;
    }

    struct FlakyHandler;
    impl RequestHandler<FlakyRequest> for FlakyHandler {
        fn handle(
            &self,
            request: Arc<FlakyRequest>,
            _exec: Exec,
        ) -> HandlerFuture<Result<String, DynError>> {
            Box::pin(async move {
                if request.fail {
                    Err("This is fine".into())
                } else {
                    Ok("ok".to_string())
                }
            })
        }
    }

    struct Recover;
    impl ExceptionHandler<FlakyRequest> for Recover {
        fn handle<'a>(
            &'a self,
            _request: &'a FlakyRequest,
            error: &'a DispatchError,
            state: &'a mut ExceptionState<String>,
            _exec: &'a Exec,
        ) -> StageFuture<'a, Result<(), DynError>> {
            Box::pin(async move {
                if let DispatchError::Handler(source) = error {
                    state.set_handled(format!("Recovered from: {source}"));
                }
                Ok(())
            })
        }
    }

    struct NeverRecover {
        consulted: Arc<AtomicUsize>,
    }
    impl ExceptionHandler<FlakyRequest> for NeverRecover {
        fn handle<'a>(
            &'a self,
            _request: &'a FlakyRequest,
            _error: &'a DispatchError,
            _state: &'a mut ExceptionState<String>,
            _exec: &'a Exec,
        ) -> StageFuture<'a, Result<(), DynError>> {
            self.consulted.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move { Ok(()) })
        }
    }

    #[tokio::test]
    async fn exception_handler_recovers_failure() {
        let mediator = Mediator::builder()
            .register::<FlakyRequest>(FlakyHandler)
            .exception_handler::<FlakyRequest>(Recover)
            .build();
        let reply = mediator.send(FlakyRequest { fail: true }).await.unwrap();
        assert_eq!(reply, "Recovered from: This is fine");
    }

    #[tokio::test]
    async fn unhandled_error_is_reraised() {
        let mediator = Mediator::builder()
            .register::<FlakyRequest>(FlakyHandler)
            .build();
        let err = mediator.send(FlakyRequest { fail: true }).await.unwrap_err();
        match err {
            DispatchError::Handler(source) => assert_eq!(source.to_string(), "This is fine"),
            other => panic!("expected Handler, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn exception_handlers_stop_after_first_recovery() {
        let consulted = Arc::new(AtomicUsize::new(0));
        let mediator = Mediator::builder()
            .register::<FlakyRequest>(FlakyHandler)
            .exception_handler::<FlakyRequest>(Recover)
            .exception_handler::<FlakyRequest>(NeverRecover {
                consulted: Arc::clone(&consulted),
            })
            .build();
        mediator.send(FlakyRequest { fail: true }).await.unwrap();
        assert_eq!(consulted.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn successful_dispatch_skips_exception_handlers() {
        let consulted = Arc::new(AtomicUsize::new(0));
        let mediator = Mediator::builder()
            .register::<FlakyRequest>(FlakyHandler)
            .exception_handler::<FlakyRequest>(NeverRecover {
                consulted: Arc::clone(&consulted),
            })
            .build();
        assert_eq!(
            mediator.send(FlakyRequest { fail: false }).await.unwrap(),
            "ok"
        );
        assert_eq!(consulted.load(Ordering::SeqCst), 0);
    }

    // ── Notifications ─────────────────────────────────────────────────────

    struct UserCreated {
        username: String,
    }
    impl Notification for UserCreated {}

    struct RecordingNotificationHandler {
        seen: Log,
        fail: bool,
    }
    impl NotificationHandler<UserCreated> for RecordingNotificationHandler {
        fn handle(
            &self,
            notification: Arc<UserCreated>,
            _exec: Exec,
        ) -> HandlerFuture<Result<(), DynError>> {
            let seen = Arc::clone(&self.seen);
            let fail = self.fail;
            Box::pin(async move {
                seen.lock().push(notification.username.clone());
                if fail {
                    Err("notification handler failed".into())
                } else {
                    Ok(())
                }
            })
        }
    }

    #[tokio::test]
    async fn publish_with_zero_handlers_succeeds() {
        let mediator = Mediator::builder().build();
        mediator
            .publish(UserCreated {
                username: "jin_yang".into(),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn publish_delivers_to_each_handler_in_order() {
        let first: Log = Arc::new(Mutex::new(Vec::new()));
        let second: Log = Arc::new(Mutex::new(Vec::new()));
        let mediator = Mediator::builder()
            .register_notification::<UserCreated>(RecordingNotificationHandler {
                seen: Arc::clone(&first),
                fail: false,
            })
            .register_notification::<UserCreated>(RecordingNotificationHandler {
                seen: Arc::clone(&second),
                fail: false,
            })
            .build();
        mediator
            .publish(UserCreated {
                username: "jin_yang".into(),
            })
            .await
            .unwrap();
        assert_eq!(*first.lock(), vec!["jin_yang"]);
        assert_eq!(*second.lock(), vec!["jin_yang"]);
    }

    #[tokio::test]
    async fn parallel_publish_aggregates_failures() {
        let seen: Log = Arc::new(Mutex::new(Vec::new()));
        let mediator = Mediator::builder()
            .publisher(ParallelPublisher)
            .register_notification::<UserCreated>(RecordingNotificationHandler {
                seen: Arc::clone(&seen),
                fail: true,
            })
            .register_notification::<UserCreated>(RecordingNotificationHandler {
                seen: Arc::clone(&seen),
                fail: true,
            })
            .build();
        let err = mediator
            .publish(UserCreated {
                username: "jin_yang".into(),
            })
            .await
            .unwrap_err();
        match err {
            DispatchError::Aggregate { total, failures } => {
                assert_eq!(total, 2);
                assert_eq!(failures.len(), 2);
            }
            other => panic!("expected Aggregate, got {other:?}"),
        }
        assert_eq!(seen.lock().len(), 2);
    }

    // ── Context: concurrency, metrics, baggage ────────────────────────────

    struct Measured;
    impl Request for Measured {
        type Response = ();
    }

    struct MeasuredHandler;
    impl RequestHandler<Measured> for MeasuredHandler {
        fn handle(&self, _request: Arc<Measured>, exec: Exec) -> HandlerFuture<Result<(), DynError>> {
            Box::pin(async move {
                if let Some(context) = exec.context() {
                    let mut timer = context.start_timer("measured");
                    context.increment("dispatches");
                    tokio::task::yield_now().await;
                    timer.stop();
                }
                Ok(())
            })
        }
    }

    #[tokio::test]
    async fn concurrent_sends_share_one_context() {
        let mediator = Mediator::builder().register::<Measured>(MeasuredHandler).build();
        let scope = mediator.create_scope();
        let tasks: Vec<_> = (0..100)
            .map(|_| {
                let scope = scope.clone();
                tokio::spawn(async move { scope.send(Measured).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        let context = scope.context().unwrap();
        assert_eq!(context.timings().len(), 100);
        assert_eq!(context.metrics()["dispatches"].count, 100);
    }

    struct WhoAmI;
    impl Request for WhoAmI {
        type Response = Option<String>;
    }

    struct BaggageProbe;
    impl RequestHandler<WhoAmI> for BaggageProbe {
        fn handle(
            &self,
            _request: Arc<WhoAmI>,
            exec: Exec,
        ) -> HandlerFuture<Result<Option<String>, DynError>> {
            Box::pin(async move { Ok(exec.context().and_then(|ctx| ctx.baggage("tenant"))) })
        }
    }

    struct NestedWhoAmI;
    impl Request for NestedWhoAmI {
        type Response = Option<String>;
    }

    struct NestedBaggageProbe;
    impl RequestHandler<NestedWhoAmI> for NestedBaggageProbe {
        fn handle(
            &self,
            _request: Arc<NestedWhoAmI>,
            exec: Exec,
        ) -> HandlerFuture<Result<Option<String>, DynError>> {
            Box::pin(async move { Ok(exec.scope().send(WhoAmI).await?) })
        }
    }

    #[tokio::test]
    async fn baggage_flows_into_nested_sends() {
        let mediator = Mediator::builder()
            .register::<WhoAmI>(BaggageProbe)
            .register::<NestedWhoAmI>(NestedBaggageProbe)
            .build();
        let scope = mediator.create_scope();
        scope.context().unwrap().set_baggage("tenant", "acme");
        assert_eq!(scope.send(WhoAmI).await.unwrap().as_deref(), Some("acme"));
        assert_eq!(
            scope.send(NestedWhoAmI).await.unwrap().as_deref(),
            Some("acme")
        );
    }

    #[tokio::test]
    async fn disabled_context_yields_none() {
        let mediator = Mediator::builder()
            .enable_pipeline_context(false)
            .register::<WhoAmI>(BaggageProbe)
            .build();
        assert!(mediator.context().is_none());
        assert_eq!(mediator.send(WhoAmI).await.unwrap(), None);
    }

    // ── Seed: causality of nested sends ───────────────────────────────────

    struct OuterRequest {
        tag: String,
    }
    impl Request for OuterRequest {
        type Response = String;
    }

    struct InnerRequest {
        tag: String,
    }
    impl Request for InnerRequest {
        type Response = String;
    }

    struct OuterHandler;
    impl RequestHandler<OuterRequest> for OuterHandler {
        fn handle(
            &self,
            request: Arc<OuterRequest>,
            exec: Exec,
        ) -> HandlerFuture<Result<String, DynError>> {
            Box::pin(async move {
                let reply = exec
                    .scope()
                    .send(InnerRequest {
                        tag: format!("{}-inner", request.tag),
                    })
                    .await?;
                Ok(reply)
            })
        }
    }

    struct InnerHandler;
    impl RequestHandler<InnerRequest> for InnerHandler {
        fn handle(
            &self,
            request: Arc<InnerRequest>,
            _exec: Exec,
        ) -> HandlerFuture<Result<String, DynError>> {
            Box::pin(async move { Ok(request.tag.clone()) })
        }
    }

    #[tokio::test]
    async fn causality_links_nested_sends() {
        let mediator = Mediator::builder()
            .enable_causality_tracking(true)
            .register::<OuterRequest>(OuterHandler)
            .register::<InnerRequest>(InnerHandler)
            .build();
        let scope = mediator.create_scope();
        let reply = scope.send(OuterRequest { tag: "t".into() }).await.unwrap();
        assert_eq!(reply, "t-inner");

        let context = scope.context().unwrap();
        let chain = context.causality_chain();
        assert_eq!(chain.len(), 2);
        let outer = &chain[0];
        let inner = &chain[1];
        assert!(outer.parent_id.is_none());
        assert_eq!(inner.parent_id.as_deref(), Some(outer.request_id.as_str()));
        assert!(outer.request_type.contains("OuterRequest"));
        assert!(inner.request_type.contains("InnerRequest"));
        // The root's id is restored (cleared) once the outer send exits.
        assert!(context
            .item::<String>(CURRENT_REQUEST_ID_ITEM_KEY)
            .is_none());
    }

    #[tokio::test]
    async fn causality_seeds_root_id_from_baggage() {
        let mediator = Mediator::builder()
            .enable_causality_tracking(true)
            .register::<InnerRequest>(InnerHandler)
            .build();
        let scope = mediator.create_scope();
        let context = scope.context().unwrap();
        context.set_baggage("request_id", "root-42");
        scope.send(InnerRequest { tag: "x".into() }).await.unwrap();
        assert_eq!(context.causality_chain()[0].request_id, "root-42");
    }

    struct FailingInner;
    impl Request for FailingInner {
        type Response = ();
    }

    struct FailingInnerHandler;
    impl RequestHandler<FailingInner> for FailingInnerHandler {
        fn handle(
            &self,
            _request: Arc<FailingInner>,
            _exec: Exec,
        ) -> HandlerFuture<Result<(), DynError>> {
            Box::pin(async move { Err("inner exploded".into()) })
        }
    }

    struct RestorationProbe;
    impl Request for RestorationProbe {
        type Response = bool;
    }

    // Issues a failing nested send and reports whether the current id was
    // restored afterwards.
    struct RestorationHandler;
    impl RequestHandler<RestorationProbe> for RestorationHandler {
        fn handle(
            &self,
            _request: Arc<RestorationProbe>,
            exec: Exec,
        ) -> HandlerFuture<Result<bool, DynError>> {
            Box::pin(async move {
                let context = exec.context().ok_or("no pipeline context")?;
                let before = context.item::<String>(CURRENT_REQUEST_ID_ITEM_KEY);
                let inner = exec.scope().send(FailingInner).await;
                assert!(inner.is_err());
                let after = context.item::<String>(CURRENT_REQUEST_ID_ITEM_KEY);
                Ok(before.as_deref() == after.as_deref())
            })
        }
    }

    #[tokio::test]
    async fn causality_restores_outer_id_after_inner_failure() {
        let mediator = Mediator::builder()
            .enable_causality_tracking(true)
            .register::<RestorationProbe>(RestorationHandler)
            .register::<FailingInner>(FailingInnerHandler)
            .build();
        let scope = mediator.create_scope();
        assert!(scope.send(RestorationProbe).await.unwrap());
        assert_eq!(scope.context().unwrap().causality_chain().len(), 2);
    }

    // ── Streaming ─────────────────────────────────────────────────────────

    struct Counter {
        limit: u32,
    }
    impl StreamRequest for Counter {
        type Item = u32;
    }

    struct CounterHandler;
    impl StreamHandler<Counter> for CounterHandler {
        fn handle(&self, request: Arc<Counter>, _exec: Exec) -> ItemStream<u32> {
            let limit = request.limit;
            Box::pin(stream::iter(1..=limit).then(|n| async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                Ok(n)
            }))
        }
    }

    #[tokio::test]
    async fn stream_yields_all_items() {
        let mediator = Mediator::builder()
            .register_stream::<Counter>(CounterHandler)
            .build();
        let items: Vec<u32> = mediator
            .create_stream(Counter { limit: 5 })
            .unwrap()
            .map(Result::unwrap)
            .collect()
            .await;
        assert_eq!(items, vec![1, 2, 3, 4, 5]);
    }

    // Seed: consumer cancels after three items and observes a cancellation
    // error; the collected prefix is >= 3 and < 100.
    #[tokio::test]
    async fn stream_cancellation_interrupts_iteration() {
        let mediator = Mediator::builder()
            .register_stream::<Counter>(CounterHandler)
            .build();
        let token = CancellationToken::new();
        let mut stream = mediator
            .create_stream_with(Counter { limit: 100 }, token.clone())
            .unwrap();

        let mut collected = Vec::new();
        for _ in 0..3 {
            match stream.next().await {
                Some(Ok(item)) => collected.push(item),
                other => panic!("expected item, got {other:?}"),
            }
        }
        token.cancel();
        match stream.next().await {
            Some(Err(err)) => assert!(err.is_cancelled()),
            other => panic!("expected cancellation, got {other:?}"),
        }
        assert!(stream.next().await.is_none());
        assert!(collected.len() >= 3 && collected.len() < 100);
    }

    struct DoubleItems;
    impl StreamBehavior<Counter> for DoubleItems {
        fn handle(
            &self,
            request: Arc<Counter>,
            exec: Exec,
            next: StreamNext<Counter>,
        ) -> DispatchStream<u32> {
            Box::pin(next.run(request, exec).map(|item| item.map(|n| n * 2)))
        }
    }

    #[tokio::test]
    async fn stream_behavior_transforms_items() {
        let mediator = Mediator::builder()
            .register_stream::<Counter>(CounterHandler)
            .stream_behavior::<Counter>(DoubleItems)
            .build();
        let items: Vec<u32> = mediator
            .create_stream(Counter { limit: 3 })
            .unwrap()
            .map(Result::unwrap)
            .collect()
            .await;
        assert_eq!(items, vec![2, 4, 6]);
    }

    #[tokio::test]
    async fn stream_without_handler_is_unregistered() {
        let mediator = Mediator::builder().build();
        let err = mediator.create_stream(Counter { limit: 1 }).err().unwrap();
        assert!(matches!(err, DispatchError::UnregisteredHandler { .. }));
    }

    // ── Untyped surface ───────────────────────────────────────────────────

    #[tokio::test]
    async fn send_boxed_dispatches_by_runtime_type() {
        let mediator = Mediator::builder().register::<Ping>(PingHandler).build();
        let request: Box<dyn Any + Send + Sync> = Box::new(Ping {
            message: "Hello".into(),
        });
        let response = mediator.send_boxed(request).await.unwrap();
        let pong = response.downcast::<Pong>().unwrap();
        assert_eq!(pong.reply, "Pong: Hello");
    }

    #[tokio::test]
    async fn send_boxed_unknown_type_is_contract_violation() {
        let mediator = Mediator::builder().build();
        let request: Box<dyn Any + Send + Sync> = Box::new("not a request".to_string());
        let err = mediator.send_boxed(request).await.unwrap_err();
        assert!(matches!(err, DispatchError::ContractViolation { .. }));
    }

    // ── Cancellation of sends ─────────────────────────────────────────────

    #[tokio::test]
    async fn cancelled_token_aborts_before_handler() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mediator = Mediator::builder()
            .register::<GetValue>(CountingHandler {
                calls: Arc::clone(&calls),
            })
            .build();
        let token = CancellationToken::new();
        token.cancel();
        let err = mediator
            .send_with(GetValue { input: 1 }, token)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    // ── Handler lifetimes ─────────────────────────────────────────────────

    fn counting_factory(
        created: &Arc<AtomicUsize>,
    ) -> impl Fn() -> Arc<dyn RequestHandler<GetValue>> + Send + Sync + 'static {
        let created = Arc::clone(created);
        move || {
            created.fetch_add(1, Ordering::SeqCst);
            Arc::new(ValueHandler)
        }
    }

    #[tokio::test]
    async fn transient_factory_runs_per_dispatch() {
        let created = Arc::new(AtomicUsize::new(0));
        let mediator = Mediator::builder()
            .register_factory::<GetValue>(counting_factory(&created))
            .build();
        mediator.send(GetValue { input: 1 }).await.unwrap();
        mediator.send(GetValue { input: 2 }).await.unwrap();
        assert_eq!(created.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn scoped_factory_runs_once_per_scope() {
        let created = Arc::new(AtomicUsize::new(0));
        let mediator = Mediator::builder()
            .handler_lifetime(Lifetime::Scoped)
            .register_factory::<GetValue>(counting_factory(&created))
            .build();
        let scope_a = mediator.create_scope();
        scope_a.send(GetValue { input: 1 }).await.unwrap();
        scope_a.send(GetValue { input: 2 }).await.unwrap();
        assert_eq!(created.load(Ordering::SeqCst), 1);
        let scope_b = mediator.create_scope();
        scope_b.send(GetValue { input: 3 }).await.unwrap();
        assert_eq!(created.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn singleton_factory_runs_once_per_process() {
        let created = Arc::new(AtomicUsize::new(0));
        let mediator = Mediator::builder()
            .handler_lifetime(Lifetime::Singleton)
            .register_factory::<GetValue>(counting_factory(&created))
            .build();
        mediator.send(GetValue { input: 1 }).await.unwrap();
        mediator.create_scope().send(GetValue { input: 2 }).await.unwrap();
        assert_eq!(created.load(Ordering::SeqCst), 1);
    }

    // ── Wrapper cache ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn racing_first_dispatches_settle_on_one_wrapper() {
        let mediator = Arc::new(Mediator::builder().register::<Ping>(PingHandler).build());
        let tasks: Vec<_> = (0..8)
            .map(|i| {
                let mediator = Arc::clone(&mediator);
                tokio::spawn(async move {
                    mediator
                        .send(Ping {
                            message: format!("m{i}"),
                        })
                        .await
                })
            })
            .collect();
        for task in tasks {
            assert!(task.await.unwrap().is_ok());
        }
    }

    // ── Open-generic stages ───────────────────────────────────────────────

    struct CountingGenericPre {
        seen: Arc<AtomicUsize>,
    }
    impl GenericPreProcessor for CountingGenericPre {
        fn process<'a>(
            &'a self,
            _request: &'a (dyn Any + Send + Sync),
            _exec: &'a Exec,
        ) -> StageFuture<'a, Result<(), DynError>> {
            self.seen.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move { Ok(()) })
        }
    }

    #[tokio::test]
    async fn generic_pre_processor_sees_every_request_type() {
        let seen = Arc::new(AtomicUsize::new(0));
        let mediator = Mediator::builder()
            .register::<Ping>(PingHandler)
            .register::<GetValue>(ValueHandler)
            .generic_pre_processor(CountingGenericPre {
                seen: Arc::clone(&seen),
            })
            .build();
        mediator.send(Ping { message: "x".into() }).await.unwrap();
        mediator.send(GetValue { input: 1 }).await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    // ── Modules & validation ──────────────────────────────────────────────

    struct PartialModule;
    impl Module for PartialModule {
        fn manifest(&self) -> ModuleManifest {
            ModuleManifest::new()
                .request::<Ping>()
                .request::<GetValue>()
                .stream::<Counter>()
        }

        fn register(&self, builder: MediatorBuilder) -> MediatorBuilder {
            // Deliberately leaves GetValue and Counter without handlers.
            builder.register::<Ping>(PingHandler)
        }
    }

    struct CompleteModule;
    impl Module for CompleteModule {
        fn manifest(&self) -> ModuleManifest {
            ModuleManifest::new().request::<Ping>().stream::<Counter>()
        }

        fn register(&self, builder: MediatorBuilder) -> MediatorBuilder {
            builder
                .register::<Ping>(PingHandler)
                .register_stream::<Counter>(CounterHandler)
        }
    }

    #[tokio::test]
    async fn validation_accumulates_every_missing_handler() {
        let module = PartialModule;
        let mediator = Mediator::builder().module(&module).build();
        let err = mediator.validate_registrations(&[&module]).unwrap_err();
        match err {
            DispatchError::InvalidConfiguration { problems } => {
                assert_eq!(problems.len(), 2);
                assert!(problems[0].contains("GetValue"));
                assert!(problems[1].contains("Counter"));
            }
            other => panic!("expected InvalidConfiguration, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn validation_passes_for_complete_module() {
        let module = CompleteModule;
        let mediator = Mediator::builder().module(&module).build();
        mediator.validate_registrations(&[&module]).unwrap();
        // Idempotent.
        mediator.validate_registrations(&[&module]).unwrap();
    }
}
