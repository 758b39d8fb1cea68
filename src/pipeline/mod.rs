//! Request pipeline — composable stages around the terminal handler.
//!
//! This module defines the stage contracts and the engine that runs them.
//! Each dispatch flows through the layers in a fixed order:
//!
//! ```text
//! exception handlers ─ outermost, consulted only on failure
//!   pre-processors   ─ registration order, before the behavior chain
//!   behaviors        ─ first registered executes outermost
//!     handler
//!   post-processors  ─ registration order, after the behavior chain
//! ```
//!
//! ## Core types
//!
//! - [`Behavior`] / [`GenericBehavior`] — wrap the rest of the pipeline via
//!   a [`Next`] cursor; may short-circuit or transform the response.
//! - [`PreProcessor`] / [`PostProcessor`] (and their `Generic*` twins) —
//!   fire-and-forget stages that observe the request (and response) but
//!   cannot short-circuit or modify the response.
//! - [`ExceptionHandler`] / [`GenericExceptionHandler`] — consulted in
//!   registration order when an inner stage fails; the first to mark its
//!   [`ExceptionState`] as handled supplies the recovery response.
//! - [`Next`] / [`AnyNext`] — cursor into the remaining behavior chain;
//!   calling [`run`](Next::run) advances to the next layer.
//!
//! Internally the pipeline is type-erased: requests travel as
//! [`AnyRequest`] and responses as [`AnyResponse`]. Typed stage and
//! handler registrations are adapted with downcast shims created while
//! their concrete types are still known, so the cached pipeline for a
//! request type is a single non-generic structure.

pub mod stream;

use std::any::{self, Any};
use std::marker::PhantomData;
use std::sync::Arc;

use tracing::debug;

use crate::error::{DispatchError, DynError};
use crate::mediator::Exec;
use crate::request::{HandlerFuture, Request, StageFuture};

/// Type-erased request value flowing through a pipeline.
pub type AnyRequest = Arc<dyn Any + Send + Sync>;

/// Type-erased response value flowing back out of a pipeline.
pub type AnyResponse = Box<dyn Any + Send + Sync>;

pub(crate) type ErasedHandlerInvoke =
    Arc<dyn Fn(AnyRequest, Exec) -> HandlerFuture<Result<AnyResponse, DispatchError>> + Send + Sync>;

// ── Stage contracts (typed) ──────────────────────────────────────────────────

/// A stage that wraps the rest of the pipeline for one request type.
///
/// Implementors receive the request, the per-dispatch [`Exec`] environment,
/// and a [`Next`] cursor. They may:
///
/// - **Pass through** — call `next.run(request, exec).await` unchanged.
/// - **Short-circuit** — return a response without calling `next`; neither
///   the handler nor any inner stage runs.
/// - **Transform** — alter the request passed to `next` or the response it
///   returns.
///
/// The first-registered behavior executes outermost.
///
/// # Examples
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use courier::{Behavior, DispatchError, Exec, HandlerFuture, Next, Request};
///
/// struct GetValue { input: i64 }
/// impl Request for GetValue { type Response = i64; }
///
/// struct AddTen;
/// impl Behavior<GetValue> for AddTen {
///     fn handle(
///         &self,
///         request: Arc<GetValue>,
///         exec: Exec,
///         next: Next<GetValue>,
///     ) -> HandlerFuture<Result<i64, DispatchError>> {
///         Box::pin(async move {
///             let request = Arc::new(GetValue { input: request.input + 10 });
///             next.run(request, exec).await
///         })
///     }
/// }
/// ```
pub trait Behavior<R: Request>: Send + Sync {
    /// Handle the request and optionally delegate to the rest of the
    /// pipeline.
    fn handle(
        &self,
        request: Arc<R>,
        exec: Exec,
        next: Next<R>,
    ) -> HandlerFuture<Result<R::Response, DispatchError>>;
}

/// A fire-and-forget stage that runs before the handler.
///
/// Pre-processors cannot short-circuit; an error from one aborts the
/// dispatch as a handler failure.
pub trait PreProcessor<R: Request>: Send + Sync {
    /// Observe the request before the handler runs.
    fn process<'a>(&'a self, request: &'a R, exec: &'a Exec)
        -> StageFuture<'a, Result<(), DynError>>;
}

/// A stage that runs after the behavior chain has produced a response.
///
/// Post-processors observe the original request and the final response but
/// cannot modify either; an error from one aborts the dispatch as a
/// handler failure.
pub trait PostProcessor<R: Request>: Send + Sync {
    /// Observe the request and its response.
    fn process<'a>(
        &'a self,
        request: &'a R,
        response: &'a R::Response,
        exec: &'a Exec,
    ) -> StageFuture<'a, Result<(), DynError>>;
}

/// Mutable recovery state passed to exception handlers.
pub struct ExceptionState<S> {
    response: Option<S>,
}

impl<S> ExceptionState<S> {
    pub(crate) fn new() -> Self {
        Self { response: None }
    }

    /// Returns `true` once a recovery response has been supplied.
    pub fn is_handled(&self) -> bool {
        self.response.is_some()
    }

    /// Marks the error as handled and supplies the recovery response.
    pub fn set_handled(&mut self, response: S) {
        self.response = Some(response);
    }

    pub(crate) fn into_response(self) -> Option<S> {
        self.response
    }
}

/// A stage consulted when the pipeline fails.
///
/// Handlers run in registration order; iteration stops at the first one
/// that marks the state as handled. If none handle, the original error is
/// re-raised unchanged. An error returned by an exception handler itself
/// propagates in place of the original.
pub trait ExceptionHandler<R: Request>: Send + Sync {
    /// Inspect the failure and optionally mark it as handled.
    fn handle<'a>(
        &'a self,
        request: &'a R,
        error: &'a DispatchError,
        state: &'a mut ExceptionState<R::Response>,
        exec: &'a Exec,
    ) -> StageFuture<'a, Result<(), DynError>>;
}

// ── Stage contracts (open-generic) ───────────────────────────────────────────

/// A [`Behavior`] that applies to every request type.
///
/// Open behaviors see the type-erased request and response; the concrete
/// request type name is available through [`Exec::request_type`].
pub trait GenericBehavior: Send + Sync {
    /// Handle the erased request and optionally delegate to the rest of
    /// the pipeline.
    fn handle(
        &self,
        request: AnyRequest,
        exec: Exec,
        next: AnyNext,
    ) -> HandlerFuture<Result<AnyResponse, DispatchError>>;
}

/// A [`PreProcessor`] that applies to every request type.
pub trait GenericPreProcessor: Send + Sync {
    /// Observe the erased request before the handler runs.
    fn process<'a>(
        &'a self,
        request: &'a (dyn Any + Send + Sync),
        exec: &'a Exec,
    ) -> StageFuture<'a, Result<(), DynError>>;
}

/// A [`PostProcessor`] that applies to every request type.
pub trait GenericPostProcessor: Send + Sync {
    /// Observe the erased request and response.
    fn process<'a>(
        &'a self,
        request: &'a (dyn Any + Send + Sync),
        response: &'a (dyn Any + Send + Sync),
        exec: &'a Exec,
    ) -> StageFuture<'a, Result<(), DynError>>;
}

/// Type-erased recovery state for [`GenericExceptionHandler`]s.
pub struct AnyExceptionState {
    response: Option<AnyResponse>,
}

impl AnyExceptionState {
    pub(crate) fn new() -> Self {
        Self { response: None }
    }

    /// Returns `true` once a recovery response has been supplied.
    pub fn is_handled(&self) -> bool {
        self.response.is_some()
    }

    /// Marks the error as handled and supplies the erased recovery
    /// response. The value must have the pipeline's response type or the
    /// dispatch fails with a contract violation.
    pub fn set_handled(&mut self, response: AnyResponse) {
        self.response = Some(response);
    }

    pub(crate) fn into_response(self) -> Option<AnyResponse> {
        self.response
    }
}

/// An [`ExceptionHandler`] that applies to every request type.
pub trait GenericExceptionHandler: Send + Sync {
    /// Inspect the failure and optionally mark it as handled.
    fn handle<'a>(
        &'a self,
        request: &'a (dyn Any + Send + Sync),
        error: &'a DispatchError,
        state: &'a mut AnyExceptionState,
        exec: &'a Exec,
    ) -> StageFuture<'a, Result<(), DynError>>;
}

// ── Next cursors ─────────────────────────────────────────────────────────────

/// Type-erased cursor into the remaining behavior chain.
///
/// `AnyNext` is consumed by [`run`](Self::run), so a behavior can invoke
/// the rest of the pipeline at most once. When the behavior chain is
/// exhausted, `run` invokes the terminal handler.
pub struct AnyNext {
    pipeline: Arc<RequestPipeline>,
    index: usize,
}

impl AnyNext {
    pub(crate) fn new(pipeline: Arc<RequestPipeline>) -> Self {
        Self { pipeline, index: 0 }
    }

    /// Invokes the next behavior (or the terminal section) and returns its
    /// response.
    pub fn run(
        mut self,
        request: AnyRequest,
        exec: Exec,
    ) -> HandlerFuture<Result<AnyResponse, DispatchError>> {
        Box::pin(async move {
            let pipeline = Arc::clone(&self.pipeline);
            if self.index < pipeline.behaviors.len() {
                let stage = Arc::clone(&pipeline.behaviors[self.index]);
                self.index += 1;
                stage.handle(request, exec, self).await
            } else {
                pipeline.terminal(request, exec).await
            }
        })
    }
}

/// Typed cursor into the remaining behavior chain for request type `R`.
pub struct Next<R: Request> {
    inner: AnyNext,
    _marker: PhantomData<fn() -> R>,
}

impl<R: Request> Next<R> {
    pub(crate) fn from_erased(inner: AnyNext) -> Self {
        Self {
            inner,
            _marker: PhantomData,
        }
    }

    /// Invokes the rest of the pipeline with the given request and returns
    /// the typed response.
    pub async fn run(self, request: Arc<R>, exec: Exec) -> Result<R::Response, DispatchError> {
        let response = self.inner.run(request, exec).await?;
        match response.downcast::<R::Response>() {
            Ok(response) => Ok(*response),
            Err(_) => Err(DispatchError::type_mismatch(any::type_name::<R::Response>())),
        }
    }
}

// ── Closed-stage adapters ────────────────────────────────────────────────────
//
// Each adapter pairs a typed stage with the downcast shim that lets it run
// inside the erased pipeline. Adapters are created at registration time
// while the request type is still known, so a mismatch can only mean the
// pipeline was built for the wrong key.

pub(crate) fn erase_behavior<R: Request>(inner: Arc<dyn Behavior<R>>) -> Arc<dyn GenericBehavior> {
    struct Adapter<R: Request> {
        inner: Arc<dyn Behavior<R>>,
    }

    impl<R: Request> GenericBehavior for Adapter<R> {
        fn handle(
            &self,
            request: AnyRequest,
            exec: Exec,
            next: AnyNext,
        ) -> HandlerFuture<Result<AnyResponse, DispatchError>> {
            let inner = Arc::clone(&self.inner);
            Box::pin(async move {
                let request = request
                    .downcast::<R>()
                    .map_err(|_| DispatchError::type_mismatch(any::type_name::<R>()))?;
                let next = Next::from_erased(next);
                let response = inner.handle(request, exec, next).await?;
                Ok(Box::new(response) as AnyResponse)
            })
        }
    }

    Arc::new(Adapter { inner })
}

pub(crate) fn erase_pre_processor<R: Request>(
    inner: Arc<dyn PreProcessor<R>>,
) -> Arc<dyn GenericPreProcessor> {
    struct Adapter<R: Request> {
        inner: Arc<dyn PreProcessor<R>>,
    }

    impl<R: Request> GenericPreProcessor for Adapter<R> {
        fn process<'a>(
            &'a self,
            request: &'a (dyn Any + Send + Sync),
            exec: &'a Exec,
        ) -> StageFuture<'a, Result<(), DynError>> {
            match request.downcast_ref::<R>() {
                Some(request) => self.inner.process(request, exec),
                None => Box::pin(async { Err("request type mismatch in pipeline stage".into()) }),
            }
        }
    }

    Arc::new(Adapter { inner })
}

pub(crate) fn erase_post_processor<R: Request>(
    inner: Arc<dyn PostProcessor<R>>,
) -> Arc<dyn GenericPostProcessor> {
    struct Adapter<R: Request> {
        inner: Arc<dyn PostProcessor<R>>,
    }

    impl<R: Request> GenericPostProcessor for Adapter<R> {
        fn process<'a>(
            &'a self,
            request: &'a (dyn Any + Send + Sync),
            response: &'a (dyn Any + Send + Sync),
            exec: &'a Exec,
        ) -> StageFuture<'a, Result<(), DynError>> {
            match (request.downcast_ref::<R>(), response.downcast_ref::<R::Response>()) {
                (Some(request), Some(response)) => self.inner.process(request, response, exec),
                _ => Box::pin(async { Err("request type mismatch in pipeline stage".into()) }),
            }
        }
    }

    Arc::new(Adapter { inner })
}

pub(crate) fn erase_exception_handler<R: Request>(
    inner: Arc<dyn ExceptionHandler<R>>,
) -> Arc<dyn GenericExceptionHandler> {
    struct Adapter<R: Request> {
        inner: Arc<dyn ExceptionHandler<R>>,
    }

    impl<R: Request> GenericExceptionHandler for Adapter<R> {
        fn handle<'a>(
            &'a self,
            request: &'a (dyn Any + Send + Sync),
            error: &'a DispatchError,
            state: &'a mut AnyExceptionState,
            exec: &'a Exec,
        ) -> StageFuture<'a, Result<(), DynError>> {
            Box::pin(async move {
                let Some(request) = request.downcast_ref::<R>() else {
                    return Err("request type mismatch in pipeline stage".into());
                };
                let mut typed = ExceptionState::new();
                self.inner.handle(request, error, &mut typed, exec).await?;
                if let Some(response) = typed.into_response() {
                    state.set_handled(Box::new(response));
                }
                Ok(())
            })
        }
    }

    Arc::new(Adapter { inner })
}

// ── The compiled pipeline ────────────────────────────────────────────────────

/// Compiled pipeline for one request type, cached for the process
/// lifetime. Immutable after construction.
pub(crate) struct RequestPipeline {
    request_type: &'static str,
    behaviors: Vec<Arc<dyn GenericBehavior>>,
    pre: Vec<Arc<dyn GenericPreProcessor>>,
    post: Vec<Arc<dyn GenericPostProcessor>>,
    exceptions: Vec<Arc<dyn GenericExceptionHandler>>,
    handler: ErasedHandlerInvoke,
}

impl std::fmt::Debug for RequestPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestPipeline")
            .field("request_type", &self.request_type)
            .field("behaviors", &self.behaviors.len())
            .field("pre", &self.pre.len())
            .field("post", &self.post.len())
            .field("exceptions", &self.exceptions.len())
            .finish()
    }
}

impl RequestPipeline {
    pub(crate) fn new(
        request_type: &'static str,
        behaviors: Vec<Arc<dyn GenericBehavior>>,
        pre: Vec<Arc<dyn GenericPreProcessor>>,
        post: Vec<Arc<dyn GenericPostProcessor>>,
        exceptions: Vec<Arc<dyn GenericExceptionHandler>>,
        handler: ErasedHandlerInvoke,
    ) -> Self {
        Self {
            request_type,
            behaviors,
            pre,
            post,
            exceptions,
            handler,
        }
    }

    /// Runs the full pipeline: pre-processors, the behavior chain around
    /// the handler, post-processors, with the exception layer outermost.
    pub(crate) async fn execute(
        self: &Arc<Self>,
        request: AnyRequest,
        exec: Exec,
    ) -> Result<AnyResponse, DispatchError> {
        match self.dispatch(Arc::clone(&request), exec.clone()).await {
            Ok(response) => Ok(response),
            Err(error) => {
                for handler in &self.exceptions {
                    let mut state = AnyExceptionState::new();
                    handler
                        .handle(&*request, &error, &mut state, &exec)
                        .await
                        .map_err(DispatchError::handler)?;
                    if let Some(response) = state.into_response() {
                        debug!(
                            request_type = self.request_type,
                            "exception handler recovered dispatch"
                        );
                        return Ok(response);
                    }
                }
                Err(error)
            }
        }
    }

    // Pre-processors, the behavior chain, then post-processors. The
    // post-processors observe the original request (before any behavior
    // substituted it) and the final response.
    async fn dispatch(
        self: &Arc<Self>,
        request: AnyRequest,
        exec: Exec,
    ) -> Result<AnyResponse, DispatchError> {
        for pre in &self.pre {
            pre.process(&*request, &exec)
                .await
                .map_err(DispatchError::handler)?;
        }
        let next = AnyNext::new(Arc::clone(self));
        let response = next.run(Arc::clone(&request), exec.clone()).await?;
        for post in &self.post {
            post.process(&*request, &*response, &exec)
                .await
                .map_err(DispatchError::handler)?;
        }
        Ok(response)
    }

    // The centre of the behavior chain: the terminal handler, guarded by a
    // cancellation check.
    async fn terminal(&self, request: AnyRequest, exec: Exec) -> Result<AnyResponse, DispatchError> {
        if exec.cancellation().is_cancelled() {
            return Err(DispatchError::Cancelled);
        }
        (self.handler)(request, exec).await
    }
}
