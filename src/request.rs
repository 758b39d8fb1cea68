//! Core request, notification, and handler contracts.
//!
//! A [`Request`] declares its response type through an associated type; a
//! [`Notification`] has no response and fans out to any number of handlers;
//! a [`StreamRequest`] produces a lazy sequence of items.
//!
//! Handlers are async but object-safe: each returns a boxed future via the
//! [`HandlerFuture`] alias rather than an `async fn`, so handler trait
//! objects can be stored, cloned, and invoked through the type-erased
//! pipeline.
//!
//! The request value travels through the pipeline as an [`Arc`] so that
//! pre-processors, the terminal handler, and post-processors all observe
//! the same value without cloning it.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::Stream;

pub(crate) use crate::error::DynError;
use crate::error::DispatchError;
use crate::mediator::Exec;

/// A request with exactly one handler and a typed response.
pub trait Request: Send + Sync + 'static {
    /// The response type the sole handler for this request produces.
    type Response: Send + Sync + 'static;
}

/// A notification fanned out to zero or more handlers. No response.
pub trait Notification: Send + Sync + 'static {}

/// A request whose response is a lazy sequence of items.
pub trait StreamRequest: Send + Sync + 'static {
    /// The element type of the produced sequence.
    type Item: Send + 'static;
}

/// Boxed future returned by handlers and behaviors.
pub type HandlerFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Boxed future that borrows its inputs, returned by processors and
/// exception handlers.
pub type StageFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Lazy sequence produced by a stream handler. Items are fallible so a
/// handler can surface mid-stream failures.
pub type ItemStream<T> = Pin<Box<dyn Stream<Item = Result<T, DynError>> + Send>>;

/// Lazy sequence returned by [`create_stream`](crate::Scope::create_stream):
/// the stream handler's items after the stream pipeline has wrapped them.
pub type DispatchStream<T> = Pin<Box<dyn Stream<Item = Result<T, DispatchError>> + Send>>;

/// The terminal handler for a request type.
///
/// Exactly one handler is registered per request type. The handler receives
/// the shared request value and the per-dispatch [`Exec`] environment
/// (scope, cancellation token, request type name). Errors are boxed
/// [`DynError`] values; the pipeline wraps them in
/// [`DispatchError::Handler`](crate::DispatchError::Handler).
///
/// # Examples
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use courier::{Exec, HandlerFuture, Request, RequestHandler};
///
/// struct Ping { message: String }
/// impl Request for Ping { type Response = String; }
///
/// struct PingHandler;
/// impl RequestHandler<Ping> for PingHandler {
///     fn handle(&self, request: Arc<Ping>, _exec: Exec) -> HandlerFuture<Result<String, courier::DynError>> {
///         Box::pin(async move { Ok(format!("Pong: {}", request.message)) })
///     }
/// }
/// ```
pub trait RequestHandler<R: Request>: Send + Sync {
    /// Handle the request and produce its response.
    fn handle(&self, request: Arc<R>, exec: Exec) -> HandlerFuture<Result<R::Response, DynError>>;
}

/// One of possibly many handlers for a notification type.
///
/// Handlers run in registration order under the sequential publisher and
/// concurrently under the parallel publisher.
pub trait NotificationHandler<N: Notification>: Send + Sync {
    /// Handle the notification.
    fn handle(&self, notification: Arc<N>, exec: Exec) -> HandlerFuture<Result<(), DynError>>;
}

/// The terminal handler for a stream request type.
///
/// Returning the stream must be cheap and lazy: the handler body should do
/// its work as the stream is polled, not when `handle` is called, so that
/// iteration drives the pipeline and cancellation can interrupt it.
pub trait StreamHandler<R: StreamRequest>: Send + Sync {
    /// Produce the lazy item sequence for the request.
    fn handle(&self, request: Arc<R>, exec: Exec) -> ItemStream<R::Item>;
}
