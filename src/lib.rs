//! # courier
//!
//! An in-process async mediator: typed request dispatch through a layered
//! stage pipeline, notification fan-out, and lazy response streams.
//!
//! Callers hand a request value to the [`Mediator`]; it locates the sole
//! handler registered for that value's type, runs it inside a configurable
//! pipeline of cross-cutting stages (pre-processors, behaviors,
//! post-processors, exception handlers), and returns the typed result.
//! Notifications fan out to any number of handlers through a pluggable
//! publisher strategy; stream requests produce lazy, cancellable
//! sequences.
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
//! #[tokio::main]
//! async fn main() -> Result<(), courier::DispatchError> {
//!     let mediator = Mediator::builder().register::<Ping>(PingHandler).build();
//!     let reply = mediator.send(Ping { message: "Hello".into() }).await?;
//!     println!("{reply}");
//!     Ok(())
//! }
//! ```

// ── Modules ───────────────────────────────────────────────────────────────────
pub mod context;
pub mod error;
pub mod mediator;
pub mod pipeline;
pub mod publish;
pub mod registry;
pub mod request;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use context::{
    CausalityEntry, MetricSnapshot, PipelineContext, TimerScope, TimingEntry, BAGGAGE_ITEM_KEY,
    CURRENT_REQUEST_ID_ITEM_KEY, REQUEST_ID_BAGGAGE_KEY,
};
pub use error::{DispatchError, DynError};
pub use mediator::{Exec, Mediator, MediatorBuilder, Scope};
pub use pipeline::stream::{
    AnyItem, AnyItemStream, AnyStreamNext, GenericStreamBehavior, StreamBehavior, StreamNext,
};
pub use pipeline::{
    AnyExceptionState, AnyNext, AnyRequest, AnyResponse, Behavior, ExceptionHandler,
    ExceptionState, GenericBehavior, GenericExceptionHandler, GenericPostProcessor,
    GenericPreProcessor, Next, PostProcessor, PreProcessor,
};
pub use publish::{NotificationJob, NotificationPublisher, ParallelPublisher, SequentialPublisher};
pub use registry::{Lifetime, Module, ModuleManifest, TypeKey};
pub use request::{
    DispatchStream, HandlerFuture, ItemStream, Notification, NotificationHandler, Request,
    RequestHandler, StageFuture, StreamHandler, StreamRequest,
};

// Re-exported so callers do not need a direct tokio-util dependency to
// pass cancellation tokens.
pub use tokio_util::sync::CancellationToken;
