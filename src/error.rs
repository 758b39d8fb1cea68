//! Dispatch error taxonomy.
//!
//! Every fallible operation on the mediator surfaces a [`DispatchError`].
//! Handler- and stage-originated failures travel as boxed [`DynError`]
//! values and are wrapped in [`DispatchError::Handler`] so that exception
//! handlers can inspect and optionally recover from them.

use thiserror::Error;

/// Boxed error type produced by user handlers and pipeline stages.
pub type DynError = Box<dyn std::error::Error + Send + Sync>;

/// Errors produced by dispatching requests, notifications, and streams.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// No handler is registered for the request or stream request type.
    ///
    /// Raised while the pipeline wrapper is being built, before any user
    /// stage runs, so it is never visible to exception handlers.
    #[error("no handler registered for request type `{type_name}`")]
    UnregisteredHandler {
        /// Fully qualified name of the request type.
        type_name: &'static str,
    },

    /// A value handed to the untyped API does not declare a response type
    /// (its concrete type was never registered as a request), or a pipeline
    /// stage produced a value of an unexpected type.
    #[error("contract violation: {message}")]
    ContractViolation {
        /// Human-readable description of the violated contract.
        message: String,
    },

    /// The terminal handler or a pipeline stage failed.
    ///
    /// Subject to exception-handler interception: the first registered
    /// exception handler that marks the error as handled replaces it with a
    /// recovery response.
    #[error("handler failed: {0}")]
    Handler(#[source] DynError),

    /// One or more notification handlers failed under the parallel
    /// publisher. Every inner failure is preserved in handler order.
    #[error("{} of {total} notification handlers failed", failures.len())]
    Aggregate {
        /// Number of handlers that were invoked.
        total: usize,
        /// The individual handler failures, in registration order.
        failures: Vec<DispatchError>,
    },

    /// The caller's cancellation signal was observed.
    #[error("dispatch was cancelled")]
    Cancelled,

    /// Startup validation found declared request types without handlers.
    #[error("invalid mediator configuration: {}", problems.join("; "))]
    InvalidConfiguration {
        /// One entry per missing handler.
        problems: Vec<String>,
    },
}

impl DispatchError {
    /// Wraps an arbitrary handler or stage error.
    pub fn handler(err: impl Into<DynError>) -> Self {
        DispatchError::Handler(err.into())
    }

    /// Returns `true` if this error is [`DispatchError::Cancelled`].
    pub fn is_cancelled(&self) -> bool {
        matches!(self, DispatchError::Cancelled)
    }

    // Internal invariant break: a pipeline produced a value whose concrete
    // type does not match the type the pipeline was built for.
    pub(crate) fn type_mismatch(expected: &'static str) -> Self {
        DispatchError::ContractViolation {
            message: format!("pipeline value type mismatch; expected `{expected}`"),
        }
    }
}
