//! Notification publishing strategies.
//!
//! A publish resolves every handler registered for the notification's
//! type, packages each into a deferred [`NotificationJob`], and hands the
//! batch to the configured [`NotificationPublisher`]. Two strategies are
//! built in:
//!
//! - [`SequentialPublisher`] — one handler at a time, in registration
//!   order; the first failure aborts the chain and surfaces as-is.
//! - [`ParallelPublisher`] — all handlers started concurrently; failures
//!   are collected into a single aggregated error preserving every inner
//!   failure.

use futures::future;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{DispatchError, DynError};
use crate::request::HandlerFuture;

type JobFn = Box<dyn FnOnce() -> HandlerFuture<Result<(), DynError>> + Send>;

/// One notification handler invocation, deferred until the publisher
/// decides to start it.
///
/// Deferring matters for the sequential strategy: a handler must not begin
/// executing until every handler before it has completed.
pub struct NotificationJob {
    label: &'static str,
    run: JobFn,
}

impl NotificationJob {
    /// Creates a job. `label` names the handler type for diagnostics.
    pub fn new(
        label: &'static str,
        run: impl FnOnce() -> HandlerFuture<Result<(), DynError>> + Send + 'static,
    ) -> Self {
        Self {
            label,
            run: Box::new(run),
        }
    }

    /// Name of the handler type this job invokes.
    pub fn label(&self) -> &'static str {
        self.label
    }

    /// Starts the handler and returns its future.
    pub fn start(self) -> HandlerFuture<Result<(), DynError>> {
        (self.run)()
    }
}

/// Strategy that executes a batch of notification handlers.
///
/// Implementations must honor the cancellation token: an in-flight handler
/// receives the same token through its `Exec`, and the strategy should not
/// start further handlers once the token has fired.
pub trait NotificationPublisher: Send + Sync {
    /// Run the jobs. `jobs` is ordered by handler registration.
    fn publish(
        &self,
        jobs: Vec<NotificationJob>,
        cancel: CancellationToken,
    ) -> HandlerFuture<Result<(), DispatchError>>;
}

/// Runs handlers one at a time in registration order.
///
/// Each handler completes before the next begins. The first failure aborts
/// the remainder of the chain and is surfaced unchanged (wrapped as a
/// handler failure).
pub struct SequentialPublisher;

impl NotificationPublisher for SequentialPublisher {
    fn publish(
        &self,
        jobs: Vec<NotificationJob>,
        cancel: CancellationToken,
    ) -> HandlerFuture<Result<(), DispatchError>> {
        Box::pin(async move {
            for job in jobs {
                if cancel.is_cancelled() {
                    return Err(DispatchError::Cancelled);
                }
                let label = job.label();
                job.start().await.map_err(|err| {
                    debug!(handler = label, error = %err, "notification handler failed");
                    DispatchError::handler(err)
                })?;
            }
            Ok(())
        })
    }
}

/// Starts all handlers concurrently and waits for every one to finish.
///
/// Ordering between handlers is unspecified. If one or more fail, the
/// caller observes a single [`DispatchError::Aggregate`] carrying all
/// failures in registration order.
pub struct ParallelPublisher;

impl NotificationPublisher for ParallelPublisher {
    fn publish(
        &self,
        jobs: Vec<NotificationJob>,
        cancel: CancellationToken,
    ) -> HandlerFuture<Result<(), DispatchError>> {
        Box::pin(async move {
            if cancel.is_cancelled() {
                return Err(DispatchError::Cancelled);
            }
            let total = jobs.len();
            let results = future::join_all(jobs.into_iter().map(NotificationJob::start)).await;
            let failures: Vec<DispatchError> = results
                .into_iter()
                .filter_map(|result| result.err().map(DispatchError::handler))
                .collect();
            if failures.is_empty() {
                Ok(())
            } else {
                warn!(
                    failed = failures.len(),
                    total, "parallel publish completed with failures"
                );
                Err(DispatchError::Aggregate { total, failures })
            }
        })
    }
}
