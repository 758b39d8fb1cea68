//! Stream pipeline — lazy sequences wrapped by stream behaviors.
//!
//! Stream requests flow through a reduced pipeline: the terminal
//! [`StreamHandler`](crate::StreamHandler) wrapped by stream behaviors in
//! reversed registration order (first-registered outermost). Pre/post
//! processors and exception handlers do not apply to streams.
//!
//! The result is lazy end to end: constructing the stream does no work,
//! iteration drives every stage, and a cancellation guard terminates the
//! sequence with a single [`DispatchError::Cancelled`] item when the
//! caller's token fires mid-iteration.

use std::any::{self, Any};
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::stream::{self, Stream, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::error::DispatchError;
use crate::mediator::Exec;
use crate::pipeline::AnyRequest;
use crate::request::{DispatchStream, StreamRequest};

/// Type-erased stream element.
pub type AnyItem = Box<dyn Any + Send>;

/// Type-erased lazy sequence flowing through a stream pipeline.
pub type AnyItemStream = Pin<Box<dyn Stream<Item = Result<AnyItem, DispatchError>> + Send>>;

pub(crate) type ErasedStreamInvoke = Arc<dyn Fn(AnyRequest, Exec) -> AnyItemStream + Send + Sync>;

// ── Stage contracts ──────────────────────────────────────────────────────────

/// A stage that wraps the stream pipeline for one stream request type.
///
/// Implementors receive the request and a [`StreamNext`] cursor and return
/// a stream; they may forward the inner stream unchanged, transform its
/// items, or substitute a different sequence entirely. The first-registered
/// stream behavior executes outermost.
pub trait StreamBehavior<R: StreamRequest>: Send + Sync {
    /// Produce the wrapped sequence.
    fn handle(
        &self,
        request: Arc<R>,
        exec: Exec,
        next: StreamNext<R>,
    ) -> DispatchStream<R::Item>;
}

/// A [`StreamBehavior`] that applies to every stream request type.
pub trait GenericStreamBehavior: Send + Sync {
    /// Produce the wrapped erased sequence.
    fn handle(&self, request: AnyRequest, exec: Exec, next: AnyStreamNext) -> AnyItemStream;
}

// ── Next cursors ─────────────────────────────────────────────────────────────

/// Type-erased cursor into the remaining stream behavior chain.
pub struct AnyStreamNext {
    pipeline: Arc<StreamPipeline>,
    index: usize,
}

impl AnyStreamNext {
    pub(crate) fn new(pipeline: Arc<StreamPipeline>) -> Self {
        Self { pipeline, index: 0 }
    }

    /// Builds the next layer's stream. Construction is cheap; the returned
    /// stream does its work as it is polled.
    pub fn run(mut self, request: AnyRequest, exec: Exec) -> AnyItemStream {
        let pipeline = Arc::clone(&self.pipeline);
        if self.index < pipeline.behaviors.len() {
            let stage = Arc::clone(&pipeline.behaviors[self.index]);
            self.index += 1;
            stage.handle(request, exec, self)
        } else {
            (pipeline.handler)(request, exec)
        }
    }
}

/// Typed cursor into the remaining stream behavior chain for `R`.
pub struct StreamNext<R: StreamRequest> {
    inner: AnyStreamNext,
    _marker: PhantomData<fn() -> R>,
}

impl<R: StreamRequest> StreamNext<R> {
    pub(crate) fn from_erased(inner: AnyStreamNext) -> Self {
        Self {
            inner,
            _marker: PhantomData,
        }
    }

    /// Builds the rest of the pipeline's stream with typed items.
    pub fn run(self, request: Arc<R>, exec: Exec) -> DispatchStream<R::Item> {
        Box::pin(self.inner.run(request, exec).map(|item| {
            item.and_then(|boxed| {
                boxed
                    .downcast::<R::Item>()
                    .map(|item| *item)
                    .map_err(|_| DispatchError::type_mismatch(any::type_name::<R::Item>()))
            })
        }))
    }
}

// ── Closed-stage adapter ─────────────────────────────────────────────────────

pub(crate) fn erase_stream_behavior<R: StreamRequest>(
    inner: Arc<dyn StreamBehavior<R>>,
) -> Arc<dyn GenericStreamBehavior> {
    struct Adapter<R: StreamRequest> {
        inner: Arc<dyn StreamBehavior<R>>,
    }

    impl<R: StreamRequest> GenericStreamBehavior for Adapter<R> {
        fn handle(&self, request: AnyRequest, exec: Exec, next: AnyStreamNext) -> AnyItemStream {
            let request = match request.downcast::<R>() {
                Ok(request) => request,
                Err(_) => {
                    let error = DispatchError::type_mismatch(any::type_name::<R>());
                    return Box::pin(stream::once(async move { Err(error) }));
                }
            };
            let typed = self
                .inner
                .handle(request, exec, StreamNext::from_erased(next));
            Box::pin(typed.map(|item| item.map(|value| Box::new(value) as AnyItem)))
        }
    }

    Arc::new(Adapter { inner })
}

// ── The compiled stream pipeline ─────────────────────────────────────────────

/// Compiled stream pipeline for one stream request type, cached for the
/// process lifetime.
pub(crate) struct StreamPipeline {
    behaviors: Vec<Arc<dyn GenericStreamBehavior>>,
    handler: ErasedStreamInvoke,
}

impl StreamPipeline {
    pub(crate) fn new(
        behaviors: Vec<Arc<dyn GenericStreamBehavior>>,
        handler: ErasedStreamInvoke,
    ) -> Self {
        Self { behaviors, handler }
    }

    pub(crate) fn execute(self: &Arc<Self>, request: AnyRequest, exec: Exec) -> AnyItemStream {
        AnyStreamNext::new(Arc::clone(self)).run(request, exec)
    }
}

// ── Cancellation guard ───────────────────────────────────────────────────────

/// Stream adapter that ends the sequence with one `Cancelled` item when the
/// dispatch token fires, without polling the inner stream again.
pub(crate) struct CancelGuard<T> {
    inner: DispatchStream<T>,
    cancelled: Pin<Box<dyn Future<Output = ()> + Send>>,
    done: bool,
}

impl<T> CancelGuard<T> {
    pub(crate) fn new(inner: DispatchStream<T>, token: CancellationToken) -> Self {
        Self {
            inner,
            cancelled: Box::pin(token.cancelled_owned()),
            done: false,
        }
    }
}

impl<T> Stream for CancelGuard<T> {
    type Item = Result<T, DispatchError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        if this.cancelled.as_mut().poll(cx).is_ready() {
            this.done = true;
            return Poll::Ready(Some(Err(DispatchError::Cancelled)));
        }
        match this.inner.as_mut().poll_next(cx) {
            Poll::Ready(None) => {
                this.done = true;
                Poll::Ready(None)
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancel_guard_passes_items_through() {
        let token = CancellationToken::new();
        let inner: DispatchStream<u32> = Box::pin(stream::iter((0..3).map(Ok)));
        let collected: Vec<_> = CancelGuard::new(inner, token).collect().await;
        assert_eq!(collected.len(), 3);
        assert!(collected.iter().all(Result::is_ok));
    }

    #[tokio::test]
    async fn cancel_guard_ends_with_cancelled_item() {
        let token = CancellationToken::new();
        let inner: DispatchStream<u32> = Box::pin(stream::iter((0..5).map(Ok)));
        let mut guard = CancelGuard::new(inner, token.clone());
        assert_eq!(guard.next().await.unwrap().unwrap(), 0);
        token.cancel();
        assert!(matches!(
            guard.next().await,
            Some(Err(DispatchError::Cancelled))
        ));
        assert!(guard.next().await.is_none());
    }
}
