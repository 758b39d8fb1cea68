//! Causality tracking — parent/child edges between nested dispatches.
//!
//! When causality tracking is enabled, every request pipeline gains an
//! implicit outermost behavior that assigns the in-flight request a short
//! opaque id, records an edge to its parent (the request that dispatched
//! it, if any), and restores the parent id once the request completes.
//! The recorded entries form the call tree of nested sends within one
//! scope.

use std::sync::Arc;
use std::time::SystemTime;

use serde::Serialize;
use uuid::Uuid;

use crate::context::{CURRENT_REQUEST_ID_ITEM_KEY, REQUEST_ID_BAGGAGE_KEY};
use crate::error::DispatchError;
use crate::mediator::Exec;
use crate::pipeline::{AnyNext, AnyRequest, AnyResponse, GenericBehavior};
use crate::request::HandlerFuture;

/// One edge in a scope's request tree.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CausalityEntry {
    /// Id assigned to the request this entry describes.
    pub request_id: String,
    /// Id of the dispatch that issued this request, or `None` for a root.
    pub parent_id: Option<String>,
    /// Name of the request type.
    pub request_type: String,
    /// When the request entered the pipeline.
    pub recorded_at: SystemTime,
}

// 12 hex chars of a v4 UUID — short enough for log lines, unique enough
// for one scope's lifetime.
fn short_request_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(12);
    id
}

/// Implicit behavior that maintains the causality chain.
///
/// Installed outermost on every request pipeline when both the pipeline
/// context and causality tracking are enabled. Without a context in scope
/// it passes straight through to `next`.
pub(crate) struct CausalityBehavior;

impl GenericBehavior for CausalityBehavior {
    fn handle(
        &self,
        request: AnyRequest,
        exec: Exec,
        next: AnyNext,
    ) -> HandlerFuture<Result<AnyResponse, DispatchError>> {
        Box::pin(async move {
            let Some(context) = exec.context() else {
                return next.run(request, exec).await;
            };

            let parent = context
                .item::<String>(CURRENT_REQUEST_ID_ITEM_KEY)
                .map(|id| (*id).clone());

            // The request_id baggage value seeds only the root of the tree;
            // nested dispatches always get fresh ids so the chain stays
            // acyclic.
            let id = match parent {
                None => context
                    .baggage(REQUEST_ID_BAGGAGE_KEY)
                    .unwrap_or_else(short_request_id),
                Some(_) => short_request_id(),
            };

            context.record_causality(CausalityEntry {
                request_id: id.clone(),
                parent_id: parent.clone(),
                request_type: exec.request_type().to_string(),
                recorded_at: SystemTime::now(),
            });
            context.set_item(CURRENT_REQUEST_ID_ITEM_KEY, id);

            let result = next.run(request, exec.clone()).await;

            // Restore the outer id whether `next` succeeded or failed.
            match parent {
                Some(parent_id) => context.set_item(CURRENT_REQUEST_ID_ITEM_KEY, parent_id),
                None => {
                    context.remove_item(CURRENT_REQUEST_ID_ITEM_KEY);
                }
            }
            result
        })
    }
}

pub(crate) fn causality_stage() -> Arc<dyn GenericBehavior> {
    Arc::new(CausalityBehavior)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_ids_are_short_and_distinct() {
        let a = short_request_id();
        let b = short_request_id();
        assert_eq!(a.len(), 12);
        assert_ne!(a, b);
    }
}
