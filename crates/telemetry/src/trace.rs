//! Trace-context propagation.
//!
//! Each inbound boundary (webhook request, pipeline cycle, CLI command)
//! establishes a trace id that flows through every log record emitted within
//! that activity. The id lives in a tokio task-local so concurrent
//! activities never observe each other's context.

use std::future::Future;

use uuid::Uuid;

tokio::task_local! {
    static TRACE_ID: String;
}

/// Generate a fresh trace id.
#[must_use]
pub fn new_trace_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Run a future with the given trace id installed as the current context.
pub async fn with_trace_id<F, T>(trace_id: String, fut: F) -> T
where
    F: Future<Output = T>,
{
    TRACE_ID.scope(trace_id, fut).await
}

/// The trace id of the current activity, if one is established.
#[must_use]
pub fn current_trace_id() -> Option<String> {
    TRACE_ID.try_with(Clone::clone).ok()
}
