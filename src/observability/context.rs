//! Request-scoped correlation context
//!
//! Each captured request cycle runs inside a [`RequestContext`] scope held in a
//! tokio task-local. The scope follows the request future across every
//! `.await`, so concurrent cycles interleaved on the same worker thread never
//! see each other's correlation id.
//!
//! Work handed off to another task does not inherit the scope automatically;
//! use [`spawn_in_context`], [`spawn_blocking_in_context`] or
//! [`in_current_context`] at the hand-off point.

use chrono::{DateTime, Utc};
use std::future::Future;
use tokio::task::JoinHandle;
use uuid::Uuid;

tokio::task_local! {
    static REQUEST_CONTEXT: RequestContext;
    static SUPPRESSED: ();
}

/// Correlation data for one request cycle
#[derive(Clone, Debug)]
pub struct RequestContext {
    correlation_id: String,
    method: String,
    path: String,
    started_at: DateTime<Utc>,
}

impl RequestContext {
    /// Create a context with a fresh correlation id
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            correlation_id: new_correlation_id(),
            method: method.into(),
            path: path.into(),
            started_at: Utc::now(),
        }
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Run `fut` with this context active
    pub async fn scope<F: Future>(self, fut: F) -> F::Output {
        REQUEST_CONTEXT.scope(self, fut).await
    }

    /// Context of the request currently executing on this task, if any
    pub fn current() -> Option<RequestContext> {
        REQUEST_CONTEXT.try_with(|ctx| ctx.clone()).ok()
    }
}

/// Generate a new correlation id
pub fn new_correlation_id() -> String {
    Uuid::new_v4().to_string()
}

/// Correlation id of the request currently executing on this task
pub fn current_correlation_id() -> Option<String> {
    REQUEST_CONTEXT
        .try_with(|ctx| ctx.correlation_id.clone())
        .ok()
}

/// Wrap `fut` so it runs under the caller's request context, wherever it is polled
pub fn in_current_context<F>(fut: F) -> impl Future<Output = F::Output>
where
    F: Future,
{
    let ctx = RequestContext::current();
    async move {
        match ctx {
            Some(ctx) => REQUEST_CONTEXT.scope(ctx, fut).await,
            None => fut.await,
        }
    }
}

/// `tokio::spawn` that carries the caller's request context into the new task
pub fn spawn_in_context<F>(fut: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    tokio::spawn(in_current_context(fut))
}

/// `tokio::task::spawn_blocking` that carries the caller's request context
pub fn spawn_blocking_in_context<F, R>(f: F) -> JoinHandle<R>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    let ctx = RequestContext::current();
    tokio::task::spawn_blocking(move || match ctx {
        Some(ctx) => REQUEST_CONTEXT.sync_scope(ctx, f),
        None => f(),
    })
}

/// Run `fut` with runtime-log capture disabled.
///
/// The durable writer runs inside this scope so that driver logs emitted
/// while persisting never turn into new runtime log events.
pub(crate) async fn suppressed<F: Future>(fut: F) -> F::Output {
    SUPPRESSED.scope((), fut).await
}

pub(crate) fn is_suppressed() -> bool {
    SUPPRESSED.try_with(|_| ()).is_ok()
}
