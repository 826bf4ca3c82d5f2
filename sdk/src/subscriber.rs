//! Event handler trait implemented by worker agents
//!
//! The bus stores subscriptions as opaque `Arc<dyn EventHandler>` handles,
//! so the engine never depends on worker internals. A worker typically
//! subscribes one handler per dispatch kind it services, plus publishes
//! `TaskCompleted` / `TaskFailed` events back through the bus handle it
//! was constructed with.

use crate::errors::MeshResult;
use crate::types::Event;
use async_trait::async_trait;
use std::sync::Arc;

/// Async callback invoked for every event a subscription matches
///
/// Handlers run concurrently with other handlers for the same event; the
/// bus awaits all of them before `publish` returns. Returning an error is
/// logged by the bus and never affects delivery to other subscribers.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle one delivered event
    async fn handle(&self, event: Event) -> MeshResult<()>;
}

/// Blanket handler over a plain async-compatible closure, convenient for
/// small subscribers and tests
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Event) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = MeshResult<()>> + Send,
{
    async fn handle(&self, event: Event) -> MeshResult<()> {
        (self.0)(event).await
    }
}

/// Wrap a closure into a shareable handler handle
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = MeshResult<()>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}
