//! Batch handler trait

use async_trait::async_trait;
use serde_json::Value;
use std::future::Future;

/// Processes one due batch entry.
///
/// The returned value is recorded as the entry's response; an error is
/// recorded as its failure. Either way the entry is consumed and never
/// redelivered.
#[async_trait]
pub trait BatchHandler: Send + Sync {
    /// Handle `message` scheduled on `batch_name` as `request_id`
    async fn handle(&self, batch_name: &str, request_id: &str, message: Value)
        -> anyhow::Result<Value>;
}

/// Handler backed by an async closure
pub struct HandlerFn<F>(F);

impl<F> std::fmt::Debug for HandlerFn<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("HandlerFn(..)")
    }
}

/// Wrap `f(batch_name, request_id, message)` as a [`BatchHandler`]
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(String, String, Value) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send,
{
    HandlerFn(f)
}

#[async_trait]
impl<F, Fut> BatchHandler for HandlerFn<F>
where
    F: Fn(String, String, Value) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send,
{
    async fn handle(
        &self,
        batch_name: &str,
        request_id: &str,
        message: Value,
    ) -> anyhow::Result<Value> {
        (self.0)(batch_name.to_string(), request_id.to_string(), message).await
    }
}
