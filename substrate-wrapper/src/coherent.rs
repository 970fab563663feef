//! Coherence wrappers
//!
//! Both wrappers thread the transaction id returned by one successful call
//! into the next call as its dependency hint, so the backend orders the
//! calls even when writes have not yet reached full consensus.
//!
//! - [`CoherentInstance`] keeps the chain head in the wrapper. One wrapper,
//!   one chain. A caller's own dependency choice wins.
//! - [`ContextCoherentInstance`] keeps the chain head in the caller's
//!   [`CallContext`] slot, so one wrapper can serve many chains. The carried
//!   head wins over a caller's own dependency option.
//!
//! [`CallContext`]: substrate_common::CallContext

use crate::instance::SubstrateInstance;
use async_trait::async_trait;
use parking_lot::Mutex;
use substrate_common::{
    options::{flatten_context, with_conditional_dependent_tx_id, with_dependent_tx_id},
    Block, Error, RequestOption, Response, Result,
};
use tracing::debug;

/// Chain state held by the wrapper itself.
///
/// Not safe for concurrent chains; calls must be awaited one after another.
#[derive(Debug)]
pub struct CoherentInstance<I> {
    inner: I,
    last_transaction_id: Mutex<Option<String>>,
}

impl<I: SubstrateInstance> CoherentInstance<I> {
    /// Start an empty chain over `inner`
    pub fn new(inner: I) -> Self {
        Self {
            inner,
            last_transaction_id: Mutex::new(None),
        }
    }

    /// Wrapped handle
    pub fn inner(&self) -> &I {
        &self.inner
    }

    /// Unwrap, dropping chain state
    pub fn into_inner(self) -> I {
        self.inner
    }
}

#[async_trait]
impl<I: SubstrateInstance> SubstrateInstance for CoherentInstance<I> {
    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }

    async fn health_check(&self, x: i64) -> Result<i64> {
        self.inner.health_check(x).await
    }

    fn is_timeout_error(&self, err: &Error) -> bool {
        self.inner.is_timeout_error(err)
    }

    async fn init(&self, program: &str, options: &[RequestOption]) -> Result<()> {
        self.inner.init(program, options).await
    }

    async fn call(&self, method: &str, options: &[RequestOption]) -> Result<Response> {
        let head = self.last_transaction_id.lock().clone();
        let mut options = options.to_vec();
        if let Some(head) = head {
            // Appended last so it can see what the caller chose
            options.push(with_conditional_dependent_tx_id(head));
        }

        let response = self.inner.call(method, &options).await?;

        debug!(method, tx = %response.transaction_id, "advancing chain");
        *self.last_transaction_id.lock() = response.transaction().map(str::to_string);
        Ok(response)
    }

    async fn query_info(&self, options: &[RequestOption]) -> Result<u64> {
        self.inner.query_info(options).await
    }

    async fn query_block(&self, height: u64, options: &[RequestOption]) -> Result<Block> {
        self.inner.query_block(height, options).await
    }

    fn last_transaction_id(&self) -> Option<String> {
        self.last_transaction_id.lock().clone()
    }
}

/// Chain state carried by the caller's context
#[derive(Debug)]
pub struct ContextCoherentInstance<I> {
    inner: I,
}

impl<I: SubstrateInstance> ContextCoherentInstance<I> {
    /// Wrap `inner`
    pub fn new(inner: I) -> Self {
        Self { inner }
    }

    /// Wrapped handle
    pub fn inner(&self) -> &I {
        &self.inner
    }

    /// Unwrap
    pub fn into_inner(self) -> I {
        self.inner
    }
}

#[async_trait]
impl<I: SubstrateInstance> SubstrateInstance for ContextCoherentInstance<I> {
    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }

    async fn health_check(&self, x: i64) -> Result<i64> {
        self.inner.health_check(x).await
    }

    fn is_timeout_error(&self, err: &Error) -> bool {
        self.inner.is_timeout_error(err)
    }

    async fn init(&self, program: &str, options: &[RequestOption]) -> Result<()> {
        self.inner.init(program, options).await
    }

    async fn call(&self, method: &str, options: &[RequestOption]) -> Result<Response> {
        // No carrier, no chain
        let ctx = match flatten_context(options) {
            Ok(ctx) if ctx.has_transaction_slot() => ctx,
            _ => return self.inner.call(method, options).await,
        };

        let mut options = options.to_vec();
        if let Some(head) = ctx.transaction_id() {
            options.push(with_dependent_tx_id(head));
        }

        let response = self.inner.call(method, &options).await?;

        debug!(method, tx = %response.transaction_id, "advancing carried chain");
        ctx.set_transaction_id(&response.transaction_id);
        Ok(response)
    }

    async fn query_info(&self, options: &[RequestOption]) -> Result<u64> {
        self.inner.query_info(options).await
    }

    async fn query_block(&self, height: u64, options: &[RequestOption]) -> Result<Block> {
        self.inner.query_block(height, options).await
    }
}

/// Wrapping helpers for any instance
pub trait SubstrateInstanceExt: SubstrateInstance + Sized {
    /// Chain calls through wrapper-held state
    fn coherent(self) -> CoherentInstance<Self> {
        CoherentInstance::new(self)
    }

    /// Chain calls through the caller's context
    fn context_coherent(self) -> ContextCoherentInstance<Self> {
        ContextCoherentInstance::new(self)
    }
}

impl<T: SubstrateInstance + Sized> SubstrateInstanceExt for T {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wrapper::{RpcInstance, SubstrateWrapper};
    use serde_json::json;
    use std::sync::Arc;
    use substrate_common::options::{with_context, with_disable_write_polling, with_params};
    use substrate_common::{CallContext, MockSubstrate, SubstrateError};

    async fn live() -> (Arc<MockSubstrate>, RpcInstance) {
        let mock = Arc::new(MockSubstrate::standard());
        let instance = SubstrateWrapper::new(mock.clone()).new_rpc().await.unwrap();
        (mock, instance)
    }

    fn put(key: &str) -> RequestOption {
        with_params(json!([key, 1]))
    }

    fn dependencies(mock: &MockSubstrate) -> Vec<Option<String>> {
        mock.endpoint_calls()
            .into_iter()
            .map(|c| c.options.and_then(|o| o.dependent_tx_id))
            .collect()
    }

    #[tokio::test]
    async fn test_chain_threads_previous_transaction() {
        let (mock, instance) = live().await;
        let chain = instance.coherent();

        for key in ["a", "b", "c"] {
            chain.call("put", &[put(key)]).await.unwrap();
        }

        assert_eq!(
            dependencies(&mock),
            vec![None, Some("tx-1".to_string()), Some("tx-2".to_string())]
        );
        assert_eq!(chain.last_transaction_id(), Some("tx-3".to_string()));
    }

    #[tokio::test]
    async fn test_failure_leaves_chain_head() {
        let (mock, instance) = live().await;
        let chain = instance.coherent();

        chain.call("put", &[put("a")]).await.unwrap();
        mock.fail_next(SubstrateError::new("transient"));
        assert!(chain.call("put", &[put("b")]).await.is_err());
        chain.call("put", &[put("c")]).await.unwrap();

        assert_eq!(
            dependencies(&mock),
            vec![None, Some("tx-1".to_string()), Some("tx-1".to_string())]
        );
    }

    #[tokio::test]
    async fn test_read_resets_chain() {
        let (mock, instance) = live().await;
        let chain = instance.coherent();

        chain.call("put", &[put("a")]).await.unwrap();
        chain.call("get", &[with_params(json!(["a"]))]).await.unwrap();
        assert_eq!(chain.last_transaction_id(), None);

        chain.call("put", &[put("b")]).await.unwrap();
        assert_eq!(dependencies(&mock)[2], None);
    }

    #[tokio::test]
    async fn test_explicit_write_polling_runs_independently() {
        let (mock, instance) = live().await;
        let chain = instance.coherent();

        chain.call("put", &[put("a")]).await.unwrap();
        chain
            .call("put", &[put("b"), with_disable_write_polling(false)])
            .await
            .unwrap();

        assert_eq!(dependencies(&mock), vec![None, None]);
    }

    #[tokio::test]
    async fn test_explicit_dependency_wins_over_chain() {
        let (mock, instance) = live().await;
        let chain = instance.coherent();

        chain.call("put", &[put("a")]).await.unwrap();
        chain.call("put", &[put("b")]).await.unwrap();
        chain
            .call("put", &[put("c"), with_dependent_tx_id("tx-1")])
            .await
            .unwrap();

        assert_eq!(dependencies(&mock)[2], Some("tx-1".to_string()));
    }

    #[tokio::test]
    async fn test_carried_chains_do_not_interleave() {
        let (_mock, instance) = live().await;
        let shared = instance.context_coherent();

        let left = CallContext::background().with_transaction_slot();
        let right = CallContext::background().with_transaction_slot();

        shared.call("put", &[put("l1"), with_context(left.clone())]).await.unwrap();
        shared.call("put", &[put("r1"), with_context(right.clone())]).await.unwrap();
        shared.call("put", &[put("l2"), with_context(left.clone())]).await.unwrap();

        assert_eq!(left.transaction_id(), Some("tx-3".to_string()));
        assert_eq!(right.transaction_id(), Some("tx-2".to_string()));
        assert_eq!(shared.last_transaction_id(), None);
    }

    #[tokio::test]
    async fn test_carried_head_overrides_explicit_dependency() {
        let (mock, instance) = live().await;
        let shared = instance.context_coherent();
        let ctx = CallContext::background().with_transaction_slot();

        shared.call("put", &[put("a"), with_context(ctx.clone())]).await.unwrap();
        shared.call("put", &[put("b")]).await.unwrap();
        shared
            .call(
                "put",
                &[put("c"), with_dependent_tx_id("tx-2"), with_context(ctx.clone())],
            )
            .await
            .unwrap();

        assert_eq!(dependencies(&mock)[2], Some("tx-1".to_string()));
        assert_eq!(ctx.transaction_id(), Some("tx-3".to_string()));
    }

    #[tokio::test]
    async fn test_carried_chain_survives_failure() {
        let (mock, instance) = live().await;
        let shared = instance.context_coherent();
        let ctx = CallContext::background().with_transaction_slot();

        shared.call("put", &[put("a"), with_context(ctx.clone())]).await.unwrap();
        mock.fail_next(SubstrateError::timeout("slow"));
        let err = shared
            .call("put", &[put("b"), with_context(ctx.clone())])
            .await
            .unwrap_err();
        assert!(shared.is_timeout_error(&err));
        assert_eq!(ctx.transaction_id(), Some("tx-1".to_string()));
    }

    #[tokio::test]
    async fn test_carrier_without_slot_is_plain_call() {
        let (mock, instance) = live().await;
        let shared = instance.context_coherent();
        let ctx = CallContext::background();

        shared.call("put", &[put("a"), with_context(ctx.clone())]).await.unwrap();
        shared.call("put", &[put("b"), with_context(ctx)]).await.unwrap();
        assert_eq!(dependencies(&mock), vec![None, None]);
    }
}
