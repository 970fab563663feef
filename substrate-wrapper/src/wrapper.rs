//! Opening live and simulated sessions

use crate::instance::{SessionBinding, SubstrateInstance};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use substrate_common::{Block, Error, RequestOption, Response, Result, Substrate};
use tracing::info;

/// Entry point over a call channel
#[derive(Clone)]
pub struct SubstrateWrapper {
    substrate: Arc<dyn Substrate>,
}

impl std::fmt::Debug for SubstrateWrapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubstrateWrapper").finish_non_exhaustive()
    }
}

impl SubstrateWrapper {
    /// Wrap a call channel (plugin client or in-memory backend)
    pub fn new(substrate: Arc<dyn Substrate>) -> Self {
        Self { substrate }
    }

    /// Underlying call channel
    pub fn substrate(&self) -> Arc<dyn Substrate> {
        self.substrate.clone()
    }

    /// Open a live session
    pub async fn new_rpc(&self) -> Result<RpcInstance> {
        let tag = self.substrate.new_session().await?;
        info!(tag = %tag, "opened live session");
        Ok(RpcInstance {
            binding: SessionBinding::new(self.substrate.clone(), tag, false),
        })
    }

    /// Open a simulated session, optionally restored from `snapshot`
    pub async fn new_mock_from(
        &self,
        name: &str,
        version: &str,
        snapshot: Option<&[u8]>,
    ) -> Result<MockInstance> {
        let tag = self.substrate.new_simulated(name, version, snapshot).await?;
        info!(tag = %tag, name, version, restored = snapshot.is_some(), "opened simulated session");
        Ok(MockInstance {
            binding: SessionBinding::new(self.substrate.clone(), tag, true),
        })
    }
}

/// Handle on a live session
#[derive(Debug)]
pub struct RpcInstance {
    binding: SessionBinding,
}

impl RpcInstance {
    /// Session tag
    pub fn tag(&self) -> &str {
        self.binding.tag()
    }
}

/// Handle on a simulated session
#[derive(Debug)]
pub struct MockInstance {
    binding: SessionBinding,
}

impl MockInstance {
    /// Session tag
    pub fn tag(&self) -> &str {
        self.binding.tag()
    }

    /// Run later calls as `creator` with `attributes`
    pub async fn set_creator_with_attributes(
        &self,
        creator: &str,
        attributes: &BTreeMap<String, String>,
    ) -> Result<()> {
        self.binding.ensure_open()?;
        self.binding
            .substrate()
            .set_simulated_identity(self.binding.tag(), creator, attributes)
            .await
    }

    /// Serialized session state, restorable with
    /// [`SubstrateWrapper::new_mock_from`]
    pub async fn snapshot(&self) -> Result<Vec<u8>> {
        self.binding.ensure_open()?;
        self.binding
            .substrate()
            .snapshot_simulated(self.binding.tag())
            .await
    }
}

macro_rules! delegate_to_binding {
    ($instance:ty) => {
        #[async_trait]
        impl SubstrateInstance for $instance {
            async fn close(&self) -> Result<()> {
                self.binding.close().await
            }

            async fn health_check(&self, x: i64) -> Result<i64> {
                self.binding.health_check(x).await
            }

            fn is_timeout_error(&self, err: &Error) -> bool {
                self.binding.is_timeout_error(err)
            }

            async fn init(&self, program: &str, options: &[RequestOption]) -> Result<()> {
                self.binding.init(program, options).await
            }

            async fn call(&self, method: &str, options: &[RequestOption]) -> Result<Response> {
                self.binding.call(method, options).await
            }

            async fn query_info(&self, options: &[RequestOption]) -> Result<u64> {
                self.binding.query_info(options).await
            }

            async fn query_block(&self, height: u64, options: &[RequestOption]) -> Result<Block> {
                self.binding.query_block(height, options).await
            }
        }
    };
}

delegate_to_binding!(RpcInstance);
delegate_to_binding!(MockInstance);

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use substrate_common::options::{
        with_context, with_log_field, with_params, with_response, with_timestamp_generator,
    };
    use substrate_common::{CallContext, MockSubstrate, ResponseCapture, SubstrateError};

    fn wrapper() -> (Arc<MockSubstrate>, SubstrateWrapper) {
        let mock = Arc::new(MockSubstrate::standard());
        (mock.clone(), SubstrateWrapper::new(mock))
    }

    #[tokio::test]
    async fn test_call_flattens_and_captures_response() {
        let (mock, wrapper) = wrapper();
        let instance = wrapper.new_rpc().await.unwrap();
        let capture = ResponseCapture::new();

        let response = instance
            .call(
                "put",
                &[
                    with_params(json!(["k", "v"])),
                    with_response(capture.clone()),
                    with_log_field("request", "put-k"),
                    with_timestamp_generator(|_| "2024-01-01T00:00:00Z".to_string()),
                ],
            )
            .await
            .unwrap();

        assert_eq!(capture.get(), Some(response.clone()));
        assert_eq!(response.transaction(), Some("tx-1"));

        let recorded = mock.endpoint_calls();
        let options = recorded[0].options.as_ref().unwrap();
        assert_eq!(options.params, br#"["k","v"]"#.to_vec());
        assert_eq!(options.timestamp, "2024-01-01T00:00:00Z");
    }

    #[tokio::test]
    async fn test_failed_call_leaves_capture_empty() {
        let (mock, wrapper) = wrapper();
        let instance = wrapper.new_rpc().await.unwrap();
        let capture = ResponseCapture::new();
        mock.fail_next(SubstrateError::new("backend down"));

        let err = instance
            .call("echo", &[with_response(capture.clone())])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Application(_)));
        assert!(capture.get().is_none());
    }

    #[tokio::test]
    async fn test_closed_instance_rejects_operations() {
        let (_mock, wrapper) = wrapper();
        let instance = wrapper.new_rpc().await.unwrap();
        instance.close().await.unwrap();

        assert!(matches!(instance.call("echo", &[]).await, Err(Error::Config(_))));
        assert!(matches!(instance.query_info(&[]).await, Err(Error::Config(_))));
        assert!(matches!(instance.close().await, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_failed_close_keeps_instance_open() {
        let (mock, wrapper) = wrapper();
        let instance = wrapper.new_rpc().await.unwrap();
        mock.fail_next_close(SubstrateError::new("backend unavailable"));

        let err = instance.close().await.unwrap_err();
        assert!(matches!(err, Error::Application(_)));
        assert_eq!(instance.health_check(1).await.unwrap(), 1);

        instance.close().await.unwrap();
        assert!(matches!(instance.close().await, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_cancelled_carrier() {
        let (mock, wrapper) = wrapper();
        let instance = wrapper.new_rpc().await.unwrap();
        let ctx = CallContext::background();
        ctx.cancel();

        let err = instance.call("echo", &[with_context(ctx)]).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert!(mock.endpoint_calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_deadline_is_timeout() {
        let (_mock, wrapper) = wrapper();
        let instance = wrapper.new_rpc().await.unwrap();
        let ctx = CallContext::background().with_timeout(Duration::from_millis(10));
        tokio::time::advance(Duration::from_millis(20)).await;

        let err = instance.call("echo", &[with_context(ctx)]).await.unwrap_err();
        assert!(matches!(err, Error::DeadlineExceeded));
        assert!(instance.is_timeout_error(&err));
    }

    #[tokio::test]
    async fn test_reads_have_no_side_effects() {
        let (_mock, wrapper) = wrapper();
        let instance = wrapper.new_rpc().await.unwrap();
        instance.call("put", &[with_params(json!(["k", 1]))]).await.unwrap();

        for _ in 0..3 {
            assert_eq!(instance.query_info(&[]).await.unwrap(), 1);
            let block = instance.query_block(0, &[]).await.unwrap();
            assert_eq!(block.transactions.len(), 1);
        }
    }

    #[tokio::test]
    async fn test_mock_instance_identity_and_snapshot() {
        let (_mock, wrapper) = wrapper();
        let instance = wrapper.new_mock_from("cc", "1.0", None).await.unwrap();
        instance
            .set_creator_with_attributes("alice", &BTreeMap::new())
            .await
            .unwrap();
        instance.call("put", &[with_params(json!(["k", "v"]))]).await.unwrap();

        let snapshot = instance.snapshot().await.unwrap();
        instance.close().await.unwrap();

        let restored = wrapper.new_mock_from("cc", "1.0", Some(&snapshot)).await.unwrap();
        let response = restored.call("get", &[with_params(json!(["k"]))]).await.unwrap();
        assert_eq!(response.unmarshal_to::<String>().unwrap(), "v");

        let who = restored.call("whoami", &[]).await.unwrap();
        let who: serde_json::Value = who.unmarshal_to().unwrap();
        assert_eq!(who["creator"], serde_json::Value::Null);
    }

    #[tokio::test]
    async fn test_live_instance_health_check() {
        let (_mock, wrapper) = wrapper();
        let instance = wrapper.new_rpc().await.unwrap();
        assert_eq!(instance.health_check(99).await.unwrap(), 99);
    }
}
