//! Batch driver: handler registration and scheduling

use crate::{
    handler::BatchHandler,
    protocol::{self, ScheduleReceipt},
    ticker::Ticker,
    Error, Result,
};
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use substrate_common::options::{with_log_fields, with_params};
use substrate_common::{RequestOption, Response};
use substrate_wrapper::SubstrateInstance;
use tracing::info;

/// Registers batch handlers against one instance
#[derive(Clone)]
pub struct Driver {
    instance: Arc<dyn SubstrateInstance>,
    log_fields: BTreeMap<String, String>,
    registered: Arc<Mutex<BTreeSet<String>>>,
}

impl std::fmt::Debug for Driver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Driver")
            .field("log_fields", &self.log_fields)
            .field("registered", &*self.registered.lock())
            .finish_non_exhaustive()
    }
}

impl Driver {
    /// Driver over `instance`
    pub fn new(instance: Arc<dyn SubstrateInstance>) -> Self {
        Self {
            instance,
            log_fields: BTreeMap::new(),
            registered: Arc::new(Mutex::new(BTreeSet::new())),
        }
    }

    /// Add a field to every tick and schedule span
    pub fn with_log_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.log_fields.insert(key.into(), value.into());
        self
    }

    /// Register the handler for `batch_name`.
    ///
    /// `options` are applied to every backend call the ticker makes; a
    /// timestamp generator here sets the ticker's notion of "now".
    pub fn register<H>(
        &self,
        batch_name: impl Into<String>,
        interval: Duration,
        handler: H,
        options: Vec<RequestOption>,
    ) -> Result<Ticker>
    where
        H: BatchHandler + 'static,
    {
        let batch_name = batch_name.into();
        if batch_name.is_empty() {
            return Err(Error::Config("batch name must not be empty".to_string()));
        }
        if interval.is_zero() {
            return Err(Error::Config(format!(
                "tick interval for {} must be positive",
                batch_name
            )));
        }

        if !self.registered.lock().insert(batch_name.clone()) {
            return Err(Error::Config(format!(
                "handler already registered for batch {}",
                batch_name
            )));
        }

        info!(batch = %batch_name, interval_ms = interval.as_millis() as u64, "registered batch handler");
        Ok(Ticker::new(
            self.instance.clone(),
            batch_name,
            interval,
            Arc::new(handler),
            self.call_options(options),
            self.registered.clone(),
        ))
    }

    /// Schedule `payload` on `batch_name` for `when`; returns the request id
    pub async fn schedule_request<T: Serialize>(
        &self,
        batch_name: &str,
        payload: &T,
        when: DateTime<Utc>,
        options: &[RequestOption],
    ) -> Result<String> {
        if batch_name.is_empty() {
            return Err(Error::Config("batch name must not be empty".to_string()));
        }

        let payload = serde_json::to_value(payload)?;
        let when = when.to_rfc3339_opts(SecondsFormat::AutoSi, true);
        let mut options = self.call_options(options.to_vec());
        options.push(with_params(json!([batch_name, payload, when])));

        let response = self.instance.call(protocol::SCHEDULE, &options).await?;
        let receipt: ScheduleReceipt = accepted(&response)?.unmarshal_to()?;
        info!(batch = batch_name, request_id = %receipt.request_id, when = %when, "scheduled batch request");
        Ok(receipt.request_id)
    }

    fn call_options(&self, mut options: Vec<RequestOption>) -> Vec<RequestOption> {
        if !self.log_fields.is_empty() {
            options.insert(0, with_log_fields(self.log_fields.clone()));
        }
        options
    }
}

/// Treat a flagged response as a rejection
pub(crate) fn accepted(response: &Response) -> Result<&Response> {
    if response.has_error {
        return Err(Error::Rejected {
            code: response.error_code,
            message: response.error_message.clone(),
        });
    }
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::handler_fn;
    use serde_json::Value;
    use substrate_common::MockSubstrate;
    use substrate_wrapper::SubstrateWrapper;

    async fn driver() -> Driver {
        let wrapper = SubstrateWrapper::new(Arc::new(MockSubstrate::standard()));
        Driver::new(Arc::new(wrapper.new_rpc().await.unwrap()))
    }

    fn noop() -> impl BatchHandler {
        handler_fn(|_, _, _| async { Ok::<_, anyhow::Error>(Value::Null) })
    }

    #[tokio::test]
    async fn test_duplicate_registration_rejected() {
        let driver = driver().await;
        let _ticker = driver
            .register("q1", Duration::from_secs(60), noop(), vec![])
            .unwrap();

        let err = driver
            .register("q1", Duration::from_secs(60), noop(), vec![])
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        // Other queues are unaffected
        driver
            .register("q2", Duration::from_secs(60), noop(), vec![])
            .unwrap();
    }

    #[tokio::test]
    async fn test_dropping_ticker_frees_name() {
        let driver = driver().await;
        let ticker = driver
            .register("q1", Duration::from_secs(60), noop(), vec![])
            .unwrap();
        drop(ticker);
        driver
            .register("q1", Duration::from_secs(60), noop(), vec![])
            .unwrap();
    }

    #[tokio::test]
    async fn test_invalid_registration() {
        let driver = driver().await;
        assert!(matches!(
            driver.register("", Duration::from_secs(1), noop(), vec![]),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            driver.register("q", Duration::ZERO, noop(), vec![]),
            Err(Error::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_schedule_returns_request_id() {
        let driver = driver().await.with_log_field("component", "test");
        let id = driver
            .schedule_request("q1", &"ping", Utc::now(), &[])
            .await
            .unwrap();
        assert!(!id.is_empty());
    }

    #[tokio::test]
    async fn test_schedule_empty_batch_rejected() {
        let driver = driver().await;
        let err = driver
            .schedule_request("", &"ping", Utc::now(), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
