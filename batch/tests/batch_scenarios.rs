//! Batch scheduling scenarios against the simulated backend
//!
//! Mirrors the round trip a deployed handler sees:
//! - immediately scheduled request succeeds
//! - immediately scheduled request fails
//! - future request waits for the clock

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use substrate_batch::{handler_fn, Driver, TickReport, Ticker};
use substrate_common::options::{with_params, with_timestamp_generator};
use substrate_common::{CallContext, MockSubstrate, RequestOption, SubstrateError};
use substrate_wrapper::{MockInstance, SubstrateInstance, SubstrateWrapper};

const TS001: &str = "2024-06-01T00:00:00Z";
const TS002: &str = "2024-06-01T00:05:00Z";
const TS003: &str = "2024-06-01T00:10:00Z";

/// Settable clock shared by every call
#[derive(Clone)]
struct TestClock(Arc<Mutex<String>>);

impl TestClock {
    fn new(start: &str) -> Self {
        Self(Arc::new(Mutex::new(start.to_string())))
    }

    fn set(&self, now: &str) {
        *self.0.lock() = now.to_string();
    }

    fn option(&self) -> RequestOption {
        let clock = self.0.clone();
        with_timestamp_generator(move |_| clock.lock().clone())
    }
}

struct Harness {
    instance: Arc<MockInstance>,
    clock: TestClock,
    last_received: Arc<Mutex<Option<String>>>,
    ticker: Ticker,
}

impl Harness {
    async fn new() -> Self {
        let wrapper = SubstrateWrapper::new(Arc::new(MockSubstrate::standard()));
        let instance = Arc::new(wrapper.new_mock_from("batch", "0.1.0", None).await.unwrap());
        let clock = TestClock::new(TS001);

        let driver = Driver::new(instance.clone()).with_log_field("TESTFIELD", "TESTVALUE");
        let last_received = Arc::new(Mutex::new(None));
        let seen = last_received.clone();

        let ticker = driver
            .register(
                "test_batch",
                Duration::from_secs(3600),
                handler_fn(move |_batch, _request_id, message: Value| {
                    let seen = seen.clone();
                    async move {
                        let message = message.as_str().unwrap_or_default().to_string();
                        *seen.lock() = Some(message.clone());
                        match message.as_str() {
                            "ping1" => Ok(json!("pong1")),
                            "ping2" => Err(anyhow::anyhow!("boom")),
                            "ping3" => Ok(json!("pong3")),
                            other => Err(anyhow::anyhow!("unexpected message {}", other)),
                        }
                    }
                }),
                vec![clock.option()],
            )
            .unwrap();

        Self {
            instance,
            clock,
            last_received,
            ticker,
        }
    }

    async fn call(&self, method: &str, params: Value) {
        let response = self
            .instance
            .call(method, &[with_params(params), self.clock.option()])
            .await
            .unwrap();
        assert!(!response.has_error, "{}", response.error_message);
    }

    async fn tick(&mut self) -> TickReport {
        self.ticker.tick(&CallContext::background()).await.unwrap()
    }

    async fn recent_input(&self) -> String {
        self.instance
            .call("get_recent_input", &[with_params(json!([])), self.clock.option()])
            .await
            .unwrap()
            .unmarshal_to()
            .unwrap()
    }

    fn last_received(&self) -> Option<String> {
        self.last_received.lock().clone()
    }
}

#[tokio::test]
async fn test_immediate_request_succeeds() {
    let mut harness = Harness::new().await;
    harness
        .call("schedule_request_now", json!(["test_batch", "ping1"]))
        .await;

    let report = harness.tick().await;
    assert_eq!(report.succeeded, 1);
    assert_eq!(harness.last_received().as_deref(), Some("ping1"));
    assert_eq!(harness.recent_input().await, "pong1");
}

#[tokio::test]
async fn test_failed_request_is_recorded_once() {
    let mut harness = Harness::new().await;
    harness
        .call("schedule_request_now", json!(["test_batch", "ping2"]))
        .await;

    let report = harness.tick().await;
    assert_eq!(report.failed, 1);
    assert_eq!(harness.recent_input().await, "error: boom");

    *harness.last_received.lock() = None;
    let report = harness.tick().await;
    assert_eq!(report, TickReport::default());
    assert_eq!(harness.last_received(), None);
}

#[tokio::test]
async fn test_future_request_waits_for_clock() {
    let mut harness = Harness::new().await;
    harness
        .call("schedule_request", json!(["test_batch", "ping3", TS002]))
        .await;

    assert_eq!(harness.tick().await.due, 0);
    assert_eq!(harness.last_received(), None);

    harness.clock.set(TS003);
    let report = harness.tick().await;
    assert_eq!(report.due, 1);
    assert_eq!(harness.last_received().as_deref(), Some("ping3"));
    assert_eq!(harness.recent_input().await, "pong3");

    assert_eq!(harness.tick().await.due, 0);
}

#[tokio::test]
async fn test_driver_schedule_then_tick() {
    let mut harness = Harness::new().await;
    let driver = Driver::new(harness.instance.clone());
    let when: DateTime<Utc> = TS002.parse().unwrap();
    driver
        .schedule_request("test_batch", &"ping1", when, &[harness.clock.option()])
        .await
        .unwrap();

    assert_eq!(harness.tick().await.due, 0);
    harness.clock.set(TS002);
    assert_eq!(harness.tick().await.succeeded, 1);
}

#[tokio::test]
async fn test_unreported_completion_is_redelivered() {
    let mock = Arc::new(MockSubstrate::standard());
    let wrapper = SubstrateWrapper::new(mock.clone());
    let instance = Arc::new(wrapper.new_rpc().await.unwrap());
    let clock = TestClock::new(TS001);
    let calls = Arc::new(Mutex::new(0usize));
    let counter = calls.clone();

    let driver = Driver::new(instance);
    let mut ticker = driver
        .register(
            "q",
            Duration::from_secs(60),
            handler_fn(move |_, _, message| {
                let counter = counter.clone();
                async move {
                    *counter.lock() += 1;
                    Ok::<_, anyhow::Error>(message)
                }
            }),
            vec![clock.option()],
        )
        .unwrap();
    driver
        .schedule_request("q", &"ping", TS001.parse().unwrap(), &[clock.option()])
        .await
        .unwrap();

    mock.fail_next_on("$batch_complete", SubstrateError::new("write lost"));
    let ctx = CallContext::background();
    let err = ticker.tick(&ctx).await.unwrap_err();
    assert!(matches!(err, substrate_batch::Error::Report { .. }));
    assert_eq!(*calls.lock(), 1);

    // The handler runs again because its outcome never landed
    let report = ticker.tick(&ctx).await.unwrap();
    assert_eq!(report.succeeded, 1);
    assert_eq!(*calls.lock(), 2);

    assert_eq!(ticker.tick(&ctx).await.unwrap().due, 0);
}
