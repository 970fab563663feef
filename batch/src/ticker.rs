//! Tick passes over one batch queue
//!
//! A pass fetches every entry due at the call's "now", dispatches each to
//! the handler in backend order, and writes exactly one completion per
//! entry. Handler failures are recorded and consumed; they are never
//! retried. A completion that fails to land stops the pass, leaving that
//! entry and the rest pending for the next pass.

use crate::{
    driver::accepted,
    handler::BatchHandler,
    protocol::{self, PendingRequest},
    Error, Result,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use substrate_common::options::{with_context, with_params};
use substrate_common::{metrics, CallContext, RequestOption};
use substrate_wrapper::SubstrateInstance;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, info_span, warn, Instrument};

/// Outcome counts for one pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Entries due at the start of the pass
    pub due: usize,
    /// Handler succeeded and the response was recorded
    pub succeeded: usize,
    /// Handler failed and the failure was recorded
    pub failed: usize,
}

/// Drives one registered batch queue
pub struct Ticker {
    instance: Arc<dyn SubstrateInstance>,
    batch_name: String,
    interval: Duration,
    handler: Arc<dyn BatchHandler>,
    options: Vec<RequestOption>,
    registered: Arc<Mutex<BTreeSet<String>>>,
}

impl std::fmt::Debug for Ticker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ticker")
            .field("batch_name", &self.batch_name)
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

impl Ticker {
    pub(crate) fn new(
        instance: Arc<dyn SubstrateInstance>,
        batch_name: String,
        interval: Duration,
        handler: Arc<dyn BatchHandler>,
        options: Vec<RequestOption>,
        registered: Arc<Mutex<BTreeSet<String>>>,
    ) -> Self {
        Self {
            instance,
            batch_name,
            interval,
            handler,
            options,
            registered,
        }
    }

    /// Queue this ticker drives
    pub fn batch_name(&self) -> &str {
        &self.batch_name
    }

    /// Time between passes in [`Ticker::run`]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Run one pass
    pub async fn tick(&mut self, ctx: &CallContext) -> Result<TickReport> {
        let span = info_span!("batch_tick", batch = %self.batch_name);
        self.pass(ctx).instrument(span).await
    }

    /// Tick every interval until `ctx` is cancelled
    pub async fn run(mut self, ctx: CallContext) -> Result<()> {
        let mut interval = interval_at(Instant::now() + self.interval, self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(batch = %self.batch_name, "batch ticker started");

        loop {
            tokio::select! {
                _ = ctx.cancellation_token().cancelled() => break,
                _ = interval.tick() => {
                    match self.tick(&ctx).await {
                        Ok(report) if report.due > 0 => {
                            info!(batch = %self.batch_name, due = report.due, succeeded = report.succeeded, failed = report.failed, "batch tick complete");
                        }
                        Ok(_) => {}
                        Err(e) => {
                            warn!(batch = %self.batch_name, error = %e, "batch tick failed");
                        }
                    }
                }
            }
        }

        info!(batch = %self.batch_name, "batch ticker stopped");
        Ok(())
    }

    async fn pass(&self, ctx: &CallContext) -> Result<TickReport> {
        let pending = self.fetch(ctx).await?;
        let mut report = TickReport {
            due: pending.len(),
            ..Default::default()
        };
        debug!(due = report.due, "fetched due batch entries");

        for request in pending {
            let outcome = self
                .handler
                .handle(&self.batch_name, &request.request_id, request.message)
                .await;

            let (response, error, status) = match outcome {
                Ok(value) => (value, Value::Null, "succeeded"),
                Err(e) => {
                    warn!(request_id = %request.request_id, error = %e, "batch handler failed");
                    (Value::Null, Value::String(e.to_string()), "failed")
                }
            };

            self.complete(ctx, &request.request_id, response, error)
                .await
                .map_err(|source| Error::Report {
                    request_id: request.request_id.clone(),
                    source: Box::new(source),
                })?;

            metrics::observe_batch_entry(&self.batch_name, status);
            if status == "succeeded" {
                report.succeeded += 1;
            } else {
                report.failed += 1;
            }
        }

        Ok(report)
    }

    async fn fetch(&self, ctx: &CallContext) -> Result<Vec<PendingRequest>> {
        let options = self.call_options(ctx, json!([self.batch_name]));
        let response = self.instance.call(protocol::PENDING, &options).await?;
        Ok(accepted(&response)?.unmarshal_to()?)
    }

    async fn complete(
        &self,
        ctx: &CallContext,
        request_id: &str,
        response: Value,
        error: Value,
    ) -> Result<()> {
        let options = self.call_options(ctx, json!([self.batch_name, request_id, response, error]));
        let reply = self.instance.call(protocol::COMPLETE, &options).await?;
        accepted(&reply)?;
        Ok(())
    }

    fn call_options(&self, ctx: &CallContext, params: Value) -> Vec<RequestOption> {
        let mut options = self.options.clone();
        options.push(with_params(params));
        options.push(with_context(ctx.clone()));
        options
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.registered.lock().remove(&self.batch_name);
    }
}
