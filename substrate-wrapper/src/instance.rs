//! Instance handles bound to one backend session

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use substrate_common::{
    metrics,
    options::RequestOptions,
    Block, Error, FlattenedOptions, RequestOption, Response, Result, Substrate,
};
use tracing::{debug, info_span, Instrument};

/// Operations available on an open session
#[async_trait]
pub trait SubstrateInstance: Send + Sync {
    /// Close the session; later operations fail
    async fn close(&self) -> Result<()>;

    /// Echo `x` through the backend
    async fn health_check(&self, x: i64) -> Result<i64>;

    /// Whether `err` is a timeout a caller may retry
    fn is_timeout_error(&self, err: &Error) -> bool;

    /// Install program source (see [`substrate_common::options::encode_program_bytes`])
    async fn init(&self, program: &str, options: &[RequestOption]) -> Result<()>;

    /// Invoke an endpoint
    async fn call(&self, method: &str, options: &[RequestOption]) -> Result<Response>;

    /// Current block height
    async fn query_info(&self, options: &[RequestOption]) -> Result<u64>;

    /// Block summary at `height`
    async fn query_block(&self, height: u64, options: &[RequestOption]) -> Result<Block>;

    /// Head of the coherence chain kept by this handle, if any
    fn last_transaction_id(&self) -> Option<String> {
        None
    }
}

#[async_trait]
impl<T: SubstrateInstance + ?Sized> SubstrateInstance for Arc<T> {
    async fn close(&self) -> Result<()> {
        (**self).close().await
    }

    async fn health_check(&self, x: i64) -> Result<i64> {
        (**self).health_check(x).await
    }

    fn is_timeout_error(&self, err: &Error) -> bool {
        (**self).is_timeout_error(err)
    }

    async fn init(&self, program: &str, options: &[RequestOption]) -> Result<()> {
        (**self).init(program, options).await
    }

    async fn call(&self, method: &str, options: &[RequestOption]) -> Result<Response> {
        (**self).call(method, options).await
    }

    async fn query_info(&self, options: &[RequestOption]) -> Result<u64> {
        (**self).query_info(options).await
    }

    async fn query_block(&self, height: u64, options: &[RequestOption]) -> Result<Block> {
        (**self).query_block(height, options).await
    }

    fn last_transaction_id(&self) -> Option<String> {
        (**self).last_transaction_id()
    }
}

/// Session tag plus the channel it lives on
pub(crate) struct SessionBinding {
    substrate: Arc<dyn Substrate>,
    tag: String,
    simulated: bool,
    closed: AtomicBool,
}

impl std::fmt::Debug for SessionBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionBinding")
            .field("tag", &self.tag)
            .field("simulated", &self.simulated)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl SessionBinding {
    pub(crate) fn new(substrate: Arc<dyn Substrate>, tag: String, simulated: bool) -> Self {
        Self {
            substrate,
            tag,
            simulated,
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn tag(&self) -> &str {
        &self.tag
    }

    pub(crate) fn substrate(&self) -> &dyn Substrate {
        self.substrate.as_ref()
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Config(format!("instance {} is closed", self.tag)));
        }
        Ok(())
    }

    fn prepare(&self, options: &[RequestOption]) -> Result<(RequestOptions, FlattenedOptions)> {
        self.ensure_open()?;
        let draft = RequestOptions::fold(options);
        let flat = draft.flatten()?;
        Ok((draft, flat))
    }

    /// Run one boundary operation under the draft's carrier
    async fn guard<T, F>(&self, operation: &'static str, draft: &RequestOptions, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let span = info_span!(
            "substrate",
            operation,
            tag = %self.tag,
            simulated = self.simulated,
            fields = %render_fields(&draft.log_fields),
        );
        let ctx = draft.context_or_background();
        let started = Instant::now();

        let result = ctx.run(fut).instrument(span.clone()).await;
        metrics::observe_call(operation, started, result.is_ok());
        if let Err(e) = &result {
            span.in_scope(|| debug!(error = %e, "boundary operation failed"));
        }
        result
    }

    pub(crate) async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(Error::Config(format!("instance {} is closed", self.tag)));
        }
        let started = Instant::now();
        let result = if self.simulated {
            self.substrate.close_simulated(&self.tag).await
        } else {
            self.substrate.close_session(&self.tag).await
        };
        metrics::observe_call("close", started, result.is_ok());
        if result.is_err() {
            // Backend session is still there; allow another close
            self.closed.store(false, Ordering::Release);
        }
        result
    }

    pub(crate) async fn health_check(&self, x: i64) -> Result<i64> {
        self.ensure_open()?;
        let started = Instant::now();
        let result = self.substrate.health_check(x).await;
        metrics::observe_call("health_check", started, result.is_ok());
        result
    }

    pub(crate) fn is_timeout_error(&self, err: &Error) -> bool {
        self.substrate.is_timeout_error(err)
    }

    pub(crate) async fn init(&self, program: &str, options: &[RequestOption]) -> Result<()> {
        let (draft, flat) = self.prepare(options)?;
        self.guard("init", &draft, self.substrate.init(&self.tag, program, &flat))
            .await
    }

    pub(crate) async fn call(&self, method: &str, options: &[RequestOption]) -> Result<Response> {
        let (draft, flat) = self.prepare(options)?;
        let response = self
            .guard("call", &draft, self.substrate.call(&self.tag, method, &flat))
            .await?;
        if let Some(capture) = draft.response_capture() {
            capture.store(response.clone());
        }
        Ok(response)
    }

    pub(crate) async fn query_info(&self, options: &[RequestOption]) -> Result<u64> {
        let (draft, flat) = self.prepare(options)?;
        self.guard("query_info", &draft, self.substrate.query_info(&self.tag, &flat))
            .await
    }

    pub(crate) async fn query_block(&self, height: u64, options: &[RequestOption]) -> Result<Block> {
        let (draft, flat) = self.prepare(options)?;
        self.guard(
            "query_block",
            &draft,
            self.substrate.query_block(&self.tag, height, &flat),
        )
        .await
    }
}

fn render_fields(fields: &BTreeMap<String, String>) -> String {
    fields
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(" ")
}
