//! Request configuration builder
//!
//! Callers describe a request as an ordered list of [`RequestOption`]
//! mutators. Every call folds the list over an empty [`RequestOptions`]
//! draft and then flattens the draft into an immutable
//! [`FlattenedOptions`] snapshot.
//!
//! Folding rules:
//! - scalar fields: the last mutator wins
//! - map and list fields: entries merge in order
//! - the dependent transaction id is never cleared once set
//!
//! ```
//! use substrate_common::options::{flatten_options, with_header, with_params, with_timestamp_generator};
//!
//! let options = vec![
//!     with_header("x-tenant", "acme"),
//!     with_params(vec!["alice", "bob"]),
//!     with_timestamp_generator(|_| "2000-01-01T00:00:00Z".to_string()),
//! ];
//! let flat = flatten_options(&options).unwrap();
//! assert_eq!(flat.params, br#"["alice","bob"]"#.to_vec());
//! assert_eq!(flat.timestamp, "2000-01-01T00:00:00Z");
//! ```

use crate::{
    context::CallContext,
    types::{FlattenedOptions, Response},
    Error, Result,
};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{SecondsFormat, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Source of the per-call "now" timestamp
pub type TimestampGenerator = Arc<dyn Fn(&CallContext) -> String + Send + Sync>;

type ParamsEncoder = Arc<dyn Fn() -> serde_json::Result<Vec<u8>> + Send + Sync>;

/// Shared slot that receives the raw response of a successful call
#[derive(Debug, Clone, Default)]
pub struct ResponseCapture(Arc<Mutex<Option<Response>>>);

impl ResponseCapture {
    /// Empty capture
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a response, replacing any previous one
    pub fn store(&self, response: Response) {
        *self.0.lock() = Some(response);
    }

    /// Copy of the captured response
    pub fn get(&self) -> Option<Response> {
        self.0.lock().clone()
    }

    /// Remove and return the captured response
    pub fn take(&self) -> Option<Response> {
        self.0.lock().take()
    }
}

/// Mutable request draft that mutators operate on
#[derive(Default)]
pub struct RequestOptions {
    /// Cancellation carrier (not flattened)
    pub context: Option<CallContext>,

    /// Extra fields for the call span (not flattened)
    pub log_fields: BTreeMap<String, String>,

    /// Extra transport headers
    pub headers: BTreeMap<String, String>,

    /// Target endpoint
    pub endpoint: Option<String>,

    /// Request id
    pub id: Option<String>,

    /// Authorization token
    pub auth_token: Option<String>,

    /// Deferred parameter encoder; `None` encodes as `[]`
    params: Option<ParamsEncoder>,

    /// Transient data
    pub transient: BTreeMap<String, Vec<u8>>,

    /// Response capture target (not flattened)
    pub response: Option<ResponseCapture>,

    /// Timestamp source (not flattened)
    pub timestamp_generator: Option<TimestampGenerator>,

    /// Endorsement filter
    pub msp_filter: Vec<String>,

    /// Minimum endorsing peers
    pub min_endorsers: u32,

    /// Creator identity
    pub creator: Option<String>,

    /// Transaction this call must be ordered after
    pub dependent_tx_id: Option<String>,

    /// Write-polling toggle; `None` means the caller expressed no choice
    pub disable_write_polling: Option<bool>,

    /// Fetch downgrade hint
    pub cc_fetch_url_downgrade: bool,

    /// Fetch proxy hint
    pub cc_fetch_url_proxy: Option<String>,
}

impl fmt::Debug for RequestOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestOptions")
            .field("context", &self.context)
            .field("log_fields", &self.log_fields)
            .field("headers", &self.headers)
            .field("endpoint", &self.endpoint)
            .field("id", &self.id)
            .field("has_params", &self.params.is_some())
            .field("transient_keys", &self.transient.keys().collect::<Vec<_>>())
            .field("msp_filter", &self.msp_filter)
            .field("min_endorsers", &self.min_endorsers)
            .field("creator", &self.creator)
            .field("dependent_tx_id", &self.dependent_tx_id)
            .field("disable_write_polling", &self.disable_write_polling)
            .finish_non_exhaustive()
    }
}

impl RequestOptions {
    /// Apply `options` in order to an empty draft
    pub fn fold(options: &[RequestOption]) -> Self {
        let mut draft = Self::default();
        for option in options {
            option.apply(&mut draft);
        }
        draft
    }

    /// Attached carrier, if any
    pub fn context(&self) -> Option<&CallContext> {
        self.context.as_ref()
    }

    /// Attached carrier, or a background one
    pub fn context_or_background(&self) -> CallContext {
        self.context.clone().unwrap_or_default()
    }

    /// Response capture target, if any
    pub fn response_capture(&self) -> Option<&ResponseCapture> {
        self.response.as_ref()
    }

    /// Resolve the draft into an immutable snapshot
    pub fn flatten(&self) -> Result<FlattenedOptions> {
        let params = match &self.params {
            Some(encode) => encode()?,
            None => b"[]".to_vec(),
        };

        Ok(FlattenedOptions {
            headers: self.headers.clone(),
            endpoint: self.endpoint.clone(),
            id: self.id.clone(),
            auth_token: self.auth_token.clone(),
            params,
            transient: self.transient.clone(),
            timestamp: self.timestamp(),
            msp_filter: self.msp_filter.clone(),
            min_endorsers: self.min_endorsers,
            creator: self.creator.clone(),
            dependent_tx_id: self.dependent_tx_id.clone(),
            disable_write_polling: self.disable_write_polling.unwrap_or(false),
            cc_fetch_url_downgrade: self.cc_fetch_url_downgrade,
            cc_fetch_url_proxy: self.cc_fetch_url_proxy.clone(),
        })
    }

    fn timestamp(&self) -> String {
        match &self.timestamp_generator {
            Some(generate) => generate(&self.context_or_background()),
            None => Utc::now().to_rfc3339_opts(SecondsFormat::AutoSi, true),
        }
    }
}

/// One mutation of a [`RequestOptions`] draft.
///
/// Cheap to clone, so option lists can be reused across calls.
#[derive(Clone)]
pub struct RequestOption(Arc<dyn Fn(&mut RequestOptions) + Send + Sync>);

impl RequestOption {
    /// Custom mutator
    pub fn new(mutate: impl Fn(&mut RequestOptions) + Send + Sync + 'static) -> Self {
        Self(Arc::new(mutate))
    }

    /// Apply to a draft
    pub fn apply(&self, draft: &mut RequestOptions) {
        (self.0)(draft)
    }
}

impl fmt::Debug for RequestOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RequestOption(..)")
    }
}

/// Flatten a list of options into an immutable snapshot.
///
/// Fails only if the parameters cannot be serialized.
pub fn flatten_options(options: &[RequestOption]) -> Result<FlattenedOptions> {
    RequestOptions::fold(options).flatten()
}

/// Carrier selected by a list of options
pub fn flatten_context(options: &[RequestOption]) -> Result<CallContext> {
    RequestOptions::fold(options)
        .context
        .ok_or_else(|| Error::Config("expected context".to_string()))
}

/// Encode program source the way the simulated backend expects it
pub fn encode_program_bytes(source: &str) -> String {
    STANDARD.encode(source.as_bytes())
}

/// Attach a cancellation carrier
pub fn with_context(ctx: CallContext) -> RequestOption {
    RequestOption::new(move |r| r.context = Some(ctx.clone()))
}

/// Add a field to the call span
pub fn with_log_field(key: impl Into<String>, value: impl fmt::Display) -> RequestOption {
    let (key, value) = (key.into(), value.to_string());
    RequestOption::new(move |r| {
        r.log_fields.insert(key.clone(), value.clone());
    })
}

/// Add several fields to the call span
pub fn with_log_fields<K, V>(fields: impl IntoIterator<Item = (K, V)>) -> RequestOption
where
    K: Into<String>,
    V: fmt::Display,
{
    let fields: Vec<(String, String)> = fields
        .into_iter()
        .map(|(k, v)| (k.into(), v.to_string()))
        .collect();
    RequestOption::new(move |r| r.log_fields.extend(fields.iter().cloned()))
}

/// Add a transport header
pub fn with_header(key: impl Into<String>, value: impl Into<String>) -> RequestOption {
    let (key, value) = (key.into(), value.into());
    RequestOption::new(move |r| {
        r.headers.insert(key.clone(), value.clone());
    })
}

/// Target a specific endpoint
pub fn with_endpoint(endpoint: impl Into<String>) -> RequestOption {
    let endpoint = endpoint.into();
    RequestOption::new(move |r| r.endpoint = Some(endpoint.clone()))
}

/// Set the request id
pub fn with_id(id: impl Into<String>) -> RequestOption {
    let id = id.into();
    RequestOption::new(move |r| r.id = Some(id.clone()))
}

/// Pass authorization for the transaction issuer
pub fn with_auth_token(token: impl Into<String>) -> RequestOption {
    let token = token.into();
    RequestOption::new(move |r| r.auth_token = Some(token.clone()))
}

/// Set the endpoint parameters.
///
/// Serialization is deferred until the options are flattened, so a value
/// that cannot be encoded fails the call before anything is sent.
pub fn with_params<T>(params: T) -> RequestOption
where
    T: Serialize + Send + Sync + 'static,
{
    let params = Arc::new(params);
    let encode: ParamsEncoder = Arc::new(move || serde_json::to_vec(&*params));
    RequestOption::new(move |r| r.params = Some(encode.clone()))
}

/// Add one transient data entry
pub fn with_transient_data(key: impl Into<String>, value: impl Into<Vec<u8>>) -> RequestOption {
    let (key, value) = (key.into(), value.into());
    RequestOption::new(move |r| {
        r.transient.insert(key.clone(), value.clone());
    })
}

/// Add several transient data entries
pub fn with_transient_data_map<K, V>(data: impl IntoIterator<Item = (K, V)>) -> RequestOption
where
    K: Into<String>,
    V: Into<Vec<u8>>,
{
    let data: Vec<(String, Vec<u8>)> = data
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect();
    RequestOption::new(move |r| r.transient.extend(data.iter().cloned()))
}

/// Capture the raw response of a successful call
pub fn with_response(capture: ResponseCapture) -> RequestOption {
    RequestOption::new(move |r| r.response = Some(capture.clone()))
}

/// Resolve "now" through `generate` instead of the wall clock
pub fn with_timestamp_generator(
    generate: impl Fn(&CallContext) -> String + Send + Sync + 'static,
) -> RequestOption {
    let generate: TimestampGenerator = Arc::new(generate);
    RequestOption::new(move |r| r.timestamp_generator = Some(generate.clone()))
}

/// Add organizations to the endorsement filter
pub fn with_msp_filter<S: Into<String>>(filter: impl IntoIterator<Item = S>) -> RequestOption {
    let filter: Vec<String> = filter.into_iter().map(Into::into).collect();
    RequestOption::new(move |r| {
        for msp in &filter {
            if !r.msp_filter.contains(msp) {
                r.msp_filter.push(msp.clone());
            }
        }
    })
}

/// Require a minimum number of endorsing peers
pub fn with_min_endorsers(min_endorsers: u32) -> RequestOption {
    RequestOption::new(move |r| r.min_endorsers = min_endorsers)
}

/// Act as `creator` (simulated sessions)
pub fn with_creator(creator: impl Into<String>) -> RequestOption {
    let creator = creator.into();
    RequestOption::new(move |r| r.creator = Some(creator.clone()))
}

/// Order this call after `tx_id`. An empty id leaves the draft untouched.
pub fn with_dependent_tx_id(tx_id: impl Into<String>) -> RequestOption {
    let tx_id = tx_id.into();
    RequestOption::new(move |r| {
        if !tx_id.is_empty() {
            r.dependent_tx_id = Some(tx_id.clone());
        }
    })
}

/// Order this call after `tx_id` unless the caller already chose otherwise.
///
/// The id is only filled in when no dependent transaction is set and the
/// caller did not explicitly enable write polling, which asks for the call
/// to wait on full consensus on its own.
pub fn with_conditional_dependent_tx_id(tx_id: impl Into<String>) -> RequestOption {
    let tx_id = tx_id.into();
    RequestOption::new(move |r| {
        if tx_id.is_empty() || r.dependent_tx_id.is_some() {
            return;
        }
        if r.disable_write_polling == Some(false) {
            return;
        }
        r.dependent_tx_id = Some(tx_id.clone());
    })
}

/// Toggle polling for full consensus after a write
pub fn with_disable_write_polling(disable: bool) -> RequestOption {
    RequestOption::new(move |r| r.disable_write_polling = Some(disable))
}

/// Allow https to http downgrade for backend-side fetches
pub fn with_cc_fetch_url_downgrade(downgrade: bool) -> RequestOption {
    RequestOption::new(move |r| r.cc_fetch_url_downgrade = downgrade)
}

/// Route backend-side fetches through `proxy`
pub fn with_cc_fetch_url_proxy(proxy: impl Into<String>) -> RequestOption {
    let proxy = proxy.into();
    RequestOption::new(move |r| r.cc_fetch_url_proxy = Some(proxy.clone()))
}
