//! In-memory substrate
//!
//! [`MockSubstrate`] keeps every session's ledger in process. Endpoints are
//! plain closures registered either as writes (commit a transaction and
//! append a block) or queries (never change state). A failing endpoint
//! leaves the ledger untouched.
//!
//! The batch built-ins (`$batch_schedule`, `$batch_pending`,
//! `$batch_complete`) are always available.

use crate::{
    error::SubstrateError,
    substrate::Substrate,
    types::{Block, FlattenedOptions, Response, Transaction},
    Error, Result,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Storage key written by the standard batch completion hook
pub const RECENT_INPUT_KEY: &str = "RECENT_INPUT";

/// Batch protocol built-ins
pub mod builtin {
    /// `[batch_name, payload, when_rfc3339] -> {"request_id"}`
    pub const BATCH_SCHEDULE: &str = "$batch_schedule";
    /// `[batch_name] -> [{"request_id", "message"}]`
    pub const BATCH_PENDING: &str = "$batch_pending";
    /// `[batch_name, request_id, response | null, error | null]`
    pub const BATCH_COMPLETE: &str = "$batch_complete";
}

/// Failure returned by an endpoint; becomes an error [`Response`]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct EndpointError {
    /// Error code reported in the response
    pub code: i32,
    /// Error message reported in the response
    pub message: String,
}

impl EndpointError {
    /// Endpoint failure with an explicit code
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Bad input
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(400, message)
    }
}

impl From<serde_json::Error> for EndpointError {
    fn from(err: serde_json::Error) -> Self {
        Self::bad_request(err.to_string())
    }
}

/// Endpoint outcome
pub type EndpointResult = std::result::Result<Value, EndpointError>;

type EndpointFn = Arc<dyn Fn(&mut Invocation<'_>) -> EndpointResult + Send + Sync>;

/// Completion hook: `(invocation, batch_name, response, error)`
type BatchHookFn =
    Arc<dyn Fn(&mut Invocation<'_>, &str, Option<&Value>, Option<&str>) -> EndpointResult + Send + Sync>;

#[derive(Clone)]
struct Endpoint {
    write: bool,
    run: EndpointFn,
}

/// Scheduled batch entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct BatchEntry {
    request_id: String,
    batch_name: String,
    message: Value,
    when: DateTime<Utc>,
    completed: bool,
}

/// Session state; this is what snapshots capture
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct Ledger {
    program: Option<String>,
    storage: BTreeMap<String, Value>,
    batches: Vec<BatchEntry>,
    batching_paused: bool,
    blocks: Vec<Block>,
    committed: BTreeSet<String>,
    next_tx: u64,
}

impl Ledger {
    fn commit(&mut self, chaincode_id: &str) -> String {
        self.next_tx += 1;
        let id = format!("tx-{}", self.next_tx);

        let previous = self.blocks.last().map(|b| b.hash.as_str()).unwrap_or("");
        let mut hasher = Sha256::new();
        hasher.update(previous.as_bytes());
        hasher.update(id.as_bytes());
        let hash = hasher
            .finalize()
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect::<String>();

        self.blocks.push(Block {
            hash,
            transactions: vec![Transaction {
                id: id.clone(),
                chaincode_id: chaincode_id.to_string(),
                ..Default::default()
            }],
        });
        self.committed.insert(id.clone());
        id
    }
}

#[derive(Debug)]
struct Session {
    simulated: bool,
    chaincode_id: String,
    creator: Option<String>,
    attributes: BTreeMap<String, String>,
    ledger: Ledger,
}

/// A boundary operation seen by the mock
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    /// Operation name (`call`, `init`, `query_info`, ...)
    pub operation: String,
    /// Session tag, if the operation names one
    pub tag: Option<String>,
    /// Endpoint, for `call`
    pub method: Option<String>,
    /// Options, for operations that take them
    pub options: Option<FlattenedOptions>,
}

#[derive(Default)]
struct MockState {
    sessions: BTreeMap<String, Session>,
    calls: Vec<RecordedCall>,
    failures: VecDeque<(Option<String>, SubstrateError)>,
    close_failures: VecDeque<SubstrateError>,
}

/// Endpoint execution context
pub struct Invocation<'a> {
    ledger: &'a mut Ledger,
    params: Vec<Value>,
    options: &'a FlattenedOptions,
    creator: Option<&'a str>,
    attributes: &'a BTreeMap<String, String>,
}

impl<'a> Invocation<'a> {
    /// All positional parameters
    pub fn params(&self) -> &[Value] {
        &self.params
    }

    /// Decode positional parameter `index`
    pub fn param<T: DeserializeOwned>(&self, index: usize) -> std::result::Result<T, EndpointError> {
        let value = self
            .params
            .get(index)
            .cloned()
            .ok_or_else(|| EndpointError::bad_request(format!("missing parameter {}", index)))?;
        Ok(serde_json::from_value(value)?)
    }

    /// Options the call was made with
    pub fn options(&self) -> &FlattenedOptions {
        self.options
    }

    /// Effective creator: the per-call override, else the session identity
    pub fn creator(&self) -> Option<&str> {
        self.options.creator.as_deref().or(self.creator)
    }

    /// Identity attributes set on a simulated session
    pub fn attributes(&self) -> &BTreeMap<String, String> {
        self.attributes
    }

    /// The call's "now"
    pub fn now(&self) -> std::result::Result<DateTime<Utc>, EndpointError> {
        if self.options.timestamp.is_empty() {
            return Ok(Utc::now());
        }
        parse_time(&self.options.timestamp)
    }

    /// Read a storage key
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.ledger.storage.get(key)
    }

    /// Write a storage key
    pub fn put(&mut self, key: impl Into<String>, value: Value) {
        self.ledger.storage.insert(key.into(), value);
    }

    /// Queue a batch entry; returns its request id
    pub fn schedule(&mut self, batch_name: &str, message: Value, when: DateTime<Utc>) -> String {
        let request_id = Uuid::now_v7().to_string();
        self.ledger.batches.push(BatchEntry {
            request_id: request_id.clone(),
            batch_name: batch_name.to_string(),
            message,
            when,
            completed: false,
        });
        request_id
    }

    fn pending(&self, batch_name: &str, now: DateTime<Utc>) -> Vec<&BatchEntry> {
        if self.ledger.batching_paused {
            return Vec::new();
        }
        let mut due: Vec<&BatchEntry> = self
            .ledger
            .batches
            .iter()
            .filter(|e| !e.completed && e.batch_name == batch_name && e.when <= now)
            .collect();
        due.sort_by_key(|e| e.when);
        due
    }
}

fn parse_time(text: &str) -> std::result::Result<DateTime<Utc>, EndpointError> {
    DateTime::parse_from_rfc3339(text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| EndpointError::bad_request(format!("invalid timestamp {:?}: {}", text, e)))
}

/// In-memory [`Substrate`]
pub struct MockSubstrate {
    endpoints: BTreeMap<String, Endpoint>,
    batch_hooks: BTreeMap<String, BatchHookFn>,
    default_batch_hook: Option<BatchHookFn>,
    state: Mutex<MockState>,
}

impl fmt::Debug for MockSubstrate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockSubstrate")
            .field("endpoints", &self.endpoints.keys().collect::<Vec<_>>())
            .field("batch_hooks", &self.batch_hooks.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl Default for MockSubstrate {
    fn default() -> Self {
        Self::new()
    }
}

impl MockSubstrate {
    /// Backend with only the batch built-ins
    pub fn new() -> Self {
        Self {
            endpoints: BTreeMap::new(),
            batch_hooks: BTreeMap::new(),
            default_batch_hook: None,
            state: Mutex::new(MockState::default()),
        }
    }

    /// Register a write endpoint
    pub fn endpoint<F>(mut self, name: impl Into<String>, run: F) -> Self
    where
        F: Fn(&mut Invocation<'_>) -> EndpointResult + Send + Sync + 'static,
    {
        self.endpoints.insert(
            name.into(),
            Endpoint {
                write: true,
                run: Arc::new(run),
            },
        );
        self
    }

    /// Register a read-only endpoint
    pub fn query<F>(mut self, name: impl Into<String>, run: F) -> Self
    where
        F: Fn(&mut Invocation<'_>) -> EndpointResult + Send + Sync + 'static,
    {
        self.endpoints.insert(
            name.into(),
            Endpoint {
                write: false,
                run: Arc::new(run),
            },
        );
        self
    }

    /// Completion hook for one batch
    pub fn batch_handler<F>(mut self, batch_name: impl Into<String>, hook: F) -> Self
    where
        F: Fn(&mut Invocation<'_>, &str, Option<&Value>, Option<&str>) -> EndpointResult
            + Send
            + Sync
            + 'static,
    {
        self.batch_hooks.insert(batch_name.into(), Arc::new(hook));
        self
    }

    /// Completion hook for batches without their own
    pub fn default_batch_handler<F>(mut self, hook: F) -> Self
    where
        F: Fn(&mut Invocation<'_>, &str, Option<&Value>, Option<&str>) -> EndpointResult
            + Send
            + Sync
            + 'static,
    {
        self.default_batch_hook = Some(Arc::new(hook));
        self
    }

    /// Endpoint set served by the `substrate-mock` plugin
    pub fn standard() -> Self {
        Self::new()
            .endpoint("put", |inv| {
                let key: String = inv.param(0)?;
                let value: Value = inv.param(1)?;
                inv.put(key, value);
                Ok(Value::Null)
            })
            .query("get", |inv| {
                let key: String = inv.param(0)?;
                Ok(inv.get(&key).cloned().unwrap_or(Value::Null))
            })
            .query("echo", |inv| Ok(Value::Array(inv.params().to_vec())))
            .query("whoami", |inv| {
                Ok(json!({
                    "creator": inv.creator(),
                    "attributes": inv.attributes(),
                }))
            })
            .endpoint("fail", |inv| {
                let message: String = inv.param(0).unwrap_or_else(|_| "failed".to_string());
                Err(EndpointError::new(500, message))
            })
            .endpoint("schedule_request", |inv| {
                let batch_name: String = inv.param(0)?;
                let message: Value = inv.param(1)?;
                let when: String = inv.param(2)?;
                let when = parse_time(&when)?;
                let request_id = inv.schedule(&batch_name, message, when);
                Ok(json!({ "request_id": request_id }))
            })
            .endpoint("schedule_request_now", |inv| {
                let batch_name: String = inv.param(0)?;
                let message: Value = inv.param(1)?;
                let now = inv.now()?;
                let request_id = inv.schedule(&batch_name, message, now);
                Ok(json!({ "request_id": request_id }))
            })
            .endpoint("set_batching_paused", |inv| {
                let paused: bool = inv.param(0)?;
                inv.ledger.batching_paused = paused;
                Ok(Value::Null)
            })
            .query("get_recent_input", |inv| {
                Ok(match inv.get(RECENT_INPUT_KEY) {
                    Some(Value::String(s)) => Value::String(s.clone()),
                    Some(other) => Value::String(other.to_string()),
                    None => Value::String(String::new()),
                })
            })
            .default_batch_handler(|inv, _batch, response, error| {
                let recent = match (error, response) {
                    (Some(error), _) => Value::String(format!("error: {}", error)),
                    (None, Some(response)) => response.clone(),
                    (None, None) => Value::Null,
                };
                inv.put(RECENT_INPUT_KEY, recent);
                Ok(Value::Null)
            })
    }

    /// Fail the next `call` with `err` before it reaches any endpoint
    pub fn fail_next(&self, err: SubstrateError) {
        self.state.lock().failures.push_back((None, err));
    }

    /// Fail the next `call` to `method` with `err`
    pub fn fail_next_on(&self, method: impl Into<String>, err: SubstrateError) {
        self.state.lock().failures.push_back((Some(method.into()), err));
    }

    /// Fail the next session close with `err`, leaving the session open
    pub fn fail_next_close(&self, err: SubstrateError) {
        self.state.lock().close_failures.push_back(err);
    }

    /// Every operation seen so far
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.state.lock().calls.clone()
    }

    /// Recorded `call` operations only
    pub fn endpoint_calls(&self) -> Vec<RecordedCall> {
        self.calls()
            .into_iter()
            .filter(|c| c.operation == "call")
            .collect()
    }

    fn record(
        state: &mut MockState,
        operation: &str,
        tag: Option<&str>,
        method: Option<&str>,
        options: Option<&FlattenedOptions>,
    ) {
        state.calls.push(RecordedCall {
            operation: operation.to_string(),
            tag: tag.map(str::to_string),
            method: method.map(str::to_string),
            options: options.cloned(),
        });
    }

    fn open(&self, simulated: bool, chaincode_id: String, ledger: Ledger) -> String {
        let prefix = if simulated { "mock" } else { "rpc" };
        let tag = format!("{}-{}", prefix, Uuid::new_v4());
        let mut state = self.state.lock();
        Self::record(&mut state, if simulated { "new_simulated" } else { "new_session" }, Some(&tag), None, None);
        state.sessions.insert(
            tag.clone(),
            Session {
                simulated,
                chaincode_id,
                creator: None,
                attributes: BTreeMap::new(),
                ledger,
            },
        );
        info!(tag = %tag, simulated, "session opened");
        tag
    }

    fn close(&self, tag: &str, simulated: bool) -> Result<()> {
        let mut state = self.state.lock();
        Self::record(&mut state, if simulated { "close_simulated" } else { "close_session" }, Some(tag), None, None);
        if let Some(err) = state.close_failures.pop_front() {
            return Err(Error::Application(err));
        }
        match state.sessions.get(tag) {
            Some(session) if session.simulated == simulated => {
                state.sessions.remove(tag);
                debug!(tag, "session closed");
                Ok(())
            }
            Some(_) => Err(kind_mismatch(simulated)),
            None => Err(unknown_session(tag)),
        }
    }

    fn run_endpoint(&self, session: &mut Session, method: &str, options: &FlattenedOptions) -> Response {
        let params = match decode_params(&options.params) {
            Ok(params) => params,
            Err(e) => return failure(&e),
        };

        let (write, outcome) = {
            let mut working = session.ledger.clone();
            let mut inv = Invocation {
                ledger: &mut working,
                params,
                options,
                creator: session.creator.as_deref(),
                attributes: &session.attributes,
            };

            let (write, outcome) = match method {
                builtin::BATCH_SCHEDULE => (true, batch_schedule(&mut inv)),
                builtin::BATCH_PENDING => (false, batch_pending(&inv)),
                builtin::BATCH_COMPLETE => (true, self.batch_complete(&mut inv)),
                other => match self.endpoints.get(other) {
                    Some(endpoint) => (endpoint.write, (endpoint.run)(&mut inv)),
                    None => {
                        return failure(&EndpointError::new(404, format!("unknown endpoint {:?}", other)))
                    }
                },
            };

            match outcome {
                Ok(value) if write => (true, Ok((value, working))),
                Ok(value) => (false, Ok((value, Ledger::default()))),
                Err(e) => (write, Err(e)),
            }
        };

        match outcome {
            Ok((value, working)) => {
                let result = match serde_json::to_vec(&value) {
                    Ok(result) => result,
                    Err(e) => return failure(&EndpointError::new(500, e.to_string())),
                };
                if write {
                    session.ledger = working;
                    let tx = session.ledger.commit(&session.chaincode_id);
                    debug!(method, tx = %tx, "write committed");
                    Response::success(result, tx)
                } else {
                    Response::success(result, "")
                }
            }
            Err(e) => {
                debug!(method, error = %e, "endpoint failed");
                failure(&e)
            }
        }
    }

    fn batch_complete(&self, inv: &mut Invocation<'_>) -> EndpointResult {
        let batch_name: String = inv.param(0)?;
        let request_id: String = inv.param(1)?;
        let response: Option<Value> = inv.param(2)?;
        let error: Option<String> = inv.param(3)?;

        let entry = inv
            .ledger
            .batches
            .iter_mut()
            .find(|e| e.request_id == request_id && e.batch_name == batch_name)
            .ok_or_else(|| EndpointError::new(404, format!("unknown batch request {}", request_id)))?;
        if entry.completed {
            return Err(EndpointError::new(
                409,
                format!("batch request {} already completed", request_id),
            ));
        }
        entry.completed = true;

        let hook = self
            .batch_hooks
            .get(&batch_name)
            .or(self.default_batch_hook.as_ref())
            .cloned();
        match hook {
            Some(hook) => hook(inv, &batch_name, response.as_ref(), error.as_deref()),
            None => Ok(Value::Null),
        }
    }

    fn with_session<T>(
        &self,
        tag: &str,
        f: impl FnOnce(&mut Session) -> Result<T>,
    ) -> Result<T> {
        let mut state = self.state.lock();
        let session = state
            .sessions
            .get_mut(tag)
            .ok_or_else(|| unknown_session(tag))?;
        f(session)
    }
}

fn batch_schedule(inv: &mut Invocation<'_>) -> EndpointResult {
    let batch_name: String = inv.param(0)?;
    let message: Value = inv.param(1)?;
    let when: String = inv.param(2)?;
    let when = parse_time(&when)?;
    let request_id = inv.schedule(&batch_name, message, when);
    Ok(json!({ "request_id": request_id }))
}

fn batch_pending(inv: &Invocation<'_>) -> EndpointResult {
    let batch_name: String = inv.param(0)?;
    let now = inv.now()?;
    let due: Vec<Value> = inv
        .pending(&batch_name, now)
        .into_iter()
        .map(|e| json!({ "request_id": e.request_id, "message": e.message }))
        .collect();
    Ok(Value::Array(due))
}

fn decode_params(params: &[u8]) -> std::result::Result<Vec<Value>, EndpointError> {
    if params.is_empty() {
        return Ok(Vec::new());
    }
    match serde_json::from_slice(params)? {
        Value::Array(values) => Ok(values),
        other => Ok(vec![other]),
    }
}

fn failure(err: &EndpointError) -> Response {
    let detail = json!({ "code": err.code, "message": err.message });
    Response::failure(err.code, err.message.clone(), detail.to_string().into_bytes())
}

fn unknown_session(tag: &str) -> Error {
    Error::Application(SubstrateError::new(format!("unknown session {:?}", tag)))
}

fn kind_mismatch(simulated_expected: bool) -> Error {
    let expected = if simulated_expected { "simulated" } else { "live" };
    Error::Application(SubstrateError::new(format!("not a {} session", expected)))
}

#[async_trait]
impl Substrate for MockSubstrate {
    async fn new_session(&self) -> Result<String> {
        Ok(self.open(false, "substrate".to_string(), Ledger::default()))
    }

    async fn close_session(&self, tag: &str) -> Result<()> {
        self.close(tag, false)
    }

    async fn new_simulated(
        &self,
        name: &str,
        version: &str,
        snapshot: Option<&[u8]>,
    ) -> Result<String> {
        let ledger = match snapshot {
            Some(bytes) => serde_json::from_slice(bytes).map_err(|e| {
                Error::Application(SubstrateError::new(format!("invalid snapshot: {}", e)))
            })?,
            None => Ledger::default(),
        };
        Ok(self.open(true, format!("{}:{}", name, version), ledger))
    }

    async fn set_simulated_identity(
        &self,
        tag: &str,
        creator: &str,
        attributes: &BTreeMap<String, String>,
    ) -> Result<()> {
        Self::record(&mut self.state.lock(), "set_simulated_identity", Some(tag), None, None);
        self.with_session(tag, |session| {
            if !session.simulated {
                return Err(kind_mismatch(true));
            }
            session.creator = Some(creator.to_string());
            session.attributes = attributes.clone();
            Ok(())
        })
    }

    async fn snapshot_simulated(&self, tag: &str) -> Result<Vec<u8>> {
        Self::record(&mut self.state.lock(), "snapshot_simulated", Some(tag), None, None);
        self.with_session(tag, |session| {
            if !session.simulated {
                return Err(kind_mismatch(true));
            }
            Ok(serde_json::to_vec(&session.ledger)?)
        })
    }

    async fn close_simulated(&self, tag: &str) -> Result<()> {
        self.close(tag, true)
    }

    async fn init(&self, tag: &str, program: &str, options: &FlattenedOptions) -> Result<()> {
        Self::record(&mut self.state.lock(), "init", Some(tag), None, Some(options));
        self.with_session(tag, |session| {
            session.ledger.program = Some(program.to_string());
            info!(tag, "program installed");
            Ok(())
        })
    }

    async fn call(&self, tag: &str, method: &str, options: &FlattenedOptions) -> Result<Response> {
        let mut state = self.state.lock();
        Self::record(&mut state, "call", Some(tag), Some(method), Some(options));

        let injected = state
            .failures
            .iter()
            .position(|(target, _)| target.as_deref().map_or(true, |t| t == method));
        if let Some((_, err)) = injected.and_then(|i| state.failures.remove(i)) {
            return Err(Error::Application(err));
        }

        let session = state
            .sessions
            .get_mut(tag)
            .ok_or_else(|| unknown_session(tag))?;

        if let Some(dependency) = &options.dependent_tx_id {
            if !session.ledger.committed.contains(dependency) {
                return Err(Error::Application(SubstrateError::timeout(format!(
                    "timed out waiting for transaction {}",
                    dependency
                ))));
            }
        }

        Ok(self.run_endpoint(session, method, options))
    }

    async fn query_info(&self, tag: &str, options: &FlattenedOptions) -> Result<u64> {
        Self::record(&mut self.state.lock(), "query_info", Some(tag), None, Some(options));
        self.with_session(tag, |session| Ok(session.ledger.blocks.len() as u64))
    }

    async fn query_block(
        &self,
        tag: &str,
        height: u64,
        options: &FlattenedOptions,
    ) -> Result<Block> {
        Self::record(&mut self.state.lock(), "query_block", Some(tag), None, Some(options));
        self.with_session(tag, |session| {
            usize::try_from(height)
                .ok()
                .and_then(|h| session.ledger.blocks.get(h))
                .cloned()
                .ok_or_else(|| {
                    Error::Application(SubstrateError::new(format!("no block at height {}", height)))
                })
        })
    }

    async fn health_check(&self, x: i64) -> Result<i64> {
        Ok(x)
    }
}
