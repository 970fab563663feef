//! Host side of the plugin channel
//!
//! The byte channel is owned by two background tasks. Callers hand whole
//! frames to the writer and wait on a per-request slot that the reader
//! fills, so a caller dropped mid-call never leaves a partial frame on the
//! wire. Replies to abandoned requests are discarded by id. A reply the
//! host cannot place (undecodable, or an id it never issued) means the
//! stream is out of sync; every waiting and later call then fails with a
//! transport error.

use crate::{
    rpc::protocol::{
        method, CallArgs, HealthCheckArgs, InitArgs, NewSimulatedArgs, NoArgs, Outcome,
        QueryBlockArgs, QueryInfoArgs, Reply, Request, SetIdentityArgs, TagArgs,
    },
    substrate::Substrate,
    types::{Block, FlattenedOptions, Response},
    Error, Result,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Requests in flight, keyed by id
#[derive(Default)]
struct Pending {
    waiters: HashMap<u64, oneshot::Sender<Result<Reply>>>,
    failed: Option<String>,
}

impl Pending {
    fn register(&mut self, id: u64) -> Result<oneshot::Receiver<Result<Reply>>> {
        if let Some(reason) = &self.failed {
            return Err(Error::Transport(reason.clone()));
        }
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(id, tx);
        Ok(rx)
    }

    /// Poison the channel and wake everyone still waiting
    fn fail(&mut self, reason: String) {
        warn!(error = %reason, waiting = self.waiters.len(), "plugin channel failed");
        for (_, waiter) in self.waiters.drain() {
            let _ = waiter.send(Err(Error::Transport(reason.clone())));
        }
        self.failed.get_or_insert(reason);
    }
}

/// [`Substrate`] implementation that forwards every operation to a plugin
pub struct PluginRpc {
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    pending: Arc<Mutex<Pending>>,
    next_id: AtomicU64,
    reader: JoinHandle<()>,
}

impl std::fmt::Debug for PluginRpc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRpc")
            .field("next_id", &self.next_id.load(Ordering::Relaxed))
            .field("in_flight", &self.pending.lock().waiters.len())
            .finish_non_exhaustive()
    }
}

impl PluginRpc {
    /// Talk to a plugin over an already established byte channel.
    ///
    /// Spawns the channel tasks, so it must be called inside a tokio runtime.
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncBufRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let pending = Arc::new(Mutex::new(Pending::default()));
        let (outbound, frames) = mpsc::unbounded_channel();

        tokio::spawn(write_frames(writer, frames, pending.clone()));
        let reader = tokio::spawn(read_replies(reader, pending.clone()));

        Self {
            outbound,
            pending,
            next_id: AtomicU64::new(1),
            reader,
        }
    }

    async fn invoke<A, T>(&self, method: &str, args: &A) -> Result<T>
    where
        A: Serialize,
        T: DeserializeOwned + Default,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = Request {
            id,
            method: method.to_string(),
            params: serde_json::to_value(args)?,
        };
        let mut frame = serde_json::to_vec(&request)?;
        frame.push(b'\n');

        let waiter = self.pending.lock().register(id)?;

        trace!(id, method, "sending request");
        if self.outbound.send(frame).is_err() {
            self.pending.lock().waiters.remove(&id);
            return Err(Error::Transport("plugin writer stopped".to_string()));
        }

        let reply = waiter
            .await
            .map_err(|_| Error::Transport("plugin channel dropped the request".to_string()))??;

        if let Some(error) = reply.error {
            return Err(Error::Transport(error));
        }

        let outcome: Outcome<T> =
            serde_json::from_value(reply.result.unwrap_or(serde_json::Value::Null))
                .map_err(|e| Error::Transport(format!("undecodable result: {}", e)))?;

        match outcome.err {
            Some(err) => Err(Error::Application(err)),
            None => Ok(outcome.value),
        }
    }
}

impl Drop for PluginRpc {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn write_frames<W>(
    mut writer: W,
    mut frames: mpsc::UnboundedReceiver<Vec<u8>>,
    pending: Arc<Mutex<Pending>>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = frames.recv().await {
        let written = match writer.write_all(&frame).await {
            Ok(()) => writer.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            pending.lock().fail(format!("write to plugin failed: {}", e));
            return;
        }
    }
    debug!("plugin writer finished");
}

async fn read_replies<R>(mut reader: R, pending: Arc<Mutex<Pending>>)
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        let reply = match reader.read_line(&mut line).await {
            Ok(0) => {
                pending.lock().fail("plugin closed the connection".to_string());
                return;
            }
            Ok(_) => match serde_json::from_str::<Reply>(&line) {
                Ok(reply) => reply,
                Err(e) => {
                    pending.lock().fail(format!("undecodable reply: {}", e));
                    return;
                }
            },
            Err(e) => {
                pending.lock().fail(format!("read from plugin failed: {}", e));
                return;
            }
        };

        let mut guard = pending.lock();
        match guard.waiters.remove(&reply.id) {
            Some(waiter) => {
                if waiter.send(Ok(reply)).is_err() {
                    debug!("discarding reply to abandoned request");
                }
            }
            None => {
                let reason = match reply.error {
                    Some(error) => format!("unsolicited reply {}: {}", reply.id, error),
                    None => format!("unsolicited reply {}", reply.id),
                };
                guard.fail(reason);
                return;
            }
        }
    }
}

#[async_trait]
impl Substrate for PluginRpc {
    async fn new_session(&self) -> Result<String> {
        self.invoke(method::NEW_SESSION, &NoArgs {}).await
    }

    async fn close_session(&self, tag: &str) -> Result<()> {
        self.invoke(method::CLOSE_SESSION, &TagArgs { tag: tag.to_string() })
            .await
    }

    async fn new_simulated(
        &self,
        name: &str,
        version: &str,
        snapshot: Option<&[u8]>,
    ) -> Result<String> {
        let args = NewSimulatedArgs {
            name: name.to_string(),
            version: version.to_string(),
            snapshot: snapshot.map(<[u8]>::to_vec),
        };
        self.invoke(method::NEW_SIMULATED, &args).await
    }

    async fn set_simulated_identity(
        &self,
        tag: &str,
        creator: &str,
        attributes: &BTreeMap<String, String>,
    ) -> Result<()> {
        let args = SetIdentityArgs {
            tag: tag.to_string(),
            creator: creator.to_string(),
            attrs: attributes.clone(),
        };
        self.invoke(method::SET_SIMULATED_IDENTITY, &args).await
    }

    async fn snapshot_simulated(&self, tag: &str) -> Result<Vec<u8>> {
        self.invoke(method::SNAPSHOT_SIMULATED, &TagArgs { tag: tag.to_string() })
            .await
    }

    async fn close_simulated(&self, tag: &str) -> Result<()> {
        self.invoke(method::CLOSE_SIMULATED, &TagArgs { tag: tag.to_string() })
            .await
    }

    async fn init(&self, tag: &str, program: &str, options: &FlattenedOptions) -> Result<()> {
        let args = InitArgs {
            tag: tag.to_string(),
            phylum: program.to_string(),
            options: options.clone(),
        };
        self.invoke(method::INIT, &args).await
    }

    async fn call(&self, tag: &str, method: &str, options: &FlattenedOptions) -> Result<Response> {
        let args = CallArgs {
            tag: tag.to_string(),
            command: method.to_string(),
            options: options.clone(),
        };
        self.invoke(method::CALL, &args).await
    }

    async fn query_info(&self, tag: &str, options: &FlattenedOptions) -> Result<u64> {
        let args = QueryInfoArgs {
            tag: tag.to_string(),
            options: options.clone(),
        };
        self.invoke(method::QUERY_INFO, &args).await
    }

    async fn query_block(
        &self,
        tag: &str,
        height: u64,
        options: &FlattenedOptions,
    ) -> Result<Block> {
        let args = QueryBlockArgs {
            tag: tag.to_string(),
            height,
            options: options.clone(),
        };
        self.invoke(method::QUERY_BLOCK, &args).await
    }

    async fn health_check(&self, x: i64) -> Result<i64> {
        self.invoke(method::HEALTH_CHECK, &HealthCheckArgs { x }).await
    }
}
