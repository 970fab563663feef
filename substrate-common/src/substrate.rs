//! The call channel to the backend
//!
//! [`Substrate`] is the capability every backend exposes, whether it lives
//! in a plugin process ([`crate::rpc::PluginRpc`]) or in memory
//! ([`crate::mock::MockSubstrate`]). Sessions are identified by opaque tags
//! handed out by `new_session` (live) and `new_simulated` (simulated).

use crate::{
    types::{Block, FlattenedOptions, Response},
    Error, Result,
};
use async_trait::async_trait;
use std::collections::BTreeMap;

/// Backend call channel
#[async_trait]
pub trait Substrate: Send + Sync {
    /// Open a live session
    async fn new_session(&self) -> Result<String>;

    /// Close a live session
    async fn close_session(&self, tag: &str) -> Result<()>;

    /// Open a simulated session, optionally restored from a snapshot
    async fn new_simulated(
        &self,
        name: &str,
        version: &str,
        snapshot: Option<&[u8]>,
    ) -> Result<String>;

    /// Set the identity simulated calls run as
    async fn set_simulated_identity(
        &self,
        tag: &str,
        creator: &str,
        attributes: &BTreeMap<String, String>,
    ) -> Result<()>;

    /// Snapshot a simulated session
    async fn snapshot_simulated(&self, tag: &str) -> Result<Vec<u8>>;

    /// Close a simulated session
    async fn close_simulated(&self, tag: &str) -> Result<()>;

    /// Install program source
    async fn init(&self, tag: &str, program: &str, options: &FlattenedOptions) -> Result<()>;

    /// Invoke an endpoint
    async fn call(&self, tag: &str, method: &str, options: &FlattenedOptions) -> Result<Response>;

    /// Current block height
    async fn query_info(&self, tag: &str, options: &FlattenedOptions) -> Result<u64>;

    /// Block summary at `height`
    async fn query_block(&self, tag: &str, height: u64, options: &FlattenedOptions)
        -> Result<Block>;

    /// Echo `x` back
    async fn health_check(&self, x: i64) -> Result<i64>;

    /// Classify `err` locally; never crosses the channel
    fn is_timeout_error(&self, err: &Error) -> bool {
        err.is_timeout()
    }
}
