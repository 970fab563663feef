//! Out-of-process substrate plugins
//!
//! The host launches a plugin executable, checks its handshake line and then
//! exchanges newline-delimited JSON frames over the child's stdio.

pub mod client;
pub mod connection;
pub mod protocol;
pub mod server;

pub use client::PluginRpc;
pub use connection::SubstrateConnection;
pub use server::{serve, serve_stdio};
