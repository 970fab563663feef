//! Substrate client core
//!
//! Provides the boundary to a ledger execution backend:
//! - Request configuration builder (ordered option mutators, flattening)
//! - The `Substrate` call channel trait and its wire types
//! - Cancellation/deadline carrier for every boundary call
//! - Out-of-process plugin transport (handshake + JSON framing over stdio)
//! - In-memory simulated backend for tests and local runs

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod config;
pub mod context;
pub mod error;
pub mod metrics;
pub mod mock;
pub mod options;
pub mod rpc;
pub mod substrate;
pub mod types;

pub use config::ConnectConfig;
pub use context::CallContext;
pub use error::{Error, Result, SubstrateError};
pub use mock::MockSubstrate;
pub use options::{RequestOption, RequestOptions, ResponseCapture};
pub use rpc::SubstrateConnection;
pub use substrate::Substrate;
pub use types::{Block, FlattenedOptions, Response, Transaction};
