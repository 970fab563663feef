//! Batch scheduling over a substrate session
//!
//! Entries are scheduled on the backend for a point in time. A registered
//! `Ticker` periodically fetches the entries that are due, hands each to
//! its `BatchHandler`, and records every outcome back on the backend:
//! - handler failures are recorded and never retried
//! - a completion that fails to land leaves the entry pending
//! - "now" comes from the call's timestamp, so test clocks are deterministic

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod driver;
pub mod error;
pub mod handler;
pub mod protocol;
pub mod ticker;

pub use driver::Driver;
pub use error::{Error, Result};
pub use handler::{handler_fn, BatchHandler};
pub use ticker::{TickReport, Ticker};
