//! Session handles over a substrate call channel
//!
//! Provides:
//! - `SubstrateWrapper` to open live (`RpcInstance`) and simulated
//!   (`MockInstance`) sessions
//! - `SubstrateInstance`, the interface every handle shares
//! - Coherence wrappers that chain each call after the previous
//!   transaction, keeping state either in the wrapper or in the caller's
//!   context

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod coherent;
pub mod instance;
pub mod wrapper;

pub use coherent::{CoherentInstance, ContextCoherentInstance, SubstrateInstanceExt};
pub use instance::SubstrateInstance;
pub use substrate_common::{Error, Result};
pub use wrapper::{MockInstance, RpcInstance, SubstrateWrapper};
