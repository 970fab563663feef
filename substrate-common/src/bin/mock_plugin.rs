//! Simulated substrate served as a plugin
//!
//! Launched by a host with the magic cookie set; speaks the plugin protocol
//! on stdin/stdout and logs to stderr.

use std::sync::Arc;
use substrate_common::rpc::{protocol::LOG_LEVEL_ENV, serve_stdio};
use substrate_common::MockSubstrate;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // stdout carries the protocol
    let filter = std::env::var(LOG_LEVEL_ENV)
        .ok()
        .and_then(|level| EnvFilter::try_new(level).ok())
        .unwrap_or_else(|| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    tracing::info!("Starting simulated substrate plugin");

    serve_stdio(Arc::new(MockSubstrate::standard())).await?;

    tracing::info!("Simulated substrate plugin exiting");
    Ok(())
}
