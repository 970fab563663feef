//! Launching a plugin process

use crate::{
    config::ConnectConfig,
    rpc::{
        client::PluginRpc,
        protocol::{Handshake, LOG_LEVEL_ENV, MAGIC_COOKIE_KEY, MAGIC_COOKIE_VALUE},
    },
    substrate::Substrate,
    Error, Result,
};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// A running plugin and the client talking to it
#[derive(Debug)]
pub struct SubstrateConnection {
    child: Child,
    substrate: Arc<PluginRpc>,
}

impl SubstrateConnection {
    /// Launch the plugin named by `config` and complete the handshake
    pub async fn connect(config: &ConnectConfig) -> Result<Self> {
        info!(command = %config.command.display(), "launching substrate plugin");

        let mut command = Command::new(&config.command);
        command
            .env(MAGIC_COOKIE_KEY, MAGIC_COOKIE_VALUE)
            .env(LOG_LEVEL_ENV, &config.log_level)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(if config.attach_stderr {
                Stdio::inherit()
            } else {
                Stdio::null()
            })
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| {
            Error::Transport(format!(
                "failed to launch {}: {}",
                config.command.display(),
                e
            ))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Transport("plugin stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Transport("plugin stdout unavailable".to_string()))?;
        let mut reader = BufReader::new(stdout);

        let mut line = String::new();
        let timeout = Duration::from_millis(config.handshake_timeout_ms);
        let read = tokio::time::timeout(timeout, reader.read_line(&mut line))
            .await
            .map_err(|_| {
                Error::Handshake(format!("no handshake within {}ms", config.handshake_timeout_ms))
            })??;
        if read == 0 {
            return Err(Error::Handshake(
                "plugin exited before completing the handshake".to_string(),
            ));
        }

        let handshake = Handshake::parse(&line)?;
        handshake.verify()?;
        debug!(handshake = %handshake.line(), "plugin handshake complete");

        Ok(Self {
            child,
            substrate: Arc::new(PluginRpc::new(reader, stdin)),
        })
    }

    /// Launch, run `f` with the substrate, then shut the plugin down
    pub async fn connect_with<F, Fut, T>(config: &ConnectConfig, f: F) -> Result<T>
    where
        F: FnOnce(Arc<dyn Substrate>) -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let connection = Self::connect(config).await?;
        let result = f(connection.substrate()).await;
        if let Err(e) = connection.close().await {
            warn!(error = %e, "plugin shutdown failed");
        }
        result
    }

    /// Call channel to the plugin
    pub fn substrate(&self) -> Arc<dyn Substrate> {
        self.substrate.clone()
    }

    /// Terminate the plugin process
    pub async fn close(mut self) -> Result<()> {
        // Dropping the client closes the plugin's stdin
        drop(self.substrate);
        match tokio::time::timeout(Duration::from_secs(2), self.child.wait()).await {
            Ok(status) => {
                debug!(status = ?status?, "plugin exited");
            }
            Err(_) => {
                self.child.kill().await?;
            }
        }
        Ok(())
    }
}
