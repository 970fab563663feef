//! Plugin launch configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// How to launch and reach a substrate plugin
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectConfig {
    /// Plugin executable
    pub command: PathBuf,

    /// Log level handed to the plugin
    pub log_level: String,

    /// Forward plugin stderr to ours
    pub attach_stderr: bool,

    /// How long to wait for the handshake line (milliseconds)
    pub handshake_timeout_ms: u64,
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            command: PathBuf::from("substrate-plugin"),
            log_level: "debug".to_string(),
            attach_stderr: false,
            handshake_timeout_ms: 10_000,
        }
    }
}

impl ConnectConfig {
    /// Config for a specific plugin executable
    pub fn with_command(command: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }

    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ConnectConfig = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = ConnectConfig::default();

        if let Ok(command) = std::env::var("SUBSTRATE_PLUGIN_FILE") {
            config.command = PathBuf::from(command);
        }

        if let Ok(level) = std::env::var("SUBSTRATE_LOG_LEVEL") {
            config.log_level = level;
        }

        if let Ok(attach) = std::env::var("SUBSTRATE_ATTACH_STDERR") {
            config.attach_stderr = matches!(attach.as_str(), "1" | "true" | "yes");
        }

        if let Ok(timeout) = std::env::var("SUBSTRATE_HANDSHAKE_TIMEOUT_MS") {
            config.handshake_timeout_ms = timeout.parse().map_err(|e| {
                crate::Error::Config(format!("Invalid SUBSTRATE_HANDSHAKE_TIMEOUT_MS: {}", e))
            })?;
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ConnectConfig::default();
        assert_eq!(config.log_level, "debug");
        assert!(!config.attach_stderr);
        assert_eq!(config.handshake_timeout_ms, 10_000);
    }

    #[test]
    fn test_partial_toml() {
        let config: ConnectConfig = toml::from_str(
            r#"
            command = "/opt/substrate/plugin"
            attach_stderr = true
            "#,
        )
        .unwrap();
        assert_eq!(config.command, PathBuf::from("/opt/substrate/plugin"));
        assert!(config.attach_stderr);
        assert_eq!(config.log_level, "debug");
    }
}
