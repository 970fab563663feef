//! Error types for the substrate boundary

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for substrate operations
pub type Result<T> = std::result::Result<T, Error>;

/// Structured failure reported by the backend.
///
/// This is the only error shape that crosses the plugin boundary; everything
/// else is classified locally.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{diagnostic}")]
pub struct SubstrateError {
    /// Backend gave up waiting (e.g. on a dependent transaction)
    pub is_timeout_error: bool,

    /// Human readable diagnostic
    pub diagnostic: String,
}

impl SubstrateError {
    /// Non-timeout failure
    pub fn new(diagnostic: impl Into<String>) -> Self {
        Self {
            is_timeout_error: false,
            diagnostic: diagnostic.into(),
        }
    }

    /// Timeout-flagged failure
    pub fn timeout(diagnostic: impl Into<String>) -> Self {
        Self {
            is_timeout_error: true,
            diagnostic: diagnostic.into(),
        }
    }
}

/// Substrate client errors
#[derive(Error, Debug)]
pub enum Error {
    /// Channel to the backend failed (unreachable, dropped, undecodable)
    #[error("Transport error: {0}")]
    Transport(String),

    /// Plugin launched but did not agree on protocol
    #[error("Handshake error: {0}")]
    Handshake(String),

    /// Backend-reported structured failure
    #[error("Substrate error: {0}")]
    Application(#[from] SubstrateError),

    /// API misuse
    #[error("Configuration error: {0}")]
    Config(String),

    /// Payload could not be converted to or from wire form
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Carrier was cancelled while waiting on the backend
    #[error("Request cancelled")]
    Cancelled,

    /// Carrier deadline passed while waiting on the backend
    #[error("Deadline exceeded")]
    DeadlineExceeded,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether a higher layer may treat this as a timeout
    pub fn is_timeout(&self) -> bool {
        match self {
            Error::Application(e) => e.is_timeout_error,
            Error::DeadlineExceeded => true,
            _ => false,
        }
    }

    /// Whether the failure happened on the channel rather than in the backend
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::Transport(_) | Error::Handshake(_))
    }
}
