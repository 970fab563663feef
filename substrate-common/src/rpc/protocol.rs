//! Wire protocol shared by the plugin host and the plugin
//!
//! # Handshake
//!
//! The host launches the plugin with `SUBSTRATEHCP1=substratehcp1` in its
//! environment. The plugin answers with one line on stdout:
//!
//! ```text
//! CORE-VERSION|APP-VERSION|NETWORK|ADDRESS|PROTOCOL
//! 1|1|stdio|-|jsonrpc
//! ```
//!
//! This is a compatibility check, not a security boundary.
//!
//! # Framing
//!
//! After the handshake every frame is one line of JSON. Requests carry
//! `{id, method, params}`, replies `{id, result}` or `{id, error}`. A reply
//! `error` is a transport failure; an `err` inside `result` is a structured
//! application error.

use crate::{error::SubstrateError, types::FlattenedOptions, Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Environment variable carrying the magic cookie
pub const MAGIC_COOKIE_KEY: &str = "SUBSTRATEHCP1";

/// Expected magic cookie value
pub const MAGIC_COOKIE_VALUE: &str = "substratehcp1";

/// Environment variable carrying the plugin log level
pub const LOG_LEVEL_ENV: &str = "SUBSTRATE_LOG_LEVEL";

/// Core protocol version
pub const CORE_PROTOCOL_VERSION: u32 = 1;

/// Application protocol version
pub const APP_PROTOCOL_VERSION: u32 = 1;

/// Frame protocol name
pub const FRAME_PROTOCOL: &str = "jsonrpc";

/// Method names on the wire
pub mod method {
    /// Open a live session
    pub const NEW_SESSION: &str = "Plugin.NewRPC";
    /// Close a live session
    pub const CLOSE_SESSION: &str = "Plugin.CloseRPC";
    /// Open a simulated session
    pub const NEW_SIMULATED: &str = "Plugin.NewMockFrom";
    /// Set simulated identity
    pub const SET_SIMULATED_IDENTITY: &str = "Plugin.SetCreatorWithAttributesMock";
    /// Snapshot a simulated session
    pub const SNAPSHOT_SIMULATED: &str = "Plugin.SnapshotMock";
    /// Close a simulated session
    pub const CLOSE_SIMULATED: &str = "Plugin.CloseMock";
    /// Install program
    pub const INIT: &str = "Plugin.Init";
    /// Invoke endpoint
    pub const CALL: &str = "Plugin.Call";
    /// Block height
    pub const QUERY_INFO: &str = "Plugin.QueryInfo";
    /// Block summary
    pub const QUERY_BLOCK: &str = "Plugin.QueryBlock";
    /// Echo
    pub const HEALTH_CHECK: &str = "Plugin.HealthCheck";
}

/// Parsed handshake line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    /// Core protocol version
    pub core_version: u32,
    /// Application protocol version
    pub app_version: u32,
    /// Network type
    pub network: String,
    /// Network address (`-` for stdio)
    pub address: String,
    /// Frame protocol
    pub protocol: String,
}

impl Handshake {
    /// Handshake this build speaks
    pub fn current() -> Self {
        Self {
            core_version: CORE_PROTOCOL_VERSION,
            app_version: APP_PROTOCOL_VERSION,
            network: "stdio".to_string(),
            address: "-".to_string(),
            protocol: FRAME_PROTOCOL.to_string(),
        }
    }

    /// Render as a handshake line (without newline)
    pub fn line(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}",
            self.core_version, self.app_version, self.network, self.address, self.protocol
        )
    }

    /// Parse a handshake line
    pub fn parse(line: &str) -> Result<Self> {
        let parts: Vec<&str> = line.trim().split('|').collect();
        if parts.len() != 5 {
            return Err(Error::Handshake(format!(
                "unrecognized handshake line: {:?}",
                line.trim()
            )));
        }

        let version = |text: &str, what: &str| {
            text.parse::<u32>()
                .map_err(|_| Error::Handshake(format!("invalid {} version: {:?}", what, text)))
        };

        Ok(Self {
            core_version: version(parts[0], "core protocol")?,
            app_version: version(parts[1], "app protocol")?,
            network: parts[2].to_string(),
            address: parts[3].to_string(),
            protocol: parts[4].to_string(),
        })
    }

    /// Check agreement with this build
    pub fn verify(&self) -> Result<()> {
        if self.core_version != CORE_PROTOCOL_VERSION {
            return Err(Error::Handshake(format!(
                "core protocol version mismatch: plugin {}, host {}",
                self.core_version, CORE_PROTOCOL_VERSION
            )));
        }
        if self.app_version != APP_PROTOCOL_VERSION {
            return Err(Error::Handshake(format!(
                "app protocol version mismatch: plugin {}, host {}",
                self.app_version, APP_PROTOCOL_VERSION
            )));
        }
        if self.network != "stdio" || self.protocol != FRAME_PROTOCOL {
            return Err(Error::Handshake(format!(
                "unsupported transport {}/{}",
                self.network, self.protocol
            )));
        }
        Ok(())
    }
}

/// Request frame
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Correlation id
    pub id: u64,
    /// Wire method name
    pub method: String,
    /// Method arguments
    #[serde(default)]
    pub params: serde_json::Value,
}

/// Reply frame
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reply {
    /// Correlation id
    pub id: u64,
    /// Method outcome
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Transport-level failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Method outcome carried inside a reply
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound(
    serialize = "T: Serialize",
    deserialize = "T: Deserialize<'de> + Default"
))]
pub struct Outcome<T> {
    /// Returned value (default when `err` is set)
    #[serde(default)]
    pub value: T,
    /// Structured application error
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err: Option<SubstrateError>,
}

/// No arguments
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NoArgs {}

/// Arguments naming a session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagArgs {
    /// Session tag
    pub tag: String,
}

/// Arguments to `NewMockFrom`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSimulatedArgs {
    /// Program name
    pub name: String,
    /// Program version
    pub version: String,
    /// Snapshot to restore
    #[serde(default, with = "optional_bytes")]
    pub snapshot: Option<Vec<u8>>,
}

/// Arguments to `SetCreatorWithAttributesMock`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetIdentityArgs {
    /// Session tag
    pub tag: String,
    /// Creator identity
    pub creator: String,
    /// Identity attributes
    pub attrs: BTreeMap<String, String>,
}

/// Arguments to `Init`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitArgs {
    /// Session tag
    pub tag: String,
    /// Program source
    pub phylum: String,
    /// Flattened options
    pub options: FlattenedOptions,
}

/// Arguments to `Call`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallArgs {
    /// Session tag
    pub tag: String,
    /// Endpoint
    pub command: String,
    /// Flattened options
    pub options: FlattenedOptions,
}

/// Arguments to `QueryInfo`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryInfoArgs {
    /// Session tag
    pub tag: String,
    /// Flattened options
    pub options: FlattenedOptions,
}

/// Arguments to `QueryBlock`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryBlockArgs {
    /// Session tag
    pub tag: String,
    /// Block height
    pub height: u64,
    /// Flattened options
    pub options: FlattenedOptions,
}

/// Arguments to `HealthCheck`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckArgs {
    /// Value to echo
    pub x: i64,
}

mod optional_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error> {
        Option::<String>::deserialize(deserializer)?
            .map(|text| STANDARD.decode(text).map_err(serde::de::Error::custom))
            .transpose()
    }
}
