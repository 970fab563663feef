//! Core types exchanged with the substrate
//!
//! Byte payloads are carried as base64 strings on the wire so that frames
//! stay readable JSON.

use crate::Result;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Response to a `Call`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    /// JSON encoded result
    #[serde(with = "base64_bytes")]
    pub result_json: Vec<u8>,

    /// The endpoint reported a failure
    pub has_error: bool,

    /// Endpoint error code (zero on success)
    pub error_code: i32,

    /// Endpoint error message
    pub error_message: String,

    /// JSON encoded error detail
    #[serde(with = "base64_bytes")]
    pub error_json: Vec<u8>,

    /// Transaction committed by the call (empty for reads and failures)
    pub transaction_id: String,
}

impl Response {
    /// Successful response
    pub fn success(result_json: Vec<u8>, transaction_id: impl Into<String>) -> Self {
        Self {
            result_json,
            transaction_id: transaction_id.into(),
            ..Default::default()
        }
    }

    /// Endpoint failure
    pub fn failure(error_code: i32, error_message: impl Into<String>, error_json: Vec<u8>) -> Self {
        Self {
            has_error: true,
            error_code,
            error_message: error_message.into(),
            error_json,
            ..Default::default()
        }
    }

    /// Decode the result payload
    pub fn unmarshal_to<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.result_json)?)
    }

    /// Transaction id, if the call committed one
    pub fn transaction(&self) -> Option<&str> {
        Some(self.transaction_id.as_str()).filter(|id| !id.is_empty())
    }
}

/// Summary information about a transaction
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Transaction id
    pub id: String,

    /// Validation reason (empty when valid)
    pub reason: String,

    /// Emitted event payload
    #[serde(with = "base64_bytes")]
    pub event: Vec<u8>,

    /// Program the transaction ran against
    pub chaincode_id: String,
}

/// Summary information about a block
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Block hash (hex)
    pub hash: String,

    /// Transactions in commit order
    pub transactions: Vec<Transaction>,
}

/// Fully resolved, immutable per-call options.
///
/// Produced by [`crate::options::flatten_options`] once per call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlattenedOptions {
    /// Extra transport headers
    pub headers: BTreeMap<String, String>,

    /// Target endpoint
    pub endpoint: Option<String>,

    /// Request id
    pub id: Option<String>,

    /// Authorization token for the transaction issuer
    pub auth_token: Option<String>,

    /// JSON encoded parameters
    #[serde(with = "base64_bytes")]
    pub params: Vec<u8>,

    /// Transient data (never persisted by the backend)
    #[serde(with = "base64_map")]
    pub transient: BTreeMap<String, Vec<u8>>,

    /// Resolved "now" for this call (RFC 3339)
    pub timestamp: String,

    /// Endorsement filter
    pub msp_filter: Vec<String>,

    /// Minimum number of endorsing peers
    pub min_endorsers: u32,

    /// Creator identity (simulated sessions)
    pub creator: Option<String>,

    /// Transaction this call must be ordered after
    pub dependent_tx_id: Option<String>,

    /// Skip polling for full consensus after a write
    pub disable_write_polling: bool,

    /// Downgrade https to http for backend-side fetches
    pub cc_fetch_url_downgrade: bool,

    /// Proxy for backend-side fetches
    pub cc_fetch_url_proxy: Option<String>,
}

/// Serde adapter for `Vec<u8>` as base64 text
pub mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    /// Serialize bytes as base64
    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    /// Deserialize base64 into bytes
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}

/// Serde adapter for a map of byte values as base64 text
pub mod base64_map {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::ser::SerializeMap;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::collections::BTreeMap;

    /// Serialize map values as base64
    pub fn serialize<S: Serializer>(
        map: &BTreeMap<String, Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let mut out = serializer.serialize_map(Some(map.len()))?;
        for (key, value) in map {
            out.serialize_entry(key, &STANDARD.encode(value))?;
        }
        out.end()
    }

    /// Deserialize base64 map values
    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<String, Vec<u8>>, D::Error> {
        BTreeMap::<String, String>::deserialize(deserializer)?
            .into_iter()
            .map(|(key, value)| {
                STANDARD
                    .decode(value)
                    .map(|bytes| (key, bytes))
                    .map_err(serde::de::Error::custom)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unmarshal_result() {
        let response = Response::success(br#"{"balance": 42}"#.to_vec(), "tx-7");
        let value: serde_json::Value = response.unmarshal_to().unwrap();
        assert_eq!(value["balance"], 42);
        assert_eq!(response.transaction(), Some("tx-7"));
    }

    #[test]
    fn test_failed_response_has_no_transaction() {
        let response = Response::failure(404, "unknown endpoint", vec![]);
        assert!(response.has_error);
        assert_eq!(response.transaction(), None);
    }

    #[test]
    fn test_bytes_travel_as_base64() {
        let mut options = FlattenedOptions::default();
        options.params = b"[]".to_vec();
        options.transient.insert("key".to_string(), vec![0xff, 0x00]);

        let json = serde_json::to_value(&options).unwrap();
        assert_eq!(json["params"], "W10=");
        assert_eq!(json["transient"]["key"], "/wA=");

        let back: FlattenedOptions = serde_json::from_value(json).unwrap();
        assert_eq!(back, options);
    }
}
