//! Backend methods behind batch scheduling

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// `[batch_name, payload, when_rfc3339] -> {"request_id"}`
pub const SCHEDULE: &str = "$batch_schedule";

/// `[batch_name] -> [PendingRequest]`, due at or before the call timestamp
pub const PENDING: &str = "$batch_pending";

/// `[batch_name, request_id, response | null, error | null]`
pub const COMPLETE: &str = "$batch_complete";

/// Entry due for dispatch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingRequest {
    /// Backend-assigned id
    pub request_id: String,
    /// Scheduled payload
    pub message: Value,
}

/// Result of a schedule write
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleReceipt {
    /// Backend-assigned id
    pub request_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use substrate_common::mock::builtin;

    #[test]
    fn test_method_names_match_simulated_backend() {
        assert_eq!(SCHEDULE, builtin::BATCH_SCHEDULE);
        assert_eq!(PENDING, builtin::BATCH_PENDING);
        assert_eq!(COMPLETE, builtin::BATCH_COMPLETE);
    }

    #[test]
    fn test_pending_decodes_any_payload() {
        let pending: Vec<PendingRequest> = serde_json::from_str(
            r#"[{"request_id":"r1","message":"ping"},{"request_id":"r2","message":{"n":1}}]"#,
        )
        .unwrap();
        assert_eq!(pending[0].message, Value::String("ping".to_string()));
        assert_eq!(pending[1].message["n"], 1);
    }
}
