//! Sync wire types
//!
//! One request/response exchange carries a device's pending changes up and the
//! store's delta back; nothing else is ever transmitted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// One sync exchange request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncRequest {
    /// Watermark returned by the previous successful exchange; absent on first sync
    #[serde(rename = "lastSync", default, skip_serializing_if = "Option::is_none")]
    pub last_sync: Option<DateTime<Utc>>,
    /// Proposed mutations, one array per entity type
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub changes: HashMap<String, Vec<Value>>,
}

/// One sync exchange response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncResponse {
    pub success: bool,
    /// New watermark; the client stores it for the next exchange
    pub timestamp: DateTime<Utc>,
    /// Every record modified after the request's `lastSync`, tombstones included
    pub changes: HashMap<String, Vec<Value>>,
    /// Types whose push failed this exchange; their mutations stay pending
    /// client-side and are retried on the next exchange
    #[serde(rename = "failedTypes", default, skip_serializing_if = "Vec::is_empty")]
    pub failed_types: Vec<String>,
}

/// Response to the destructive reset call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResetResponse {
    pub success: bool,
}

/// Per-owner sync bookkeeping, for the status endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncStatusResponse {
    #[serde(rename = "lastSync", skip_serializing_if = "Option::is_none")]
    pub last_sync: Option<DateTime<Utc>>,
    #[serde(rename = "exchangeCount")]
    pub exchange_count: i64,
    /// Non-tombstoned record counts per declared type
    #[serde(rename = "liveRecords")]
    pub live_records: HashMap<String, i64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_last_sync_optional() {
        let request: SyncRequest = serde_json::from_value(json!({
            "changes": {"tasks": [{"id": "t1", "title": "x"}]}
        }))
        .unwrap();

        assert!(request.last_sync.is_none());
        assert_eq!(request.changes["tasks"].len(), 1);
    }

    #[test]
    fn test_request_parses_rfc3339_watermark() {
        let request: SyncRequest = serde_json::from_value(json!({
            "lastSync": "2024-01-01T00:00:00Z"
        }))
        .unwrap();

        assert!(request.last_sync.is_some());
        assert!(request.changes.is_empty());
    }

    #[test]
    fn test_response_omits_empty_failed_types() {
        let response = SyncResponse {
            success: true,
            timestamp: Utc::now(),
            changes: HashMap::new(),
            failed_types: Vec::new(),
        };

        let json = serde_json::to_value(&response).unwrap();
        assert!(json.get("failedTypes").is_none());
        assert!(json.get("timestamp").is_some());
    }
}
