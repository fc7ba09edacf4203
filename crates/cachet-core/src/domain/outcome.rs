//! Worker result model.
//!
//! Exactly one `WorkerResult` is produced per task. Failures inside a worker
//! are data, not panics crossing the pool boundary.

use serde::{Deserialize, Serialize};

/// Reply of a worker for one task.
///
/// Wire shape: `{"success": true, "data": ...}` or `{"success": false, "error": "..."}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "WireReply", try_from = "WireReply")]
pub enum WorkerResult {
    Success { data: serde_json::Value },
    Failure { error: String },
}

impl WorkerResult {
    pub fn success(data: serde_json::Value) -> Self {
        WorkerResult::Success { data }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        WorkerResult::Failure {
            error: error.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, WorkerResult::Success { .. })
    }
}

#[derive(Serialize, Deserialize)]
struct WireReply {
    success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl From<WorkerResult> for WireReply {
    fn from(result: WorkerResult) -> Self {
        match result {
            WorkerResult::Success { data } => WireReply {
                success: true,
                data: Some(data),
                error: None,
            },
            WorkerResult::Failure { error } => WireReply {
                success: false,
                data: None,
                error: Some(error),
            },
        }
    }
}

impl TryFrom<WireReply> for WorkerResult {
    type Error = String;

    fn try_from(reply: WireReply) -> Result<Self, Self::Error> {
        match reply {
            WireReply {
                success: true,
                data,
                ..
            } => Ok(WorkerResult::Success {
                data: data.unwrap_or(serde_json::Value::Null),
            }),
            WireReply {
                success: false,
                error: Some(error),
                ..
            } => Ok(WorkerResult::Failure { error }),
            WireReply { success: false, .. } => {
                Err("failed reply without an error message".to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wire_shape_matches_protocol() {
        let ok = serde_json::to_value(WorkerResult::success(json!({"issues": 0}))).unwrap();
        assert_eq!(ok, json!({"success": true, "data": {"issues": 0}}));

        let err = serde_json::to_value(WorkerResult::failure("bad yaml")).unwrap();
        assert_eq!(err, json!({"success": false, "error": "bad yaml"}));
    }

    #[test]
    fn failure_without_message_is_rejected() {
        let parsed: Result<WorkerResult, _> = serde_json::from_value(json!({"success": false}));
        assert!(parsed.is_err());
    }
}
