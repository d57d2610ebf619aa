//! Request and response types for the job API

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Standard response envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T: Serialize> {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success_with_message(message: &str) -> Self {
        Self {
            status: "success".to_string(),
            message: Some(message.to_string()),
            data: None,
        }
    }

    pub fn success_with_data(data: T) -> Self {
        Self {
            status: "success".to_string(),
            message: None,
            data: Some(data),
        }
    }

    pub fn error_with_data(message: &str, data: T) -> Self {
        Self {
            status: "error".to_string(),
            message: Some(message.to_string()),
            data: Some(data),
        }
    }
}

/// Empty data type for responses without data
#[derive(Debug, Clone, Serialize)]
pub struct Empty {}

/// Submit job request - POST /api/v1/jobs
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitJobRequest {
    /// `agent-analysis` or `dashboard-refresh`
    pub kind: String,
    #[serde(default)]
    pub params: Value,
}

/// Result of a poll or recovery trigger
#[derive(Debug, Clone, Serialize)]
pub struct TriggerResult {
    /// Job that was run, if any
    pub job_id: Option<String>,
}
