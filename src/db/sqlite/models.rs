//! Job store models

use crate::error::{AppError, Result};
use crate::providers::types::OptionType;
use crate::scoring::{FeatureMap, ScoreResult};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Kind of background work a job carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobKind {
    AgentAnalysis,
    DashboardRefresh,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::AgentAnalysis => "agent-analysis",
            JobKind::DashboardRefresh => "dashboard-refresh",
        }
    }
}

impl std::str::FromStr for JobKind {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "agent-analysis" => Ok(JobKind::AgentAnalysis),
            "dashboard-refresh" => Ok(JobKind::DashboardRefresh),
            other => Err(AppError::Validation(format!("Unknown job kind '{}'", other))),
        }
    }
}

/// Job status. Transitions only move forward:
/// pending -> running -> completed | failed, and pending | running -> cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl std::str::FromStr for JobStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(AppError::Internal(format!("Unknown job status '{}'", other))),
        }
    }
}

/// Pipeline progress snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobProgress {
    pub current_step: String,
    pub total_steps: u32,
    pub completed_steps: u32,
    pub symbols_processed: u32,
    pub total_symbols: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl JobProgress {
    /// Initial progress of a freshly created job
    pub fn queued(total_steps: u32, total_symbols: u32) -> Self {
        Self {
            current_step: "queued".to_string(),
            total_steps,
            completed_steps: 0,
            symbols_processed: 0,
            total_symbols,
            message: None,
        }
    }
}

/// Failure recorded on a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobError {
    pub message: String,
    #[serde(default)]
    pub details: Value,
}

impl JobError {
    /// Error record for a failure during `step`
    pub fn from_app_error(err: &AppError, step: Option<&str>) -> Self {
        let step = match err {
            AppError::Pipeline { step, .. } => Some(step.as_str()),
            _ => step,
        };
        Self {
            message: err.to_string(),
            details: serde_json::json!({
                "code": err.code(),
                "step": step,
            }),
        }
    }
}

/// A unit of background work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub kind: JobKind,
    pub status: JobStatus,
    pub params: Value,
    pub progress: JobProgress,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// One scored option contract kept for a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub rank: u32,
    pub symbol: String,
    pub contract_id: String,
    pub expiration: NaiveDate,
    pub strike: f64,
    pub option_type: OptionType,
    pub mid: f64,
    pub dte: i64,
    pub score: ScoreResult,
    pub features: FeatureMap,
    #[serde(default)]
    pub data_tags: Vec<String>,
}
