//! Durable job store

pub mod sqlite;

use crate::error::Result;
use chrono::Duration;
use serde_json::Value;

pub use sqlite::models::{Candidate, Job, JobError, JobKind, JobProgress, JobStatus};
pub use sqlite::SqliteJobStore;

/// Job persistence used by the dispatcher and the runner.
///
/// Claim, terminal and cancel operations are conditional on the current
/// status and return `None` / `false` when another caller got there first.
pub trait JobStore: Send + Sync {
    /// Insert a new job with status `pending`
    fn create_job(&self, kind: JobKind, params: &Value, progress: &JobProgress) -> Result<Job>;

    fn get_job(&self, id: &str) -> Result<Option<Job>>;

    fn get_status(&self, id: &str) -> Result<Option<JobStatus>>;

    /// Atomically move the oldest pending job to `running`
    fn claim_next_pending(&self) -> Result<Option<Job>>;

    /// Atomically move `id` from `pending` to `running`
    fn claim_by_id(&self, id: &str) -> Result<Option<Job>>;

    /// Progress writes never lower `completed_steps`
    fn update_progress(&self, id: &str, progress: &JobProgress) -> Result<bool>;

    fn complete(&self, id: &str, result: &Value) -> Result<bool>;

    fn fail(&self, id: &str, error: &JobError) -> Result<bool>;

    fn cancel(&self, id: &str) -> Result<bool>;

    /// Jobs still pending after `older_than`, oldest first
    fn find_stuck_pending(&self, older_than: Duration) -> Result<Vec<Job>>;

    fn save_candidates(&self, job_id: &str, candidates: &[Candidate]) -> Result<()>;

    fn list_candidates(&self, job_id: &str) -> Result<Vec<Candidate>>;
}
