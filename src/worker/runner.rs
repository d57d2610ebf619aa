//! Job Runner
//!
//! Claims a job, drives its pipeline step by step and writes exactly one
//! terminal state. The whole run is capped by the job timeout; a run that
//! exceeds it is recorded as failed rather than left `running`.

use crate::clock::Clock;
use crate::config::AnalysisConfig;
use crate::db::{Job, JobError, JobProgress, JobStatus, JobStore};
use crate::error::{AppError, Result};
use crate::services::market_data_service::MarketDataService;
use crate::worker::pipeline::{JobRequest, PipelineRun};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::{debug, error, info, warn};

/// How a claimed run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Failed,
    Cancelled,
}

// ============================================================================
// Progress
// ============================================================================

/// Writes progress for one running job.
///
/// Progress writes are best effort; a failed write is logged and the run
/// continues.
pub struct ProgressTracker {
    job_id: String,
    store: Arc<dyn JobStore>,
    progress: Mutex<JobProgress>,
}

impl ProgressTracker {
    pub fn new(job_id: &str, store: Arc<dyn JobStore>, total_steps: u32, total_symbols: u32) -> Self {
        Self {
            job_id: job_id.to_string(),
            store,
            progress: Mutex::new(JobProgress::queued(total_steps, total_symbols)),
        }
    }

    pub fn begin_step(&self, step: &str) {
        self.update(|p| {
            p.current_step = step.to_string();
            p.message = Some(format!("Running {}", step));
        });
    }

    pub fn finish_step(&self, step: &str) {
        self.update(|p| {
            p.completed_steps = (p.completed_steps + 1).min(p.total_steps);
            p.message = Some(format!("Finished {}", step));
        });
    }

    pub fn symbols_processed(&self, processed: u32) {
        self.update(|p| {
            p.symbols_processed = processed.max(p.symbols_processed).min(p.total_symbols);
        });
    }

    pub fn current_step(&self) -> String {
        self.progress.lock().current_step.clone()
    }

    fn update<F: FnOnce(&mut JobProgress)>(&self, f: F) {
        let snapshot = {
            let mut progress = self.progress.lock();
            f(&mut *progress);
            progress.clone()
        };
        if let Err(e) = self.store.update_progress(&self.job_id, &snapshot) {
            warn!("ProgressTracker - job={} progress write failed: {}", self.job_id, e);
        }
    }
}

// ============================================================================
// Runner
// ============================================================================

#[derive(Debug, Clone)]
pub struct RunnerSettings {
    pub job_timeout: Duration,
    /// Runs in flight across every trigger path
    pub max_concurrent_jobs: usize,
    pub analysis: AnalysisConfig,
}

/// Pipeline executor for claimed jobs
pub struct JobRunner {
    store: Arc<dyn JobStore>,
    market_data: Arc<MarketDataService>,
    clock: Arc<dyn Clock>,
    slots: Semaphore,
    settings: RunnerSettings,
}

/// Terminal decision of a pipeline execution
enum Execution {
    Finished(Value),
    Cancelled,
}

impl JobRunner {
    pub fn new(
        store: Arc<dyn JobStore>,
        market_data: Arc<MarketDataService>,
        clock: Arc<dyn Clock>,
        settings: RunnerSettings,
    ) -> Self {
        Self {
            store,
            market_data,
            clock,
            slots: Semaphore::new(settings.max_concurrent_jobs.max(1)),
            settings,
        }
    }

    /// Claim `id` and run it. `None` when another trigger already owns it.
    pub async fn run_by_id(&self, id: &str) -> Result<Option<RunOutcome>> {
        let _slot = self.acquire_slot().await?;
        match self.store.claim_by_id(id)? {
            Some(job) => Ok(Some(self.run_claimed(job).await)),
            None => {
                debug!("JobRunner::run_by_id - {} not pending, skipping", id);
                Ok(None)
            }
        }
    }

    /// Claim the oldest pending job and run it
    pub async fn run_next_pending(&self) -> Result<Option<(String, RunOutcome)>> {
        let _slot = self.acquire_slot().await?;
        match self.store.claim_next_pending()? {
            Some(job) => {
                let id = job.id.clone();
                let outcome = self.run_claimed(job).await;
                Ok(Some((id, outcome)))
            }
            None => Ok(None),
        }
    }

    /// Wait for a free run slot. Claiming happens only once a slot is held,
    /// so a waiting trigger never leaves a job `running` without a runner.
    async fn acquire_slot(&self) -> Result<SemaphorePermit<'_>> {
        self.slots
            .acquire()
            .await
            .map_err(|_| AppError::Internal("Job run slots closed".to_string()))
    }

    /// Drive an already-claimed job to a terminal state
    pub async fn run_claimed(&self, job: Job) -> RunOutcome {
        info!("JobRunner::run_claimed - job={} kind={}", job.id, job.kind.as_str());

        let steps = crate::worker::pipeline::steps_for(job.kind);
        let total_symbols = job
            .params
            .get("symbols")
            .and_then(Value::as_array)
            .map_or(0, |s| s.len() as u32);
        let tracker = ProgressTracker::new(
            &job.id,
            self.store.clone(),
            steps.len() as u32,
            total_symbols,
        );

        let execution =
            tokio::time::timeout(self.settings.job_timeout, self.execute(&job, &tracker)).await;

        match execution {
            Ok(Ok(Execution::Finished(result))) => self.finish(&job.id, &result),
            Ok(Ok(Execution::Cancelled)) => {
                info!("JobRunner::run_claimed - job={} cancelled", job.id);
                RunOutcome::Cancelled
            }
            Ok(Err(err)) => self.record_failure(&job.id, &err, &tracker.current_step()),
            Err(_) => {
                let err = AppError::Timeout(format!(
                    "Job exceeded {}s",
                    self.settings.job_timeout.as_secs()
                ));
                self.record_failure(&job.id, &err, &tracker.current_step())
            }
        }
    }

    async fn execute(&self, job: &Job, tracker: &ProgressTracker) -> Result<Execution> {
        let request = JobRequest::parse(job.kind, &job.params, &self.settings.analysis)?;
        let mut run = PipelineRun::new(
            &job.id,
            request,
            self.clock.now().date_naive(),
            self.settings.analysis.clone(),
            self.market_data.clone(),
            self.store.clone(),
        );

        for step in run.steps() {
            if self.is_cancelled(&job.id)? {
                return Ok(Execution::Cancelled);
            }
            tracker.begin_step(step.as_str());
            run.execute(*step, tracker).await?;
            tracker.finish_step(step.as_str());
        }

        if self.is_cancelled(&job.id)? {
            return Ok(Execution::Cancelled);
        }

        run.into_result()
            .map(Execution::Finished)
            .ok_or_else(|| AppError::Internal("Pipeline finished without a result".to_string()))
    }

    fn is_cancelled(&self, id: &str) -> Result<bool> {
        Ok(self.store.get_status(id)? == Some(JobStatus::Cancelled))
    }

    fn finish(&self, id: &str, result: &Value) -> RunOutcome {
        match self.store.complete(id, result) {
            Ok(true) => {
                info!("JobRunner::finish - job={} completed", id);
                RunOutcome::Completed
            }
            Ok(false) => {
                // Cancelled after the last step; the cancel wins
                info!("JobRunner::finish - job={} no longer running, result dropped", id);
                RunOutcome::Cancelled
            }
            Err(e) => {
                error!("JobRunner::finish - job={} could not be completed: {}", id, e);
                self.record_failure(id, &e, "finalize")
            }
        }
    }

    fn record_failure(&self, id: &str, err: &AppError, step: &str) -> RunOutcome {
        error!("JobRunner - job={} failed at {}: {}", id, step, err);

        let record = JobError::from_app_error(err, Some(step));
        match self.store.fail(id, &record) {
            Ok(true) => RunOutcome::Failed,
            Ok(false) => {
                info!("JobRunner - job={} was cancelled before the failure was recorded", id);
                RunOutcome::Cancelled
            }
            Err(e) => {
                error!("JobRunner - job={} failure could not be recorded: {}", id, e);
                RunOutcome::Failed
            }
        }
    }
}
