//! Dispatcher
//!
//! Entry points that create jobs and trigger runs. `submit` records the job
//! and notifies the worker loop over a bounded channel; the poller and the
//! stuck-job sweep are the fallback triggers when a notification is lost.
//! Whichever trigger claims first runs the job; the others no-op.

use crate::config::AnalysisConfig;
use crate::db::{Candidate, Job, JobKind, JobProgress, JobStore};
use crate::error::{AppError, Result};
use crate::worker::pipeline::JobRequest;
use crate::worker::runner::{JobRunner, RunOutcome};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Dispatch trigger surface
pub struct Dispatcher {
    store: Arc<dyn JobStore>,
    runner: Arc<JobRunner>,
    notify: mpsc::Sender<String>,
    limits: AnalysisConfig,
    stuck_after: chrono::Duration,
}

impl Dispatcher {
    /// Build the dispatcher and the receiving end of its notify channel
    pub fn new(
        store: Arc<dyn JobStore>,
        runner: Arc<JobRunner>,
        limits: AnalysisConfig,
        stuck_after: chrono::Duration,
        queue_capacity: usize,
    ) -> (Self, mpsc::Receiver<String>) {
        let (notify, queue) = mpsc::channel(queue_capacity.max(1));
        (
            Self {
                store,
                runner,
                notify,
                limits,
                stuck_after,
            },
            queue,
        )
    }

    /// Validate, create a pending job and notify the worker
    pub fn submit(&self, kind: JobKind, params: &Value) -> Result<Job> {
        let request = JobRequest::parse(kind, params, &self.limits)?;
        let progress = JobProgress::queued(
            request.steps().len() as u32,
            request.symbols().len() as u32,
        );
        let job = self.store.create_job(kind, &request.to_value()?, &progress)?;

        info!(
            "Dispatcher::submit - job={} kind={} symbols={}",
            job.id,
            kind.as_str(),
            request.symbols().len()
        );

        match self.notify.try_send(job.id.clone()) {
            Ok(()) => {}
            Err(TrySendError::Full(id)) => {
                warn!("Dispatcher::submit - queue full, job={} left for the poller", id)
            }
            Err(TrySendError::Closed(id)) => {
                warn!("Dispatcher::submit - worker stopped, job={} left for the poller", id)
            }
        }

        Ok(job)
    }

    pub fn status(&self, id: &str) -> Result<Job> {
        self.store
            .get_job(id)?
            .ok_or_else(|| AppError::NotFound(format!("Job not found: {}", id)))
    }

    /// Cancel a pending or running job
    pub fn cancel(&self, id: &str) -> Result<Job> {
        if self.store.cancel(id)? {
            info!("Dispatcher::cancel - job={} cancelled", id);
            return self.status(id);
        }
        let job = self.status(id)?;
        Err(AppError::Validation(format!(
            "Job {} is already {}",
            id,
            job.status.as_str()
        )))
    }

    pub fn candidates(&self, id: &str) -> Result<Vec<Candidate>> {
        self.status(id)?;
        self.store.list_candidates(id)
    }

    /// Claim and run the oldest pending job, if any
    pub async fn process_next_pending(&self) -> Result<Option<String>> {
        match self.runner.run_next_pending().await? {
            Some((id, outcome)) => {
                info!("Dispatcher::process_next_pending - job={} {:?}", id, outcome);
                Ok(Some(id))
            }
            None => {
                debug!("Dispatcher::process_next_pending - nothing pending");
                Ok(None)
            }
        }
    }

    /// Run the oldest job stuck in `pending` past the staleness window
    pub async fn recover_stuck(&self) -> Result<Option<String>> {
        let stuck = self.store.find_stuck_pending(self.stuck_after)?;
        if stuck.is_empty() {
            return Ok(None);
        }

        warn!("Dispatcher::recover_stuck - {} stuck pending jobs", stuck.len());
        for job in stuck {
            if let Some(outcome) = self.runner.run_by_id(&job.id).await? {
                info!("Dispatcher::recover_stuck - job={} {:?}", job.id, outcome);
                return Ok(Some(job.id));
            }
        }
        Ok(None)
    }

    /// Run the stuck-job sweep in the background
    pub fn spawn_recovery(self: &Arc<Self>) -> JoinHandle<()> {
        let dispatcher = self.clone();
        tokio::spawn(async move {
            match dispatcher.recover_stuck().await {
                Ok(Some(id)) => info!("Dispatcher - recovered stuck job {}", id),
                Ok(None) => debug!("Dispatcher - no stuck jobs"),
                Err(e) => error!("Dispatcher - stuck job recovery failed: {}", e),
            }
        })
    }
}

/// Consumes submit notifications and runs each job in its own task.
///
/// Concurrency is capped by the runner's slots, shared with the poll and
/// recovery triggers.
pub struct Worker {
    runner: Arc<JobRunner>,
    queue: mpsc::Receiver<String>,
}

impl Worker {
    pub fn new(runner: Arc<JobRunner>, queue: mpsc::Receiver<String>) -> Self {
        Self { runner, queue }
    }

    /// Spawn the worker loop
    pub fn start(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        info!("Worker started");

        while let Some(id) = self.queue.recv().await {
            let runner = self.runner.clone();

            tokio::spawn(async move {
                match runner.run_by_id(&id).await {
                    Ok(Some(RunOutcome::Completed)) => info!("Worker - job={} completed", id),
                    Ok(Some(outcome)) => warn!("Worker - job={} ended {:?}", id, outcome),
                    Ok(None) => debug!("Worker - job={} claimed elsewhere", id),
                    Err(e) => error!("Worker - job={} could not be run: {}", id, e),
                }
            });
        }

        info!("Worker stopped: notify channel closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::db::{JobStatus, SqliteJobStore};
    use crate::worker::runner::tests::{analysis_params, clock, runner_with, ChainProvider};
    use chrono::Duration;
    use serde_json::json;

    struct Fixture {
        clock: Arc<ManualClock>,
        store: Arc<SqliteJobStore>,
        runner: Arc<JobRunner>,
        dispatcher: Dispatcher,
        queue: mpsc::Receiver<String>,
    }

    fn fixture(queue_capacity: usize) -> Fixture {
        let clock = clock();
        let store = Arc::new(SqliteJobStore::open_in_memory(clock.clone()).unwrap());
        let runner = Arc::new(runner_with(
            store.clone(),
            Arc::new(ChainProvider::default()),
            clock.clone(),
        ));
        let (dispatcher, queue) = Dispatcher::new(
            store.clone(),
            runner.clone(),
            AnalysisConfig::default(),
            Duration::seconds(60),
            queue_capacity,
        );
        Fixture {
            clock,
            store,
            runner,
            dispatcher,
            queue,
        }
    }

    async fn wait_for_terminal(dispatcher: &Dispatcher, id: &str) -> Job {
        for _ in 0..200 {
            let job = dispatcher.status(id).unwrap();
            if job.status.is_terminal() {
                return job;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("job {} never finished", id);
    }

    #[tokio::test]
    async fn test_submit_rejects_invalid_params() {
        let f = fixture(8);
        let err = f
            .dispatcher
            .submit(JobKind::DashboardRefresh, &json!({"symbols": ["not a ticker"]}))
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        assert!(f.store.claim_next_pending().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_submit_notifies_worker() {
        let f = fixture(8);
        Worker::new(f.runner.clone(), f.queue).start();

        let job = f
            .dispatcher
            .submit(JobKind::AgentAnalysis, &analysis_params())
            .unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.progress.current_step, "queued");
        assert_eq!(job.progress.total_steps, 5);

        let done = wait_for_terminal(&f.dispatcher, &job.id).await;
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(f.dispatcher.candidates(&job.id).unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_full_queue_still_creates_job() {
        let f = fixture(1);
        let first = f
            .dispatcher
            .submit(JobKind::DashboardRefresh, &json!({"symbols": ["SPY"]}))
            .unwrap();
        let second = f
            .dispatcher
            .submit(JobKind::DashboardRefresh, &json!({"symbols": ["QQQ"]}))
            .unwrap();

        // No worker: the poll trigger picks both up, oldest first
        assert_eq!(f.dispatcher.process_next_pending().await.unwrap(), Some(first.id));
        assert_eq!(f.dispatcher.process_next_pending().await.unwrap(), Some(second.id));
        assert_eq!(f.dispatcher.process_next_pending().await.unwrap(), None);
        drop(f.queue);
    }

    #[tokio::test]
    async fn test_racing_triggers_run_job_once() {
        let f = fixture(8);
        let job = f
            .dispatcher
            .submit(JobKind::DashboardRefresh, &json!({"symbols": ["SPY"]}))
            .unwrap();

        let (a, b) = tokio::join!(f.runner.run_by_id(&job.id), f.runner.run_by_id(&job.id));
        let winners = [a.unwrap(), b.unwrap()]
            .into_iter()
            .filter(Option::is_some)
            .count();
        assert_eq!(winners, 1);
        assert_eq!(f.dispatcher.status(&job.id).unwrap().status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_recover_stuck_only_after_window() {
        let f = fixture(8);
        let stuck = f
            .dispatcher
            .submit(JobKind::DashboardRefresh, &json!({"symbols": ["SPY"]}))
            .unwrap();
        let running = f
            .dispatcher
            .submit(JobKind::DashboardRefresh, &json!({"symbols": ["QQQ"]}))
            .unwrap();
        f.store.claim_by_id(&running.id).unwrap();

        assert_eq!(f.dispatcher.recover_stuck().await.unwrap(), None);

        f.clock.advance(Duration::seconds(61));
        assert_eq!(f.dispatcher.recover_stuck().await.unwrap(), Some(stuck.id.clone()));
        assert_eq!(f.dispatcher.status(&stuck.id).unwrap().status, JobStatus::Completed);

        // The running job is never re-claimed by the sweep
        assert_eq!(f.dispatcher.recover_stuck().await.unwrap(), None);
        assert_eq!(f.dispatcher.status(&running.id).unwrap().status, JobStatus::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_recovery_returns_before_job_finishes() {
        let clock = clock();
        let store = Arc::new(SqliteJobStore::open_in_memory(clock.clone()).unwrap());
        let provider = ChainProvider {
            stall: Some(std::time::Duration::from_secs(30)),
            ..Default::default()
        };
        let runner = Arc::new(runner_with(store.clone(), Arc::new(provider), clock.clone()));
        let (dispatcher, _queue) = Dispatcher::new(
            store,
            runner,
            AnalysisConfig::default(),
            Duration::seconds(60),
            8,
        );
        let dispatcher = Arc::new(dispatcher);
        let job = dispatcher
            .submit(JobKind::DashboardRefresh, &json!({"symbols": ["SPY"]}))
            .unwrap();
        clock.advance(Duration::seconds(61));

        let sweep = dispatcher.spawn_recovery();
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        assert!(!sweep.is_finished());
        assert_eq!(dispatcher.status(&job.id).unwrap().status, JobStatus::Running);

        sweep.await.unwrap();
        assert_eq!(dispatcher.status(&job.id).unwrap().status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_cancel_and_lookups() {
        let f = fixture(8);
        let job = f
            .dispatcher
            .submit(JobKind::DashboardRefresh, &json!({"symbols": ["SPY"]}))
            .unwrap();

        let cancelled = f.dispatcher.cancel(&job.id).unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);
        assert!(matches!(f.dispatcher.cancel(&job.id), Err(AppError::Validation(_))));
        assert_eq!(f.dispatcher.process_next_pending().await.unwrap(), None);

        assert!(matches!(f.dispatcher.status("nope"), Err(AppError::NotFound(_))));
        assert!(matches!(f.dispatcher.cancel("nope"), Err(AppError::NotFound(_))));
        assert!(matches!(f.dispatcher.candidates("nope"), Err(AppError::NotFound(_))));
    }
}
