//! Periodic poll trigger
//!
//! Picks up pending jobs whose submit notification never reached the worker
//! (full queue, restart between submit and run).

use crate::worker::dispatcher::Dispatcher;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

/// Calls `process_next_pending` on a fixed interval
pub struct JobPoller {
    dispatcher: Arc<Dispatcher>,
    interval: Duration,
}

impl JobPoller {
    pub fn new(dispatcher: Arc<Dispatcher>, interval: Duration) -> Self {
        Self {
            dispatcher,
            interval,
        }
    }

    /// Spawn the poll loop
    pub fn start(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("Job poller started (every {}s)", self.interval.as_secs());

            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick completes immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;
                self.poll_once().await;
            }
        })
    }

    /// One poll; returns the id of the job it ran
    pub async fn poll_once(&self) -> Option<String> {
        match self.dispatcher.process_next_pending().await {
            Ok(id) => id,
            Err(e) => {
                error!("JobPoller - poll failed: {}", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AnalysisConfig;
    use crate::db::{JobKind, JobStatus, SqliteJobStore};
    use crate::worker::runner::tests::{clock, runner_with, ChainProvider};
    use serde_json::json;

    fn dispatcher() -> Arc<Dispatcher> {
        let clock = clock();
        let store = Arc::new(SqliteJobStore::open_in_memory(clock.clone()).unwrap());
        let runner = Arc::new(runner_with(
            store.clone(),
            Arc::new(ChainProvider::default()),
            clock,
        ));
        // Receiver dropped: submit notifications go nowhere
        let (dispatcher, _queue) = Dispatcher::new(
            store,
            runner,
            AnalysisConfig::default(),
            chrono::Duration::seconds(60),
            4,
        );
        Arc::new(dispatcher)
    }

    #[tokio::test]
    async fn test_poll_once_runs_pending_job() {
        let dispatcher = dispatcher();
        let poller = JobPoller::new(dispatcher.clone(), Duration::from_secs(30));

        assert_eq!(poller.poll_once().await, None);

        let job = dispatcher
            .submit(JobKind::DashboardRefresh, &json!({"symbols": ["SPY"]}))
            .unwrap();
        assert_eq!(poller.poll_once().await, Some(job.id.clone()));
        assert_eq!(dispatcher.status(&job.id).unwrap().status, JobStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poller_picks_up_dropped_notification() {
        let dispatcher = dispatcher();
        let job = dispatcher
            .submit(JobKind::DashboardRefresh, &json!({"symbols": ["SPY"]}))
            .unwrap();

        let handle = JobPoller::new(dispatcher.clone(), Duration::from_secs(30)).start();

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(dispatcher.status(&job.id).unwrap().status, JobStatus::Pending);

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(dispatcher.status(&job.id).unwrap().status, JobStatus::Completed);

        handle.abort();
    }
}
