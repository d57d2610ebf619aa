//! Application state
//!
//! Every shared component is built here once and handed down explicitly.

use crate::cache::DailyBudget;
use crate::clock::{Clock, SystemClock};
use crate::config::AppConfig;
use crate::db::{JobStore, SqliteJobStore};
use crate::error::Result;
use crate::providers::alphavantage::AlphaVantageProvider;
use crate::providers::MarketDataProvider;
use crate::services::{GatewaySettings, MarketDataService};
use crate::worker::{Dispatcher, JobRunner, RunnerSettings};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Application state shared by the worker, the poller and the API
pub struct AppState {
    pub config: AppConfig,

    /// Job and candidate persistence
    pub store: Arc<dyn JobStore>,

    /// Cached market-data gateway
    pub market_data: Arc<MarketDataService>,

    pub runner: Arc<JobRunner>,

    pub dispatcher: Arc<Dispatcher>,
}

impl AppState {
    /// Build state against the configured database and Alpha Vantage
    pub fn new(config: AppConfig) -> Result<(Self, mpsc::Receiver<String>)> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        tracing::info!("Opening job database at {:?}", config.database.path);
        let store: Arc<dyn JobStore> =
            Arc::new(SqliteJobStore::new(&config.database.path, clock.clone())?);

        let provider: Arc<dyn MarketDataProvider> = Arc::new(AlphaVantageProvider::new(
            &config.market_data.base_url,
            &config.market_data.api_key,
            config.market_data.request_timeout(),
        )?);

        Ok(Self::with_parts(config, clock, store, provider))
    }

    /// Build state from already-constructed store, provider and clock
    pub fn with_parts(
        config: AppConfig,
        clock: Arc<dyn Clock>,
        store: Arc<dyn JobStore>,
        provider: Arc<dyn MarketDataProvider>,
    ) -> (Self, mpsc::Receiver<String>) {
        let budget = Arc::new(DailyBudget::new(clock.clone()));
        let market_data = Arc::new(MarketDataService::new(
            provider,
            budget,
            config.market_data.cache_ttl(),
            clock.clone(),
            GatewaySettings::from(&config.market_data),
        ));

        let runner = Arc::new(JobRunner::new(
            store.clone(),
            market_data.clone(),
            clock,
            RunnerSettings {
                job_timeout: config.worker.job_timeout(),
                max_concurrent_jobs: config.worker.max_concurrent_jobs,
                analysis: config.analysis.clone(),
            },
        ));

        let (dispatcher, queue) = Dispatcher::new(
            store.clone(),
            runner.clone(),
            config.analysis.clone(),
            config.worker.stuck_after(),
            config.worker.queue_capacity,
        );

        let state = Self {
            config,
            store,
            market_data,
            runner,
            dispatcher: Arc::new(dispatcher),
        };
        (state, queue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::db::{JobKind, JobStatus};
    use crate::worker::runner::tests::ChainProvider;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    #[tokio::test]
    async fn test_with_parts_wires_dispatcher_to_store() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 3, 1, 14, 0, 0).unwrap(),
        ));
        let store: Arc<dyn JobStore> =
            Arc::new(SqliteJobStore::open_in_memory(clock.clone()).unwrap());
        let mut config = AppConfig::default();
        config.market_data.batch_delay_ms = 0;

        let (state, mut queue) = AppState::with_parts(
            config,
            clock,
            store,
            Arc::new(ChainProvider::default()),
        );

        let job = state
            .dispatcher
            .submit(JobKind::DashboardRefresh, &json!({"symbols": ["SPY"]}))
            .unwrap();
        assert_eq!(queue.recv().await, Some(job.id.clone()));

        assert_eq!(
            state.runner.run_by_id(&job.id).await.unwrap(),
            Some(crate::worker::RunOutcome::Completed)
        );
        assert_eq!(state.store.get_job(&job.id).unwrap().unwrap().status, JobStatus::Completed);
        assert_eq!(state.market_data.budget().value(), 1);
    }

    #[test]
    fn test_new_opens_file_database() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.database.path = dir.path().join("jobs.db");
        config.market_data.api_key = "demo".to_string();

        let (state, _queue) = AppState::new(config).unwrap();
        assert!(state.store.get_job("missing").unwrap().is_none());
        assert!(dir.path().join("jobs.db").exists());
    }
}
