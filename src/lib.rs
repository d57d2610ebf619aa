//! IPS Analyzer - background option-trade analysis
//!
//! Scores option contracts against weighted Investment Policy Statement
//! factors. Jobs are submitted over HTTP, run by a background worker and
//! persisted in SQLite; market data comes through a cached, budget-guarded
//! Alpha Vantage gateway.

pub mod api;
pub mod cache;
pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod providers;
pub mod scoring;
pub mod services;
pub mod state;
pub mod worker;

use api::{ApiServer, ApiState};
use config::AppConfig;
use state::AppState;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use worker::{JobPoller, Worker};

/// Initialize logging, build state and run until ctrl-c
pub async fn run() -> anyhow::Result<()> {
    // Initialize tracing/logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "ips_analyzer=debug,ips_analyzer_lib=debug,tower_http=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting IPS Analyzer...");

    let config = AppConfig::load()?;
    let (state, queue) = AppState::new(config)?;
    let state = Arc::new(state);
    tracing::info!("Application state initialized");

    let worker = Worker::new(state.runner.clone(), queue).start();

    let poller = JobPoller::new(state.dispatcher.clone(), state.config.worker.poll_interval()).start();

    let mut server = ApiServer::new();
    if state.config.api.enabled {
        server
            .start(
                &state.config.api,
                Arc::new(ApiState::new(state.dispatcher.clone())),
            )
            .await?;
    } else {
        tracing::info!("API server is disabled");
    }

    // Jobs left pending by a previous run
    let recovery = state.dispatcher.spawn_recovery();

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested");

    server.stop();
    recovery.abort();
    poller.abort();
    worker.abort();
    Ok(())
}
