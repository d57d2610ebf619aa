//! HTTP server for the job API

use crate::api::handlers::{self, ApiState};
use crate::config::ApiConfig;
use crate::error::{AppError, Result};
use axum::{
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::oneshot;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// Build the `/api/v1` router
pub fn router(state: Arc<ApiState>) -> Router {
    // Build CORS layer (allow all for local tooling)
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api = Router::new()
        .route("/health", get(handlers::health_check))
        // ================================================================
        // Jobs
        // ================================================================
        .route("/jobs", post(handlers::submit_job))
        .route("/jobs/process-next", post(handlers::process_next))
        .route("/jobs/recover", post(handlers::recover_stuck))
        .route("/jobs/:id", get(handlers::get_job))
        .route("/jobs/:id/candidates", get(handlers::get_candidates))
        .route("/jobs/:id/cancel", post(handlers::cancel_job));

    Router::new()
        .nest("/api/v1", api)
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

/// API server manager
#[derive(Default)]
pub struct ApiServer {
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl ApiServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind and serve in the background; returns the bound address
    pub async fn start(&mut self, config: &ApiConfig, state: Arc<ApiState>) -> Result<SocketAddr> {
        let addr: SocketAddr = format!("{}:{}", config.host, config.port)
            .parse()
            .map_err(|e| AppError::Config(format!("Invalid API address: {}", e)))?;

        let app = router(state);

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        self.shutdown_tx = Some(shutdown_tx);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        let bound = listener.local_addr()?;

        tokio::spawn(async move {
            let server = axum::serve(listener, app).with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
                info!("API server shutting down");
            });

            if let Err(e) = server.await {
                error!("API server error: {}", e);
            }
        });

        info!("IPS Analyzer API server listening on {}", bound);
        Ok(bound)
    }

    /// Signal graceful shutdown
    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}
