//! Application configuration
//!
//! Loaded once at startup: an optional TOML file named by `IPS_CONFIG`,
//! then environment overrides, then validation.

use crate::error::{AppError, Result};
use crate::providers::alphavantage::DEFAULT_BASE_URL;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub api: ApiConfig,
    pub market_data: MarketDataConfig,
    pub worker: WorkerConfig,
    pub analysis: AnalysisConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("ips-analyzer.db"),
        }
    }
}

/// HTTP trigger surface
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "127.0.0.1".to_string(),
            port: 5080,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MarketDataConfig {
    pub base_url: String,
    pub api_key: String,
    /// Quote / chain freshness window
    pub cache_ttl_secs: u64,
    /// Soft ceiling on chargeable upstream calls per UTC day
    pub daily_budget: u32,
    /// Symbols fetched concurrently per batch. A quote-and-chain fetch
    /// makes two upstream calls per symbol, so its call rate is double.
    pub batch_size: usize,
    /// Pause between batches
    pub batch_delay_ms: u64,
    pub request_timeout_secs: u64,
}

impl Default for MarketDataConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: String::new(),
            cache_ttl_secs: 3 * 60 * 60,
            daily_budget: 500,
            batch_size: 5,
            batch_delay_ms: 5_000,
            request_timeout_secs: 30,
        }
    }
}

impl MarketDataConfig {
    pub fn cache_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.cache_ttl_secs as i64)
    }

    pub fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.batch_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub max_concurrent_jobs: usize,
    pub poll_interval_secs: u64,
    /// Pending jobs older than this are picked up by the recovery sweep
    pub stuck_after_secs: u64,
    /// Wall-clock cap for one job run
    pub job_timeout_secs: u64,
    pub queue_capacity: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 4,
            poll_interval_secs: 30,
            stuck_after_secs: 60,
            job_timeout_secs: 300,
            queue_capacity: 256,
        }
    }
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn stuck_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.stuck_after_secs as i64)
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub max_candidates: usize,
    pub max_symbols: usize,
    pub max_dte: i64,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            max_candidates: 10,
            max_symbols: 50,
            max_dte: 60,
        }
    }
}

impl AppConfig {
    /// Load from `IPS_CONFIG` (if set) and the environment, then validate
    pub fn load() -> Result<Self> {
        let mut config = match std::env::var("IPS_CONFIG") {
            Ok(path) => {
                tracing::info!("Loading configuration from {}", path);
                Self::from_toml_str(&std::fs::read_to_string(&path)?)?
            }
            Err(_) => Self::default(),
        };

        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| AppError::Config(format!("Invalid config file: {}", e)))
    }

    fn apply_env<F>(&mut self, var: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = var("IPS_DATABASE_PATH") {
            self.database.path = PathBuf::from(path);
        }
        if let Some(host) = var("IPS_API_HOST") {
            self.api.host = host;
        }
        if let Some(port) = var("IPS_API_PORT") {
            self.api.port = port
                .parse()
                .map_err(|e| AppError::Config(format!("IPS_API_PORT '{}': {}", port, e)))?;
        }
        if let Some(key) = var("ALPHA_VANTAGE_API_KEY") {
            self.market_data.api_key = key;
        }
        if let Some(url) = var("ALPHA_VANTAGE_BASE_URL") {
            self.market_data.base_url = url;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let md = &self.market_data;
        if md.api_key.trim().is_empty() {
            return Err(AppError::Config(
                "market_data.api_key is required (or set ALPHA_VANTAGE_API_KEY)".to_string(),
            ));
        }
        url::Url::parse(&md.base_url).map_err(|e| {
            AppError::Config(format!("market_data.base_url '{}': {}", md.base_url, e))
        })?;
        if md.batch_size == 0 {
            return Err(AppError::Config("market_data.batch_size must be > 0".to_string()));
        }
        if md.daily_budget == 0 {
            return Err(AppError::Config("market_data.daily_budget must be > 0".to_string()));
        }
        if self.worker.max_concurrent_jobs == 0 || self.worker.queue_capacity == 0 {
            return Err(AppError::Config(
                "worker.max_concurrent_jobs and worker.queue_capacity must be > 0".to_string(),
            ));
        }
        if self.worker.poll_interval_secs == 0 || self.worker.job_timeout_secs == 0 {
            return Err(AppError::Config(
                "worker.poll_interval_secs and worker.job_timeout_secs must be > 0".to_string(),
            ));
        }
        if self.analysis.max_symbols == 0 {
            return Err(AppError::Config("analysis.max_symbols must be > 0".to_string()));
        }
        Ok(())
    }
}
