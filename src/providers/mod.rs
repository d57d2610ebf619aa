//! Market data provider adapters

pub mod alphavantage;
pub mod types;

use crate::error::AppError;
use async_trait::async_trait;
use thiserror::Error;
use types::*;

/// Quote / options-chain source that all provider adapters must implement
#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    /// Provider ID (e.g., "alphavantage")
    fn id(&self) -> &'static str;

    /// Latest quote for one underlying
    async fn fetch_quote(&self, symbol: &str) -> Result<Quote, ProviderError>;

    /// Current option chain for one underlying
    async fn fetch_options_chain(&self, symbol: &str) -> Result<Vec<OptionContract>, ProviderError>;
}

/// Classified provider failure
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("rate limited by provider: {0}")]
    RateLimited(String),

    #[error("provider unavailable: {0}")]
    Unavailable(String),

    #[error("malformed provider response: {0}")]
    Malformed(String),
}

/// Coarse failure class the gateway reacts to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderErrorKind {
    RateLimit,
    Unavailable,
}

impl ProviderErrorKind {
    pub fn code(&self) -> &'static str {
        match self {
            ProviderErrorKind::RateLimit => "RATE_LIMIT",
            ProviderErrorKind::Unavailable => "UNAVAILABLE",
        }
    }
}

impl ProviderError {
    pub fn kind(&self) -> ProviderErrorKind {
        match self {
            ProviderError::RateLimited(_) => ProviderErrorKind::RateLimit,
            ProviderError::Unavailable(_) | ProviderError::Malformed(_) => {
                ProviderErrorKind::Unavailable
            }
        }
    }

    pub fn is_rate_limit(&self) -> bool {
        self.kind() == ProviderErrorKind::RateLimit
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.status() == Some(reqwest::StatusCode::TOO_MANY_REQUESTS) {
            ProviderError::RateLimited(err.to_string())
        } else {
            ProviderError::Unavailable(err.to_string())
        }
    }
}

impl From<ProviderError> for AppError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::RateLimited(msg) => AppError::RateLimited(msg),
            other => AppError::Upstream(other.to_string()),
        }
    }
}
