//! Services Layer
//!
//! - `MarketDataService` - cached, budget-guarded quote and option-chain gateway

pub mod market_data_service;

pub use market_data_service::{
    BatchProgress, DataTag, DegradeReason, FetchScope, GatewaySettings, MarketData,
    MarketDataService, SymbolData,
};
