//! In-process market data caches
//!
//! - `TtlCache` - per-symbol snapshot cache with a freshness window
//! - `DailyBudget` - day-scoped soft ceiling on chargeable upstream calls
//!
//! Both are constructed once in `AppState` and shared by reference; there are
//! no process-wide singletons.

mod budget;
mod quote_cache;

pub use budget::{BudgetPermit, DailyBudget};
pub use quote_cache::{ChainCache, QuoteCache, TtlCache};
