//! Market Data Gateway
//!
//! Fronts the quota-limited provider with the TTL caches and the daily
//! budget. For every symbol it serves fresh cache, falls back to stale cache,
//! or calls upstream. Provider failures stop here: callers always get a
//! (possibly empty) tagged value, never a fetch error.

use crate::cache::{ChainCache, DailyBudget, QuoteCache, TtlCache};
use crate::clock::Clock;
use crate::config::MarketDataConfig;
use crate::providers::types::{OptionContract, Quote};
use crate::providers::{MarketDataProvider, ProviderError, ProviderErrorKind};
use futures_util::future::join_all;
use serde::{Serialize, Serializer};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

// ============================================================================
// Tags
// ============================================================================

/// Why a symbol could not be served fresh from upstream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DegradeReason {
    BudgetExceeded,
    RateLimit,
    Unavailable,
}

impl DegradeReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DegradeReason::BudgetExceeded => "budget-exceeded",
            DegradeReason::RateLimit => ProviderErrorKind::RateLimit.code(),
            DegradeReason::Unavailable => ProviderErrorKind::Unavailable.code(),
        }
    }
}

impl From<ProviderErrorKind> for DegradeReason {
    fn from(kind: ProviderErrorKind) -> Self {
        match kind {
            ProviderErrorKind::RateLimit => DegradeReason::RateLimit,
            ProviderErrorKind::Unavailable => DegradeReason::Unavailable,
        }
    }
}

/// Annotation on a degraded read, e.g. `served-stale:RATE_LIMIT`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataTag {
    ServedStale(DegradeReason),
    NoData(DegradeReason),
}

impl DataTag {
    pub fn reason(&self) -> DegradeReason {
        match self {
            DataTag::ServedStale(reason) | DataTag::NoData(reason) => *reason,
        }
    }
}

impl fmt::Display for DataTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataTag::ServedStale(reason) => write!(f, "served-stale:{}", reason.as_str()),
            DataTag::NoData(reason) => write!(f, "no-data:{}", reason.as_str()),
        }
    }
}

impl Serialize for DataTag {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

// ============================================================================
// Results
// ============================================================================

/// Outcome of one gateway read
#[derive(Debug, Clone, Serialize)]
pub struct MarketData<T> {
    pub symbol: String,
    pub value: Option<T>,
    /// Served from cache (fresh or stale) rather than from upstream
    pub from_cache: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<DataTag>,
    /// The provider signalled a rate limit on this read
    pub rate_limited: bool,
}

impl<T> MarketData<T> {
    fn fresh(symbol: &str, value: T, from_cache: bool) -> Self {
        Self {
            symbol: symbol.to_string(),
            value: Some(value),
            from_cache,
            tag: None,
            rate_limited: false,
        }
    }

    fn degraded(symbol: &str, stale: Option<T>, reason: DegradeReason) -> Self {
        let tag = match stale {
            Some(_) => DataTag::ServedStale(reason),
            None => DataTag::NoData(reason),
        };
        Self {
            symbol: symbol.to_string(),
            from_cache: stale.is_some(),
            value: stale,
            tag: Some(tag),
            rate_limited: reason == DegradeReason::RateLimit,
        }
    }

    pub fn is_stale(&self) -> bool {
        matches!(self.tag, Some(DataTag::ServedStale(_)))
    }
}

/// Quote plus (optionally) option chain for one underlying
#[derive(Debug, Clone, Serialize)]
pub struct SymbolData {
    pub symbol: String,
    pub quote: MarketData<Quote>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chain: Option<MarketData<Vec<OptionContract>>>,
}

impl SymbolData {
    pub fn tags(&self) -> Vec<DataTag> {
        let mut tags: Vec<DataTag> = self.quote.tag.into_iter().collect();
        if let Some(tag) = self.chain.as_ref().and_then(|c| c.tag) {
            if !tags.contains(&tag) {
                tags.push(tag);
            }
        }
        tags
    }

    pub fn rate_limited(&self) -> bool {
        self.quote.rate_limited || self.chain.as_ref().map_or(false, |c| c.rate_limited)
    }

    pub fn has_quote(&self) -> bool {
        self.quote.value.is_some()
    }

    pub fn contracts(&self) -> &[OptionContract] {
        self.chain
            .as_ref()
            .and_then(|c| c.value.as_deref())
            .unwrap_or(&[])
    }
}

/// Which resources a batch fetch should resolve per symbol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchScope {
    QuoteOnly,
    QuoteAndChain,
}

impl FetchScope {
    /// Upstream calls one uncached symbol costs
    pub fn calls_per_symbol(&self) -> usize {
        match self {
            FetchScope::QuoteOnly => 1,
            FetchScope::QuoteAndChain => 2,
        }
    }
}

/// Batch progress: symbols resolved so far and the total
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchProgress {
    pub batch: usize,
    pub total_batches: usize,
    pub symbols_processed: usize,
    pub total_symbols: usize,
}

// ============================================================================
// Service
// ============================================================================

/// Gateway settings taken from `[market_data]`
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub daily_ceiling: u32,
    pub batch_size: usize,
    pub batch_delay: Duration,
}

impl GatewaySettings {
    /// Worst-case upstream call rate of a cold-cache batch fetch.
    /// `batch_size` counts symbols, so the rate scales with the scope.
    pub fn calls_per_minute(&self, scope: FetchScope) -> f64 {
        let calls = (self.batch_size.max(1) * scope.calls_per_symbol()) as f64;
        if self.batch_delay.is_zero() {
            return f64::INFINITY;
        }
        calls * 60.0 / self.batch_delay.as_secs_f64()
    }
}

impl From<&MarketDataConfig> for GatewaySettings {
    fn from(config: &MarketDataConfig) -> Self {
        Self {
            daily_ceiling: config.daily_budget,
            batch_size: config.batch_size.max(1),
            batch_delay: config.batch_delay(),
        }
    }
}

/// Market data service for the job pipelines
pub struct MarketDataService {
    provider: Arc<dyn MarketDataProvider>,
    quotes: QuoteCache,
    chains: ChainCache,
    budget: Arc<DailyBudget>,
    settings: GatewaySettings,
}

impl MarketDataService {
    pub fn new(
        provider: Arc<dyn MarketDataProvider>,
        budget: Arc<DailyBudget>,
        cache_ttl: chrono::Duration,
        clock: Arc<dyn Clock>,
        settings: GatewaySettings,
    ) -> Self {
        Self {
            provider,
            quotes: TtlCache::new(cache_ttl, clock.clone()),
            chains: TtlCache::new(cache_ttl, clock),
            budget,
            settings,
        }
    }

    pub fn budget(&self) -> &DailyBudget {
        &self.budget
    }

    /// Quote for one symbol
    pub async fn get_quote(&self, symbol: &str) -> MarketData<Quote> {
        self.resolve("quote", symbol, &self.quotes, || {
            self.provider.fetch_quote(symbol)
        })
        .await
    }

    /// Option chain for one symbol
    pub async fn get_options_chain(&self, symbol: &str) -> MarketData<Vec<OptionContract>> {
        self.resolve("options_chain", symbol, &self.chains, || {
            self.provider.fetch_options_chain(symbol)
        })
        .await
    }

    /// Quote and, for [`FetchScope::QuoteAndChain`], the chain for one symbol
    pub async fn fetch_symbol(&self, symbol: &str, scope: FetchScope) -> SymbolData {
        match scope {
            FetchScope::QuoteOnly => SymbolData {
                symbol: symbol.to_string(),
                quote: self.get_quote(symbol).await,
                chain: None,
            },
            FetchScope::QuoteAndChain => {
                let (quote, chain) =
                    futures_util::join!(self.get_quote(symbol), self.get_options_chain(symbol));
                SymbolData {
                    symbol: symbol.to_string(),
                    quote,
                    chain: Some(chain),
                }
            }
        }
    }

    /// Fetch many symbols in fixed-size concurrent batches.
    ///
    /// Sleeps `batch_delay` between batches (never after the last one).
    /// Results keep the input order; `on_batch` runs after every batch.
    pub async fn fetch_batch<F>(
        &self,
        symbols: &[String],
        scope: FetchScope,
        mut on_batch: F,
    ) -> Vec<SymbolData>
    where
        F: FnMut(BatchProgress) + Send,
    {
        let batch_size = self.settings.batch_size.max(1);
        let total_batches = symbols.len().div_ceil(batch_size);
        let mut results = Vec::with_capacity(symbols.len());

        info!(
            "MarketDataService::fetch_batch - {} symbols in {} batches of {} (up to {:.0} calls/min)",
            symbols.len(),
            total_batches,
            batch_size,
            self.settings.calls_per_minute(scope)
        );

        for (index, chunk) in symbols.chunks(batch_size).enumerate() {
            if index > 0 && !self.settings.batch_delay.is_zero() {
                debug!(
                    "MarketDataService::fetch_batch - pausing {:?} before batch {}",
                    self.settings.batch_delay,
                    index + 1
                );
                tokio::time::sleep(self.settings.batch_delay).await;
            }

            let batch = join_all(chunk.iter().map(|s| self.fetch_symbol(s, scope))).await;
            results.extend(batch);

            on_batch(BatchProgress {
                batch: index + 1,
                total_batches,
                symbols_processed: results.len(),
                total_symbols: symbols.len(),
            });
        }

        results
    }

    /// Cache / budget / upstream decision for one resource
    async fn resolve<T, F, Fut>(
        &self,
        resource: &str,
        symbol: &str,
        cache: &TtlCache<T>,
        fetch: F,
    ) -> MarketData<T>
    where
        T: Clone,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, ProviderError>>,
    {
        if let Some(value) = cache.get(symbol) {
            debug!("MarketDataService::{} - {} fresh from cache", resource, symbol);
            return MarketData::fresh(symbol, value, true);
        }

        let Some(permit) = self.budget.try_reserve(self.settings.daily_ceiling) else {
            warn!(
                "MarketDataService::{} - daily budget of {} reached, {} not fetched",
                resource, self.settings.daily_ceiling, symbol
            );
            return MarketData::degraded(
                symbol,
                cache.get_stale(symbol),
                DegradeReason::BudgetExceeded,
            );
        };

        match fetch().await {
            Ok(value) => {
                permit.commit();
                cache.set(symbol, value.clone());
                MarketData::fresh(symbol, value, false)
            }
            Err(err) => {
                self.budget.refund(permit);
                let reason = DegradeReason::from(err.kind());
                warn!(
                    "MarketDataService::{} - {} failed ({}): {}",
                    resource,
                    symbol,
                    reason.as_str(),
                    err
                );
                MarketData::degraded(symbol, cache.get_stale(symbol), reason)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::providers::types::OptionType;
    use async_trait::async_trait;
    use chrono::{NaiveDate, TimeZone, Utc};
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scripted provider; symbols without a script succeed
    #[derive(Default)]
    struct MockProvider {
        failures: Mutex<HashMap<String, ProviderError>>,
        quote_calls: AtomicUsize,
        chain_calls: AtomicUsize,
    }

    impl MockProvider {
        fn fail(&self, symbol: &str, err: ProviderError) {
            self.failures.lock().insert(symbol.to_string(), err);
        }

        fn recover(&self, symbol: &str) {
            self.failures.lock().remove(symbol);
        }

        fn scripted(&self, symbol: &str) -> std::result::Result<(), ProviderError> {
            match self.failures.lock().get(symbol) {
                Some(err) => Err(err.clone()),
                None => Ok(()),
            }
        }
    }

    #[async_trait]
    impl MarketDataProvider for MockProvider {
        fn id(&self) -> &'static str {
            "mock"
        }

        async fn fetch_quote(&self, symbol: &str) -> std::result::Result<Quote, ProviderError> {
            self.quote_calls.fetch_add(1, Ordering::SeqCst);
            self.scripted(symbol)?;
            Ok(Quote {
                symbol: symbol.to_string(),
                price: 100.0 + self.quote_calls.load(Ordering::SeqCst) as f64,
                open: 99.0,
                high: 101.0,
                low: 98.0,
                previous_close: 99.0,
                change: 1.0,
                change_percent: 1.01,
                volume: 1_000,
                latest_trading_day: "2024-03-01".to_string(),
            })
        }

        async fn fetch_options_chain(
            &self,
            symbol: &str,
        ) -> std::result::Result<Vec<OptionContract>, ProviderError> {
            self.chain_calls.fetch_add(1, Ordering::SeqCst);
            self.scripted(symbol)?;
            Ok(vec![OptionContract {
                contract_id: format!("{}240315P00100000", symbol),
                symbol: symbol.to_string(),
                expiration: NaiveDate::from_ymd_opt(2024, 3, 15).unwrap(),
                strike: 100.0,
                option_type: OptionType::Put,
                bid: 1.0,
                ask: 1.2,
                last: 1.1,
                volume: 10,
                open_interest: 100,
                implied_volatility: Some(0.25),
                delta: Some(-0.3),
                gamma: None,
                theta: None,
                vega: None,
            }])
        }
    }

    struct Fixture {
        clock: Arc<ManualClock>,
        provider: Arc<MockProvider>,
        service: MarketDataService,
    }

    fn fixture(ceiling: u32, batch_size: usize, batch_delay: Duration) -> Fixture {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 3, 1, 14, 0, 0).unwrap(),
        ));
        let provider = Arc::new(MockProvider::default());
        let service = MarketDataService::new(
            provider.clone(),
            Arc::new(DailyBudget::new(clock.clone())),
            chrono::Duration::hours(3),
            clock.clone(),
            GatewaySettings {
                daily_ceiling: ceiling,
                batch_size,
                batch_delay,
            },
        );
        Fixture {
            clock,
            provider,
            service,
        }
    }

    fn symbols(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("SYM{}", i)).collect()
    }

    #[tokio::test]
    async fn test_fresh_cache_skips_upstream_and_budget() {
        let f = fixture(10, 5, Duration::ZERO);

        let first = f.service.get_quote("spy").await;
        assert!(!first.from_cache);
        assert_eq!(f.service.budget().value(), 1);

        let second = f.service.get_quote("SPY").await;
        assert!(second.from_cache);
        assert!(second.tag.is_none());
        assert_eq!(second.value, first.value);
        assert_eq!(f.provider.quote_calls.load(Ordering::SeqCst), 1);
        assert_eq!(f.service.budget().value(), 1);
    }

    #[tokio::test]
    async fn test_expired_entry_is_refetched() {
        let f = fixture(10, 5, Duration::ZERO);
        f.service.get_quote("SPY").await;

        f.clock.advance(chrono::Duration::hours(3) + chrono::Duration::seconds(1));
        let again = f.service.get_quote("SPY").await;
        assert!(!again.from_cache);
        assert_eq!(f.provider.quote_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_budget_exhausted_serves_stale_or_no_data() {
        let f = fixture(1, 5, Duration::ZERO);
        f.service.get_quote("SPY").await;
        f.clock.advance(chrono::Duration::hours(4));

        let stale = f.service.get_quote("SPY").await;
        assert!(stale.value.is_some());
        assert!(stale.is_stale());
        assert_eq!(stale.tag.unwrap().to_string(), "served-stale:budget-exceeded");
        assert!(!stale.rate_limited);

        let missing = f.service.get_quote("QQQ").await;
        assert!(missing.value.is_none());
        assert_eq!(missing.tag.unwrap().to_string(), "no-data:budget-exceeded");

        assert_eq!(f.provider.quote_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rate_limit_falls_back_without_charging() {
        let f = fixture(10, 5, Duration::ZERO);
        f.service.get_quote("SPY").await;
        f.clock.advance(chrono::Duration::hours(4));
        f.provider
            .fail("SPY", ProviderError::RateLimited("5 calls per minute".into()));
        f.provider
            .fail("QQQ", ProviderError::RateLimited("5 calls per minute".into()));

        let stale = f.service.get_quote("SPY").await;
        assert!(stale.rate_limited);
        assert_eq!(stale.tag.unwrap().to_string(), "served-stale:RATE_LIMIT");
        assert!(stale.value.is_some());

        let missing = f.service.get_quote("QQQ").await;
        assert!(missing.rate_limited);
        assert_eq!(missing.tag.unwrap().to_string(), "no-data:RATE_LIMIT");

        assert_eq!(f.service.budget().value(), 1);
    }

    #[tokio::test]
    async fn test_unavailable_is_tagged_and_refunded() {
        let f = fixture(10, 5, Duration::ZERO);
        f.provider
            .fail("SPY", ProviderError::Unavailable("HTTP 503".into()));

        let result = f.service.get_quote("SPY").await;
        assert!(result.value.is_none());
        assert!(!result.rate_limited);
        assert_eq!(result.tag.unwrap().to_string(), "no-data:UNAVAILABLE");
        assert_eq!(f.service.budget().value(), 0);

        f.provider.recover("SPY");
        assert!(f.service.get_quote("SPY").await.value.is_some());
        assert_eq!(f.service.budget().value(), 1);
    }

    #[tokio::test]
    async fn test_symbol_data_with_chain() {
        let f = fixture(10, 5, Duration::ZERO);
        let data = f
            .service
            .fetch_symbol("SPY", FetchScope::QuoteAndChain)
            .await;

        assert!(data.has_quote());
        assert_eq!(data.contracts().len(), 1);
        assert!(data.tags().is_empty());
        assert_eq!(f.service.budget().value(), 2);

        let quote_only = f.service.fetch_symbol("QQQ", FetchScope::QuoteOnly).await;
        assert!(quote_only.chain.is_none());
        assert_eq!(f.provider.chain_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_batch_isolates_failures_and_keeps_order() {
        let f = fixture(100, 2, Duration::ZERO);
        f.provider
            .fail("SYM1", ProviderError::Unavailable("boom".into()));

        let input = symbols(5);
        let results = f
            .service
            .fetch_batch(&input, FetchScope::QuoteOnly, |_| {})
            .await;

        let order: Vec<&str> = results.iter().map(|r| r.symbol.as_str()).collect();
        assert_eq!(order, vec!["SYM0", "SYM1", "SYM2", "SYM3", "SYM4"]);
        assert!(!results[1].has_quote());
        assert_eq!(results.iter().filter(|r| r.has_quote()).count(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_count_and_total_delay() {
        let delay = Duration::from_millis(5_000);
        for (k, b) in [(12usize, 5usize), (10, 5), (1, 5), (7, 1)] {
            let f = fixture(1_000, b, delay);
            let mut progress = Vec::new();

            let started = tokio::time::Instant::now();
            f.service
                .fetch_batch(&symbols(k), FetchScope::QuoteOnly, |p| progress.push(p))
                .await;
            let elapsed = started.elapsed();

            let batches = k.div_ceil(b);
            assert_eq!(progress.len(), batches);
            assert_eq!(elapsed, delay * (batches as u32 - 1));
            let last = progress.last().unwrap();
            assert_eq!(last.symbols_processed, k);
            assert_eq!(last.total_batches, batches);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_batch_never_sleeps() {
        let f = fixture(10, 5, Duration::from_secs(5));
        let started = tokio::time::Instant::now();
        let results = f
            .service
            .fetch_batch(&[], FetchScope::QuoteOnly, |_| panic!("no batches expected"))
            .await;
        assert!(results.is_empty());
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[test]
    fn test_tag_serializes_as_string() {
        let json = serde_json::to_string(&DataTag::ServedStale(DegradeReason::RateLimit)).unwrap();
        assert_eq!(json, "\"served-stale:RATE_LIMIT\"");
    }

    #[test]
    fn test_call_rate_scales_with_scope() {
        let settings = GatewaySettings::from(&MarketDataConfig::default());
        assert_eq!(settings.calls_per_minute(FetchScope::QuoteOnly), 60.0);
        assert_eq!(settings.calls_per_minute(FetchScope::QuoteAndChain), 120.0);
    }
}
