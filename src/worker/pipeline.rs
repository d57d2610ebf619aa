//! Job pipelines
//!
//! Job parameters, their validation, and the ordered steps each job kind runs.
//! agent-analysis: fetch_data -> score -> select_candidates -> persist -> finalize
//! dashboard-refresh: fetch_data -> persist -> finalize

use crate::config::AnalysisConfig;
use crate::db::{Candidate, JobKind, JobStore};
use crate::error::{AppError, Result};
use crate::providers::types::{OptionContract, OptionType};
use crate::scoring::{self, features, FeatureMap, IpsPolicy, ScoreResult};
use crate::services::market_data_service::{
    DataTag, DegradeReason, FetchScope, MarketDataService, SymbolData,
};
use crate::worker::runner::ProgressTracker;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info};

const MAX_SYMBOL_LEN: usize = 10;

// ============================================================================
// Steps
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    FetchData,
    Score,
    SelectCandidates,
    Persist,
    Finalize,
}

impl Step {
    pub fn as_str(&self) -> &'static str {
        match self {
            Step::FetchData => "fetch_data",
            Step::Score => "score",
            Step::SelectCandidates => "select_candidates",
            Step::Persist => "persist",
            Step::Finalize => "finalize",
        }
    }
}

const ANALYSIS_STEPS: &[Step] = &[
    Step::FetchData,
    Step::Score,
    Step::SelectCandidates,
    Step::Persist,
    Step::Finalize,
];

const REFRESH_STEPS: &[Step] = &[Step::FetchData, Step::Persist, Step::Finalize];

pub fn steps_for(kind: JobKind) -> &'static [Step] {
    match kind {
        JobKind::AgentAnalysis => ANALYSIS_STEPS,
        JobKind::DashboardRefresh => REFRESH_STEPS,
    }
}

// ============================================================================
// Parameters
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisParams {
    pub symbols: Vec<String>,
    pub policy: IpsPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_candidates: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub option_type: Option<OptionType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_dte: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshParams {
    pub symbols: Vec<String>,
}

/// Validated parameters of one job
#[derive(Debug, Clone)]
pub enum JobRequest {
    Analysis(AnalysisParams),
    Refresh(RefreshParams),
}

impl JobRequest {
    /// Decode and validate raw job parameters, normalizing the symbol list
    pub fn parse(kind: JobKind, params: &Value, limits: &AnalysisConfig) -> Result<Self> {
        match kind {
            JobKind::AgentAnalysis => {
                let mut p: AnalysisParams = decode(kind, params)?;
                p.symbols = validate_symbols(&p.symbols, limits.max_symbols)?;
                p.policy.normalize()?;
                if p.max_candidates == Some(0) {
                    return Err(AppError::Validation("max_candidates must be > 0".to_string()));
                }
                if matches!(p.max_dte, Some(d) if d < 0) {
                    return Err(AppError::Validation("max_dte must be >= 0".to_string()));
                }
                Ok(JobRequest::Analysis(p))
            }
            JobKind::DashboardRefresh => {
                let mut p: RefreshParams = decode(kind, params)?;
                p.symbols = validate_symbols(&p.symbols, limits.max_symbols)?;
                Ok(JobRequest::Refresh(p))
            }
        }
    }

    pub fn kind(&self) -> JobKind {
        match self {
            JobRequest::Analysis(_) => JobKind::AgentAnalysis,
            JobRequest::Refresh(_) => JobKind::DashboardRefresh,
        }
    }

    pub fn symbols(&self) -> &[String] {
        match self {
            JobRequest::Analysis(p) => &p.symbols,
            JobRequest::Refresh(p) => &p.symbols,
        }
    }

    pub fn steps(&self) -> &'static [Step] {
        steps_for(self.kind())
    }

    pub fn to_value(&self) -> Result<Value> {
        Ok(match self {
            JobRequest::Analysis(p) => serde_json::to_value(p)?,
            JobRequest::Refresh(p) => serde_json::to_value(p)?,
        })
    }
}

fn decode<T: serde::de::DeserializeOwned>(kind: JobKind, params: &Value) -> Result<T> {
    serde_json::from_value(params.clone()).map_err(|e| {
        AppError::Validation(format!("Invalid {} parameters: {}", kind.as_str(), e))
    })
}

/// Trim, upper-case and de-duplicate tickers (first occurrence wins)
pub fn validate_symbols(raw: &[String], max_symbols: usize) -> Result<Vec<String>> {
    let mut seen = HashSet::new();
    let mut symbols = Vec::with_capacity(raw.len());

    for s in raw {
        let symbol = s.trim().to_ascii_uppercase();
        let valid = !symbol.is_empty()
            && symbol.len() <= MAX_SYMBOL_LEN
            && symbol
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-');
        if !valid {
            return Err(AppError::Validation(format!("Invalid symbol '{}'", s)));
        }
        if seen.insert(symbol.clone()) {
            symbols.push(symbol);
        }
    }

    if symbols.is_empty() {
        return Err(AppError::Validation("At least one symbol is required".to_string()));
    }
    if symbols.len() > max_symbols {
        return Err(AppError::Validation(format!(
            "Too many symbols: {} (max {})",
            symbols.len(),
            max_symbols
        )));
    }
    Ok(symbols)
}

// ============================================================================
// Execution
// ============================================================================

/// A contract that survived filtering, with its score
#[derive(Debug, Clone)]
struct ScoredContract {
    contract: OptionContract,
    dte: i64,
    features: FeatureMap,
    score: ScoreResult,
    data_tags: Vec<String>,
}

/// State carried between the steps of one job run
pub struct PipelineRun {
    job_id: String,
    request: JobRequest,
    as_of: NaiveDate,
    limits: AnalysisConfig,
    market_data: Arc<MarketDataService>,
    store: Arc<dyn JobStore>,
    data: Vec<SymbolData>,
    scored: Vec<ScoredContract>,
    selected: Vec<Candidate>,
    result: Option<Value>,
}

impl PipelineRun {
    pub fn new(
        job_id: &str,
        request: JobRequest,
        as_of: NaiveDate,
        limits: AnalysisConfig,
        market_data: Arc<MarketDataService>,
        store: Arc<dyn JobStore>,
    ) -> Self {
        Self {
            job_id: job_id.to_string(),
            request,
            as_of,
            limits,
            market_data,
            store,
            data: Vec::new(),
            scored: Vec::new(),
            selected: Vec::new(),
            result: None,
        }
    }

    pub fn steps(&self) -> &'static [Step] {
        self.request.steps()
    }

    /// Result payload, available once `finalize` has run
    pub fn into_result(self) -> Option<Value> {
        self.result
    }

    pub async fn execute(&mut self, step: Step, tracker: &ProgressTracker) -> Result<()> {
        debug!("PipelineRun::execute - job={} step={}", self.job_id, step.as_str());
        match step {
            Step::FetchData => self.fetch_data(tracker).await,
            Step::Score => self.score(),
            Step::SelectCandidates => {
                self.select_candidates();
                Ok(())
            }
            Step::Persist => self.persist(),
            Step::Finalize => {
                self.finalize();
                Ok(())
            }
        }
    }

    async fn fetch_data(&mut self, tracker: &ProgressTracker) -> Result<()> {
        let scope = match self.request {
            JobRequest::Analysis(_) => FetchScope::QuoteAndChain,
            JobRequest::Refresh(_) => FetchScope::QuoteOnly,
        };

        let data = self
            .market_data
            .fetch_batch(self.request.symbols(), scope, |p| {
                tracker.symbols_processed(p.symbols_processed as u32)
            })
            .await;

        let usable = data
            .iter()
            .filter(|d| match scope {
                FetchScope::QuoteOnly => d.has_quote(),
                FetchScope::QuoteAndChain => !d.contracts().is_empty(),
            })
            .count();

        if usable == 0 {
            return Err(no_data_error(&data));
        }

        info!(
            "PipelineRun::fetch_data - job={} {}/{} symbols with data",
            self.job_id,
            usable,
            data.len()
        );
        self.data = data;
        Ok(())
    }

    fn score(&mut self) -> Result<()> {
        let JobRequest::Analysis(params) = &self.request else {
            return Ok(());
        };
        let policy = params.policy.normalize()?;
        let option_type = params.option_type.unwrap_or(OptionType::Put);
        let max_dte = params.max_dte.unwrap_or(self.limits.max_dte);

        let mut scored = Vec::new();
        for data in &self.data {
            let chain = data.contracts();
            let chain_iv = features::iv_range(chain);
            let tags: Vec<String> = data.tags().iter().map(DataTag::to_string).collect();

            for contract in chain {
                let dte = contract.days_to_expiry(self.as_of);
                if contract.option_type != option_type || dte < 0 || dte > max_dte {
                    continue;
                }
                let features = features::contract_features(
                    data.quote.value.as_ref(),
                    contract,
                    chain_iv,
                    self.as_of,
                );
                let score = scoring::score(&policy, &features);
                scored.push(ScoredContract {
                    contract: contract.clone(),
                    dte,
                    features,
                    score,
                    data_tags: tags.clone(),
                });
            }
        }

        info!(
            "PipelineRun::score - job={} scored {} contracts",
            self.job_id,
            scored.len()
        );
        self.scored = scored;
        Ok(())
    }

    fn select_candidates(&mut self) {
        let JobRequest::Analysis(params) = &self.request else {
            return;
        };
        let limit = params.max_candidates.unwrap_or(self.limits.max_candidates);

        let mut ranked: Vec<&ScoredContract> = self.scored.iter().collect();
        ranked.sort_by(|a, b| rank_order(a, b));

        self.selected = ranked
            .into_iter()
            .take(limit)
            .enumerate()
            .map(|(i, s)| Candidate {
                rank: i as u32 + 1,
                symbol: s.contract.symbol.clone(),
                contract_id: s.contract.contract_id.clone(),
                expiration: s.contract.expiration,
                strike: s.contract.strike,
                option_type: s.contract.option_type,
                mid: s.contract.mid(),
                dte: s.dte,
                score: s.score.clone(),
                features: s.features.clone(),
                data_tags: s.data_tags.clone(),
            })
            .collect();
    }

    fn persist(&mut self) -> Result<()> {
        match self.request {
            JobRequest::Analysis(_) => {
                self.store
                    .save_candidates(&self.job_id, &self.selected)
                    .map_err(|e| AppError::Pipeline {
                        step: Step::Persist.as_str().to_string(),
                        message: e.to_string(),
                    })
            }
            // Refreshed quotes already live in the cache; nothing else to store
            JobRequest::Refresh(_) => Ok(()),
        }
    }

    fn finalize(&mut self) {
        let data_tags: BTreeMap<&str, Vec<String>> = self
            .data
            .iter()
            .filter_map(|d| {
                let tags = d.tags();
                (!tags.is_empty()).then(|| {
                    (
                        d.symbol.as_str(),
                        tags.iter().map(DataTag::to_string).collect::<Vec<_>>(),
                    )
                })
            })
            .collect();
        let rate_limited = self.data.iter().any(SymbolData::rate_limited);
        let symbols_with_data = self.data.iter().filter(|d| d.has_quote()).count();

        let result = match &self.request {
            JobRequest::Analysis(params) => json!({
                "symbols_requested": params.symbols.len(),
                "symbols_with_data": symbols_with_data,
                "candidates_scored": self.scored.len(),
                "candidates_selected": self.selected.len(),
                "top": self.selected.iter().map(|c| json!({
                    "rank": c.rank,
                    "symbol": c.symbol,
                    "contract_id": c.contract_id,
                    "alignment": c.score.alignment,
                })).collect::<Vec<_>>(),
                "rate_limited": rate_limited,
                "data_tags": data_tags,
            }),
            JobRequest::Refresh(params) => json!({
                "symbols_requested": params.symbols.len(),
                "symbols_with_data": symbols_with_data,
                "quotes": self.data.iter().filter_map(|d| d.quote.value.as_ref().map(|q| json!({
                    "symbol": q.symbol,
                    "price": q.price,
                    "change_percent": q.change_percent,
                    "from_cache": d.quote.from_cache,
                    "stale": d.quote.is_stale(),
                }))).collect::<Vec<_>>(),
                "rate_limited": rate_limited,
                "data_tags": data_tags,
            }),
        };
        self.result = Some(result);
    }
}

/// Alignment descending, then contract id ascending
fn rank_order(a: &ScoredContract, b: &ScoredContract) -> Ordering {
    b.score
        .alignment
        .partial_cmp(&a.score.alignment)
        .unwrap_or(Ordering::Equal)
        .then_with(|| a.contract.contract_id.cmp(&b.contract.contract_id))
}

/// Error for a fetch that produced nothing usable, named after the
/// most specific degradation seen
fn no_data_error(data: &[SymbolData]) -> AppError {
    let reasons: HashSet<DegradeReason> = data
        .iter()
        .flat_map(|d| d.tags())
        .map(|t| t.reason())
        .collect();
    let symbols = data.len();

    if reasons.contains(&DegradeReason::RateLimit) {
        AppError::RateLimited(format!("No market data for {} symbols", symbols))
    } else if reasons.contains(&DegradeReason::BudgetExceeded) {
        AppError::BudgetExceeded(format!("No market data for {} symbols", symbols))
    } else {
        AppError::Upstream(format!("No market data for {} symbols", symbols))
    }
}
