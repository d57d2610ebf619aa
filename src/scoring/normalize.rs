//! Raw factor value -> [0, 1]
//!
//! Every recognised factor has a fixed mapping. Unknown keys, absent values
//! and values that cannot be read as the expected type all map to the neutral
//! midpoint so missing data is never scored as zero.

use super::features::FeatureValue;

pub const NEUTRAL: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FactorKind {
    IvRank,
    ImpliedVolatility,
    Delta,
    Dte,
    BidAskSpread,
    OpenInterest,
    Volume,
    PremiumYield,
    Pop,
    Rsi,
    Trend,
    Earnings,
}

impl FactorKind {
    pub fn from_key(key: &str) -> Option<Self> {
        let kind = match key.trim().to_ascii_lowercase().as_str() {
            "iv_rank" | "ivr" => FactorKind::IvRank,
            "implied_volatility" | "iv" => FactorKind::ImpliedVolatility,
            "delta" => FactorKind::Delta,
            "dte" | "dte_mode" | "days_to_expiry" => FactorKind::Dte,
            "bid_ask_spread" | "spread" => FactorKind::BidAskSpread,
            "open_interest" => FactorKind::OpenInterest,
            "volume" => FactorKind::Volume,
            "premium_yield" => FactorKind::PremiumYield,
            "pop" | "probability_of_profit" => FactorKind::Pop,
            "rsi" => FactorKind::Rsi,
            "trend" => FactorKind::Trend,
            "earnings" => FactorKind::Earnings,
            _ => return None,
        };
        Some(kind)
    }

    /// Key the feature builder emits for this factor
    pub fn canonical_key(&self) -> &'static str {
        match self {
            FactorKind::IvRank => "iv_rank",
            FactorKind::ImpliedVolatility => "implied_volatility",
            FactorKind::Delta => "delta",
            FactorKind::Dte => "dte",
            FactorKind::BidAskSpread => "bid_ask_spread",
            FactorKind::OpenInterest => "open_interest",
            FactorKind::Volume => "volume",
            FactorKind::PremiumYield => "premium_yield",
            FactorKind::Pop => "pop",
            FactorKind::Rsi => "rsi",
            FactorKind::Trend => "trend",
            FactorKind::Earnings => "earnings",
        }
    }

    fn map(&self, raw: &FeatureValue) -> Option<f64> {
        match self {
            FactorKind::Trend => raw.as_label().and_then(|label| match label.as_str() {
                "strong_bullish" => Some(1.0),
                "bullish" => Some(0.75),
                "neutral" => Some(0.5),
                "bearish" => Some(0.25),
                "strong_bearish" => Some(0.0),
                _ => None,
            }),
            FactorKind::Earnings => raw.as_label().and_then(|label| match label.as_str() {
                "none" => Some(1.0),
                "after_expiry" => Some(0.8),
                "before_expiry" => Some(0.2),
                _ => None,
            }),
            numeric => raw.as_f64().map(|v| numeric.map_number(v)),
        }
    }

    fn map_number(&self, v: f64) -> f64 {
        match self {
            FactorKind::IvRank | FactorKind::Pop => percent_aware(v),
            FactorKind::ImpliedVolatility => linear(v, 0.10, 0.80),
            FactorKind::Delta => triangular(v.abs(), 0.30, 0.30),
            FactorKind::Dte => triangular(v, 7.0, 21.0),
            FactorKind::BidAskSpread => 1.0 - clamp01(v / 0.10),
            FactorKind::OpenInterest => linear(v, 0.0, 5_000.0),
            FactorKind::Volume => linear(v, 0.0, 1_000.0),
            FactorKind::PremiumYield => linear(v, 0.0, 0.03),
            FactorKind::Rsi => triangular(v, 50.0, 50.0),
            FactorKind::Trend | FactorKind::Earnings => NEUTRAL,
        }
    }
}

/// Map a raw factor value into [0, 1]
pub fn normalize(factor_key: &str, raw: Option<&FeatureValue>) -> f64 {
    match (FactorKind::from_key(factor_key), raw) {
        (Some(kind), Some(value)) => kind.map(value).unwrap_or(NEUTRAL),
        _ => NEUTRAL,
    }
}

fn clamp01(v: f64) -> f64 {
    v.clamp(0.0, 1.0)
}

fn linear(v: f64, lo: f64, hi: f64) -> f64 {
    clamp01((v - lo) / (hi - lo))
}

/// 1 at `target`, falling linearly to 0 at `target ± half_width`
fn triangular(v: f64, target: f64, half_width: f64) -> f64 {
    clamp01(1.0 - (v - target).abs() / half_width)
}

/// Accepts 0..1 or 0..100
fn percent_aware(v: f64) -> f64 {
    if v > 1.0 {
        clamp01(v / 100.0)
    } else {
        clamp01(v)
    }
}
