//! Feature maps: factor key -> raw value for one candidate

use crate::providers::types::{OptionContract, Quote};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Raw signal value. Absent signals are simply missing from the map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FeatureValue {
    Number(f64),
    Text(String),
}

impl FeatureValue {
    /// Numeric reading; numeric strings are parsed, non-finite values are dropped
    pub fn as_f64(&self) -> Option<f64> {
        let v = match self {
            FeatureValue::Number(n) => *n,
            FeatureValue::Text(s) => s.trim().parse::<f64>().ok()?,
        };
        v.is_finite().then_some(v)
    }

    /// Lower-cased label for categorical factors
    pub fn as_label(&self) -> Option<String> {
        match self {
            FeatureValue::Text(s) => Some(s.trim().to_ascii_lowercase()),
            FeatureValue::Number(_) => None,
        }
    }
}

impl From<f64> for FeatureValue {
    fn from(v: f64) -> Self {
        FeatureValue::Number(v)
    }
}

impl From<&str> for FeatureValue {
    fn from(s: &str) -> Self {
        FeatureValue::Text(s.to_string())
    }
}

pub type FeatureMap = BTreeMap<String, FeatureValue>;

/// Min and max implied volatility across a chain
pub fn iv_range(chain: &[OptionContract]) -> Option<(f64, f64)> {
    chain
        .iter()
        .filter_map(|c| c.implied_volatility)
        .filter(|iv| iv.is_finite() && *iv > 0.0)
        .fold(None, |acc, iv| match acc {
            None => Some((iv, iv)),
            Some((lo, hi)) => Some((lo.min(iv), hi.max(iv))),
        })
}

/// Categorical trend from the underlying's daily change percent
pub fn trend_label(change_percent: f64) -> &'static str {
    if change_percent > 2.0 {
        "strong_bullish"
    } else if change_percent > 0.5 {
        "bullish"
    } else if change_percent < -2.0 {
        "strong_bearish"
    } else if change_percent < -0.5 {
        "bearish"
    } else {
        "neutral"
    }
}

/// Build the feature map for one contract.
///
/// `chain_iv` is the chain's IV range from [`iv_range`]; a contract's
/// `iv_rank` is its IV's position inside that range.
pub fn contract_features(
    quote: Option<&Quote>,
    contract: &OptionContract,
    chain_iv: Option<(f64, f64)>,
    as_of: NaiveDate,
) -> FeatureMap {
    let mut features = FeatureMap::new();

    features.insert(
        "dte".to_string(),
        (contract.days_to_expiry(as_of) as f64).into(),
    );
    features.insert(
        "open_interest".to_string(),
        (contract.open_interest as f64).into(),
    );
    features.insert("volume".to_string(), (contract.volume as f64).into());

    if let Some(iv) = contract.implied_volatility.filter(|iv| iv.is_finite()) {
        features.insert("implied_volatility".to_string(), iv.into());
        if let Some((lo, hi)) = chain_iv {
            let rank = if hi > lo { (iv - lo) / (hi - lo) } else { 0.5 };
            features.insert("iv_rank".to_string(), rank.clamp(0.0, 1.0).into());
        }
    }

    if let Some(delta) = contract.delta.filter(|d| d.is_finite()) {
        features.insert("delta".to_string(), delta.abs().into());
        features.insert("pop".to_string(), (1.0 - delta.abs()).clamp(0.0, 1.0).into());
    }

    let mid = contract.mid();
    if contract.bid > 0.0 && contract.ask > 0.0 && mid > 0.0 {
        features.insert(
            "bid_ask_spread".to_string(),
            ((contract.ask - contract.bid) / mid).into(),
        );
    }
    if contract.strike > 0.0 && mid > 0.0 {
        features.insert("premium_yield".to_string(), (mid / contract.strike).into());
    }

    if let Some(quote) = quote {
        features.insert(
            "trend".to_string(),
            trend_label(quote.change_percent).into(),
        );
    }

    features
}
