//! Factor scoring engine
//!
//! `score(policy, features)` turns a validated IPS policy and a candidate's
//! feature map into an alignment score in [0, 1] plus a per-factor breakdown.
//! It is pure: identical inputs always produce identical output.
//!
//! A factor whose threshold gate fails keeps half of its normalized value
//! rather than being dropped; this soft penalty changes rankings and is
//! intentional.

pub mod features;
pub mod normalize;
pub mod policy;

pub use features::{FeatureMap, FeatureValue};
pub use normalize::{normalize, FactorKind, NEUTRAL};
pub use policy::{FactorSpec, GateDirection, IpsPolicy, NormalizedPolicy};

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Decimal places kept for per-factor contributions
const CONTRIBUTION_PRECISION: f64 = 10_000.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreResult {
    pub alignment: f64,
    pub breakdown: BTreeMap<String, f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed_gates: Vec<String>,
}

/// Score one feature map against a normalized policy
pub fn score(policy: &NormalizedPolicy, features: &FeatureMap) -> ScoreResult {
    let mut alignment = 0.0_f64;
    let mut breakdown = BTreeMap::new();
    let mut failed_gates = Vec::new();

    for factor in policy.factors() {
        let raw = lookup(features, &factor.key);
        let mut value = normalize(&factor.key, raw);

        if let Some(gate) = &factor.gate {
            if !gate.passes(raw.and_then(FeatureValue::as_f64)) {
                value *= 0.5;
                failed_gates.push(factor.key.clone());
            }
        }

        let contribution = value * factor.weight;
        alignment += contribution;
        breakdown.insert(factor.key.clone(), round_contribution(contribution));
    }

    ScoreResult {
        alignment: alignment.clamp(0.0, 1.0),
        breakdown,
        failed_gates,
    }
}

/// Validate `policy` and score `features` against it
pub fn score_policy(policy: &IpsPolicy, features: &FeatureMap) -> Result<ScoreResult> {
    Ok(score(&policy.normalize()?, features))
}

/// The policy's own key wins; otherwise fall back to the canonical key
fn lookup<'a>(features: &'a FeatureMap, key: &str) -> Option<&'a FeatureValue> {
    features.get(key).or_else(|| {
        FactorKind::from_key(key).and_then(|kind| features.get(kind.canonical_key()))
    })
}

fn round_contribution(v: f64) -> f64 {
    (v * CONTRIBUTION_PRECISION).round() / CONTRIBUTION_PRECISION
}
