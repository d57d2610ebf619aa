//! IPS policy model and validation

use crate::error::{AppError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Pass/fail gate direction for a factor threshold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GateDirection {
    /// Raw value must be >= threshold
    Gte,
    /// Raw value must be <= threshold
    Lte,
}

/// One factor as the user configured it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactorSpec {
    pub key: String,
    pub weight: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direction: Option<GateDirection>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// User-defined weighted factor set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpsPolicy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub factors: Vec<FactorSpec>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Gate {
    pub threshold: f64,
    pub direction: GateDirection,
}

impl Gate {
    /// Evaluate the gate. A missing raw value stands in as -inf for `gte`
    /// and +inf for `lte`, so it always fails.
    pub fn passes(&self, raw: Option<f64>) -> bool {
        match self.direction {
            GateDirection::Gte => raw.unwrap_or(f64::NEG_INFINITY) >= self.threshold,
            GateDirection::Lte => raw.unwrap_or(f64::INFINITY) <= self.threshold,
        }
    }
}

/// Enabled factor with its share of the total weight
#[derive(Debug, Clone, PartialEq)]
pub struct WeightedFactor {
    pub key: String,
    pub weight: f64,
    pub gate: Option<Gate>,
}

/// Validated policy whose weights sum to 1
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedPolicy {
    factors: Vec<WeightedFactor>,
}

impl NormalizedPolicy {
    pub fn factors(&self) -> &[WeightedFactor] {
        &self.factors
    }
}

impl IpsPolicy {
    /// Validate and rescale the enabled factors' weights to sum to 1
    pub fn normalize(&self) -> Result<NormalizedPolicy> {
        let mut seen = HashSet::new();
        let mut enabled = Vec::new();

        for factor in &self.factors {
            let key = factor.key.trim();
            if key.is_empty() {
                return Err(AppError::Validation("Factor key must not be empty".to_string()));
            }
            if !factor.weight.is_finite() || factor.weight < 0.0 {
                return Err(AppError::Validation(format!(
                    "Factor '{}' has invalid weight {}",
                    key, factor.weight
                )));
            }
            if let Some(threshold) = factor.threshold {
                if !threshold.is_finite() {
                    return Err(AppError::Validation(format!(
                        "Factor '{}' has a non-finite threshold",
                        key
                    )));
                }
            }
            if !factor.enabled {
                continue;
            }
            if !seen.insert(key.to_string()) {
                return Err(AppError::Validation(format!(
                    "Factor '{}' is listed more than once",
                    key
                )));
            }
            enabled.push(factor);
        }

        if enabled.is_empty() {
            return Err(AppError::Validation(
                "Policy has no enabled factors".to_string(),
            ));
        }

        let total: f64 = enabled.iter().map(|f| f.weight).sum();
        if total <= 0.0 {
            return Err(AppError::Validation(
                "Enabled factor weights sum to zero".to_string(),
            ));
        }

        let factors = enabled
            .into_iter()
            .map(|f| WeightedFactor {
                key: f.key.trim().to_string(),
                weight: f.weight / total,
                gate: match (f.threshold, f.direction) {
                    (Some(threshold), Some(direction)) => Some(Gate {
                        threshold,
                        direction,
                    }),
                    _ => None,
                },
            })
            .collect();

        Ok(NormalizedPolicy { factors })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn factor(key: &str, weight: f64) -> FactorSpec {
        FactorSpec {
            key: key.to_string(),
            weight,
            threshold: None,
            direction: None,
            enabled: true,
        }
    }

    #[test]
    fn test_weights_normalized_over_enabled_factors() {
        let mut disabled = factor("volume", 10.0);
        disabled.enabled = false;
        let policy = IpsPolicy {
            name: None,
            factors: vec![factor("iv_rank", 3.0), factor("delta", 1.0), disabled],
        };

        let normalized = policy.normalize().unwrap();
        let weights: Vec<f64> = normalized.factors().iter().map(|f| f.weight).collect();
        assert_eq!(weights, vec![0.75, 0.25]);
    }

    #[test]
    fn test_no_enabled_factors_rejected() {
        let mut only = factor("iv_rank", 1.0);
        only.enabled = false;
        let policy = IpsPolicy {
            name: Some("empty".into()),
            factors: vec![only],
        };
        assert!(matches!(policy.normalize(), Err(AppError::Validation(_))));

        let policy = IpsPolicy {
            name: None,
            factors: vec![],
        };
        assert!(matches!(policy.normalize(), Err(AppError::Validation(_))));
    }

    #[test]
    fn test_invalid_weights_rejected() {
        for weight in [-1.0, f64::NAN, f64::INFINITY] {
            let policy = IpsPolicy {
                name: None,
                factors: vec![factor("iv_rank", weight)],
            };
            assert!(policy.normalize().is_err(), "weight {} accepted", weight);
        }

        let policy = IpsPolicy {
            name: None,
            factors: vec![factor("iv_rank", 0.0), factor("delta", 0.0)],
        };
        assert!(policy.normalize().is_err());
    }

    #[test]
    fn test_duplicate_keys_rejected() {
        let policy = IpsPolicy {
            name: None,
            factors: vec![factor("delta", 1.0), factor("delta", 2.0)],
        };
        assert!(policy.normalize().is_err());
    }

    #[test]
    fn test_gate_requires_threshold_and_direction() {
        let mut threshold_only = factor("dte", 1.0);
        threshold_only.threshold = Some(14.0);
        let policy = IpsPolicy {
            name: None,
            factors: vec![threshold_only],
        };
        assert!(policy.normalize().unwrap().factors()[0].gate.is_none());
    }

    #[test]
    fn test_gate_missing_value_fails() {
        let gte = Gate {
            threshold: 0.0,
            direction: GateDirection::Gte,
        };
        let lte = Gate {
            threshold: 0.0,
            direction: GateDirection::Lte,
        };
        assert!(!gte.passes(None));
        assert!(!lte.passes(None));
        assert!(gte.passes(Some(0.0)));
        assert!(lte.passes(Some(-3.0)));
    }

    #[test]
    fn test_policy_deserializes_from_json() {
        let policy: IpsPolicy = serde_json::from_str(
            r#"{"factors":[{"key":"iv_rank","weight":0.6},{"key":"dte_mode","weight":0.4,"threshold":14,"direction":"lte"}]}"#,
        )
        .unwrap();
        assert!(policy.factors[0].enabled);
        assert_eq!(policy.factors[1].direction, Some(GateDirection::Lte));
    }
}
