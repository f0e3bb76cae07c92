//! Formula engine: resolves `dimension_mappings` into expression variables
//! and evaluates the billing expression safely.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::dimensions::DimValue;
use crate::expr::{BindingValue, ExprError, SafeExpression};

#[derive(Debug, Clone, thiserror::Error)]
pub enum BillingError {
    #[error(transparent)]
    Expression(#[from] ExprError),
    #[error("missing required dimensions: {missing_required:?}")]
    Incomplete { missing_required: Vec<String> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MappingSource {
    #[default]
    Constant,
    Dimension,
    Matrix,
    Tiered,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PriceTierMapping {
    /// `None` means unbounded (∞).
    pub up_to: Option<f64>,
    pub value: f64,
}

/// How one expression variable is produced from the dimension map.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DimensionMapping {
    #[serde(default)]
    pub source: MappingSource,
    /// Dimension key for `dimension`/`matrix` sources; defaults to the
    /// variable name.
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub map: HashMap<String, f64>,
    #[serde(default)]
    pub tiers: Vec<PriceTierMapping>,
    #[serde(default)]
    pub tier_key: Option<String>,
    #[serde(default)]
    pub default: f64,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub allow_zero: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvaluationStatus {
    Complete,
    Incomplete,
}

#[derive(Debug, Clone)]
pub struct EvaluationOutcome {
    pub status: EvaluationStatus,
    pub cost: f64,
    pub resolved_values: HashMap<String, BindingValue>,
    pub missing_required: Vec<String>,
    pub error: Option<String>,
}

#[derive(Debug, Default)]
pub struct FormulaEngine;

impl FormulaEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn evaluate(
        &self,
        expression: &str,
        variables: &HashMap<String, BindingValue>,
        dimensions: &HashMap<String, DimValue>,
        dimension_mappings: &HashMap<String, DimensionMapping>,
        strict_mode: bool,
    ) -> Result<EvaluationOutcome, BillingError> {
        let mut resolved: HashMap<String, BindingValue> = variables.clone();
        let mut missing_required = Vec::new();

        for (var_name, mapping) in dimension_mappings {
            // An explicit constant mapping is a fallback: never override a
            // value the caller already supplied.
            if mapping.source == MappingSource::Constant && resolved.contains_key(var_name) {
                continue;
            }
            match resolve_mapping(var_name, mapping, dimensions) {
                Resolved::Value(value) => {
                    resolved.insert(var_name.clone(), value);
                }
                Resolved::MissingRequired => missing_required.push(var_name.clone()),
            }
        }
        missing_required.sort_unstable();

        if !missing_required.is_empty() {
            if strict_mode {
                return Err(BillingError::Incomplete { missing_required });
            }
            return Ok(EvaluationOutcome {
                status: EvaluationStatus::Incomplete,
                cost: 0.0,
                resolved_values: resolved,
                missing_required,
                error: None,
            });
        }

        let evaluated = SafeExpression::parse(expression)
            .and_then(|expr| expr.eval_number(&resolved));
        match evaluated {
            Ok(cost) if cost < 0.0 => Ok(EvaluationOutcome {
                // Negative cost means a misconfigured rule.
                status: EvaluationStatus::Incomplete,
                cost: 0.0,
                resolved_values: resolved,
                missing_required: Vec::new(),
                error: Some("negative_cost".to_string()),
            }),
            Ok(cost) => Ok(EvaluationOutcome {
                status: EvaluationStatus::Complete,
                cost,
                resolved_values: resolved,
                missing_required: Vec::new(),
                error: None,
            }),
            Err(err) => {
                if strict_mode {
                    return Err(err.into());
                }
                Ok(EvaluationOutcome {
                    status: EvaluationStatus::Incomplete,
                    cost: 0.0,
                    resolved_values: resolved,
                    missing_required: Vec::new(),
                    error: Some(err.to_string()),
                })
            }
        }
    }
}

enum Resolved {
    Value(BindingValue),
    MissingRequired,
}

fn missing(mapping: &DimensionMapping) -> Resolved {
    if mapping.required {
        Resolved::MissingRequired
    } else {
        Resolved::Value(BindingValue::Num(mapping.default))
    }
}

fn resolve_mapping(
    var_name: &str,
    mapping: &DimensionMapping,
    dimensions: &HashMap<String, DimValue>,
) -> Resolved {
    match mapping.source {
        MappingSource::Constant => Resolved::Value(BindingValue::Num(mapping.default)),
        MappingSource::Dimension => {
            let key = mapping.key.as_deref().unwrap_or(var_name);
            let Some(raw) = dimensions.get(key) else {
                return missing(mapping);
            };
            match raw {
                DimValue::Str(text) if text.is_empty() => missing(mapping),
                DimValue::Str(text) => match text.trim().parse::<f64>() {
                    Ok(number) if number == 0.0 && !mapping.allow_zero => missing(mapping),
                    Ok(number) => Resolved::Value(BindingValue::Num(number)),
                    // Non-numeric strings pass through for the caller to judge.
                    Err(_) => Resolved::Value(BindingValue::Str(text.clone())),
                },
                other => {
                    let number = other.as_f64().unwrap_or(0.0);
                    if number == 0.0 && !mapping.allow_zero {
                        missing(mapping)
                    } else {
                        Resolved::Value(BindingValue::Num(number))
                    }
                }
            }
        }
        MappingSource::Matrix => {
            let key = mapping.key.as_deref().unwrap_or(var_name);
            let raw_key = match dimensions.get(key) {
                None => return missing(mapping),
                Some(DimValue::Str(text)) if text.is_empty() => return missing(mapping),
                Some(DimValue::Str(text)) => text.clone(),
                Some(DimValue::Int(value)) => value.to_string(),
                Some(DimValue::Float(value)) => value.to_string(),
            };
            match mapping.map.get(&raw_key) {
                Some(value) => Resolved::Value(BindingValue::Num(*value)),
                None => missing(mapping),
            }
        }
        MappingSource::Tiered => {
            let Some(tier_key) = mapping.tier_key.as_deref() else {
                return missing(mapping);
            };
            let Some(raw) = dimensions.get(tier_key) else {
                return missing(mapping);
            };
            let Some(tier_value) = raw.as_f64() else {
                return missing(mapping);
            };
            if tier_value == 0.0 && !mapping.allow_zero {
                return missing(mapping);
            }
            for tier in &mapping.tiers {
                match tier.up_to {
                    None => return Resolved::Value(BindingValue::Num(tier.value)),
                    Some(up_to) if tier_value <= up_to => {
                        return Resolved::Value(BindingValue::Num(tier.value));
                    }
                    Some(_) => continue,
                }
            }
            // Past the last bounded tier: reuse it rather than fail.
            match mapping.tiers.last() {
                Some(tier) => Resolved::Value(BindingValue::Num(tier.value)),
                None => Resolved::Value(BindingValue::Num(mapping.default)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dims(pairs: &[(&str, DimValue)]) -> HashMap<String, DimValue> {
        pairs
            .iter()
            .map(|(name, value)| (name.to_string(), value.clone()))
            .collect()
    }

    #[test]
    fn video_rule_with_matrix_multiplier() {
        let engine = FormulaEngine::new();
        let mut mappings = HashMap::new();
        mappings.insert(
            "duration_seconds".to_string(),
            DimensionMapping {
                source: MappingSource::Dimension,
                required: true,
                ..Default::default()
            },
        );
        mappings.insert(
            "resolution_multiplier".to_string(),
            DimensionMapping {
                source: MappingSource::Matrix,
                key: Some("resolution".to_string()),
                map: HashMap::from([("720p".to_string(), 1.0), ("1080p".to_string(), 1.5)]),
                required: true,
                ..Default::default()
            },
        );
        let mut variables = HashMap::new();
        variables.insert("base".to_string(), BindingValue::Num(0.1));
        variables.insert("per_second".to_string(), BindingValue::Num(0.05));

        let outcome = engine
            .evaluate(
                "base + duration_seconds * per_second * resolution_multiplier",
                &variables,
                &dims(&[
                    ("duration_seconds", DimValue::Float(4.0)),
                    ("resolution", DimValue::Str("720p".to_string())),
                ]),
                &mappings,
                false,
            )
            .unwrap();
        assert_eq!(outcome.status, EvaluationStatus::Complete);
        assert!((outcome.cost - 0.3).abs() < 1e-12);
    }

    #[test]
    fn strict_mode_raises_on_missing_required() {
        let engine = FormulaEngine::new();
        let mut mappings = HashMap::new();
        mappings.insert(
            "duration_seconds".to_string(),
            DimensionMapping {
                source: MappingSource::Dimension,
                required: true,
                ..Default::default()
            },
        );
        let err = engine
            .evaluate("duration_seconds * 2", &HashMap::new(), &HashMap::new(), &mappings, true)
            .unwrap_err();
        assert!(matches!(err, BillingError::Incomplete { missing_required }
            if missing_required == vec!["duration_seconds".to_string()]));
    }

    #[test]
    fn lenient_mode_returns_incomplete_zero_cost() {
        let engine = FormulaEngine::new();
        let mut mappings = HashMap::new();
        mappings.insert(
            "x".to_string(),
            DimensionMapping {
                source: MappingSource::Dimension,
                required: true,
                ..Default::default()
            },
        );
        let outcome = engine
            .evaluate("x", &HashMap::new(), &HashMap::new(), &mappings, false)
            .unwrap();
        assert_eq!(outcome.status, EvaluationStatus::Incomplete);
        assert_eq!(outcome.cost, 0.0);
        assert_eq!(outcome.missing_required, vec!["x".to_string()]);
    }

    #[test]
    fn zero_is_missing_unless_allowed() {
        let engine = FormulaEngine::new();
        let mut mappings = HashMap::new();
        mappings.insert(
            "n".to_string(),
            DimensionMapping {
                source: MappingSource::Dimension,
                required: true,
                ..Default::default()
            },
        );
        let err = engine
            .evaluate(
                "n",
                &HashMap::new(),
                &dims(&[("n", DimValue::Int(0))]),
                &mappings,
                true,
            )
            .unwrap_err();
        assert!(matches!(err, BillingError::Incomplete { .. }));

        let mut allowing = mappings.clone();
        allowing.get_mut("n").unwrap().allow_zero = true;
        let outcome = engine
            .evaluate(
                "n + 1",
                &HashMap::new(),
                &dims(&[("n", DimValue::Int(0))]),
                &allowing,
                true,
            )
            .unwrap();
        assert_eq!(outcome.cost, 1.0);
    }

    #[test]
    fn constant_mapping_never_overrides_supplied_variable() {
        let engine = FormulaEngine::new();
        let mut mappings = HashMap::new();
        mappings.insert(
            "rate".to_string(),
            DimensionMapping {
                source: MappingSource::Constant,
                default: 99.0,
                ..Default::default()
            },
        );
        let mut variables = HashMap::new();
        variables.insert("rate".to_string(), BindingValue::Num(2.0));
        let outcome = engine
            .evaluate("rate", &variables, &HashMap::new(), &mappings, false)
            .unwrap();
        assert_eq!(outcome.cost, 2.0);
    }

    #[test]
    fn tiered_lookup_picks_first_covering_tier() {
        let engine = FormulaEngine::new();
        let mut mappings = HashMap::new();
        mappings.insert(
            "price".to_string(),
            DimensionMapping {
                source: MappingSource::Tiered,
                tier_key: Some("tokens".to_string()),
                tiers: vec![
                    PriceTierMapping {
                        up_to: Some(128_000.0),
                        value: 2.5,
                    },
                    PriceTierMapping {
                        up_to: None,
                        value: 1.25,
                    },
                ],
                ..Default::default()
            },
        );
        let low = engine
            .evaluate(
                "price",
                &HashMap::new(),
                &dims(&[("tokens", DimValue::Int(1000))]),
                &mappings,
                false,
            )
            .unwrap();
        assert_eq!(low.cost, 2.5);
        let high = engine
            .evaluate(
                "price",
                &HashMap::new(),
                &dims(&[("tokens", DimValue::Int(200_000))]),
                &mappings,
                false,
            )
            .unwrap();
        assert_eq!(high.cost, 1.25);
    }

    #[test]
    fn negative_cost_is_rejected() {
        let engine = FormulaEngine::new();
        let outcome = engine
            .evaluate("0 - 5", &HashMap::new(), &HashMap::new(), &HashMap::new(), false)
            .unwrap();
        assert_eq!(outcome.status, EvaluationStatus::Incomplete);
        assert_eq!(outcome.error.as_deref(), Some("negative_cost"));
    }
}
