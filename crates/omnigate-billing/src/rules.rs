//! Billing rule snapshots and scope resolution.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use omnigate_common::TaskType;

use crate::engine::DimensionMapping;

/// Which entity a rule is attached to. Model-level scopes shadow
/// GlobalModel-level scopes for the same task type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleScope {
    Model,
    GlobalModel,
}

/// A frozen copy of one billing rule, captured at submission time for async
/// jobs so later settlement is immune to rule edits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingRuleSnapshot {
    pub rule_id: i64,
    pub scope: RuleScope,
    pub task_type: TaskType,
    pub expression: String,
    #[serde(default)]
    pub constants: HashMap<String, f64>,
    #[serde(default)]
    pub dimension_mappings: HashMap<String, DimensionMapping>,
}

/// Model-level wins over GlobalModel-level; storage guarantees at most one
/// enabled rule per scope.
pub fn pick_rule(
    model_rule: Option<BillingRuleSnapshot>,
    global_rule: Option<BillingRuleSnapshot>,
) -> Option<BillingRuleSnapshot> {
    model_rule.or(global_rule)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(rule_id: i64, scope: RuleScope) -> BillingRuleSnapshot {
        BillingRuleSnapshot {
            rule_id,
            scope,
            task_type: TaskType::Video,
            expression: "1".to_string(),
            constants: HashMap::new(),
            dimension_mappings: HashMap::new(),
        }
    }

    #[test]
    fn model_scope_shadows_global() {
        let picked = pick_rule(
            Some(snapshot(1, RuleScope::Model)),
            Some(snapshot(2, RuleScope::GlobalModel)),
        )
        .unwrap();
        assert_eq!(picked.rule_id, 1);
    }

    #[test]
    fn global_rule_applies_when_model_has_none() {
        let picked = pick_rule(None, Some(snapshot(2, RuleScope::GlobalModel))).unwrap();
        assert_eq!(picked.rule_id, 2);
    }

    #[test]
    fn snapshot_round_trips_through_json() {
        let mut mappings = HashMap::new();
        mappings.insert(
            "resolution_multiplier".to_string(),
            DimensionMapping {
                source: crate::engine::MappingSource::Matrix,
                key: Some("resolution".to_string()),
                map: HashMap::from([("720p".to_string(), 1.0)]),
                required: true,
                ..Default::default()
            },
        );
        let snapshot = BillingRuleSnapshot {
            rule_id: 7,
            scope: RuleScope::Model,
            task_type: TaskType::Video,
            expression: "base + x".to_string(),
            constants: HashMap::from([("base".to_string(), 0.1)]),
            dimension_mappings: mappings,
        };
        let json = serde_json::to_string(&snapshot).unwrap();
        let back: BillingRuleSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back.rule_id, 7);
        assert!(back.dimension_mappings.contains_key("resolution_multiplier"));
    }
}
