//! End-to-end billing for an async video job: collect dimensions from the
//! request and terminal response, evaluate the rule, get a deterministic
//! cost — or a hard failure under strict mode when required dimensions are
//! missing.

use std::collections::HashMap;

use omnigate_billing::{
    BillingError, BindingValue, CollectInput, CollectorSpec, DimensionMapping, EvaluationStatus,
    FormulaEngine, MappingSource, collect_dimensions, dimensions,
};
use serde_json::json;

fn video_collectors() -> Vec<CollectorSpec> {
    vec![
        CollectorSpec {
            dimension_name: "duration_seconds".to_string(),
            source_type: dimensions::SourceType::Request,
            source_path: Some("duration_seconds".to_string()),
            value_type: dimensions::ValueType::Float,
            transform_expression: None,
            default_value: None,
            priority: 0,
        },
        CollectorSpec {
            dimension_name: "resolution".to_string(),
            source_type: dimensions::SourceType::Response,
            source_path: Some("video.resolution".to_string()),
            value_type: dimensions::ValueType::String,
            transform_expression: None,
            default_value: None,
            priority: 0,
        },
    ]
}

fn video_mappings() -> HashMap<String, DimensionMapping> {
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
    mappings
}

fn constants() -> HashMap<String, BindingValue> {
    HashMap::from([
        ("base".to_string(), BindingValue::Num(0.1)),
        ("per_second".to_string(), BindingValue::Num(0.05)),
    ])
}

const EXPRESSION: &str = "base + duration_seconds * per_second * resolution_multiplier";

#[test]
fn completed_job_settles_to_a_deterministic_cost() {
    let request = json!({"model": "sora-video", "prompt": "cat", "duration_seconds": 4});
    let response = json!({"status": "completed", "video": {"resolution": "720p"}});

    let dims = collect_dimensions(
        &video_collectors(),
        CollectInput {
            request: Some(&request),
            response: Some(&response),
            metadata: None,
        },
        &HashMap::new(),
    );

    let outcome = FormulaEngine::new()
        .evaluate(EXPRESSION, &constants(), &dims, &video_mappings(), true)
        .unwrap();
    assert_eq!(outcome.status, EvaluationStatus::Complete);
    // 0.1 + 4 * 0.05 * 1.0
    assert!((outcome.cost - 0.3).abs() < 1e-9);
    // The resolved variable map explains the cost breakdown.
    assert_eq!(
        outcome.resolved_values.get("resolution_multiplier"),
        Some(&BindingValue::Num(1.0))
    );
}

#[test]
fn higher_resolution_scales_the_cost() {
    let request = json!({"duration_seconds": 4});
    let response = json!({"video": {"resolution": "1080p"}});
    let dims = collect_dimensions(
        &video_collectors(),
        CollectInput {
            request: Some(&request),
            response: Some(&response),
            metadata: None,
        },
        &HashMap::new(),
    );
    let outcome = FormulaEngine::new()
        .evaluate(EXPRESSION, &constants(), &dims, &video_mappings(), true)
        .unwrap();
    assert!((outcome.cost - 0.4).abs() < 1e-9);
}

#[test]
fn missing_resolution_fails_strict_settlement() {
    let request = json!({"duration_seconds": 4});
    // Terminal response without the resolution field: the matrix dimension
    // resolves to the string type zero, which is missing for the lookup.
    let response = json!({"status": "completed"});
    let dims = collect_dimensions(
        &video_collectors(),
        CollectInput {
            request: Some(&request),
            response: Some(&response),
            metadata: None,
        },
        &HashMap::new(),
    );

    let err = FormulaEngine::new()
        .evaluate(EXPRESSION, &constants(), &dims, &video_mappings(), true)
        .unwrap_err();
    match err {
        BillingError::Incomplete { missing_required } => {
            assert_eq!(missing_required, vec!["resolution_multiplier".to_string()]);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn lenient_mode_records_zero_cost_with_the_missing_list() {
    let dims = HashMap::new();
    let outcome = FormulaEngine::new()
        .evaluate(EXPRESSION, &constants(), &dims, &video_mappings(), false)
        .unwrap();
    assert_eq!(outcome.status, EvaluationStatus::Incomplete);
    assert_eq!(outcome.cost, 0.0);
    assert_eq!(outcome.missing_required.len(), 2);
}
