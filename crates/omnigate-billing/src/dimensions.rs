//! Runtime dimension collection.
//!
//! Given the enabled collectors for an `(api_family:endpoint_kind, task_type)`
//! scope and the request/response/metadata of one exchange, produce the
//! dimension map billing expressions evaluate against. Collectors never fail
//! into the caller: a dimension that cannot be resolved falls back to its
//! configured default, then to the type zero.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error};

use crate::expr::{BindingValue, SafeExpression, extract_variable_names};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Request,
    Response,
    Metadata,
    Computed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    Float,
    Int,
    String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorSpec {
    pub dimension_name: String,
    pub source_type: SourceType,
    #[serde(default)]
    pub source_path: Option<String>,
    pub value_type: ValueType,
    #[serde(default)]
    pub transform_expression: Option<String>,
    #[serde(default)]
    pub default_value: Option<String>,
    #[serde(default)]
    pub priority: i32,
}

/// One collected dimension value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DimValue {
    Float(f64),
    Int(i64),
    Str(String),
}

impl DimValue {
    pub fn as_binding(&self) -> BindingValue {
        match self {
            DimValue::Float(value) => BindingValue::Num(*value),
            DimValue::Int(value) => BindingValue::Num(*value as f64),
            DimValue::Str(text) => BindingValue::Str(text.clone()),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            DimValue::Float(value) => Some(*value),
            DimValue::Int(value) => Some(*value as f64),
            DimValue::Str(text) => text.trim().parse().ok(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CollectInput<'a> {
    pub request: Option<&'a Value>,
    pub response: Option<&'a Value>,
    pub metadata: Option<&'a Value>,
}

/// Dot-separated JSON path lookup; list segments are numeric indices.
fn get_nested<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return None;
    }
    let mut current = root;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
        if current.is_null() {
            return None;
        }
    }
    Some(current)
}

fn type_zero(value_type: ValueType) -> DimValue {
    match value_type {
        ValueType::Float => DimValue::Float(0.0),
        ValueType::Int => DimValue::Int(0),
        ValueType::String => DimValue::Str(String::new()),
    }
}

fn cast_number(value: f64, value_type: ValueType) -> DimValue {
    match value_type {
        ValueType::Float => DimValue::Float(value),
        ValueType::Int => DimValue::Int(value.trunc() as i64),
        ValueType::String => DimValue::Str(value.to_string()),
    }
}

fn cast_raw(raw: &Value, value_type: ValueType) -> Option<DimValue> {
    match value_type {
        ValueType::String => Some(DimValue::Str(match raw {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        })),
        ValueType::Int => match raw {
            Value::Number(number) => number.as_f64().map(|v| DimValue::Int(v.trunc() as i64)),
            Value::String(text) => text.trim().parse::<f64>().ok().map(|v| DimValue::Int(v.trunc() as i64)),
            // bools are never valid numeric dimensions
            _ => None,
        },
        ValueType::Float => match raw {
            Value::Number(number) => number.as_f64().map(DimValue::Float),
            Value::String(text) => text.trim().parse::<f64>().ok().map(DimValue::Float),
            _ => None,
        },
    }
}

fn cast_default(default: &str, value_type: ValueType) -> DimValue {
    match value_type {
        ValueType::String => DimValue::Str(default.to_string()),
        ValueType::Int => default
            .trim()
            .parse::<f64>()
            .map(|v| DimValue::Int(v.trunc() as i64))
            .unwrap_or_else(|_| type_zero(value_type)),
        ValueType::Float => default
            .trim()
            .parse::<f64>()
            .map(DimValue::Float)
            .unwrap_or_else(|_| type_zero(value_type)),
    }
}

/// Collect all dimensions for one exchange.
pub fn collect_dimensions(
    collectors: &[CollectorSpec],
    input: CollectInput<'_>,
    base_dimensions: &HashMap<String, DimValue>,
) -> HashMap<String, DimValue> {
    let mut dims: HashMap<String, DimValue> = base_dimensions.clone();

    // dimension_name -> collectors, priority descending
    let mut grouped: BTreeMap<&str, Vec<&CollectorSpec>> = BTreeMap::new();
    for collector in collectors {
        grouped
            .entry(collector.dimension_name.as_str())
            .or_default()
            .push(collector);
    }
    for group in grouped.values_mut() {
        group.sort_by_key(|collector| std::cmp::Reverse(collector.priority));
    }

    // First pass: every dimension with at least one non-computed collector.
    let mut computed_only: HashSet<&str> = HashSet::new();
    for (name, group) in &grouped {
        let direct: Vec<&CollectorSpec> = group
            .iter()
            .copied()
            .filter(|collector| collector.source_type != SourceType::Computed)
            .collect();
        if direct.is_empty() {
            computed_only.insert(name);
            continue;
        }
        let value = resolve_direct(name, &direct, input);
        dims.insert((*name).to_string(), value);
    }

    // Second pass: computed dimensions in dependency order.
    for name in toposort_computed(&grouped, &computed_only) {
        let group: Vec<&CollectorSpec> = grouped
            .get(name)
            .map(|g| {
                g.iter()
                    .copied()
                    .filter(|collector| collector.source_type == SourceType::Computed)
                    .collect()
            })
            .unwrap_or_default();
        if group.is_empty() {
            continue;
        }
        let value = resolve_computed(name, &group, &dims);
        dims.insert(name.to_string(), value);
    }

    dims
}

fn resolve_direct(
    name: &str,
    collectors: &[&CollectorSpec],
    input: CollectInput<'_>,
) -> DimValue {
    let mut fallback: Option<(String, ValueType)> = None;
    let mut value_type = collectors
        .first()
        .map(|collector| collector.value_type)
        .unwrap_or(ValueType::Float);

    for collector in collectors {
        value_type = collector.value_type;
        if fallback.is_none() {
            if let Some(default) = &collector.default_value {
                fallback = Some((default.clone(), collector.value_type));
            }
        }

        let source = match collector.source_type {
            SourceType::Request => input.request,
            SourceType::Response => input.response,
            SourceType::Metadata => input.metadata,
            SourceType::Computed => continue,
        };
        let Some(root) = source else { continue };
        let Some(path) = collector.source_path.as_deref() else {
            continue;
        };
        let Some(raw) = get_nested(root, path) else {
            continue;
        };

        let outcome = apply_transform(collector, raw);
        match outcome {
            Ok(value) => return value,
            Err(reason) => {
                debug!(dimension = name, %reason, "dimension collector failed, trying next");
                continue;
            }
        }
    }

    match fallback {
        Some((default, fallback_type)) => cast_default(&default, fallback_type),
        None => type_zero(value_type),
    }
}

fn apply_transform(collector: &CollectorSpec, raw: &Value) -> Result<DimValue, String> {
    if let Some(expression) = &collector.transform_expression {
        let expr = SafeExpression::parse(expression).map_err(|err| err.to_string())?;
        let binding = match raw {
            Value::Number(number) => BindingValue::Num(number.as_f64().unwrap_or(0.0)),
            Value::String(text) => BindingValue::Str(text.clone()),
            other => return Err(format!("transform input is not scalar: {other}")),
        };
        let mut bindings = HashMap::new();
        bindings.insert("value".to_string(), binding);
        let number = expr.eval_number(&bindings).map_err(|err| err.to_string())?;
        return Ok(cast_number(number, collector.value_type));
    }
    cast_raw(raw, collector.value_type).ok_or_else(|| format!("cannot cast {raw} as dimension"))
}

fn resolve_computed(
    name: &str,
    collectors: &[&CollectorSpec],
    dims: &HashMap<String, DimValue>,
) -> DimValue {
    let mut fallback: Option<(String, ValueType)> = None;
    let mut value_type = collectors
        .first()
        .map(|collector| collector.value_type)
        .unwrap_or(ValueType::Float);

    let bindings: HashMap<String, BindingValue> = dims
        .iter()
        .map(|(key, value)| (key.clone(), value.as_binding()))
        .collect();

    for collector in collectors {
        value_type = collector.value_type;
        if fallback.is_none() {
            if let Some(default) = &collector.default_value {
                fallback = Some((default.clone(), collector.value_type));
            }
        }
        let Some(expression) = &collector.transform_expression else {
            continue;
        };
        let parsed = match SafeExpression::parse(expression) {
            Ok(parsed) => parsed,
            Err(err) => {
                debug!(dimension = name, error = %err, "invalid computed expression");
                continue;
            }
        };
        match parsed.eval_number(&bindings) {
            Ok(number) => return cast_number(number, collector.value_type),
            Err(err) => {
                debug!(dimension = name, error = %err, "computed dimension failed");
                continue;
            }
        }
    }

    match fallback {
        Some((default, fallback_type)) => cast_default(&default, fallback_type),
        None => type_zero(value_type),
    }
}

/// Kahn toposort of computed dimensions by the variables their transforms
/// reference. Cycles degrade by appending the remainder in name order.
fn toposort_computed<'a>(
    grouped: &BTreeMap<&'a str, Vec<&CollectorSpec>>,
    computed_only: &HashSet<&'a str>,
) -> Vec<&'a str> {
    let builtin: HashSet<&str> = crate::expr::builtin_function_names().into_iter().collect();

    let mut deps: HashMap<&'a str, HashSet<&'a str>> = HashMap::new();
    for name in computed_only.iter().copied() {
        let mut wanted: HashSet<&'a str> = HashSet::new();
        for collector in grouped.get(name).into_iter().flatten() {
            if collector.source_type != SourceType::Computed {
                continue;
            }
            let Some(expression) = &collector.transform_expression else {
                continue;
            };
            let names = match extract_variable_names(expression) {
                Ok(names) => names,
                Err(err) => {
                    error!(dimension = name, error = %err, "invalid computed transform expression");
                    continue;
                }
            };
            for referenced in names {
                if referenced == "value" || builtin.contains(referenced.as_str()) {
                    continue;
                }
                if let Some(key) = computed_only.get(referenced.as_str())
                    && *key != name
                {
                    wanted.insert(*key);
                }
            }
        }
        deps.insert(name, wanted);
    }

    let mut in_degree: BTreeMap<&'a str, usize> = computed_only.iter().map(|n| (*n, 0)).collect();
    let mut forward: HashMap<&'a str, Vec<&'a str>> = HashMap::new();
    for (name, wanted) in &deps {
        let name = *name;
        for dep in wanted.iter().copied() {
            forward.entry(dep).or_default().push(name);
            *in_degree.entry(name).or_default() += 1;
        }
    }

    let mut queue: VecDeque<&str> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(name, _)| *name)
        .collect();
    let mut ordered = Vec::with_capacity(computed_only.len());
    while let Some(name) = queue.pop_front() {
        ordered.push(name);
        let mut next: Vec<&str> = forward.remove(name).unwrap_or_default();
        next.sort_unstable();
        for dependent in next {
            let degree = in_degree.get_mut(dependent).expect("known node");
            *degree -= 1;
            if *degree == 0 {
                queue.push_back(dependent);
            }
        }
    }

    if ordered.len() != computed_only.len() {
        let seen: HashSet<&str> = ordered.iter().copied().collect();
        let mut remaining: Vec<&str> = computed_only
            .iter()
            .copied()
            .filter(|name| !seen.contains(name))
            .collect();
        remaining.sort_unstable();
        error!(?remaining, "computed dimension cycle detected");
        ordered.extend(remaining);
    }

    ordered
}

/// Per-dimension union of `cli` and `chat` collector scopes, cli winning.
pub fn union_cli_with_chat(
    cli: Vec<CollectorSpec>,
    chat: Vec<CollectorSpec>,
) -> Vec<CollectorSpec> {
    let cli_dims: HashSet<String> = cli
        .iter()
        .map(|collector| collector.dimension_name.clone())
        .collect();
    let mut merged = cli;
    for collector in chat {
        if !cli_dims.contains(&collector.dimension_name) {
            merged.push(collector);
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spec(
        name: &str,
        source: SourceType,
        path: Option<&str>,
        value_type: ValueType,
        transform: Option<&str>,
        default: Option<&str>,
        priority: i32,
    ) -> CollectorSpec {
        CollectorSpec {
            dimension_name: name.to_string(),
            source_type: source,
            source_path: path.map(Into::into),
            value_type,
            transform_expression: transform.map(Into::into),
            default_value: default.map(Into::into),
            priority,
        }
    }

    #[test]
    fn extracts_from_request_and_response() {
        let request = json!({"duration_seconds": 4});
        let response = json!({"video": {"resolution": "720p"}});
        let collectors = vec![
            spec("duration_seconds", SourceType::Request, Some("duration_seconds"), ValueType::Float, None, None, 0),
            spec("resolution", SourceType::Response, Some("video.resolution"), ValueType::String, None, None, 0),
        ];
        let dims = collect_dimensions(
            &collectors,
            CollectInput {
                request: Some(&request),
                response: Some(&response),
                metadata: None,
            },
            &HashMap::new(),
        );
        assert_eq!(dims["duration_seconds"], DimValue::Float(4.0));
        assert_eq!(dims["resolution"], DimValue::Str("720p".to_string()));
    }

    #[test]
    fn priority_fallback_on_missing_path() {
        let request = json!({"b": 2});
        let collectors = vec![
            spec("dim", SourceType::Request, Some("a"), ValueType::Int, None, None, 10),
            spec("dim", SourceType::Request, Some("b"), ValueType::Int, None, None, 1),
        ];
        let dims = collect_dimensions(
            &collectors,
            CollectInput {
                request: Some(&request),
                ..Default::default()
            },
            &HashMap::new(),
        );
        assert_eq!(dims["dim"], DimValue::Int(2));
    }

    #[test]
    fn default_then_type_zero() {
        let collectors = vec![
            spec("with_default", SourceType::Request, Some("missing"), ValueType::Float, None, Some("1.5"), 0),
            spec("bare", SourceType::Request, Some("missing"), ValueType::Int, None, None, 0),
        ];
        let dims = collect_dimensions(&collectors, CollectInput::default(), &HashMap::new());
        assert_eq!(dims["with_default"], DimValue::Float(1.5));
        assert_eq!(dims["bare"], DimValue::Int(0));
    }

    #[test]
    fn transform_binds_value() {
        let request = json!({"ms": 1500});
        let collectors = vec![spec(
            "seconds",
            SourceType::Request,
            Some("ms"),
            ValueType::Float,
            Some("value / 1000"),
            None,
            0,
        )];
        let dims = collect_dimensions(
            &collectors,
            CollectInput {
                request: Some(&request),
                ..Default::default()
            },
            &HashMap::new(),
        );
        assert_eq!(dims["seconds"], DimValue::Float(1.5));
    }

    #[test]
    fn computed_dimensions_order_by_dependency() {
        let request = json!({"n": 3});
        let collectors = vec![
            spec("n", SourceType::Request, Some("n"), ValueType::Float, None, None, 0),
            // doubled depends on n; quadrupled depends on doubled
            spec("quadrupled", SourceType::Computed, None, ValueType::Float, Some("doubled * 2"), None, 0),
            spec("doubled", SourceType::Computed, None, ValueType::Float, Some("n * 2"), None, 0),
        ];
        let dims = collect_dimensions(
            &collectors,
            CollectInput {
                request: Some(&request),
                ..Default::default()
            },
            &HashMap::new(),
        );
        assert_eq!(dims["doubled"], DimValue::Float(6.0));
        assert_eq!(dims["quadrupled"], DimValue::Float(12.0));
    }

    #[test]
    fn computed_cycle_degrades_without_blocking() {
        let collectors = vec![
            spec("a", SourceType::Computed, None, ValueType::Float, Some("b + 1"), None, 0),
            spec("b", SourceType::Computed, None, ValueType::Float, Some("a + 1"), None, 0),
        ];
        let dims = collect_dimensions(&collectors, CollectInput::default(), &HashMap::new());
        // Both present; values degrade to type zero since neither resolves.
        assert!(dims.contains_key("a") && dims.contains_key("b"));
    }

    #[test]
    fn list_index_paths() {
        let response = json!({"items": [{"id": 7}]});
        let collectors = vec![spec(
            "first_id",
            SourceType::Response,
            Some("items.0.id"),
            ValueType::Int,
            None,
            None,
            0,
        )];
        let dims = collect_dimensions(
            &collectors,
            CollectInput {
                response: Some(&response),
                ..Default::default()
            },
            &HashMap::new(),
        );
        assert_eq!(dims["first_id"], DimValue::Int(7));
    }

    #[test]
    fn cli_union_prefers_cli_scope() {
        let cli = vec![spec("x", SourceType::Request, Some("a"), ValueType::Int, None, None, 0)];
        let chat = vec![
            spec("x", SourceType::Request, Some("b"), ValueType::Int, None, None, 0),
            spec("y", SourceType::Request, Some("c"), ValueType::Int, None, None, 0),
        ];
        let merged = union_cli_with_chat(cli, chat);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].source_path.as_deref(), Some("a"));
    }
}
