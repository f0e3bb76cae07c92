//! Candidate planner: filter and rank (provider, endpoint, credential)
//! triples for one resolved request.

use globset::{Glob, GlobSetBuilder};
use serde::Deserialize;

use omnigate_common::{ApiFamily, EndpointKind, EndpointSignature};
use omnigate_storage::entities::{
    global_models, models, provider_api_keys, provider_endpoints, providers,
};
use omnigate_storage::routing::RoutingSnapshot;

use crate::auth::{key_allows_provider, user_allows_provider};
use crate::types::{RequiredCapabilities, ResolvedRequest};

/// One plannable triple, with the upstream model name already resolved.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub provider: providers::Model,
    pub endpoint: provider_endpoints::Model,
    pub credential: provider_api_keys::Model,
    pub upstream_model: String,
    pub upstream_signature: EndpointSignature,
    pub model_priority: Option<i32>,
    pub global_model_id: i64,
    pub model_id: i64,
    /// Effective tiered pricing: the Model override, else the GlobalModel
    /// default.
    pub pricing: serde_json::Value,
}

/// Resolve the requested model through ModelMapping (alias → canonical).
pub fn normalize_model(snapshot: &RoutingSnapshot, requested: &str) -> String {
    let mapping = snapshot
        .mappings
        .iter()
        .filter(|mapping| mapping.source_name == requested)
        // Provider-scoped mappings win over global ones.
        .max_by_key(|mapping| mapping.provider_id.is_some());
    let Some(mapping) = mapping else {
        return requested.to_string();
    };
    snapshot
        .global_models
        .iter()
        .find(|global| global.id == mapping.target_global_model_id)
        .map(|global| global.name.clone())
        .unwrap_or_else(|| requested.to_string())
}

#[derive(Debug, Deserialize)]
struct NameVariant {
    name: String,
    #[serde(default)]
    priority: i32,
    /// Endpoint signature keys this variant is limited to.
    #[serde(default)]
    scopes: Vec<String>,
}

fn capability_allows(
    capabilities: &Option<serde_json::Value>,
    override_capabilities: &Option<serde_json::Value>,
    required: RequiredCapabilities,
) -> bool {
    let get = |name: &str| -> Option<bool> {
        override_capabilities
            .as_ref()
            .and_then(|caps| caps.get(name))
            .or_else(|| capabilities.as_ref().and_then(|caps| caps.get(name)))
            .and_then(|value| value.as_bool())
    };
    // Absent capability flags permit; only an explicit false refuses.
    if required.vision && get("vision") == Some(false) {
        return false;
    }
    if required.function_calling && get("function_calling") == Some(false) {
        return false;
    }
    if required.extended_thinking && get("extended_thinking") == Some(false) {
        return false;
    }
    true
}

fn credential_serves_model(credential: &provider_api_keys::Model, model: &str) -> bool {
    let build_set = |patterns: &Option<serde_json::Value>| -> Option<globset::GlobSet> {
        let items = patterns.as_ref()?.as_array()?;
        if items.is_empty() {
            return None;
        }
        let mut builder = GlobSetBuilder::new();
        for item in items {
            let Some(pattern) = item.as_str() else { continue };
            if let Ok(glob) = Glob::new(pattern) {
                builder.add(glob);
            }
        }
        builder.build().ok()
    };
    if let Some(include) = build_set(&credential.model_include_patterns)
        && !include.is_match(model)
    {
        return false;
    }
    if let Some(exclude) = build_set(&credential.model_exclude_patterns)
        && exclude.is_match(model)
    {
        return false;
    }
    true
}

/// Pick the model's upstream name for a concrete endpoint: the
/// highest-priority name variant whose scope covers the signature, falling
/// back to the base upstream name. Ties disperse by the affinity hash.
fn upstream_name_for(
    model: &models::Model,
    signature: EndpointSignature,
    affinity_key: u64,
) -> String {
    let variants: Vec<NameVariant> = model
        .name_variants
        .as_ref()
        .and_then(|json| serde_json::from_value(json.clone()).ok())
        .unwrap_or_default();
    let signature_key = signature.key();
    let mut applicable: Vec<&NameVariant> = variants
        .iter()
        .filter(|variant| {
            variant.scopes.is_empty() || variant.scopes.iter().any(|scope| *scope == signature_key)
        })
        .collect();
    if applicable.is_empty() {
        return model.upstream_name.clone();
    }
    applicable.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then_with(|| dispersal_hash(affinity_key, &a.name).cmp(&dispersal_hash(affinity_key, &b.name)))
    });
    applicable[0].name.clone()
}

fn dispersal_hash(affinity_key: u64, discriminator: impl std::fmt::Display) -> u64 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&affinity_key.to_le_bytes());
    hasher.update(discriminator.to_string().as_bytes());
    let digest = hasher.finalize();
    u64::from_le_bytes(digest.as_bytes()[..8].try_into().expect("digest length"))
}

fn endpoint_signature(endpoint: &provider_endpoints::Model) -> Option<EndpointSignature> {
    let family: ApiFamily = endpoint.api_family.parse().ok()?;
    let kind: EndpointKind = endpoint.endpoint_kind.parse().ok()?;
    Some(EndpointSignature::new(family, kind))
}

fn global_model_for<'a>(
    snapshot: &'a RoutingSnapshot,
    name: &str,
) -> Option<&'a global_models::Model> {
    snapshot.global_models.iter().find(|global| global.name == name)
}

/// Produce the ordered, bounded candidate list. Breaker state and in-flight
/// admissibility are re-checked by the dispatcher per attempt; this pass
/// only excludes credentials whose stored breaker state is open with no due
/// probe.
pub fn plan_candidates(
    snapshot: &RoutingSnapshot,
    request: &ResolvedRequest,
    max_candidates: usize,
) -> Vec<Candidate> {
    let Some(global) = global_model_for(snapshot, &request.normalized_model) else {
        return Vec::new();
    };

    let mut candidates: Vec<(CandidateRank, Candidate)> = Vec::new();

    for model in snapshot
        .models
        .iter()
        .filter(|model| model.global_model_id == global.id)
    {
        let Some(provider) = snapshot
            .providers
            .iter()
            .find(|provider| provider.id == model.provider_id)
        else {
            continue;
        };
        if !key_allows_provider(&request.api_key, &provider.name) {
            continue;
        }
        if let Some(user) = &request.user
            && !user_allows_provider(user, &provider.name)
        {
            continue;
        }
        if let Some(quota) = provider.monthly_quota_usd
            && provider.monthly_used_usd >= quota
        {
            continue;
        }
        if !capability_allows(
            &global.capabilities,
            &model.capability_override,
            request.capabilities,
        ) {
            continue;
        }

        // Prefer the same-family endpoint (byte pass-through); fall back to
        // any chat-capable endpoint reachable through translation.
        let mut endpoints: Vec<(&provider_endpoints::Model, EndpointSignature)> = snapshot
            .endpoints
            .iter()
            .filter(|endpoint| endpoint.provider_id == provider.id)
            .filter_map(|endpoint| endpoint_signature(endpoint).map(|sig| (endpoint, sig)))
            .filter(|(_, sig)| {
                if request.client_signature.kind == sig.kind {
                    true
                } else {
                    matches!(sig.kind, EndpointKind::Chat | EndpointKind::Cli)
                        && matches!(
                            request.client_signature.kind,
                            EndpointKind::Chat | EndpointKind::Cli
                        )
                }
            })
            .collect();
        // Exact signature first (byte pass-through), then same-family
        // reshapes, then cross-family translation.
        endpoints.sort_by_key(|(_, sig)| {
            (
                *sig != request.client_signature,
                sig.family != request.client_signature.family,
            )
        });
        let Some((endpoint, upstream_signature)) = endpoints.first().copied() else {
            continue;
        };

        let upstream_model = upstream_name_for(model, upstream_signature, request.affinity_key);

        for credential in snapshot
            .credentials
            .iter()
            .filter(|credential| credential.endpoint_id == endpoint.id)
        {
            if !credential_serves_model(credential, &request.normalized_model) {
                continue;
            }
            let rank = CandidateRank {
                model_priority: -model.model_priority.unwrap_or(0),
                provider_priority: provider.provider_priority,
                internal_priority: credential.internal_priority,
                // Higher score first; invert for ascending sort.
                inverse_health: -(credential.health_score * 1_000.0) as i64,
                dispersion: dispersal_hash(request.affinity_key, credential.id),
            };
            candidates.push((
                rank,
                Candidate {
                    provider: provider.clone(),
                    endpoint: endpoint.clone(),
                    credential: credential.clone(),
                    upstream_model: upstream_model.clone(),
                    upstream_signature,
                    model_priority: model.model_priority,
                    global_model_id: global.id,
                    model_id: model.id,
                    pricing: model
                        .pricing_override
                        .clone()
                        .unwrap_or_else(|| global.pricing.clone()),
                },
            ));
        }
    }

    candidates.sort_by(|a, b| a.0.cmp(&b.0));
    candidates
        .into_iter()
        .map(|(_, candidate)| candidate)
        .take(max_candidates)
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct CandidateRank {
    model_priority: i32,
    provider_priority: i32,
    internal_priority: i32,
    inverse_health: i64,
    dispersion: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use omnigate_common::{ApiFamily, EndpointKind};
    use omnigate_storage::entities::{api_keys, model_mappings};
    use time::OffsetDateTime;

    fn now() -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }

    fn provider(id: i64, name: &str, priority: i32) -> providers::Model {
        providers::Model {
            id,
            name: name.to_string(),
            provider_type: None,
            billing_model: None,
            monthly_quota_usd: None,
            monthly_used_usd: 0.0,
            rpm_limit: None,
            rpm_used: 0,
            provider_priority: priority,
            proxy: None,
            enabled: true,
            created_at: now(),
            updated_at: now(),
        }
    }

    fn endpoint(id: i64, provider_id: i64, family: &str, kind: &str) -> provider_endpoints::Model {
        provider_endpoints::Model {
            id,
            provider_id,
            api_family: family.to_string(),
            endpoint_kind: kind.to_string(),
            base_url: "https://api.example.com".to_string(),
            custom_path: None,
            custom_headers: None,
            connect_timeout_ms: None,
            read_timeout_ms: None,
            first_byte_timeout_ms: None,
            proxy: None,
            enabled: true,
            created_at: now(),
            updated_at: now(),
        }
    }

    fn credential(id: i64, endpoint_id: i64, priority: i32, health: f64) -> provider_api_keys::Model {
        provider_api_keys::Model {
            id,
            endpoint_id,
            name: None,
            secret: serde_json::json!({"api_key": "sk"}),
            auth_type: "api_key".to_string(),
            auth_config: None,
            internal_priority: priority,
            rate_multiplier: 1.0,
            rate_limit_per_minute: None,
            max_concurrent: 5,
            learned_max_concurrent: 5,
            daily_quota_usd: None,
            daily_used_usd: 0.0,
            monthly_quota_usd: None,
            monthly_used_usd: 0.0,
            model_include_patterns: None,
            model_exclude_patterns: None,
            tls_profile: None,
            enabled: true,
            health_score: health,
            consecutive_failures: 0,
            request_count: 0,
            success_count: 0,
            error_count: 0,
            total_response_time_ms: 0,
            utilization_samples: None,
            request_results_window: None,
            circuit_state: "closed".to_string(),
            circuit_opened_at: None,
            next_probe_at: None,
            half_open_until: None,
            half_open_successes: 0,
            half_open_failures: 0,
            probe_interval_seconds: 30,
            max_probe_interval_minutes: 30,
            cache_ttl_minutes: 5,
            last_concurrent_peak: 0,
            adjustment_history: None,
            last_probe_increase_at: None,
            created_at: now(),
            updated_at: now(),
        }
    }

    fn global_model(id: i64, name: &str) -> global_models::Model {
        global_models::Model {
            id,
            name: name.to_string(),
            pricing: serde_json::json!({"tiers": []}),
            capabilities: None,
            enabled: true,
            created_at: now(),
            updated_at: now(),
        }
    }

    fn model(id: i64, global_model_id: i64, provider_id: i64, upstream: &str) -> models::Model {
        models::Model {
            id,
            global_model_id,
            provider_id,
            upstream_name: upstream.to_string(),
            name_variants: None,
            pricing_override: None,
            capability_override: None,
            model_priority: None,
            enabled: true,
            created_at: now(),
            updated_at: now(),
        }
    }

    fn api_key() -> api_keys::Model {
        api_keys::Model {
            id: 1,
            user_id: None,
            key_hash: "h".to_string(),
            label: None,
            is_active: true,
            allowed_providers: None,
            allowed_endpoints: None,
            allowed_api_formats: None,
            allowed_models: None,
            rate_limit_per_minute: None,
            max_concurrent: None,
            log_level: "basic".to_string(),
            used_usd: 0.0,
            request_count: 0,
            expires_at: None,
            auto_delete_on_expiry: false,
            created_at: now(),
            last_used_at: None,
        }
    }

    fn request(snapshot: &RoutingSnapshot, model: &str) -> ResolvedRequest {
        ResolvedRequest {
            request_id: "req-1".to_string(),
            api_key: api_key(),
            user: None,
            client_signature: EndpointSignature::new(ApiFamily::OpenAI, EndpointKind::Chat),
            requested_model: model.to_string(),
            normalized_model: normalize_model(snapshot, model),
            capabilities: RequiredCapabilities::default(),
            body: serde_json::json!({}),
            is_stream: true,
            affinity_key: 42,
            metadata: None,
        }
    }

    fn basic_snapshot() -> RoutingSnapshot {
        RoutingSnapshot {
            providers: vec![provider(1, "p1", 0), provider(2, "p2", 1)],
            endpoints: vec![
                endpoint(10, 1, "openai", "chat"),
                endpoint(20, 2, "openai", "chat"),
            ],
            credentials: vec![
                credential(100, 10, 0, 1.0),
                credential(200, 20, 0, 1.0),
            ],
            global_models: vec![global_model(1, "gpt-4o")],
            models: vec![model(1, 1, 1, "gpt-4o"), model(2, 1, 2, "gpt-4o-mini")],
            mappings: vec![],
        }
    }

    #[test]
    fn provider_priority_orders_candidates() {
        let snapshot = basic_snapshot();
        let request = request(&snapshot, "gpt-4o");
        let candidates = plan_candidates(&snapshot, &request, 10);
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].provider.name, "p1");
        assert_eq!(candidates[1].provider.name, "p2");
        assert_eq!(candidates[1].upstream_model, "gpt-4o-mini");
    }

    #[test]
    fn unknown_model_plans_nothing() {
        let snapshot = basic_snapshot();
        let request = request(&snapshot, "no-such-model");
        assert!(plan_candidates(&snapshot, &request, 10).is_empty());
    }

    #[test]
    fn model_mapping_normalizes_alias() {
        let mut snapshot = basic_snapshot();
        snapshot.mappings.push(model_mappings::Model {
            id: 1,
            source_name: "gpt-4o-alias".to_string(),
            target_global_model_id: 1,
            provider_id: None,
            mapping_kind: "alias".to_string(),
            enabled: true,
            created_at: now(),
            updated_at: now(),
        });
        assert_eq!(normalize_model(&snapshot, "gpt-4o-alias"), "gpt-4o");
    }

    #[test]
    fn exhausted_provider_monthly_quota_filters() {
        let mut snapshot = basic_snapshot();
        snapshot.providers[0].monthly_quota_usd = Some(10.0);
        snapshot.providers[0].monthly_used_usd = 10.0;
        let request = request(&snapshot, "gpt-4o");
        let candidates = plan_candidates(&snapshot, &request, 10);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].provider.name, "p2");
    }

    #[test]
    fn capability_false_filters_model() {
        let mut snapshot = basic_snapshot();
        snapshot.global_models[0].capabilities = Some(serde_json::json!({"vision": false}));
        let mut request = request(&snapshot, "gpt-4o");
        request.capabilities.vision = true;
        assert!(plan_candidates(&snapshot, &request, 10).is_empty());
    }

    #[test]
    fn credential_exclude_glob_filters() {
        let mut snapshot = basic_snapshot();
        snapshot.credentials[0].model_exclude_patterns = Some(serde_json::json!(["gpt-4*"]));
        let request = request(&snapshot, "gpt-4o");
        let candidates = plan_candidates(&snapshot, &request, 10);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].credential.id, 200);
    }

    #[test]
    fn same_family_endpoint_preferred_over_translation() {
        let mut snapshot = basic_snapshot();
        // p1 gains a claude endpoint; openai must still win for openai clients.
        snapshot.endpoints.push(endpoint(11, 1, "claude", "chat"));
        snapshot.credentials.push(credential(101, 11, 0, 1.0));
        let request = request(&snapshot, "gpt-4o");
        let candidates = plan_candidates(&snapshot, &request, 10);
        assert_eq!(candidates[0].upstream_signature.family, ApiFamily::OpenAI);
    }

    #[test]
    fn name_variants_pick_highest_priority_in_scope() {
        let mut snapshot = basic_snapshot();
        snapshot.models[0].name_variants = Some(serde_json::json!([
            {"name": "gpt-4o-2024", "priority": 5},
            {"name": "gpt-4o-cli-only", "priority": 9, "scopes": ["openai:cli"]}
        ]));
        let request = request(&snapshot, "gpt-4o");
        let candidates = plan_candidates(&snapshot, &request, 10);
        // The cli-scoped variant does not apply to an openai:chat endpoint.
        assert_eq!(candidates[0].upstream_model, "gpt-4o-2024");
    }
}
