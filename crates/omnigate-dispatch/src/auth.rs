//! Request-time authentication and quota checks.

use sha2::{Digest, Sha256};
use time::OffsetDateTime;

use omnigate_common::{EndpointSignature, ErrorCategory};
use omnigate_storage::GatewayStorage;
use omnigate_storage::entities::{api_keys, users};

use crate::error::DispatchError;

pub fn hash_key(presented: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(presented.as_bytes());
    hex_encode(&hasher.finalize())
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|byte| format!("{byte:02x}")).collect()
}

/// Hash the presented key, look up the active ApiKey, verify expiry.
pub async fn authenticate(
    storage: &GatewayStorage,
    bearer: &str,
) -> Result<(api_keys::Model, Option<users::Model>), DispatchError> {
    let key_hash = hash_key(bearer.trim());
    let Some((key, user)) = storage.find_api_key_by_hash(&key_hash).await? else {
        return Err(DispatchError::new(
            ErrorCategory::AuthenticationFailed,
            "unknown API key",
        ));
    };
    if !key.is_active {
        return Err(DispatchError::new(
            ErrorCategory::AuthenticationFailed,
            "API key is disabled",
        ));
    }
    if let Some(expires_at) = key.expires_at
        && expires_at <= OffsetDateTime::now_utc()
    {
        return Err(DispatchError::new(
            ErrorCategory::AuthenticationFailed,
            "API key has expired",
        ));
    }
    if let Some(user) = &user
        && user.is_deleted
    {
        return Err(DispatchError::new(
            ErrorCategory::AuthenticationFailed,
            "account is deleted",
        ));
    }
    Ok((key, user))
}

fn allow_list_contains(list: &Option<serde_json::Value>, value: &str) -> bool {
    match list {
        None => true,
        Some(serde_json::Value::Array(items)) if items.is_empty() => true,
        Some(serde_json::Value::Array(items)) => items
            .iter()
            .any(|item| item.as_str().is_some_and(|text| text == value)),
        Some(_) => true,
    }
}

/// Per-key allow-lists: api format (family), endpoint signature, model.
/// Provider filtering happens in the planner where names are known.
pub fn check_key_allow_lists(
    key: &api_keys::Model,
    signature: EndpointSignature,
    model: &str,
) -> Result<(), DispatchError> {
    if !allow_list_contains(&key.allowed_api_formats, signature.family.as_str()) {
        return Err(DispatchError::new(
            ErrorCategory::InvalidRequest,
            format!("API format {} is not allowed for this key", signature.family),
        ));
    }
    if !allow_list_contains(&key.allowed_endpoints, &signature.key()) {
        return Err(DispatchError::new(
            ErrorCategory::InvalidRequest,
            format!("endpoint {} is not allowed for this key", signature.key()),
        ));
    }
    if !allow_list_contains(&key.allowed_models, model) {
        return Err(DispatchError::new(
            ErrorCategory::InvalidRequest,
            format!("model {model} is not allowed for this key"),
        ));
    }
    Ok(())
}

pub fn key_allows_provider(key: &api_keys::Model, provider_name: &str) -> bool {
    allow_list_contains(&key.allowed_providers, provider_name)
}

pub fn user_allows_provider(user: &users::Model, provider_name: &str) -> bool {
    allow_list_contains(&user.allowed_providers, provider_name)
}

/// Pre-dispatch quota gate on the owning user.
pub fn check_user_quota(user: &users::Model) -> Result<(), DispatchError> {
    if let Some(quota) = user.quota_usd
        && user.used_usd >= quota
    {
        return Err(DispatchError::new(
            ErrorCategory::QuotaExceeded,
            "user quota exhausted",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use omnigate_common::{ApiFamily, EndpointKind};

    fn key_with_lists(
        formats: Option<serde_json::Value>,
        models: Option<serde_json::Value>,
    ) -> api_keys::Model {
        api_keys::Model {
            id: 1,
            user_id: None,
            key_hash: "h".into(),
            label: None,
            is_active: true,
            allowed_providers: None,
            allowed_endpoints: None,
            allowed_api_formats: formats,
            allowed_models: models,
            rate_limit_per_minute: None,
            max_concurrent: None,
            log_level: "basic".into(),
            used_usd: 0.0,
            request_count: 0,
            expires_at: None,
            auto_delete_on_expiry: false,
            created_at: OffsetDateTime::now_utc(),
            last_used_at: None,
        }
    }

    #[test]
    fn hashing_is_stable_and_hex() {
        let hash = hash_key("sk-test");
        assert_eq!(hash.len(), 64);
        assert_eq!(hash, hash_key("sk-test"));
    }

    #[test]
    fn empty_allow_lists_mean_unrestricted() {
        let key = key_with_lists(Some(serde_json::json!([])), None);
        let signature = EndpointSignature::new(ApiFamily::OpenAI, EndpointKind::Chat);
        assert!(check_key_allow_lists(&key, signature, "gpt-4o").is_ok());
    }

    #[test]
    fn model_allow_list_is_enforced() {
        let key = key_with_lists(None, Some(serde_json::json!(["gpt-4o"])));
        let signature = EndpointSignature::new(ApiFamily::OpenAI, EndpointKind::Chat);
        assert!(check_key_allow_lists(&key, signature, "gpt-4o").is_ok());
        let err = check_key_allow_lists(&key, signature, "o3").unwrap_err();
        assert_eq!(err.category, ErrorCategory::InvalidRequest);
    }

    #[test]
    fn quota_gate_rejects_exhausted_users() {
        let user = users::Model {
            id: 1,
            name: "u".into(),
            key_hash: None,
            role: "user".into(),
            quota_usd: Some(10.0),
            used_usd: 10.0,
            total_usd: 10.0,
            allowed_providers: None,
            allowed_endpoints: None,
            allowed_models: None,
            is_deleted: false,
            created_at: OffsetDateTime::now_utc(),
            updated_at: OffsetDateTime::now_utc(),
        };
        assert_eq!(
            check_user_quota(&user).unwrap_err().category,
            ErrorCategory::QuotaExceeded
        );
    }
}
