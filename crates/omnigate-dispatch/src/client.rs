//! Pooled upstream HTTP clients, keyed by (proxy, TLS profile).
//!
//! Credentials carrying a browser-grade TLS fingerprint profile share a
//! client per (profile, proxy) pair; everything else shares the default
//! transport for its proxy.

use std::collections::HashMap;
use std::sync::Mutex;

use omnigate_common::ErrorCategory;

use crate::error::DispatchError;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ClientKey {
    proxy: Option<String>,
    tls_profile: Option<String>,
}

pub struct ClientPool {
    cache: Mutex<HashMap<ClientKey, wreq::Client>>,
}

impl Default for ClientPool {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientPool {
    pub fn new() -> Self {
        Self {
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn client_for(
        &self,
        proxy: Option<&str>,
        tls_profile: Option<&str>,
    ) -> Result<wreq::Client, DispatchError> {
        let key = ClientKey {
            proxy: normalize(proxy),
            tls_profile: normalize(tls_profile),
        };
        let mut cache = self
            .cache
            .lock()
            .map_err(|_| DispatchError::new(ErrorCategory::Internal, "client cache lock failed"))?;
        if let Some(client) = cache.get(&key) {
            return Ok(client.clone());
        }
        let client = build_client(key.proxy.as_deref(), key.tls_profile.as_deref())?;
        cache.insert(key, client.clone());
        Ok(client)
    }

    /// Drop every pooled client (shutdown).
    pub fn clear(&self) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.clear();
        }
    }
}

fn normalize(value: Option<&str>) -> Option<String> {
    value
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
}

fn build_client(
    proxy: Option<&str>,
    tls_profile: Option<&str>,
) -> Result<wreq::Client, DispatchError> {
    let mut builder = wreq::Client::builder();
    if let Some(proxy_url) = proxy {
        builder = builder.proxy(
            wreq::Proxy::all(proxy_url)
                .map_err(|err| DispatchError::new(ErrorCategory::ProxyError, err.to_string()))?,
        );
    }
    if let Some(profile) = tls_profile
        && let Some(emulation) = emulation_for(profile)
    {
        builder = builder.emulation(emulation);
    }
    builder
        .build()
        .map_err(|err| DispatchError::new(ErrorCategory::Internal, err.to_string()))
}

fn emulation_for(profile: &str) -> Option<wreq_util::Profile> {
    match profile.to_ascii_lowercase().as_str() {
        "chrome" => Some(wreq_util::Emulation::Chrome133),
        "firefox" => Some(wreq_util::Emulation::Firefox135),
        "safari" => Some(wreq_util::Emulation::Safari18),
        "edge" => Some(wreq_util::Emulation::Edge134),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_reuses_clients_per_key() {
        let pool = ClientPool::new();
        let _default = pool.client_for(None, None).unwrap();
        let _chrome = pool.client_for(None, Some("chrome")).unwrap();
        let cache_len = pool.cache.lock().unwrap().len();
        assert_eq!(cache_len, 2);
        // Same key again does not grow the pool.
        let _again = pool.client_for(None, Some("chrome")).unwrap();
        assert_eq!(pool.cache.lock().unwrap().len(), 2);
    }

    #[test]
    fn blank_proxy_and_default_proxy_share_a_client() {
        let pool = ClientPool::new();
        let _a = pool.client_for(Some("  "), None).unwrap();
        let _b = pool.client_for(None, None).unwrap();
        assert_eq!(pool.cache.lock().unwrap().len(), 1);
    }
}
