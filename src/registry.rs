//! Provider, endpoint and pool definitions plus the in-memory registry.
//!
//! The registry is the authoritative read-mostly view of the routing
//! configuration. Reads clone out of a snapshot under a short read lock;
//! mutations are serialised through the write lock and rebuild the
//! pool → provider → endpoints index the selector consults.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Pool identifier. Each pool backs exactly one virtual model.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolTag {
    Tool = 0,
    Normal = 1,
    Advanced = 2,
}

impl PoolTag {
    /// All pools, in stable order.
    pub const ALL: [PoolTag; 3] = [PoolTag::Tool, PoolTag::Normal, PoolTag::Advanced];

    pub fn as_str(&self) -> &'static str {
        match self {
            PoolTag::Tool => "tool",
            PoolTag::Normal => "normal",
            PoolTag::Advanced => "advanced",
        }
    }
}

impl fmt::Display for PoolTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PoolTag {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tool" => Ok(PoolTag::Tool),
            "normal" => Ok(PoolTag::Normal),
            "advanced" => Ok(PoolTag::Advanced),
            other => Err(format!("unknown pool tag '{}'", other)),
        }
    }
}

/// Wire format spoken by a provider, or expected by a client path.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiFormat {
    OpenAi,
    Anthropic,
}

impl ApiFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApiFormat::OpenAi => "openai",
            ApiFormat::Anthropic => "anthropic",
        }
    }
}

impl fmt::Display for ApiFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ApiFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "openai" => Ok(ApiFormat::OpenAi),
            "anthropic" => Ok(ApiFormat::Anthropic),
            other => Err(format!("unknown api format '{}'", other)),
        }
    }
}

/// An upstream provider account.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Provider {
    /// Stable integer id (assigned by the store).
    pub id: i64,

    /// Unique display name.
    pub name: String,

    /// API base URL, e.g. `https://api.openai.com/v1`.
    pub base_url: String,

    /// Upstream API key.
    #[serde(skip_serializing)]
    pub api_key: String,

    /// Wire format the provider speaks.
    pub api_format: ApiFormat,

    /// Disabled providers exclude every one of their endpoints from selection.
    pub enabled: bool,

    pub created_at: DateTime<Utc>,
}

impl Provider {
    pub fn new(
        id: i64,
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        api_format: ApiFormat,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            api_format,
            enabled: true,
            created_at: Utc::now(),
        }
    }

    /// Builder: set the enabled flag.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

/// A `(provider, upstream model)` placement into exactly one pool.
///
/// `(provider_id, upstream_model, pool)` is unique; the same model may appear
/// in several pools as distinct endpoints.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Endpoint {
    pub id: i64,
    pub provider_id: i64,

    /// Concrete model id sent upstream, e.g. `gpt-4o-mini`.
    pub upstream_model: String,

    pub pool: PoolTag,

    /// Disabled endpoints are never selected, regardless of cooldown.
    pub enabled: bool,

    /// Relative selection weight within the provider (>= 1).
    pub weight: u32,

    /// Soft minimum interval between selections, in seconds.
    pub min_interval_secs: u32,

    /// Persisted for forward compatibility; the selector does not use it.
    pub priority: i32,
}

impl Endpoint {
    pub fn new(id: i64, provider_id: i64, upstream_model: impl Into<String>, pool: PoolTag) -> Self {
        Self {
            id,
            provider_id,
            upstream_model: upstream_model.into(),
            pool,
            enabled: true,
            weight: 1,
            min_interval_secs: 0,
            priority: 0,
        }
    }

    /// Builder: set the selection weight.
    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight.max(1);
        self
    }

    /// Builder: set the soft rate-gate interval.
    pub fn with_min_interval_secs(mut self, secs: u32) -> Self {
        self.min_interval_secs = secs;
        self
    }

    /// Builder: set the enabled flag.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

/// Per-pool routing configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Client-visible model name resolving to this pool.
    pub virtual_model: String,

    /// Cooldown applied to an endpoint on failure. Zero disables cooldowns.
    pub cooldown_secs: u64,

    /// Budget from dispatch to the first upstream response byte.
    pub timeout_secs: u64,

    /// Attempt cap per dispatch. `None` exhausts the candidate list.
    pub max_retries: Option<u32>,
}

impl PoolConfig {
    pub fn new(virtual_model: impl Into<String>) -> Self {
        Self {
            virtual_model: virtual_model.into(),
            cooldown_secs: 60,
            timeout_secs: 60,
            max_retries: None,
        }
    }
}

/// One provider and its endpoints inside a pool, in insertion order.
#[derive(Clone, Debug)]
pub struct ProviderGroup {
    pub provider: Provider,
    pub endpoints: Vec<Endpoint>,
}

/// Filter for endpoint listings.
#[derive(Clone, Copy, Debug, Default)]
pub struct EndpointFilter {
    pub pool: Option<PoolTag>,
    pub provider_id: Option<i64>,
}

#[derive(Debug, Default)]
struct Inner {
    /// Providers in insertion (id) order, which is the round-robin order.
    providers: Vec<Provider>,

    /// Endpoints in insertion (id) order, the deterministic fallback order.
    endpoints: Vec<Endpoint>,

    pools: Vec<(PoolTag, PoolConfig)>,

    /// virtual model name → pool, fixed at startup.
    virtual_models: HashMap<String, PoolTag>,

    /// pool → provider → endpoints, rebuilt on any mutation.
    index: [Vec<ProviderGroup>; 3],
}

impl Inner {
    fn rebuild_index(&mut self) {
        let mut index: [Vec<ProviderGroup>; 3] = Default::default();
        for tag in PoolTag::ALL {
            let groups = &mut index[tag as usize];
            for provider in &self.providers {
                let endpoints: Vec<Endpoint> = self
                    .endpoints
                    .iter()
                    .filter(|e| e.provider_id == provider.id && e.pool == tag)
                    .cloned()
                    .collect();
                if !endpoints.is_empty() {
                    groups.push(ProviderGroup {
                        provider: provider.clone(),
                        endpoints,
                    });
                }
            }
        }
        self.index = index;
    }
}

/// In-memory authoritative view of providers, endpoints and pool configs.
pub struct Registry {
    inner: RwLock<Inner>,
}

impl Registry {
    /// Build a registry from loaded rows and the virtual-model table.
    pub fn new(
        providers: Vec<Provider>,
        endpoints: Vec<Endpoint>,
        pools: Vec<(PoolTag, PoolConfig)>,
    ) -> Self {
        let virtual_models = pools
            .iter()
            .map(|(tag, cfg)| (cfg.virtual_model.clone(), *tag))
            .collect();
        let mut inner = Inner {
            providers,
            endpoints,
            pools,
            virtual_models,
            index: Default::default(),
        };
        inner.rebuild_index();
        Self {
            inner: RwLock::new(inner),
        }
    }

    /// Resolve a client-visible model name to its pool.
    pub fn resolve_virtual_model(&self, name: &str) -> Option<PoolTag> {
        self.inner.read().virtual_models.get(name).copied()
    }

    /// The three virtual model names, in pool order.
    pub fn virtual_model_names(&self) -> Vec<String> {
        let inner = self.inner.read();
        inner
            .pools
            .iter()
            .map(|(_, cfg)| cfg.virtual_model.clone())
            .collect()
    }

    pub fn list_providers(&self) -> Vec<Provider> {
        self.inner.read().providers.clone()
    }

    pub fn get_provider(&self, id: i64) -> Option<Provider> {
        self.inner.read().providers.iter().find(|p| p.id == id).cloned()
    }

    pub fn list_endpoints(&self, filter: EndpointFilter) -> Vec<Endpoint> {
        self.inner
            .read()
            .endpoints
            .iter()
            .filter(|e| filter.pool.map_or(true, |p| e.pool == p))
            .filter(|e| filter.provider_id.map_or(true, |id| e.provider_id == id))
            .cloned()
            .collect()
    }

    pub fn get_endpoint(&self, id: i64) -> Option<Endpoint> {
        self.inner.read().endpoints.iter().find(|e| e.id == id).cloned()
    }

    pub fn endpoints_by_pool(&self, tag: PoolTag) -> Vec<Endpoint> {
        self.list_endpoints(EndpointFilter {
            pool: Some(tag),
            ..Default::default()
        })
    }

    pub fn pool_config(&self, tag: PoolTag) -> PoolConfig {
        let inner = self.inner.read();
        inner
            .pools
            .iter()
            .find(|(t, _)| *t == tag)
            .map(|(_, cfg)| cfg.clone())
            .unwrap_or_else(|| PoolConfig::new(tag.as_str()))
    }

    pub fn pool_configs(&self) -> Vec<(PoolTag, PoolConfig)> {
        self.inner.read().pools.clone()
    }

    /// Consistent snapshot of a pool for one dispatch. The caller releases
    /// the lock before any upstream I/O simply by holding only the clone.
    pub fn pool_snapshot(&self, tag: PoolTag) -> Vec<ProviderGroup> {
        self.inner.read().index[tag as usize].clone()
    }

    pub fn insert_provider(&self, provider: Provider) {
        let mut inner = self.inner.write();
        inner.providers.push(provider);
        inner.rebuild_index();
    }

    /// Replace a provider row. Returns false when the id is unknown.
    pub fn update_provider(&self, provider: Provider) -> bool {
        let mut inner = self.inner.write();
        let Some(slot) = inner.providers.iter_mut().find(|p| p.id == provider.id) else {
            return false;
        };
        *slot = provider;
        inner.rebuild_index();
        true
    }

    /// Remove a provider and all of its endpoints. Returns the removed
    /// endpoint ids so callers can drop health state.
    pub fn remove_provider(&self, id: i64) -> Option<Vec<i64>> {
        let mut inner = self.inner.write();
        if !inner.providers.iter().any(|p| p.id == id) {
            return None;
        }
        inner.providers.retain(|p| p.id != id);
        let removed: Vec<i64> = inner
            .endpoints
            .iter()
            .filter(|e| e.provider_id == id)
            .map(|e| e.id)
            .collect();
        inner.endpoints.retain(|e| e.provider_id != id);
        inner.rebuild_index();
        Some(removed)
    }

    pub fn insert_endpoint(&self, endpoint: Endpoint) {
        let mut inner = self.inner.write();
        inner.endpoints.push(endpoint);
        inner.rebuild_index();
    }

    pub fn update_endpoint(&self, endpoint: Endpoint) -> bool {
        let mut inner = self.inner.write();
        let Some(slot) = inner.endpoints.iter_mut().find(|e| e.id == endpoint.id) else {
            return false;
        };
        *slot = endpoint;
        inner.rebuild_index();
        true
    }

    pub fn remove_endpoint(&self, id: i64) -> bool {
        let mut inner = self.inner.write();
        let before = inner.endpoints.len();
        inner.endpoints.retain(|e| e.id != id);
        let removed = inner.endpoints.len() != before;
        if removed {
            inner.rebuild_index();
        }
        removed
    }

    /// Whether an endpoint exists for the `(provider, model, pool)` key.
    pub fn endpoint_exists(&self, provider_id: i64, upstream_model: &str, pool: PoolTag) -> bool {
        self.inner
            .read()
            .endpoints
            .iter()
            .any(|e| e.provider_id == provider_id && e.upstream_model == upstream_model && e.pool == pool)
    }

    /// Update a pool's config. The virtual-model table is rebuilt so renames
    /// take effect on the next dispatch.
    pub fn set_pool_config(&self, tag: PoolTag, config: PoolConfig) {
        let mut inner = self.inner.write();
        if let Some(slot) = inner.pools.iter_mut().find(|(t, _)| *t == tag) {
            slot.1 = config;
        } else {
            inner.pools.push((tag, config));
        }
        inner.virtual_models = inner
            .pools
            .iter()
            .map(|(t, cfg)| (cfg.virtual_model.clone(), *t))
            .collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_pools() -> Vec<(PoolTag, PoolConfig)> {
        vec![
            (PoolTag::Tool, PoolConfig::new("haiku")),
            (PoolTag::Normal, PoolConfig::new("sonnet")),
            (PoolTag::Advanced, PoolConfig::new("opus")),
        ]
    }

    #[test]
    fn test_endpoint_builder() {
        let endpoint = Endpoint::new(1, 7, "gpt-4o-mini", PoolTag::Tool)
            .with_weight(3)
            .with_min_interval_secs(5);

        assert_eq!(endpoint.provider_id, 7);
        assert_eq!(endpoint.upstream_model, "gpt-4o-mini");
        assert_eq!(endpoint.weight, 3);
        assert_eq!(endpoint.min_interval_secs, 5);
        assert!(endpoint.enabled);
    }

    #[test]
    fn test_weight_floor() {
        let endpoint = Endpoint::new(1, 1, "m", PoolTag::Tool).with_weight(0);
        assert_eq!(endpoint.weight, 1);
    }

    #[test]
    fn test_virtual_model_resolution() {
        let registry = Registry::new(vec![], vec![], default_pools());
        assert_eq!(registry.resolve_virtual_model("haiku"), Some(PoolTag::Tool));
        assert_eq!(registry.resolve_virtual_model("sonnet"), Some(PoolTag::Normal));
        assert_eq!(registry.resolve_virtual_model("opus"), Some(PoolTag::Advanced));
        assert_eq!(registry.resolve_virtual_model("gpt-4"), None);
    }

    #[test]
    fn test_index_preserves_insertion_order() {
        let providers = vec![
            Provider::new(1, "alpha", "https://a.example.com/v1", "k1", ApiFormat::OpenAi),
            Provider::new(2, "beta", "https://b.example.com/v1", "k2", ApiFormat::Anthropic),
        ];
        let endpoints = vec![
            Endpoint::new(1, 2, "claude-x", PoolTag::Normal),
            Endpoint::new(2, 1, "gpt-a", PoolTag::Normal),
            Endpoint::new(3, 1, "gpt-b", PoolTag::Normal),
        ];
        let registry = Registry::new(providers, endpoints, default_pools());

        let groups = registry.pool_snapshot(PoolTag::Normal);
        // Provider order follows insertion order, not endpoint order.
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].provider.name, "alpha");
        assert_eq!(groups[0].endpoints.len(), 2);
        assert_eq!(groups[0].endpoints[0].upstream_model, "gpt-a");
        assert_eq!(groups[1].provider.name, "beta");
    }

    #[test]
    fn test_provider_delete_cascades() {
        let providers = vec![Provider::new(1, "p", "https://x/v1", "k", ApiFormat::OpenAi)];
        let endpoints = vec![
            Endpoint::new(1, 1, "a", PoolTag::Tool),
            Endpoint::new(2, 1, "b", PoolTag::Normal),
        ];
        let registry = Registry::new(providers, endpoints, default_pools());

        let removed = registry.remove_provider(1).unwrap();
        assert_eq!(removed, vec![1, 2]);
        assert!(registry.list_endpoints(EndpointFilter::default()).is_empty());
        assert!(registry.pool_snapshot(PoolTag::Tool).is_empty());
    }

    #[test]
    fn test_uniqueness_probe() {
        let providers = vec![Provider::new(1, "p", "https://x/v1", "k", ApiFormat::OpenAi)];
        let endpoints = vec![Endpoint::new(1, 1, "m", PoolTag::Tool)];
        let registry = Registry::new(providers, endpoints, default_pools());

        assert!(registry.endpoint_exists(1, "m", PoolTag::Tool));
        // Same model in another pool is a distinct endpoint.
        assert!(!registry.endpoint_exists(1, "m", PoolTag::Normal));
    }

    #[test]
    fn test_pool_config_rename_remaps_virtual_model() {
        let registry = Registry::new(vec![], vec![], default_pools());
        let mut cfg = registry.pool_config(PoolTag::Normal);
        cfg.virtual_model = "balanced".to_string();
        registry.set_pool_config(PoolTag::Normal, cfg);

        assert_eq!(registry.resolve_virtual_model("balanced"), Some(PoolTag::Normal));
        assert_eq!(registry.resolve_virtual_model("sonnet"), None);
    }
}
