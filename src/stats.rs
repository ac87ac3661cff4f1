//! Aggregated counters served by the admin stats endpoint.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::health::EndpointHealth;
use crate::registry::{PoolTag, Registry};

/// Gateway-wide aggregate plus per-provider and per-endpoint breakdowns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayStats {
    pub total_requests: u64,
    pub success_requests: u64,
    pub error_requests: u64,
    pub providers: Vec<ProviderStats>,
    pub endpoints: Vec<EndpointStats>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderStats {
    pub id: i64,
    pub name: String,
    pub enabled: bool,
    pub total: u64,
    pub success: u64,
    pub error: u64,
    pub success_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointStats {
    pub id: i64,
    pub provider_id: i64,
    pub provider_name: String,
    pub upstream_model: String,
    pub pool: PoolTag,
    pub enabled: bool,
    pub weight: u32,
    pub total: u64,
    pub success: u64,
    pub error: u64,
    pub success_rate: f64,
    pub avg_latency_ms: f64,
    pub cooling: bool,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_used: Option<DateTime<Utc>>,
}

fn success_rate(success: u64, total: u64) -> f64 {
    if total == 0 {
        return 100.0;
    }
    (success as f64 / total as f64) * 100.0
}

impl GatewayStats {
    /// Assemble the aggregate view from the registry and health tracker.
    pub fn collect(registry: &Registry, health: &EndpointHealth, now: DateTime<Utc>) -> Self {
        let providers = registry.list_providers();
        let provider_stats: Vec<ProviderStats> = providers
            .iter()
            .map(|p| {
                let counters = health.provider_counters(p.id);
                ProviderStats {
                    id: p.id,
                    name: p.name.clone(),
                    enabled: p.enabled,
                    total: counters.total,
                    success: counters.success,
                    error: counters.error,
                    success_rate: success_rate(counters.success, counters.total),
                }
            })
            .collect();

        let endpoints: Vec<EndpointStats> = registry
            .list_endpoints(Default::default())
            .into_iter()
            .map(|e| {
                let state = health.snapshot(e.id);
                let provider_name = providers
                    .iter()
                    .find(|p| p.id == e.provider_id)
                    .map(|p| p.name.clone())
                    .unwrap_or_default();
                EndpointStats {
                    id: e.id,
                    provider_id: e.provider_id,
                    provider_name,
                    upstream_model: e.upstream_model,
                    pool: e.pool,
                    enabled: e.enabled,
                    weight: e.weight,
                    total: state.total,
                    success: state.success,
                    error: state.error,
                    success_rate: success_rate(state.success, state.total),
                    avg_latency_ms: state.avg_latency_ms,
                    cooling: !state.cooldown_elapsed(now),
                    cooldown_until: state.cooldown_until,
                    last_error: state.last_error,
                    last_used: state.last_used,
                }
            })
            .collect();

        GatewayStats {
            total_requests: provider_stats.iter().map(|p| p.total).sum(),
            success_requests: provider_stats.iter().map(|p| p.success).sum(),
            error_requests: provider_stats.iter().map(|p| p.error).sum(),
            providers: provider_stats,
            endpoints,
        }
    }

    /// Number of endpoints currently not cooling.
    pub fn healthy_count(&self) -> usize {
        self.endpoints.iter().filter(|e| !e.cooling).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ApiFormat, Endpoint, PoolConfig, Provider};

    #[test]
    fn test_collect_aggregates_counters() {
        let registry = Registry::new(
            vec![Provider::new(1, "p", "https://x/v1", "k", ApiFormat::OpenAi)],
            vec![Endpoint::new(1, 1, "m", PoolTag::Tool)],
            vec![(PoolTag::Tool, PoolConfig::new("haiku"))],
        );
        let health = EndpointHealth::new();
        let now = Utc::now();

        health.mark_success(1, 1, 50, now);
        health.mark_failure(1, 1, "HTTP 500".into(), 60, now);

        let stats = GatewayStats::collect(&registry, &health, now);
        assert_eq!(stats.total_requests, 2);
        assert_eq!(stats.success_requests, 1);
        assert_eq!(stats.error_requests, 1);
        assert_eq!(stats.providers[0].success_rate, 50.0);
        assert!(stats.endpoints[0].cooling);
        assert_eq!(stats.healthy_count(), 0);
    }

    #[test]
    fn test_untouched_endpoint_reads_fresh() {
        let registry = Registry::new(
            vec![Provider::new(1, "p", "https://x/v1", "k", ApiFormat::OpenAi)],
            vec![Endpoint::new(1, 1, "m", PoolTag::Tool)],
            vec![(PoolTag::Tool, PoolConfig::new("haiku"))],
        );
        let health = EndpointHealth::new();

        let stats = GatewayStats::collect(&registry, &health, Utc::now());
        assert_eq!(stats.endpoints[0].total, 0);
        assert_eq!(stats.endpoints[0].success_rate, 100.0);
        assert!(!stats.endpoints[0].cooling);
    }
}
