//! Per-endpoint mutable health state and liveness decisions.
//!
//! Health records are keyed by endpoint id and live outside the registry so
//! dispatch-outcome updates never take the registry write lock. Each record
//! sits in its own `DashMap` slot; an update is one short critical section.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;

use crate::error::AttemptError;
use crate::registry::{Endpoint, Provider};

/// Smoothing factor for the rolling latency mean.
const LATENCY_ALPHA: f64 = 0.2;

/// Floor for the shortened cooldown applied to client-side errors.
const SHORT_COOLDOWN_SECS: u64 = 5;

/// Mutable health record for one endpoint.
#[derive(Debug, Clone, Default)]
pub struct EndpointState {
    /// Total dispatch attempts routed to this endpoint.
    pub total: u64,

    /// Successful attempts.
    pub success: u64,

    /// Failed attempts.
    pub error: u64,

    /// Exponentially smoothed latency over successful attempts only.
    pub avg_latency_ms: f64,

    /// While set and in the future, the endpoint is cooling. Expiry is
    /// implicit: once `cooldown_until <= now` the endpoint is healthy again
    /// without the field being rewritten.
    pub cooldown_until: Option<DateTime<Utc>>,

    /// Most recent error message.
    pub last_error: Option<String>,

    /// When the endpoint last carried an attempt (success or failure).
    pub last_used: Option<DateTime<Utc>>,
}

impl EndpointState {
    pub fn cooldown_elapsed(&self, now: DateTime<Utc>) -> bool {
        self.cooldown_until.map_or(true, |until| until <= now)
    }

    pub fn interval_elapsed(&self, min_interval_secs: u32, now: DateTime<Utc>) -> bool {
        if min_interval_secs == 0 {
            return true;
        }
        self.last_used
            .map_or(true, |used| now - used >= Duration::seconds(min_interval_secs as i64))
    }

    fn update_latency(&mut self, latency_ms: u64) {
        if self.avg_latency_ms == 0.0 {
            self.avg_latency_ms = latency_ms as f64;
        } else {
            self.avg_latency_ms =
                self.avg_latency_ms * (1.0 - LATENCY_ALPHA) + latency_ms as f64 * LATENCY_ALPHA;
        }
    }
}

/// Lifetime counters for one provider.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProviderCounters {
    pub total: u64,
    pub success: u64,
    pub error: u64,
}

/// Health tracker for every endpoint, keyed by endpoint id.
#[derive(Default)]
pub struct EndpointHealth {
    states: DashMap<i64, EndpointState>,
    providers: DashMap<i64, ProviderCounters>,
}

impl EndpointHealth {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a persisted record, e.g. at startup.
    pub fn seed(&self, endpoint_id: i64, state: EndpointState) {
        self.states.insert(endpoint_id, state);
    }

    /// Install persisted provider counters at startup.
    pub fn seed_provider(&self, provider_id: i64, counters: ProviderCounters) {
        self.providers.insert(provider_id, counters);
    }

    /// Clone of the current record. Missing records read as fresh.
    pub fn snapshot(&self, endpoint_id: i64) -> EndpointState {
        self.states
            .get(&endpoint_id)
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    pub fn provider_counters(&self, provider_id: i64) -> ProviderCounters {
        self.providers
            .get(&provider_id)
            .map(|c| *c)
            .unwrap_or_default()
    }

    /// Primary-pass liveness: administrative flags, cooldown, and the soft
    /// min-interval gate all pass.
    pub fn is_available(&self, provider: &Provider, endpoint: &Endpoint, now: DateTime<Utc>) -> bool {
        if !endpoint.enabled || !provider.enabled {
            return false;
        }
        match self.states.get(&endpoint.id) {
            Some(state) => {
                state.cooldown_elapsed(now) && state.interval_elapsed(endpoint.min_interval_secs, now)
            }
            None => true,
        }
    }

    /// Degraded-pass liveness: cooldown is ignored, everything else holds.
    pub fn is_available_ignoring_cooldown(
        &self,
        provider: &Provider,
        endpoint: &Endpoint,
        now: DateTime<Utc>,
    ) -> bool {
        if !endpoint.enabled || !provider.enabled {
            return false;
        }
        match self.states.get(&endpoint.id) {
            Some(state) => state.interval_elapsed(endpoint.min_interval_secs, now),
            None => true,
        }
    }

    /// Record a successful attempt: clears cooldown and last-error, folds the
    /// latency into the rolling mean, bumps counters, stamps last-used.
    pub fn mark_success(
        &self,
        endpoint_id: i64,
        provider_id: i64,
        latency_ms: u64,
        now: DateTime<Utc>,
    ) -> EndpointState {
        let mut entry = self.states.entry(endpoint_id).or_default();
        entry.total += 1;
        entry.success += 1;
        entry.update_latency(latency_ms);
        entry.cooldown_until = None;
        entry.last_error = None;
        entry.last_used = Some(now);
        let snapshot = entry.clone();
        drop(entry);

        let mut counters = self.providers.entry(provider_id).or_default();
        counters.total += 1;
        counters.success += 1;

        snapshot
    }

    /// Record a failed attempt and schedule the cooldown.
    ///
    /// `cooldown_secs` is the effective value from [`cooldown_secs_for`];
    /// zero leaves the endpoint immediately selectable.
    pub fn mark_failure(
        &self,
        endpoint_id: i64,
        provider_id: i64,
        error: String,
        cooldown_secs: u64,
        now: DateTime<Utc>,
    ) -> EndpointState {
        let mut entry = self.states.entry(endpoint_id).or_default();
        entry.total += 1;
        entry.error += 1;
        if cooldown_secs > 0 {
            entry.cooldown_until = Some(now + Duration::seconds(cooldown_secs as i64));
        }
        entry.last_error = Some(error);
        entry.last_used = Some(now);
        let snapshot = entry.clone();
        drop(entry);

        let mut counters = self.providers.entry(provider_id).or_default();
        counters.total += 1;
        counters.error += 1;

        snapshot
    }

    /// Drop health state for a deleted endpoint.
    pub fn remove(&self, endpoint_id: i64) {
        self.states.remove(&endpoint_id);
    }

    /// Drop counters for a deleted provider.
    pub fn remove_provider(&self, provider_id: i64) {
        self.providers.remove(&provider_id);
    }
}

/// Effective cooldown for a failed attempt.
///
/// A pool cooldown of zero disables cooldowns entirely. Failures that are
/// plausibly transient upstream trouble take the full pool cooldown;
/// client-correctable ones take `min(pool, 5s)` so a bad request cannot
/// poison an otherwise healthy pool.
pub fn cooldown_secs_for(err: &AttemptError, pool_cooldown_secs: u64) -> u64 {
    if pool_cooldown_secs == 0 {
        0
    } else if err.wants_full_cooldown() {
        pool_cooldown_secs
    } else {
        pool_cooldown_secs.min(SHORT_COOLDOWN_SECS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ApiFormat, PoolTag};

    fn provider() -> Provider {
        Provider::new(1, "p", "https://api.example.com/v1", "key", ApiFormat::OpenAi)
    }

    fn endpoint() -> Endpoint {
        Endpoint::new(10, 1, "model-a", PoolTag::Normal)
    }

    #[test]
    fn test_ema_latency() {
        let health = EndpointHealth::new();
        let now = Utc::now();

        // First success sets the baseline
        let s = health.mark_success(10, 1, 100, now);
        assert_eq!(s.avg_latency_ms, 100.0);

        // Second success smooths with alpha 0.2: 100 * 0.8 + 200 * 0.2 = 140
        let s = health.mark_success(10, 1, 200, now);
        assert!((s.avg_latency_ms - 140.0).abs() < 0.001);
    }

    #[test]
    fn test_failure_schedules_cooldown() {
        let health = EndpointHealth::new();
        let now = Utc::now();

        let s = health.mark_failure(10, 1, "HTTP 500".into(), 60, now);
        assert_eq!(s.cooldown_until, Some(now + Duration::seconds(60)));
        assert_eq!(s.last_error.as_deref(), Some("HTTP 500"));

        // Cooling at now, implicitly healthy once the clock passes the mark.
        assert!(!health.is_available(&provider(), &endpoint(), now));
        assert!(health.is_available(&provider(), &endpoint(), now + Duration::seconds(61)));
    }

    #[test]
    fn test_zero_cooldown_keeps_endpoint_selectable() {
        let health = EndpointHealth::new();
        let now = Utc::now();

        let s = health.mark_failure(10, 1, "HTTP 500".into(), 0, now);
        assert!(s.cooldown_until.is_none());
        assert!(health.is_available(&provider(), &endpoint(), now));
    }

    #[test]
    fn test_success_clears_cooldown_and_error() {
        let health = EndpointHealth::new();
        let now = Utc::now();

        health.mark_failure(10, 1, "HTTP 503".into(), 60, now);
        let s = health.mark_success(10, 1, 42, now + Duration::seconds(1));
        assert!(s.cooldown_until.is_none());
        assert!(s.last_error.is_none());
        assert!(health.is_available(&provider(), &endpoint(), now + Duration::seconds(2)));
    }

    #[test]
    fn test_counters_monotone() {
        let health = EndpointHealth::new();
        let now = Utc::now();

        health.mark_success(10, 1, 10, now);
        health.mark_failure(10, 1, "x".into(), 60, now);
        health.mark_success(10, 1, 10, now);

        let s = health.snapshot(10);
        assert_eq!(s.total, 3);
        assert_eq!(s.success, 2);
        assert_eq!(s.error, 1);
        assert!(s.success + s.error <= s.total);

        let p = health.provider_counters(1);
        assert_eq!((p.total, p.success, p.error), (3, 2, 1));
    }

    #[test]
    fn test_disabled_flags_override_health() {
        let health = EndpointHealth::new();
        let now = Utc::now();

        let disabled_ep = endpoint().with_enabled(false);
        assert!(!health.is_available(&provider(), &disabled_ep, now));

        let disabled_provider = provider().with_enabled(false);
        assert!(!health.is_available(&disabled_provider, &endpoint(), now));
        assert!(!health.is_available_ignoring_cooldown(&disabled_provider, &endpoint(), now));
    }

    #[test]
    fn test_min_interval_gates_softly() {
        let health = EndpointHealth::new();
        let now = Utc::now();
        let gated = endpoint().with_min_interval_secs(10);

        health.mark_success(10, 1, 5, now);
        assert!(!health.is_available(&provider(), &gated, now + Duration::seconds(3)));
        assert!(health.is_available(&provider(), &gated, now + Duration::seconds(10)));

        // Rate-gating also holds in the degraded pass.
        assert!(!health.is_available_ignoring_cooldown(&provider(), &gated, now + Duration::seconds(3)));
    }

    #[test]
    fn test_effective_cooldown() {
        let server = AttemptError::Http {
            status: 500,
            body: "".into(),
        };
        let client = AttemptError::Http {
            status: 404,
            body: "".into(),
        };
        assert_eq!(cooldown_secs_for(&server, 60), 60);
        assert_eq!(cooldown_secs_for(&client, 60), 5);
        assert_eq!(cooldown_secs_for(&client, 3), 3);
        assert_eq!(cooldown_secs_for(&server, 0), 0);
    }
}
