//! Two-level candidate selection.
//!
//! Level one rotates a per-pool round-robin cursor across the providers in a
//! pool; level two picks one of the provider's live endpoints by
//! weight-proportional random selection. When every endpoint in the pool is
//! cooling, a degraded fallback pass re-examines them ignoring cooldown so a
//! transient universal cooldown cannot hard-fail a request while any endpoint
//! is administratively live.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use rand::Rng;

use crate::health::EndpointHealth;
use crate::registry::{Endpoint, PoolTag, Provider, ProviderGroup};

/// One entry of the ordered candidate sequence for a dispatch.
#[derive(Clone, Debug)]
pub struct Candidate {
    pub provider: Provider,
    pub endpoint: Endpoint,

    /// True when yielded by the degraded fallback pass.
    pub degraded: bool,
}

/// Pool-scoped selection state. The round-robin cursors are the only
/// cross-request state; the weighted pick is independent per call.
#[derive(Default)]
pub struct Selector {
    cursors: [AtomicU64; 3],
}

impl Selector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Produce the ordered candidate sequence for one dispatch.
    ///
    /// The pool cursor advances exactly once per call, regardless of how many
    /// candidates the dispatcher ends up consuming. No endpoint id appears
    /// twice in the returned sequence.
    pub fn candidates<R: Rng>(
        &self,
        pool: PoolTag,
        groups: &[ProviderGroup],
        health: &EndpointHealth,
        now: DateTime<Utc>,
        rng: &mut R,
    ) -> Vec<Candidate> {
        let cursor = self.cursors[pool as usize].fetch_add(1, Ordering::Relaxed);

        let mut yielded: HashSet<i64> = HashSet::new();
        let mut candidates = Vec::new();

        // Primary pass: rotated provider order, one weighted pick each.
        let n = groups.len();
        for offset in 0..n {
            let group = &groups[(cursor as usize + offset) % n];
            let live: Vec<&Endpoint> = group
                .endpoints
                .iter()
                .filter(|e| health.is_available(&group.provider, e, now))
                .collect();
            if live.is_empty() {
                continue;
            }
            let picked = weighted_pick(&live, rng);
            if yielded.insert(picked.id) {
                candidates.push(Candidate {
                    provider: group.provider.clone(),
                    endpoint: picked.clone(),
                    degraded: false,
                });
            }
        }

        if !candidates.is_empty() {
            return candidates;
        }

        // Degraded fallback: stable (provider insertion, endpoint insertion)
        // order, cooldown ignored. Administrative flags and the rate gate
        // still hold.
        for group in groups {
            for endpoint in &group.endpoints {
                if health.is_available_ignoring_cooldown(&group.provider, endpoint, now)
                    && yielded.insert(endpoint.id)
                {
                    candidates.push(Candidate {
                        provider: group.provider.clone(),
                        endpoint: endpoint.clone(),
                        degraded: true,
                    });
                }
            }
        }

        candidates
    }
}

/// Weight-proportional random choice: endpoint `i` is picked with
/// probability `w_i / Σw`.
fn weighted_pick<'a, R: Rng>(live: &[&'a Endpoint], rng: &mut R) -> &'a Endpoint {
    let total: u64 = live.iter().map(|e| e.weight.max(1) as u64).sum();
    let mut roll = rng.gen_range(0..total);
    for endpoint in live {
        let w = endpoint.weight.max(1) as u64;
        if roll < w {
            return endpoint;
        }
        roll -= w;
    }
    // Unreachable while total == Σw; keep the last as a safe default.
    live[live.len() - 1]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ApiFormat;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn group(provider_id: i64, name: &str, endpoints: Vec<Endpoint>) -> ProviderGroup {
        ProviderGroup {
            provider: Provider::new(
                provider_id,
                name,
                format!("https://{}.example.com/v1", name),
                "key",
                ApiFormat::OpenAi,
            ),
            endpoints,
        }
    }

    fn three_provider_pool() -> Vec<ProviderGroup> {
        vec![
            group(1, "p1", vec![Endpoint::new(1, 1, "m1", PoolTag::Normal)]),
            group(2, "p2", vec![Endpoint::new(2, 2, "m2", PoolTag::Normal)]),
            group(3, "p3", vec![Endpoint::new(3, 3, "m3", PoolTag::Normal)]),
        ]
    }

    #[test]
    fn test_round_robin_rotation() {
        let selector = Selector::new();
        let health = EndpointHealth::new();
        let groups = three_provider_pool();
        let now = Utc::now();
        let mut rng = StdRng::seed_from_u64(7);

        let first_of = |selector: &Selector, rng: &mut StdRng| {
            selector.candidates(PoolTag::Normal, &groups, &health, now, rng)[0]
                .provider
                .id
        };

        // Six dispatches cycle p1, p2, p3, p1, p2, p3.
        let order: Vec<i64> = (0..6).map(|_| first_of(&selector, &mut rng)).collect();
        assert_eq!(order, vec![1, 2, 3, 1, 2, 3]);
    }

    #[test]
    fn test_no_endpoint_yielded_twice() {
        let selector = Selector::new();
        let health = EndpointHealth::new();
        let groups = three_provider_pool();
        let mut rng = StdRng::seed_from_u64(7);

        for _ in 0..20 {
            let candidates =
                selector.candidates(PoolTag::Normal, &groups, &health, Utc::now(), &mut rng);
            let mut seen = HashSet::new();
            for c in &candidates {
                assert!(seen.insert(c.endpoint.id), "endpoint yielded twice");
            }
        }
    }

    #[test]
    fn test_disabled_never_selected() {
        let selector = Selector::new();
        let health = EndpointHealth::new();
        let groups = vec![
            group(
                1,
                "p1",
                vec![Endpoint::new(1, 1, "m1", PoolTag::Normal).with_enabled(false)],
            ),
            group(2, "p2", vec![Endpoint::new(2, 2, "m2", PoolTag::Normal)]),
        ];
        let mut rng = StdRng::seed_from_u64(7);

        for _ in 0..10 {
            let candidates =
                selector.candidates(PoolTag::Normal, &groups, &health, Utc::now(), &mut rng);
            assert!(candidates.iter().all(|c| c.endpoint.id != 1));
            assert!(!candidates.is_empty());
        }
    }

    #[test]
    fn test_disabled_provider_excludes_endpoints() {
        let selector = Selector::new();
        let health = EndpointHealth::new();
        let mut disabled = group(1, "p1", vec![Endpoint::new(1, 1, "m1", PoolTag::Normal)]);
        disabled.provider.enabled = false;
        let groups = vec![
            disabled,
            group(2, "p2", vec![Endpoint::new(2, 2, "m2", PoolTag::Normal)]),
        ];
        let mut rng = StdRng::seed_from_u64(7);

        let candidates = selector.candidates(PoolTag::Normal, &groups, &health, Utc::now(), &mut rng);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].endpoint.id, 2);
    }

    #[test]
    fn test_cooling_skipped_in_primary_pass() {
        let selector = Selector::new();
        let health = EndpointHealth::new();
        let groups = three_provider_pool();
        let now = Utc::now();
        let mut rng = StdRng::seed_from_u64(7);

        health.mark_failure(2, 2, "HTTP 500".into(), 60, now);

        let candidates = selector.candidates(PoolTag::Normal, &groups, &health, now, &mut rng);
        assert!(candidates.iter().all(|c| !c.degraded));
        assert!(candidates.iter().all(|c| c.endpoint.id != 2));
    }

    #[test]
    fn test_degraded_pass_when_all_cooling() {
        let selector = Selector::new();
        let health = EndpointHealth::new();
        let groups = three_provider_pool();
        let now = Utc::now();
        let mut rng = StdRng::seed_from_u64(7);

        for id in 1..=3 {
            health.mark_failure(id, id, "HTTP 500".into(), 60, now);
        }

        let candidates = selector.candidates(PoolTag::Normal, &groups, &health, now, &mut rng);
        // Stable insertion order, every endpoint marked degraded.
        assert_eq!(
            candidates.iter().map(|c| c.endpoint.id).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert!(candidates.iter().all(|c| c.degraded));
    }

    #[test]
    fn test_degraded_pass_respects_admin_flags() {
        let selector = Selector::new();
        let health = EndpointHealth::new();
        let now = Utc::now();
        let groups = vec![group(
            1,
            "p1",
            vec![
                Endpoint::new(1, 1, "m1", PoolTag::Normal),
                Endpoint::new(2, 1, "m2", PoolTag::Normal).with_enabled(false),
            ],
        )];
        let mut rng = StdRng::seed_from_u64(7);

        health.mark_failure(1, 1, "HTTP 500".into(), 60, now);

        let candidates = selector.candidates(PoolTag::Normal, &groups, &health, now, &mut rng);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].endpoint.id, 1);
        assert!(candidates[0].degraded);
    }

    #[test]
    fn test_weighted_pick_distribution() {
        // Single provider, weights 1 and 3: expect ~75% on the heavy one.
        let heavy = Endpoint::new(2, 1, "m2", PoolTag::Advanced).with_weight(3);
        let light = Endpoint::new(1, 1, "m1", PoolTag::Advanced);
        let live = vec![&light, &heavy];
        let mut rng = StdRng::seed_from_u64(42);

        let mut heavy_hits = 0u32;
        const N: u32 = 4_000;
        for _ in 0..N {
            if weighted_pick(&live, &mut rng).id == 2 {
                heavy_hits += 1;
            }
        }
        let freq = heavy_hits as f64 / N as f64;
        assert!((0.72..=0.78).contains(&freq), "frequency {} out of band", freq);
    }

    #[test]
    fn test_empty_pool_yields_nothing() {
        let selector = Selector::new();
        let health = EndpointHealth::new();
        let mut rng = StdRng::seed_from_u64(7);

        let candidates = selector.candidates(PoolTag::Tool, &[], &health, Utc::now(), &mut rng);
        assert!(candidates.is_empty());
    }
}
