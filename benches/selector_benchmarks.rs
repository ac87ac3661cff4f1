//! Benchmarks for the selection hot path.

use chrono::Utc;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use llm_api_pool::registry::{ApiFormat, Endpoint, PoolTag, Provider, ProviderGroup};
use llm_api_pool::{EndpointHealth, Selector};

fn build_pool(providers: usize, endpoints_per_provider: usize) -> Vec<ProviderGroup> {
    let mut next_endpoint = 1i64;
    (0..providers)
        .map(|p| {
            let provider_id = p as i64 + 1;
            let endpoints = (0..endpoints_per_provider)
                .map(|e| {
                    let id = next_endpoint;
                    next_endpoint += 1;
                    Endpoint::new(id, provider_id, format!("model-{}-{}", p, e), PoolTag::Normal)
                        .with_weight((e as u32 % 4) + 1)
                })
                .collect();
            ProviderGroup {
                provider: Provider::new(
                    provider_id,
                    format!("provider{}", p),
                    format!("https://p{}.example.com/v1", p),
                    "key",
                    ApiFormat::OpenAi,
                ),
                endpoints,
            }
        })
        .collect()
}

fn bench_candidate_selection(c: &mut Criterion) {
    let mut group = c.benchmark_group("candidate_selection");

    for provider_count in [2, 5, 10, 20, 50] {
        let groups = build_pool(provider_count, 4);
        let selector = Selector::new();
        let health = EndpointHealth::new();
        let now = Utc::now();

        group.throughput(Throughput::Elements(1));
        group.bench_with_input(
            BenchmarkId::new("all_healthy", provider_count),
            &provider_count,
            |b, _| {
                let mut rng = rand::thread_rng();
                b.iter(|| {
                    black_box(selector.candidates(PoolTag::Normal, &groups, &health, now, &mut rng));
                });
            },
        );
    }

    group.finish();
}

fn bench_degraded_fallback(c: &mut Criterion) {
    let mut group = c.benchmark_group("degraded_fallback");
    let groups = build_pool(10, 4);
    let selector = Selector::new();
    let health = EndpointHealth::new();
    let now = Utc::now();

    // Everything cooling: every call walks the full degraded pass.
    for g in &groups {
        for e in &g.endpoints {
            health.mark_failure(e.id, g.provider.id, "HTTP 500".into(), 300, now);
        }
    }

    group.throughput(Throughput::Elements(1));
    group.bench_function("all_cooling", |b| {
        let mut rng = rand::thread_rng();
        b.iter(|| {
            black_box(selector.candidates(PoolTag::Normal, &groups, &health, now, &mut rng));
        });
    });

    group.finish();
}

fn bench_health_updates(c: &mut Criterion) {
    let mut group = c.benchmark_group("endpoint_health");
    let health = EndpointHealth::new();
    let now = Utc::now();

    group.bench_function("mark_success", |b| {
        b.iter(|| {
            health.mark_success(black_box(1), 1, black_box(50), now);
        });
    });

    group.bench_function("mark_failure", |b| {
        b.iter(|| {
            health.mark_failure(black_box(2), 1, "HTTP 500".to_string(), 60, now);
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_candidate_selection,
    bench_degraded_fallback,
    bench_health_updates,
);
criterion_main!(benches);
