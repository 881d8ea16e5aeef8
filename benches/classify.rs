//! Classification benchmarks.
//!
//! The classifier and estimator run once per key per run; the enrichment
//! bench measures pure orchestration overhead with an instant mock service.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::Arc;
use tokio::runtime::Runtime;
use tokio_util::sync::CancellationToken;

use spot_enrich::config::EnricherConfig;
use spot_enrich::scoring::{PlacementRequest, ScoreError};
use spot_enrich::{
    classify, estimate, BucketTable, Enricher, RawScoreLevel, ScoreKey, ScoringService,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Answers `High` for every requested size, immediately.
struct InstantService;

#[async_trait::async_trait]
impl ScoringService for InstantService {
    async fn score(
        &self,
        request: &PlacementRequest,
        _cancel: &CancellationToken,
    ) -> Result<Vec<RawScoreLevel>, ScoreError> {
        Ok(vec![RawScoreLevel::High; request.desired_sizes.len()])
    }
}

fn bench_config() -> EnricherConfig {
    let mut config = EnricherConfig::default();
    config.enrichment.stagger_max_ms = 0;
    config.enrichment.inter_group_pause_ms = 0;
    config.enrichment.concurrency_limit = 8;
    config
}

// ---------------------------------------------------------------------------
// Bench: classify over every level
// ---------------------------------------------------------------------------

fn bench_classify_levels(c: &mut Criterion) {
    let levels = [
        RawScoreLevel::High,
        RawScoreLevel::Medium,
        RawScoreLevel::Low,
        RawScoreLevel::None,
        RawScoreLevel::Unspecified,
    ];

    c.bench_function("classify_all_levels", |b| {
        b.iter(|| {
            for level in levels {
                black_box(classify(black_box(level), BucketTable::Standard));
            }
        })
    });
}

// ---------------------------------------------------------------------------
// Bench: static estimate (regex core-count extraction)
// ---------------------------------------------------------------------------

fn bench_estimate(c: &mut Criterion) {
    let mut group = c.benchmark_group("estimate");
    for sku in ["Standard_D2s_v5", "Standard_E4-2ds_v5", "Standard_NC24ads_A100_v4", "Basic"] {
        group.bench_with_input(BenchmarkId::new("sku", sku), &sku, |b, sku| {
            b.iter(|| black_box(estimate(black_box(sku))))
        });
    }
    group.finish();
}

// ---------------------------------------------------------------------------
// Bench: enrichment orchestration with an instant service
// ---------------------------------------------------------------------------

fn bench_enrich_orchestration(c: &mut Criterion) {
    let rt = Runtime::new().expect("runtime");

    let mut group = c.benchmark_group("enrich_orchestration");
    group.sample_size(20);

    for count in [5usize, 50] {
        let keys: Vec<ScoreKey> = (0..count)
            .map(|i| ScoreKey::new("eastus", format!("Standard_D{}s_v5", i + 2)))
            .collect();
        let enricher = Enricher::new(Arc::new(InstantService), None, &bench_config());

        group.bench_with_input(BenchmarkId::new("keys", count), &keys, |b, keys| {
            b.to_async(&rt)
                .iter(|| async { black_box(enricher.enrich_keys(keys.iter().cloned()).await) })
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_classify_levels,
    bench_estimate,
    bench_enrich_orchestration
);
criterion_main!(benches);
