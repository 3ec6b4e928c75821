//! Retrieval micro-benchmarks: feature hashing, hybrid blending, and
//! density clustering over synthetic corpora.

use athena_core::embedding::feature_hash;
use athena_core::search::{blend, Candidate, HybridWeights};
use criterion::{black_box, criterion_group, criterion_main, Criterion};

fn bench_feature_hash(c: &mut Criterion) {
    let text = "deployed service alpha to the staging environment after the canary \
                slice passed its smoke checks";
    c.bench_function("feature_hash_256", |b| {
        b.iter(|| feature_hash(black_box(text), 256))
    });
}

fn bench_hybrid_blend(c: &mut Criterion) {
    let now = chrono::Utc::now();
    let candidates: Vec<Candidate> = (0..500)
        .map(|i| Candidate {
            id: i,
            vec_sim: Some(f64::from(i as u32 % 97) / 97.0),
            lex_score: (i % 3 != 0).then(|| f64::from(i as u32 % 13)),
            last_accessed: now - chrono::Duration::minutes(i),
            confidence: 0.5,
        })
        .collect();
    c.bench_function("hybrid_blend_500", |b| {
        b.iter(|| blend(black_box(&candidates), HybridWeights::default(), now))
    });
}

fn bench_clustering(c: &mut Criterion) {
    use athena_core::consolidation::{build_clusters, dbscan, ClusterParams};

    let vectors: Vec<Vec<f32>> = (0..200)
        .map(|i| feature_hash(&format!("topic {} observation {}", i % 8, i), 128))
        .collect();
    let params = ClusterParams {
        eps: 0.45,
        min_samples: 2,
        min_cluster_size: 3,
    };
    c.bench_function("dbscan_200", |b| {
        b.iter(|| {
            let labels = dbscan(black_box(&params), black_box(&vectors));
            build_clusters(&params, &vectors, &labels)
        })
    });
}

criterion_group!(benches, bench_feature_hash, bench_hybrid_blend, bench_clustering);
criterion_main!(benches);
