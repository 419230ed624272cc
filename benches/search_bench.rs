use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use seqindex::builder::build_index;
use seqindex::corpus::Corpus;
use seqindex::index::{Collection, CollectionOptions, FlatIndex, MetadataFilter, NearestNeighborIndex};
use seqindex::normalize::normalize;
use seqindex::query::rerank::dtw_distance;
use seqindex::storage::memory::MemoryStorage;
use seqindex::types::DistanceMetric;
use std::sync::Arc;

const TARGET_SIZE: usize = 32;

fn bench_normalize(c: &mut Criterion) {
    let raw: Vec<f64> = (0..30).map(|i| (i as f64 * 0.37).sin()).collect();
    c.bench_function("normalize_30_to_32", |b| {
        b.iter(|| normalize(black_box(&raw), TARGET_SIZE))
    });
}

fn bench_dtw(c: &mut Criterion) {
    let a = normalize(&(0..30).map(|i| (i as f64).sin()).collect::<Vec<_>>(), TARGET_SIZE).unwrap();
    let b = normalize(&(0..30).map(|i| (i as f64).cos()).collect::<Vec<_>>(), TARGET_SIZE).unwrap();

    let mut group = c.benchmark_group("dtw");
    for band in [None, Some(4)] {
        group.bench_with_input(BenchmarkId::from_parameter(format!("{:?}", band)), &band, |bench, band| {
            bench.iter(|| dtw_distance(black_box(&a), black_box(&b), *band))
        });
    }
    group.finish();
}

fn bench_search(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let corpus = Corpus::random_walk(20, 1_000, 42).unwrap();

    let collection = runtime.block_on(async {
        let collection = Collection::create(
            "bench",
            TARGET_SIZE,
            DistanceMetric::L2,
            Arc::new(MemoryStorage::new()),
            CollectionOptions::default(),
        )
        .await
        .unwrap();
        build_index(&corpus, &collection, &[7, 14, 30], TARGET_SIZE, 1)
            .await
            .unwrap();
        collection
    });

    let query = normalize(&corpus.series()[3].values[200..230], TARGET_SIZE).unwrap();

    let mut group = c.benchmark_group("collection_query");
    for k in [1, 5, 20] {
        group.bench_with_input(BenchmarkId::new("global", k), &k, |b, &k| {
            b.to_async(&runtime)
                .iter(|| async { collection.query(black_box(&query), k, None).await.unwrap() })
        });
    }
    let filter = MetadataFilter::name_eq("Series 3");
    group.bench_function("per_name_k5", |b| {
        b.to_async(&runtime)
            .iter(|| async { collection.query(black_box(&query), 5, Some(&filter)).await.unwrap() })
    });
    group.finish();

    let mut flat = FlatIndex::new(TARGET_SIZE, DistanceMetric::Cosine).unwrap();
    let records = runtime.block_on(async {
        // Reuse the built vectors for a cosine-only scan
        collection.query(&query, 10_000, None).await.unwrap()
    });
    flat.add(
        records
            .into_iter()
            .map(|hit| seqindex::types::IndexRecord {
                id: hit.id,
                vector: hit.vector,
                metadata: hit.metadata,
            })
            .collect(),
    )
    .unwrap();
    c.bench_function("flat_cosine_k5", |b| {
        b.iter(|| flat.search(black_box(&query), 5, None).unwrap())
    });
}

criterion_group!(benches, bench_normalize, bench_dtw, bench_search);
criterion_main!(benches);
