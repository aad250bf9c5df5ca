//! Benchmarks for index search and the full match path.
//!
//! Uses 2,000 owner bios by default for CI speed. Set `BENCH_FULL_SCALE=1`
//! to run against 100,000 bios:
//!
//! ```bash
//! BENCH_FULL_SCALE=1 cargo bench -p affinity-vector
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use criterion::{criterion_group, criterion_main, Criterion};

use affinity_core::config::{CacheConfig, EncoderConfig, IndexConfig, SearchConfig};
use affinity_core::types::{
    ContentItem, EmbeddingRecord, EmbeddingType, OwnerId, OwnerProfile, Preference, RecordId,
};
use affinity_storage::{MemoryProfileStore, MemoryRecordStore, ProfileStore, RecordStore};
use affinity_vector::{
    EncoderService, FeatureHashEncoder, IndexHandle, MatchEngine, SearchRequest,
};

const CI_OWNER_COUNT: usize = 2_000;
const FULL_SCALE_OWNER_COUNT: usize = 100_000;
const DIM: usize = 384;

const HOBBIES: &[&str] = &[
    "hiking", "coffee", "jazz", "climbing", "cooking", "photography", "surfing", "chess",
    "yoga", "travel", "painting", "cycling", "wine", "gardening", "films", "running",
];

fn owner_count() -> usize {
    if std::env::var("BENCH_FULL_SCALE").is_ok() {
        FULL_SCALE_OWNER_COUNT
    } else {
        CI_OWNER_COUNT
    }
}

/// A bio mentioning three hobbies, distinct per index.
fn bio(i: usize) -> String {
    format!(
        "loves {} and {}, weekends are for {}. profile {}",
        HOBBIES[i % HOBBIES.len()],
        HOBBIES[(i / 3) % HOBBIES.len()],
        HOBBIES[(i / 7) % HOBBIES.len()],
        i
    )
}

struct Populated {
    engine: MatchEngine,
    index: Arc<IndexHandle>,
    encoder: Arc<EncoderService>,
    requester: OwnerId,
}

fn populate(rt: &tokio::runtime::Runtime, count: usize, cache: &CacheConfig) -> Populated {
    let encoder = Arc::new(
        EncoderService::new(
            Arc::new(FeatureHashEncoder::new(DIM)),
            &EncoderConfig {
                dimensions: DIM,
                ..Default::default()
            },
        )
        .expect("encoder service"),
    );
    let records = Arc::new(MemoryRecordStore::new());
    let profiles = Arc::new(MemoryProfileStore::new());

    let mut batch = Vec::with_capacity(count);
    for i in 0..count {
        let owner_id = OwnerId::new();
        profiles
            .upsert(
                OwnerProfile {
                    owner_id,
                    gender: Some(if i % 2 == 0 { "f" } else { "m" }.to_string()),
                    verified: true,
                    metadata: serde_json::json!({ "rank": i }),
                },
                Preference::allow_all(),
            )
            .expect("upsert profile");
        let vector = rt
            .block_on(encoder.encode(&ContentItem::Text(bio(i))))
            .expect("encode bio");
        batch.push(EmbeddingRecord {
            id: RecordId::new(),
            owner_id,
            agent_id: None,
            vector,
            embedding_type: EmbeddingType::Text,
            data_type: Some("bio".to_string()),
            created_at: Utc::now(),
            source_ref: None,
        });
    }
    let requester = batch[0].owner_id;
    rt.block_on(records.append(&batch)).expect("append records");

    let index = Arc::new(IndexHandle::new(&IndexConfig::default(), DIM));
    rt.block_on(index.init(records.as_ref(), profiles.as_ref()))
        .expect("index init");

    let engine = MatchEngine::new(
        Arc::clone(&encoder),
        Arc::clone(&index),
        profiles as Arc<dyn ProfileStore>,
        &SearchConfig::default(),
        cache,
    );
    Populated {
        engine,
        index,
        encoder,
        requester,
    }
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("Failed to build tokio runtime")
}

fn bench_index_search(c: &mut Criterion) {
    let count = owner_count();
    let rt = runtime();
    let populated = populate(&rt, count, &CacheConfig::default());
    let query = rt
        .block_on(populated.encoder.encode_text("hiking and coffee lover"))
        .expect("encode query");

    let mut group = c.benchmark_group("index_search");
    group.sample_size(100);
    group.measurement_time(Duration::from_secs(10));

    group.bench_function(format!("knn_top10_{}owners", count), |b| {
        b.iter(|| {
            let hits = populated.index.search(&query, 10).expect("search failed");
            assert!(!hits.is_empty());
            hits
        });
    });

    group.bench_function(format!("knn_top100_filtered_{}owners", count), |b| {
        b.iter(|| {
            populated
                .index
                .search_filtered(&query, 100, |r| r.owner_id.0.as_bytes()[0] % 2 == 0)
                .expect("search failed")
        });
    });

    group.finish();
}

fn bench_match_search(c: &mut Criterion) {
    let count = owner_count();
    let rt = runtime();
    let uncached = populate(
        &rt,
        count,
        &CacheConfig {
            capacity: 0,
            ..Default::default()
        },
    );
    let cached = populate(&rt, count, &CacheConfig::default());

    let mut group = c.benchmark_group("match_search");
    group.sample_size(50);
    group.measurement_time(Duration::from_secs(10));

    group.bench_function(format!("uncached_page10_{}owners", count), |b| {
        let request = SearchRequest::new("hiking and coffee lover", uncached.requester);
        b.iter(|| {
            rt.block_on(uncached.engine.search_similar(&request))
                .expect("match search failed")
        });
    });

    group.bench_function(format!("cached_page10_{}owners", count), |b| {
        let request = SearchRequest::new("hiking and coffee lover", cached.requester);
        rt.block_on(cached.engine.search_similar(&request))
            .expect("warm cache");
        b.iter(|| {
            let response = rt
                .block_on(cached.engine.search_similar(&request))
                .expect("match search failed");
            assert!(response.meta.cached);
            response
        });
    });

    group.finish();
}

criterion_group!(benches, bench_index_search, bench_match_search);
criterion_main!(benches);
