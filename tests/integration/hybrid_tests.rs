use std::sync::Arc;

use async_trait::async_trait;
use workflow_cache::embedding::{Capability, CapabilityProbe, Embedder, EmbedderProbe, HashingEmbedder};
use workflow_cache::{BaseCache, CacheConfig, CacheKey, CacheMode, HashOnlyCache, HybridCache};

use crate::common::*;

/// Two-dimensional embedder with hand-picked angles between prompts
struct AngleEmbedder;

#[async_trait]
impl Embedder for AngleEmbedder {
    fn name(&self) -> &str {
        "angle"
    }

    fn dimensions(&self) -> usize {
        2
    }

    async fn embed(&self, text: &str) -> workflow_cache::Result<Vec<f32>> {
        Ok(match text {
            "review this diff" => vec![1.0, 0.0],
            // cosine 0.96 with "review this diff"
            "review the diff" => vec![0.96, 0.28],
            // cosine 0.94 with "review this diff"
            "inspect this patch" => vec![0.94, 0.341_174_5],
            _ => vec![0.0, 1.0],
        })
    }
}

async fn hybrid(config: CacheConfig, embedder: Arc<dyn Embedder>) -> HybridCache {
    let capability = EmbedderProbe::new(embedder.clone()).probe().await;
    HybridCache::open(config, Some(embedder), capability)
        .await
        .unwrap()
}

fn memory_config() -> CacheConfig {
    CacheConfig {
        sweep_interval_secs: 0,
        ..CacheConfig::hybrid()
    }
}

#[tokio::test]
async fn test_semantic_promotion_at_096() {
    init_test_logging();
    let cache = hybrid(memory_config(), Arc::new(AngleEmbedder)).await;
    assert_eq!(cache.mode(), CacheMode::Hybrid);

    let original = key("security", "review this diff");
    cache
        .put(&original, entry(&original, "review this diff", "R1"))
        .await
        .unwrap();

    let close = key("security", "review the diff");
    assert_eq!(cache.get(&close).await.unwrap().response_payload, "R1");
    assert_eq!(cache.stats().await.semantic_hits, 1);

    // The second identical lookup is an exact hit on the promoted entry
    let again = cache.get(&close).await.unwrap();
    assert_eq!(again.key, close.as_str());
    assert_eq!(again.hit_count, 1);
    let stats = cache.stats().await;
    assert_eq!(stats.semantic_hits, 1);
    assert_eq!(stats.hits, 2);
}

#[tokio::test]
async fn test_similarity_below_threshold_misses() {
    let cache = hybrid(memory_config(), Arc::new(AngleEmbedder)).await;
    let original = key("security", "review this diff");
    cache
        .put(&original, entry(&original, "review this diff", "R1"))
        .await
        .unwrap();

    assert!(cache.get(&key("security", "inspect this patch")).await.is_none());

    let lenient = hybrid(
        CacheConfig {
            similarity_threshold: 0.9,
            ..memory_config()
        },
        Arc::new(AngleEmbedder),
    )
    .await;
    lenient
        .put(&original, entry(&original, "review this diff", "R1"))
        .await
        .unwrap();
    assert!(lenient.get(&key("security", "inspect this patch")).await.is_some());
}

#[tokio::test]
async fn test_exact_repeat_hits_in_both_modes() {
    let hash = HashOnlyCache::open(CacheConfig {
        sweep_interval_secs: 0,
        ..Default::default()
    })
    .await
    .unwrap();
    let hybrid = hybrid(memory_config(), Arc::new(HashingEmbedder::default())).await;
    let caches: [&dyn BaseCache; 2] = [&hash, &hybrid];

    for cache in caches {
        let k = key("security", "review this diff");
        assert!(cache.get(&k).await.is_none());
        cache.put(&k, entry(&k, "review this diff", "R1")).await.unwrap();

        let first = cache.get(&k).await.unwrap();
        assert_eq!(first.response_payload, "R1");
        assert_eq!(first.hit_count, 1);
        assert_eq!(cache.get(&k).await.unwrap().hit_count, 2);
    }
}

#[tokio::test]
async fn test_no_cross_workflow_matches() {
    let cache = hybrid(memory_config(), Arc::new(HashingEmbedder::default())).await;
    let review = key("security", "explain this function");
    cache
        .put(&review, entry(&review, "explain this function", "R-review"))
        .await
        .unwrap();

    let docs = CacheKey::from_request("docs", "security", "modelX", "explain this function");
    assert!(cache.get(&docs).await.is_none());
    assert_eq!(cache.stats().await.semantic_hits, 0);
}

#[tokio::test]
async fn test_degraded_sequence_matches_hash_only() {
    let sequence = [
        "review this diff",
        "review the diff",
        "review this diff",
        "summarize",
        "review the diff",
    ];
    let hash = HashOnlyCache::open(CacheConfig {
        sweep_interval_secs: 0,
        ..Default::default()
    })
    .await
    .unwrap();
    let degraded = HybridCache::open(
        memory_config(),
        Some(Arc::new(AngleEmbedder)),
        Capability::unavailable("embedding backend not installed"),
    )
    .await
    .unwrap();
    assert!(degraded.is_degraded());

    let caches: [&dyn BaseCache; 2] = [&hash, &degraded];
    let mut outcomes: Vec<Vec<bool>> = Vec::new();
    for cache in caches {
        let mut seen = Vec::new();
        for prompt in sequence {
            let k = key("security", prompt);
            let hit = cache.get(&k).await.is_some();
            if !hit {
                cache.put(&k, entry(&k, prompt, prompt)).await.unwrap();
            }
            seen.push(hit);
        }
        outcomes.push(seen);
    }

    assert_eq!(outcomes[0], vec![false, false, true, false, true]);
    assert_eq!(outcomes[0], outcomes[1]);
}

#[tokio::test]
async fn test_concurrent_lookups_during_writes() {
    let cache = Arc::new(hybrid(memory_config(), Arc::new(HashingEmbedder::default())).await);
    let seed = key("security", "shared prompt");
    cache
        .put(&seed, entry(&seed, "shared prompt", "R"))
        .await
        .unwrap();

    let readers = (0..8).map(|_| {
        let cache = Arc::clone(&cache);
        let seed = seed.clone();
        tokio::spawn(async move {
            for _ in 0..25 {
                assert!(cache.get(&seed).await.is_some());
            }
        })
    });
    let writers = (0..4).map(|w| {
        let cache = Arc::clone(&cache);
        tokio::spawn(async move {
            for i in 0..25 {
                let prompt = format!("writer {} prompt {}", w, i);
                let k = key("style", &prompt);
                cache.put(&k, entry(&k, &prompt, "W")).await.unwrap();
            }
        })
    });

    let handles: Vec<_> = readers.chain(writers).collect();
    for result in futures::future::join_all(handles).await {
        result.unwrap();
    }

    assert_eq!(cache.get(&seed).await.unwrap().hit_count, 201);
    assert_eq!(cache.len().await, 101);
    assert_eq!(cache.semantic_len().await, 101);
}
