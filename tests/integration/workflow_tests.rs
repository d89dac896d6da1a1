use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use workflow_cache::embedding::HashingEmbedder;
use workflow_cache::{CacheConfig, CachingProvider, CompletionProvider, WorkflowCache};

use crate::common::*;

/// Counts upstream calls and echoes the prompt back
struct CountingProvider {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl CompletionProvider for CountingProvider {
    fn model_id(&self) -> &str {
        "modelX"
    }

    async fn complete(&self, prompt: &str) -> anyhow::Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(format!("findings for: {}", prompt))
    }
}

#[tokio::test]
async fn test_adapter_scenario() {
    let env = TestEnvironment::new();
    let cache = WorkflowCache::open(env.config(), None).await.unwrap();

    cache
        .cache_store("review", "security", "modelX", "review this diff", "R1")
        .await
        .unwrap();
    assert_eq!(
        cache
            .cache_lookup("review", "security", "modelX", "review this diff")
            .await
            .as_deref(),
        Some("R1")
    );
    assert!(cache
        .cache_lookup("review", "security", "modelY", "review this diff")
        .await
        .is_none());

    let stats = cache.cache_stats().await;
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.evictions, 0);
    assert_eq!(stats.entries, 1);
}

#[tokio::test]
async fn test_stage_survives_restart() {
    let env = TestEnvironment::new();
    let calls = Arc::new(AtomicUsize::new(0));

    {
        let cache = WorkflowCache::open(env.config(), None).await.unwrap();
        let stage = CachingProvider::new(
            CountingProvider {
                calls: calls.clone(),
            },
            cache.clone(),
            "review",
            "security",
        );
        stage.complete("review this diff").await.unwrap();
        cache.flush().await.unwrap();
    }

    let cache = WorkflowCache::open(env.config(), None).await.unwrap();
    let stage = CachingProvider::new(
        CountingProvider {
            calls: calls.clone(),
        },
        cache,
        "review",
        "security",
    );
    assert_eq!(
        stage.complete("review this diff").await.unwrap(),
        "findings for: review this diff"
    );
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_hybrid_adapter_serves_paraphrase() {
    let env = TestEnvironment::new();
    let cache = WorkflowCache::open(
        env.hybrid_config(),
        Some(Arc::new(HashingEmbedder::default())),
    )
    .await
    .unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let stage = CachingProvider::new(
        CountingProvider {
            calls: calls.clone(),
        },
        cache.clone(),
        "review",
        "security",
    );

    stage.complete("Review this diff for SQL injection").await.unwrap();
    let served = stage.complete("review this diff for SQL injection.").await.unwrap();

    assert_eq!(served, "findings for: Review this diff for SQL injection");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_disabled_adapter_always_calls_upstream() {
    let env = TestEnvironment::new();
    let config = CacheConfig {
        enabled: false,
        ..env.config()
    };
    let cache = WorkflowCache::open(config, None).await.unwrap();
    assert!(!cache.is_enabled());

    let calls = Arc::new(AtomicUsize::new(0));
    let stage = CachingProvider::new(
        CountingProvider {
            calls: calls.clone(),
        },
        cache,
        "review",
        "security",
    );
    stage.complete("p").await.unwrap();
    stage.complete("p").await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}
