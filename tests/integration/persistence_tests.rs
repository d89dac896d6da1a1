use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use workflow_cache::cache::{PersistedCache, FORMAT_VERSION};
use workflow_cache::embedding::{Capability, Embedder, HashingEmbedder};
use workflow_cache::{BaseCache, CacheConfig, HashOnlyCache, HybridCache, WorkflowCache};

use crate::common::*;

fn write_document(env: &TestEnvironment, document: &serde_json::Value) {
    let path = env.storage_path();
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, serde_json::to_vec_pretty(document).unwrap()).unwrap();
}

#[tokio::test]
async fn test_round_trip_preserves_entries() {
    let env = TestEnvironment::new();
    let a = key("security", "review this diff");
    let b = key("style", "check naming");

    let first = HashOnlyCache::open(env.config()).await.unwrap();
    let a_entry = entry(&a, "review this diff", "R1");
    let b_entry = entry(&b, "check naming", "R2");
    first.put(&a, a_entry.clone()).await.unwrap();
    first.put(&b, b_entry.clone()).await.unwrap();
    first.get(&a).await.unwrap();
    first.get(&a).await.unwrap();
    first.flush().await.unwrap();
    drop(first);

    let second = HashOnlyCache::open(env.config()).await.unwrap();
    assert_eq!(second.len().await, 2);

    let entries = second.entries().await;
    let restored_a = entries.iter().find(|e| e.key == a.as_str()).unwrap();
    let restored_b = entries.iter().find(|e| e.key == b.as_str()).unwrap();
    assert_eq!(restored_a.hit_count, 2);
    assert_eq!(restored_a.created_at, a_entry.created_at);
    assert_eq!(restored_a.response_payload, "R1");
    assert_eq!(restored_b.hit_count, 0);
    assert_eq!(restored_b.created_at, b_entry.created_at);

    // Hit counts keep advancing from the persisted value
    assert_eq!(second.get(&a).await.unwrap().hit_count, 3);
}

#[tokio::test]
async fn test_reload_restores_lru_order() {
    let env = TestEnvironment::new();
    let keys: Vec<_> = ["a", "b", "c"].iter().map(|p| key("security", p)).collect();

    let first = HashOnlyCache::open(env.config()).await.unwrap();
    for (k, prompt) in keys.iter().zip(["a", "b", "c"]) {
        first.put(k, entry(k, prompt, prompt)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    first.get(&keys[0]).await.unwrap();
    first.flush().await.unwrap();
    drop(first);

    let second = HashOnlyCache::open(CacheConfig {
        max_entries: 3,
        ..env.config()
    })
    .await
    .unwrap();
    let d = key("security", "d");
    second.put(&d, entry(&d, "d", "d")).await.unwrap();

    // "b" was the least recently used before the restart
    assert!(second.get(&keys[1]).await.is_none());
    assert!(second.get(&keys[0]).await.is_some());
    assert!(second.get(&keys[2]).await.is_some());
}

#[tokio::test]
async fn test_expired_entries_are_dropped_on_load() {
    let env = TestEnvironment::new();
    let live = key("security", "live");
    let stale = key("security", "stale");
    let document = PersistedCache {
        format_version: FORMAT_VERSION,
        saved_at: Utc::now(),
        entries: vec![
            entry(&live, "live", "R-live"),
            expired_entry(&stale, "stale", "R-stale"),
        ],
    };
    write_document(&env, &serde_json::to_value(&document).unwrap());

    let cache = HashOnlyCache::open(env.config()).await.unwrap();
    assert_eq!(cache.len().await, 1);
    assert!(cache.get(&stale).await.is_none());
    assert_eq!(cache.get(&live).await.unwrap().response_payload, "R-live");
}

#[tokio::test]
async fn test_incompatible_version_starts_empty() {
    let env = TestEnvironment::new();
    let k = key("security", "p");
    write_document(
        &env,
        &serde_json::json!({
            "format_version": FORMAT_VERSION + 1,
            "entries": [serde_json::to_value(entry(&k, "p", "R")).unwrap()],
        }),
    );

    let cache = HashOnlyCache::open(env.config()).await.unwrap();
    assert!(cache.is_empty().await);
    assert_eq!(cache.stats().await.storage_failures, 1);
}

#[tokio::test]
async fn test_corrupt_file_starts_empty_and_is_replaced() {
    let env = TestEnvironment::new();
    let path = env.storage_path();
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, b"{\"format_version\": 1, \"entries\": [").unwrap();

    let cache = HashOnlyCache::open(env.config()).await.unwrap();
    assert!(cache.is_empty().await);

    let k = key("security", "p");
    cache.put(&k, entry(&k, "p", "R")).await.unwrap();
    cache.flush().await.unwrap();
    drop(cache);

    let reopened = HashOnlyCache::open(env.config()).await.unwrap();
    assert_eq!(reopened.len().await, 1);
    assert_eq!(reopened.stats().await.storage_failures, 0);
}

#[tokio::test]
async fn test_auto_save_writes_after_mutation() {
    let env = TestEnvironment::new();
    let config = CacheConfig {
        auto_save: true,
        autosave_debounce_ms: 20,
        ..env.config()
    };

    let cache = HashOnlyCache::open(config.clone()).await.unwrap();
    let k = key("security", "p");
    cache.put(&k, entry(&k, "p", "R")).await.unwrap();

    let mut saved = false;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        if env.storage_path().exists() {
            saved = true;
            break;
        }
    }
    assert!(saved, "auto-save never wrote the cache file");
    drop(cache);

    let reopened = HashOnlyCache::open(config).await.unwrap();
    assert_eq!(reopened.len().await, 1);
}

#[tokio::test]
async fn test_drop_saves_changes_still_in_debounce() {
    let env = TestEnvironment::new();
    let config = CacheConfig {
        auto_save: true,
        ..env.config()
    };
    assert_eq!(config.autosave_debounce_ms, 500);

    let cache = WorkflowCache::open(config.clone(), None).await.unwrap();
    cache
        .cache_store("review", "security", "modelX", "review this diff", "R1")
        .await
        .unwrap();
    drop(cache);

    let reopened = HashOnlyCache::open(config).await.unwrap();
    assert_eq!(reopened.len().await, 1);
    assert_eq!(
        reopened
            .get(&key("security", "review this diff"))
            .await
            .unwrap()
            .response_payload,
        "R1"
    );
}

#[tokio::test]
async fn test_drop_without_auto_save_writes_nothing() {
    let env = TestEnvironment::new();
    let cache = HashOnlyCache::open(env.config()).await.unwrap();
    let k = key("security", "p");
    cache.put(&k, entry(&k, "p", "R")).await.unwrap();
    drop(cache);

    assert!(!env.storage_path().exists());
}

#[tokio::test]
async fn test_repeated_save_failures_escalate() {
    let env = TestEnvironment::new();
    // A regular file where the cache directory should be
    let blocker = env.temp_dir.path().join("blocked");
    std::fs::write(&blocker, b"not a directory").unwrap();
    let config = CacheConfig {
        storage_failure_alert_threshold: 3,
        ..env.config()
    }
    .with_storage_path(blocker.join("responses.json"));

    let cache = HashOnlyCache::open(config).await.unwrap();
    let k = key("security", "p");
    cache.put(&k, entry(&k, "p", "R")).await.unwrap();

    for attempt in 1..=3 {
        assert!(cache.flush().await.is_err());
        let stats = cache.stats().await;
        assert_eq!(stats.consecutive_storage_failures, attempt);
        assert_eq!(stats.storage_degraded(3), attempt >= 3);
    }

    // The cache itself keeps serving
    assert_eq!(cache.get(&k).await.unwrap().response_payload, "R");
}

#[tokio::test]
async fn test_hybrid_embeddings_survive_restart() {
    let env = TestEnvironment::new();
    let embedder: Arc<dyn Embedder> = Arc::new(HashingEmbedder::default());
    let k = key("security", "review this diff for injection bugs");

    let first = HybridCache::open(
        env.hybrid_config(),
        Some(embedder.clone()),
        Capability::available("test"),
    )
    .await
    .unwrap();
    first
        .put(&k, entry(&k, "review this diff for injection bugs", "R1"))
        .await
        .unwrap();
    first.flush().await.unwrap();
    drop(first);

    let raw = std::fs::read_to_string(env.storage_path()).unwrap();
    assert!(raw.contains("\"embedding\""));

    let second = HybridCache::open(env.hybrid_config(), Some(embedder), Capability::available("test"))
        .await
        .unwrap();
    assert_eq!(second.semantic_len().await, 1);

    let paraphrase = key("security", "Review this diff for injection bugs!");
    assert_eq!(second.get(&paraphrase).await.unwrap().response_payload, "R1");
}

#[tokio::test]
async fn test_hash_mode_saves_without_embeddings() {
    let env = TestEnvironment::new();
    let k = key("security", "p");

    let hybrid = HybridCache::open(
        env.hybrid_config(),
        Some(Arc::new(HashingEmbedder::default())),
        Capability::available("test"),
    )
    .await
    .unwrap();
    hybrid.put(&k, entry(&k, "p", "R")).await.unwrap();
    hybrid.flush().await.unwrap();
    drop(hybrid);

    let hash = HashOnlyCache::open(env.config()).await.unwrap();
    assert_eq!(hash.get(&k).await.unwrap().response_payload, "R");
    hash.flush().await.unwrap();

    let raw = std::fs::read_to_string(env.storage_path()).unwrap();
    assert!(!raw.contains("\"embedding\""));
}
