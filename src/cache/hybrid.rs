//! Exact-match cache with a semantic fallback
//!
//! A [`HybridCache`] wraps a [`HashOnlyCache`]. Exact hits take the hash path
//! unchanged. On a miss the prompt is embedded and compared against prompts of
//! the same workflow, stage and model; a close enough match is served and
//! promoted under the new exact key so the next identical request hits the
//! hash path.
//!
//! Lock order is semantic index first, hash index second. Mutations hold the
//! semantic write lock for their whole duration.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::entry::{short_key, CacheEntry, CacheKey};
use super::hash::{check_key, HashOnlyCache};
use super::semantic::{Candidate, Scope, SemanticIndex};
use super::stats::{CacheStatistics, SizeInfo};
use super::store::BaseCache;
use crate::config::{CacheConfig, CacheMode};
use crate::embedding::{Capability, Embedder};
use crate::error::Result;

struct SemanticLayer {
    embedder: Arc<dyn Embedder>,
    index: RwLock<SemanticIndex>,
}

pub struct HybridCache {
    inner: HashOnlyCache,
    semantic: Option<SemanticLayer>,
    capability: Capability,
}

impl HybridCache {
    /// Build a hybrid cache from a capability report taken at startup.
    ///
    /// When the capability is unavailable, or no embedder is supplied, the
    /// cache runs degraded and behaves exactly like a [`HashOnlyCache`].
    pub async fn open(
        config: CacheConfig,
        embedder: Option<Arc<dyn Embedder>>,
        capability: Capability,
    ) -> Result<Self> {
        let embedder = match (embedder, capability.available) {
            (Some(embedder), true) => Some(embedder),
            (None, true) => {
                warn!("Semantic capability reported without an embedder, using exact matching only");
                None
            }
            (_, false) => {
                debug!(reason = %capability.reason, "Semantic cache unavailable, using exact matching only");
                None
            }
        };

        let Some(embedder) = embedder else {
            let inner = HashOnlyCache::open_with(config, false, false).await?;
            return Ok(Self {
                inner,
                semantic: None,
                capability: Capability::unavailable(capability.reason),
            });
        };

        let inner = HashOnlyCache::open_with(config, true, true).await?;
        let dimensions = embedder.dimensions();
        let mut index = SemanticIndex::new();
        for entry in inner.entries().await {
            if let Some(vector) = &entry.embedding {
                if vector.len() == dimensions {
                    index.insert(Scope::of_entry(&entry), entry.key.clone(), vector.clone());
                }
            }
        }
        // Loading evictions are already reflected in the snapshot above
        inner.core().drain_removed();
        debug!(
            embedder = embedder.name(),
            indexed = index.len(),
            "Semantic index built"
        );

        Ok(Self {
            inner,
            semantic: Some(SemanticLayer {
                embedder,
                index: RwLock::new(index),
            }),
            capability,
        })
    }

    pub fn capability(&self) -> &Capability {
        &self.capability
    }

    pub fn is_degraded(&self) -> bool {
        self.semantic.is_none()
    }

    pub fn config(&self) -> &CacheConfig {
        self.inner.config()
    }

    /// Number of prompts searchable by similarity
    pub async fn semantic_len(&self) -> usize {
        match &self.semantic {
            Some(layer) => layer.index.read().await.len(),
            None => 0,
        }
    }

    /// Every live entry, least recently used first
    pub async fn entries(&self) -> Vec<CacheEntry> {
        self.inner.entries().await
    }

    async fn embed(&self, layer: &SemanticLayer, text: &str) -> Option<Vec<f32>> {
        match layer.embedder.embed(text).await {
            Ok(vector) if vector.len() == layer.embedder.dimensions() => Some(vector),
            Ok(vector) => {
                debug!(
                    got = vector.len(),
                    expected = layer.embedder.dimensions(),
                    "Embedding has the wrong dimension, skipping semantic step"
                );
                None
            }
            Err(e) => {
                debug!("Embedding failed, skipping semantic step: {}", e);
                None
            }
        }
    }

    /// Drop index entries whose hash entry is gone.
    ///
    /// Keys are re-checked against the hash index, so a key that was removed
    /// and then stored again stays indexed.
    async fn prune(&self, index: &mut SemanticIndex, stale: Vec<String>) {
        if stale.is_empty() {
            return;
        }
        let refs: Vec<&str> = stale.iter().map(String::as_str).collect();
        let live = self.inner.core().access_ticks(&refs).await;
        for key in &stale {
            if !live.contains_key(key) {
                index.remove(key);
            }
        }
    }

    async fn sync_removals(&self, index: &mut SemanticIndex) {
        let removed = self.inner.core().drain_removed();
        self.prune(index, removed).await;
    }

    /// Candidates that are still live, best similarity first and most
    /// recently used first among equal scores.
    async fn rank(&self, candidates: Vec<Candidate>) -> (Vec<Candidate>, Vec<String>) {
        let keys: Vec<&str> = candidates.iter().map(|c| c.key.as_str()).collect();
        let ticks = self.inner.core().access_ticks(&keys).await;

        let (mut live, stale): (Vec<Candidate>, Vec<Candidate>) = candidates
            .into_iter()
            .partition(|c| ticks.contains_key(&c.key));
        live.sort_by(|a, b| {
            b.similarity
                .total_cmp(&a.similarity)
                .then_with(|| ticks.get(&b.key).cmp(&ticks.get(&a.key)))
        });
        (live, stale.into_iter().map(|c| c.key).collect())
    }

    async fn semantic_get(&self, layer: &SemanticLayer, key: &CacheKey) -> Option<CacheEntry> {
        let query = self.embed(layer, &key.normalized_prompt).await?;
        let scope = Scope::of_key(key);
        let threshold = self.config().similarity_threshold;

        let candidates = layer.index.read().await.search(&scope, &query, threshold);
        if candidates.is_empty() {
            return None;
        }

        let (ranked, stale) = self.rank(candidates).await;
        if !stale.is_empty() {
            let mut index = layer.index.write().await;
            self.prune(&mut index, stale).await;
        }

        for candidate in ranked {
            let now = Utc::now();
            let Some(matched) = self.inner.core().lookup(&candidate.key, now).await else {
                continue;
            };
            let Some(matched) = self.inner.core().verify_live(matched, now).await else {
                continue;
            };

            self.inner.core().recorder().record_semantic_hit();
            debug!(
                key = %short_key(key.as_str()),
                matched = %short_key(&matched.key),
                similarity = candidate.similarity,
                "Semantic cache hit"
            );
            self.promote(layer, key, &matched, query).await;
            return Some(matched);
        }
        None
    }

    /// Store the matched response under the requesting key.
    async fn promote(
        &self,
        layer: &SemanticLayer,
        key: &CacheKey,
        matched: &CacheEntry,
        query: Vec<f32>,
    ) {
        let Ok(remaining) = (matched.expires_at - Utc::now()).to_std() else {
            return;
        };

        let mut promoted = match CacheEntry::new(
            key,
            key.normalized_prompt.clone(),
            matched.response_payload.clone(),
            remaining,
        ) {
            Ok(entry) => entry,
            Err(e) => {
                debug!("Promotion skipped: {}", e);
                return;
            }
        };
        // A promotion never outlives the response it copies
        promoted.expires_at = matched.expires_at;
        promoted.embedding = Some(query.clone());

        let mut index = layer.index.write().await;
        self.sync_removals(&mut index).await;
        match self.inner.core().insert(promoted).await {
            Ok(()) => {
                self.sync_removals(&mut index).await;
                index.insert(Scope::of_key(key), key.as_str().to_string(), query);
                self.inner.core().recorder().record_promotion();
                debug!(key = %short_key(key.as_str()), "Promoted semantic match");
            }
            Err(e) => debug!("Promotion skipped: {}", e),
        }
    }
}

#[async_trait]
impl BaseCache for HybridCache {
    fn mode(&self) -> CacheMode {
        if self.semantic.is_some() {
            CacheMode::Hybrid
        } else {
            CacheMode::Hash
        }
    }

    async fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
        let Some(layer) = &self.semantic else {
            return self.inner.get(key).await;
        };

        let core = self.inner.core();
        let now = Utc::now();
        let exact = match core.lookup(key.as_str(), now).await {
            Some(entry) => core.verify_live(entry, now).await,
            None => None,
        };
        if let Some(entry) = exact {
            core.recorder().record_hit();
            debug!(key = %short_key(key.as_str()), hits = entry.hit_count, "Cache hit");
            return Some(entry);
        }

        match self.semantic_get(layer, key).await {
            Some(entry) => Some(entry),
            None => {
                core.recorder().record_miss();
                debug!(key = %short_key(key.as_str()), "Cache miss");
                None
            }
        }
    }

    async fn put(&self, key: &CacheKey, mut entry: CacheEntry) -> Result<()> {
        let Some(layer) = &self.semantic else {
            return self.inner.put(key, entry).await;
        };
        check_key(key, &entry)?;
        entry.validate()?;

        let dimensions = layer.embedder.dimensions();
        if entry.embedding.as_ref().map(Vec::len) != Some(dimensions) {
            entry.embedding = self.embed(layer, &key.normalized_prompt).await;
        }
        let embedding = entry.embedding.clone();

        let mut index = layer.index.write().await;
        self.sync_removals(&mut index).await;
        self.inner.core().insert(entry).await?;
        self.sync_removals(&mut index).await;

        // An already expired entry is accepted but never stored
        let stored = self
            .inner
            .core()
            .access_ticks(&[key.as_str()])
            .await
            .contains_key(key.as_str());
        match embedding {
            Some(vector) if stored => {
                index.insert(Scope::of_key(key), key.as_str().to_string(), vector);
            }
            _ => {
                index.remove(key.as_str());
            }
        }
        Ok(())
    }

    async fn invalidate(&self, key: &CacheKey) -> bool {
        let Some(layer) = &self.semantic else {
            return self.inner.invalidate(key).await;
        };
        let mut index = layer.index.write().await;
        let removed = self.inner.invalidate(key).await;
        index.remove(key.as_str());
        self.sync_removals(&mut index).await;
        removed
    }

    async fn clear(&self) {
        let Some(layer) = &self.semantic else {
            return self.inner.clear().await;
        };
        let mut index = layer.index.write().await;
        self.inner.clear().await;
        self.inner.core().drain_removed();
        index.clear();
    }

    async fn purge_expired(&self) -> usize {
        let Some(layer) = &self.semantic else {
            return self.inner.purge_expired().await;
        };
        let mut index = layer.index.write().await;
        let purged = self.inner.purge_expired().await;
        self.sync_removals(&mut index).await;
        purged
    }

    async fn flush(&self) -> Result<()> {
        self.inner.flush().await
    }

    async fn len(&self) -> usize {
        self.inner.len().await
    }

    async fn size_info(&self) -> SizeInfo {
        self.inner.size_info().await
    }

    async fn stats(&self) -> CacheStatistics {
        self.inner.stats().await
    }
}
