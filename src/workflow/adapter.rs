//! Adapter between workflow stages and the response cache

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::cache::{BaseCache, CacheEntry, CacheKey};
use crate::config::CacheConfig;
use crate::embedding::Embedder;
use crate::error::Result;
use crate::factory::open_cache;

/// Counters reported to the workflow engine
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub hit_rate: f64,
    pub entries: usize,
    pub approx_size_bytes: u64,
}

/// Cache handle passed to each workflow stage
///
/// Cloning is cheap; clones share the same cache.
#[derive(Clone)]
pub struct WorkflowCache {
    cache: Arc<dyn BaseCache>,
    enabled: bool,
    ttl: Duration,
}

impl WorkflowCache {
    /// Wrap an existing cache. `config` supplies the TTL and the on/off switch.
    pub fn new(cache: Arc<dyn BaseCache>, config: &CacheConfig) -> Self {
        Self {
            cache,
            enabled: config.enabled,
            ttl: config.ttl(),
        }
    }

    /// Build the cache described by `config` and wrap it.
    pub async fn open(config: CacheConfig, embedder: Option<Arc<dyn Embedder>>) -> Result<Self> {
        let enabled = config.enabled;
        let ttl = config.ttl();
        let cache = open_cache(config, embedder).await?;
        Ok(Self {
            cache,
            enabled,
            ttl,
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// The underlying cache
    pub fn cache(&self) -> &Arc<dyn BaseCache> {
        &self.cache
    }

    /// Cached response for this request, if any
    pub async fn cache_lookup(
        &self,
        workflow_name: &str,
        stage_name: &str,
        model_id: &str,
        prompt_text: &str,
    ) -> Option<String> {
        if !self.enabled {
            return None;
        }
        let key = CacheKey::from_request(workflow_name, stage_name, model_id, prompt_text);
        self.cache
            .get(&key)
            .await
            .map(|entry| entry.response_payload)
    }

    /// Remember a complete upstream response.
    ///
    /// Only validation errors are returned; the cache recovers from anything
    /// else on its own.
    pub async fn cache_store(
        &self,
        workflow_name: &str,
        stage_name: &str,
        model_id: &str,
        prompt_text: &str,
        response_payload: impl Into<String>,
    ) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let key = CacheKey::from_request(workflow_name, stage_name, model_id, prompt_text);
        let entry = CacheEntry::new(&key, prompt_text, response_payload, self.ttl)?;
        match self.cache.put(&key, entry).await {
            Err(e) if e.is_recoverable() => {
                debug!("Response not cached: {}", e);
                Ok(())
            }
            other => other,
        }
    }

    pub async fn cache_stats(&self) -> WorkflowCacheStats {
        let stats = self.cache.stats().await;
        WorkflowCacheStats {
            hits: stats.hits,
            misses: stats.misses,
            evictions: stats.evictions,
            hit_rate: stats.hit_rate,
            entries: stats.total_entries,
            approx_size_bytes: stats.total_size_bytes,
        }
    }

    /// Typed lookup; a payload that no longer deserializes counts as a miss.
    pub async fn lookup_json<T: DeserializeOwned>(
        &self,
        workflow_name: &str,
        stage_name: &str,
        model_id: &str,
        prompt_text: &str,
    ) -> Option<T> {
        let payload = self
            .cache_lookup(workflow_name, stage_name, model_id, prompt_text)
            .await?;
        match serde_json::from_str(&payload) {
            Ok(value) => Some(value),
            Err(e) => {
                debug!("Cached payload does not match the requested type: {}", e);
                None
            }
        }
    }

    pub async fn store_json<T: Serialize>(
        &self,
        workflow_name: &str,
        stage_name: &str,
        model_id: &str,
        prompt_text: &str,
        value: &T,
    ) -> Result<()> {
        let payload = serde_json::to_string(value)?;
        self.cache_store(workflow_name, stage_name, model_id, prompt_text, payload)
            .await
    }

    /// Serve from cache, or run `upstream` and cache its successful result.
    ///
    /// Upstream errors are returned unchanged and nothing is stored.
    pub async fn get_or_compute<F, Fut>(
        &self,
        workflow_name: &str,
        stage_name: &str,
        model_id: &str,
        prompt_text: &str,
        upstream: F,
    ) -> anyhow::Result<String>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<String>>,
    {
        if let Some(cached) = self
            .cache_lookup(workflow_name, stage_name, model_id, prompt_text)
            .await
        {
            return Ok(cached);
        }

        let response = upstream().await?;
        if let Err(e) = self
            .cache_store(workflow_name, stage_name, model_id, prompt_text, response.clone())
            .await
        {
            warn!(workflow = workflow_name, stage = stage_name, "Could not cache response: {}", e);
        }
        Ok(response)
    }

    /// Write the cache to storage now, ignoring the auto-save debounce.
    pub async fn flush(&self) -> Result<()> {
        self.cache.flush().await
    }
}
