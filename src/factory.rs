//! Factory for creating the configured cache.

use std::sync::Arc;

use tracing::info;

use crate::cache::{BaseCache, HashOnlyCache, HybridCache};
use crate::config::{CacheConfig, CacheMode};
use crate::embedding::{Capability, CapabilityProbe, Embedder, EmbedderProbe};
use crate::error::Result;

/// Create the cache selected by `config.mode`.
///
/// In hybrid mode the embedder, if any, is probed once before construction.
/// A missing or failing embedder yields a degraded hybrid cache that behaves
/// exactly like the hash-only one.
pub async fn open_cache(
    config: CacheConfig,
    embedder: Option<Arc<dyn Embedder>>,
) -> Result<Arc<dyn BaseCache>> {
    let capability = match (&config.mode, &embedder) {
        (CacheMode::Hybrid, Some(embedder)) => {
            EmbedderProbe::new(Arc::clone(embedder)).probe().await
        }
        (CacheMode::Hybrid, None) => Capability::unavailable("no embedder configured"),
        (CacheMode::Hash, _) => Capability::unavailable("hash mode"),
    };
    open_cache_with_capability(config, embedder, capability).await
}

/// Create the configured cache using a caller-supplied probe.
pub async fn open_cache_with_probe(
    config: CacheConfig,
    embedder: Option<Arc<dyn Embedder>>,
    probe: &dyn CapabilityProbe,
) -> Result<Arc<dyn BaseCache>> {
    let capability = match config.mode {
        CacheMode::Hybrid => probe.probe().await,
        CacheMode::Hash => Capability::unavailable("hash mode"),
    };
    open_cache_with_capability(config, embedder, capability).await
}

async fn open_cache_with_capability(
    config: CacheConfig,
    embedder: Option<Arc<dyn Embedder>>,
    capability: Capability,
) -> Result<Arc<dyn BaseCache>> {
    let cache: Arc<dyn BaseCache> = match config.mode {
        CacheMode::Hash => Arc::new(HashOnlyCache::open(config).await?),
        CacheMode::Hybrid => Arc::new(HybridCache::open(config, embedder, capability).await?),
    };
    info!(mode = cache.mode().as_str(), "Response cache ready");
    Ok(cache)
}
