//! The contract every cache implementation satisfies

use async_trait::async_trait;

use super::entry::{CacheEntry, CacheKey};
use super::stats::{CacheStatistics, SizeInfo};
use crate::config::CacheMode;
use crate::error::Result;

/// Trait for response cache implementations
#[async_trait]
pub trait BaseCache: Send + Sync {
    /// Which lookup strategy this cache actually runs with
    fn mode(&self) -> CacheMode;

    /// Look up a request.
    ///
    /// Returns the entry only if present and not expired. On hit the entry's
    /// `hit_count` and `last_accessed_at` are updated before it is returned.
    async fn get(&self, key: &CacheKey) -> Option<CacheEntry>;

    /// Insert or replace the entry for `key`, evicting LRU entries if needed.
    ///
    /// Fails with a validation error if the entry is malformed or does not
    /// belong to `key`; nothing is stored in that case.
    async fn put(&self, key: &CacheKey, entry: CacheEntry) -> Result<()>;

    /// Remove a single entry. Returns whether it was present.
    async fn invalidate(&self, key: &CacheKey) -> bool;

    /// Remove every entry
    async fn clear(&self);

    /// Drop all expired entries, returning how many were removed
    async fn purge_expired(&self) -> usize;

    /// Write the current contents to storage right away
    async fn flush(&self) -> Result<()>;

    async fn len(&self) -> usize;

    async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn size_info(&self) -> SizeInfo;

    async fn stats(&self) -> CacheStatistics;
}
