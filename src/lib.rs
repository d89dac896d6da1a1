// Library exports for workflow-cache
// The cache is an embedded library: hosts build one instance at startup and
// pass it to every workflow stage that needs it.

pub mod cache;
pub mod config;
pub mod embedding;
pub mod error;
pub mod factory;
pub mod workflow;

pub use cache::{BaseCache, CacheEntry, CacheKey, CacheStatistics, HashOnlyCache, HybridCache};
pub use config::{CacheConfig, CacheMode};
pub use error::{CacheError, Result};
pub use factory::{open_cache, open_cache_with_probe};
pub use workflow::{CachingProvider, CompletionProvider, WorkflowCache};
