//! Response caching for workflow LLM calls
//!
//! Two implementations share the [`BaseCache`] contract: [`HashOnlyCache`]
//! serves exact repeats of a request, and [`HybridCache`] additionally serves
//! prompts that mean the same thing within one workflow/stage/model scope.
//! Both can persist to a single JSON document through [`CacheStorage`].

mod background;
mod entry;
mod hash;
mod hybrid;
pub mod semantic;
mod stats;
mod storage;
mod store;

pub use entry::{fingerprint, normalize_prompt, CacheEntry, CacheKey};
pub use hash::HashOnlyCache;
pub use hybrid::HybridCache;
pub use semantic::{cosine_similarity, Scope, SemanticIndex};
pub use stats::{CacheStatistics, SizeInfo};
pub use storage::{CacheStorage, PersistedCache, FORMAT_VERSION};
pub use store::BaseCache;
