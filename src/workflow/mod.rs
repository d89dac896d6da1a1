//! Integration points for the calling workflow engine
//!
//! [`WorkflowCache`] is the adapter each workflow stage receives. It speaks in
//! workflow, stage, model and prompt strings and hides keys and entries.
//! [`CachingProvider`] wraps any [`CompletionProvider`] so a stage can use the
//! cache without calling the adapter itself.

use async_trait::async_trait;

mod adapter;
mod cached;

pub use adapter::{WorkflowCache, WorkflowCacheStats};
pub use cached::CachingProvider;

/// An upstream model that turns a prompt into a response payload
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Identifier of the model, part of every cache key
    fn model_id(&self) -> &str;

    async fn complete(&self, prompt: &str) -> anyhow::Result<String>;
}
