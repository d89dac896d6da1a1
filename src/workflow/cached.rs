//! Caching wrapper for completion providers
//!
//! This module provides a decorator that wraps any CompletionProvider to serve
//! repeated prompts of one workflow stage from the response cache.

use anyhow::Result;
use async_trait::async_trait;

use super::{CompletionProvider, WorkflowCache};

/// A caching wrapper for a provider used by a single workflow stage
pub struct CachingProvider<P> {
    inner: P,
    cache: WorkflowCache,
    workflow_name: String,
    stage_name: String,
}

impl<P: CompletionProvider> CachingProvider<P> {
    pub fn new(
        inner: P,
        cache: WorkflowCache,
        workflow_name: impl Into<String>,
        stage_name: impl Into<String>,
    ) -> Self {
        Self {
            inner,
            cache,
            workflow_name: workflow_name.into(),
            stage_name: stage_name.into(),
        }
    }

    pub fn inner(&self) -> &P {
        &self.inner
    }

    pub fn cache(&self) -> &WorkflowCache {
        &self.cache
    }
}

#[async_trait]
impl<P: CompletionProvider> CompletionProvider for CachingProvider<P> {
    fn model_id(&self) -> &str {
        self.inner.model_id()
    }

    async fn complete(&self, prompt: &str) -> Result<String> {
        self.cache
            .get_or_compute(
                &self.workflow_name,
                &self.stage_name,
                self.inner.model_id(),
                prompt,
                || self.inner.complete(prompt),
            )
            .await
    }
}
