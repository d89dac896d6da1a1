//! Embedding backends and the capability probe for semantic lookups
//!
//! The cache core never installs or discovers backends itself. The host asks a
//! [`CapabilityProbe`] once at startup and hands the answer, together with an
//! optional [`Embedder`], to the hybrid cache.

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::Result;

mod hashing;

pub use hashing::HashingEmbedder;

/// Turns prompt text into a fixed-length vector
#[async_trait]
pub trait Embedder: Send + Sync {
    fn name(&self) -> &str;

    /// Length of every vector this embedder returns
    fn dimensions(&self) -> usize;

    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// Outcome of a capability probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capability {
    pub available: bool,
    pub reason: String,
}

impl Capability {
    pub fn available(reason: impl Into<String>) -> Self {
        Self {
            available: true,
            reason: reason.into(),
        }
    }

    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self {
            available: false,
            reason: reason.into(),
        }
    }
}

/// Reports whether semantic lookups can be served
#[async_trait]
pub trait CapabilityProbe: Send + Sync {
    async fn probe(&self) -> Capability;
}

/// A probe with a fixed answer, for hosts that already know
#[derive(Debug, Clone)]
pub struct StaticProbe(pub Capability);

#[async_trait]
impl CapabilityProbe for StaticProbe {
    async fn probe(&self) -> Capability {
        self.0.clone()
    }
}

const PROBE_TEXT: &str = "capability probe: summarize the attached diff";

/// Checks an embedder by embedding a short sentence
pub struct EmbedderProbe {
    embedder: Arc<dyn Embedder>,
}

impl EmbedderProbe {
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self { embedder }
    }
}

#[async_trait]
impl CapabilityProbe for EmbedderProbe {
    async fn probe(&self) -> Capability {
        let name = self.embedder.name().to_string();
        let expected = self.embedder.dimensions();
        if expected == 0 {
            return Capability::unavailable(format!("{} reports zero dimensions", name));
        }

        match self.embedder.embed(PROBE_TEXT).await {
            Ok(vector) if vector.len() != expected => Capability::unavailable(format!(
                "{} returned {} dimensions, expected {}",
                name,
                vector.len(),
                expected
            )),
            Ok(vector) if vector.iter().any(|x| !x.is_finite()) => {
                Capability::unavailable(format!("{} returned non-finite values", name))
            }
            Ok(_) => Capability::available(format!("{} ({} dimensions)", name, expected)),
            Err(e) => Capability::unavailable(format!("{} failed: {}", name, e)),
        }
    }
}
