//! Cache keys, prompt normalization and the cache entry record

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::Duration;

use crate::error::{CacheError, Result};

/// Bumped whenever the fingerprint inputs or normalization rules change.
const KEY_VERSION: &[u8] = b"wfc-key-v1";

/// Normalize a prompt before fingerprinting.
///
/// Rules, in order:
/// 1. `\r\n` and lone `\r` become `\n`
/// 2. trailing whitespace is stripped from every line
/// 3. runs of blank lines collapse to a single blank line
/// 4. leading and trailing whitespace of the whole prompt is removed
///
/// Case, indentation, interior spacing and all other content are kept as-is.
pub fn normalize_prompt(prompt: &str) -> String {
    let unified = prompt.replace("\r\n", "\n").replace('\r', "\n");

    let mut out = String::with_capacity(unified.len());
    let mut previous_blank = false;
    for line in unified.split('\n') {
        let line = line.trim_end();
        let blank = line.is_empty();
        if blank && previous_blank {
            continue;
        }
        out.push_str(line);
        out.push('\n');
        previous_blank = blank;
    }

    out.trim().to_string()
}

/// Deterministic fingerprint of a request scope and its normalized prompt.
///
/// Length-prefixed so that `("a|b", "c")` and `("a", "b|c")` never collide.
pub fn fingerprint(workflow_name: &str, stage_name: &str, model_id: &str, normalized: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(KEY_VERSION);
    for part in [workflow_name, stage_name, model_id, normalized] {
        hasher.update((part.len() as u64).to_le_bytes());
        hasher.update(part.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

/// Shorten a key for log output
pub(crate) fn short_key(key: &str) -> &str {
    match key.char_indices().nth(12) {
        Some((idx, _)) => &key[..idx],
        None => key,
    }
}

/// Identifies one cacheable request
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub workflow_name: String,
    pub stage_name: String,
    pub model_id: String,
    /// The prompt after [`normalize_prompt`]
    pub normalized_prompt: String,
    fingerprint: String,
}

impl CacheKey {
    /// Generate a cache key from request components
    pub fn from_request(workflow_name: &str, stage_name: &str, model_id: &str, prompt: &str) -> Self {
        let normalized_prompt = normalize_prompt(prompt);
        let fingerprint = fingerprint(workflow_name, stage_name, model_id, &normalized_prompt);
        Self {
            workflow_name: workflow_name.to_string(),
            stage_name: stage_name.to_string(),
            model_id: model_id.to_string(),
            normalized_prompt,
            fingerprint,
        }
    }

    /// The canonical key string used by the hash index
    pub fn as_str(&self) -> &str {
        &self.fingerprint
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.fingerprint)
    }
}

/// A single cached response with its bookkeeping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Canonical fingerprint
    pub key: String,
    /// Prompt as the caller sent it
    pub raw_prompt: String,
    /// Prompt embedding, only kept in hybrid mode
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    /// Opaque serialized upstream result
    pub response_payload: String,
    pub workflow_name: String,
    pub stage_name: String,
    pub model_id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    #[serde(default)]
    pub hit_count: u64,
}

impl CacheEntry {
    /// Create a fresh entry for `key`, expiring after `ttl`.
    pub fn new(
        key: &CacheKey,
        raw_prompt: impl Into<String>,
        response_payload: impl Into<String>,
        ttl: Duration,
    ) -> Result<Self> {
        let ttl = ChronoDuration::from_std(ttl)
            .map_err(|_| CacheError::validation("ttl is out of range"))?;
        let now = Utc::now();
        let expires_at = now
            .checked_add_signed(ttl)
            .ok_or_else(|| CacheError::validation("ttl is out of range"))?;

        let entry = Self {
            key: key.as_str().to_string(),
            raw_prompt: raw_prompt.into(),
            embedding: None,
            response_payload: response_payload.into(),
            workflow_name: key.workflow_name.clone(),
            stage_name: key.stage_name.clone(),
            model_id: key.model_id.clone(),
            created_at: now,
            expires_at,
            last_accessed_at: now,
            hit_count: 0,
        };
        entry.validate()?;
        Ok(entry)
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Approximate in-memory footprint, used for `max_bytes` accounting
    pub fn size_bytes(&self) -> usize {
        self.key.len()
            + self.raw_prompt.len()
            + self.response_payload.len()
            + self.workflow_name.len()
            + self.stage_name.len()
            + self.model_id.len()
            + self
                .embedding
                .as_ref()
                .map(|v| v.len() * std::mem::size_of::<f32>())
                .unwrap_or(0)
    }

    /// Same request and response, ignoring access bookkeeping
    pub fn same_content(&self, other: &CacheEntry) -> bool {
        self.key == other.key
            && self.raw_prompt == other.raw_prompt
            && self.response_payload == other.response_payload
            && self.workflow_name == other.workflow_name
            && self.stage_name == other.stage_name
            && self.model_id == other.model_id
            && self.embedding == other.embedding
    }

    /// Check that every required field is present and consistent.
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("key", &self.key),
            ("workflow_name", &self.workflow_name),
            ("stage_name", &self.stage_name),
            ("model_id", &self.model_id),
        ] {
            if value.trim().is_empty() {
                return Err(CacheError::validation(format!("entry is missing {}", name)));
            }
        }

        let expected = fingerprint(
            &self.workflow_name,
            &self.stage_name,
            &self.model_id,
            &normalize_prompt(&self.raw_prompt),
        );
        if self.key != expected {
            return Err(CacheError::validation(format!(
                "entry key {} does not match its request fingerprint",
                short_key(&self.key)
            )));
        }

        if self.expires_at <= self.created_at {
            return Err(CacheError::validation("expires_at must be after created_at"));
        }
        if self.last_accessed_at < self.created_at {
            return Err(CacheError::validation(
                "last_accessed_at must not precede created_at",
            ));
        }

        if let Some(embedding) = &self.embedding {
            if embedding.is_empty() {
                return Err(CacheError::validation("embedding must not be empty"));
            }
            if embedding.iter().any(|x| !x.is_finite()) {
                return Err(CacheError::validation("embedding contains non-finite values"));
            }
        }

        Ok(())
    }
}
