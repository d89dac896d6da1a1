//! Scoped vector index for similarity lookups
//!
//! Vectors are partitioned by [`Scope`] so that a prompt is only ever compared
//! with prompts of the same workflow, stage and model.

use std::collections::HashMap;

use super::entry::{CacheEntry, CacheKey};

/// The workflow/stage/model a prompt belongs to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Scope {
    pub workflow_name: String,
    pub stage_name: String,
    pub model_id: String,
}

impl Scope {
    pub fn of_key(key: &CacheKey) -> Self {
        Self {
            workflow_name: key.workflow_name.clone(),
            stage_name: key.stage_name.clone(),
            model_id: key.model_id.clone(),
        }
    }

    pub fn of_entry(entry: &CacheEntry) -> Self {
        Self {
            workflow_name: entry.workflow_name.clone(),
            stage_name: entry.stage_name.clone(),
            model_id: entry.model_id.clone(),
        }
    }
}

/// Cosine similarity in `[-1, 1]`.
///
/// Returns `None` for empty vectors, mismatched lengths or zero magnitude.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f32> {
    if a.len() != b.len() || a.is_empty() {
        return None;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if mag_a == 0.0 || mag_b == 0.0 {
        return None;
    }
    // Rounding can push identical vectors a hair past 1.0
    Some((dot / (mag_a * mag_b)).clamp(-1.0, 1.0))
}

/// A stored vector that scored at or above the threshold
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub key: String,
    pub similarity: f32,
}

#[derive(Debug, Default)]
pub struct SemanticIndex {
    scopes: HashMap<Scope, HashMap<String, Vec<f32>>>,
    key_scopes: HashMap<String, Scope>,
}

impl SemanticIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, scope: Scope, key: String, embedding: Vec<f32>) {
        if let Some(previous) = self.key_scopes.get(&key) {
            if *previous != scope {
                self.remove(&key);
            }
        }
        self.key_scopes.insert(key.clone(), scope.clone());
        self.scopes.entry(scope).or_default().insert(key, embedding);
    }

    pub fn remove(&mut self, key: &str) -> bool {
        let Some(scope) = self.key_scopes.remove(key) else {
            return false;
        };
        if let Some(vectors) = self.scopes.get_mut(&scope) {
            vectors.remove(key);
            if vectors.is_empty() {
                self.scopes.remove(&scope);
            }
        }
        true
    }

    pub fn contains(&self, key: &str) -> bool {
        self.key_scopes.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.key_scopes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.key_scopes.is_empty()
    }

    pub fn clear(&mut self) {
        self.scopes.clear();
        self.key_scopes.clear();
    }

    /// All vectors in `scope` scoring within `[threshold, 1.0]`, best first.
    pub fn search(&self, scope: &Scope, query: &[f32], threshold: f32) -> Vec<Candidate> {
        let Some(vectors) = self.scopes.get(scope) else {
            return Vec::new();
        };

        let mut candidates: Vec<Candidate> = vectors
            .iter()
            .filter_map(|(key, vector)| {
                cosine_similarity(query, vector).map(|similarity| Candidate {
                    key: key.clone(),
                    similarity,
                })
            })
            .filter(|c| c.similarity >= threshold)
            .collect();

        candidates.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
        candidates
    }
}
