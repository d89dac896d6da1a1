//! Cache statistics

use serde::Serialize;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Statistics about cache usage, as seen at one point in time
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStatistics {
    /// Number of successful lookups (exact and semantic)
    pub hits: u64,
    /// Number of lookups that found nothing usable
    pub misses: u64,
    /// Entries removed to respect `max_entries` / `max_bytes`
    pub evictions: u64,
    /// Entries removed because their TTL ran out
    pub expirations: u64,
    /// Hits served through similarity search
    pub semantic_hits: u64,
    /// Semantic hits copied into the exact-match index
    pub promotions: u64,
    /// Failed loads and saves since startup
    pub storage_failures: u64,
    /// Failed saves since the last successful one
    pub consecutive_storage_failures: u32,
    /// Current number of entries
    pub total_entries: usize,
    /// Approximate size of all entries
    pub total_size_bytes: u64,
    /// hits / (hits + misses), 0.0 before any lookup
    pub hit_rate: f64,
}

impl CacheStatistics {
    /// Whether the operator should be told that persistence keeps failing
    pub fn storage_degraded(&self, alert_threshold: u32) -> bool {
        alert_threshold > 0 && self.consecutive_storage_failures >= alert_threshold
    }
}

/// `size_info()` result
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct SizeInfo {
    pub entries: usize,
    pub bytes: u64,
    pub hit_rate: f64,
}

pub(crate) fn hit_rate(hits: u64, misses: u64) -> f64 {
    let total = hits + misses;
    if total == 0 {
        0.0
    } else {
        hits as f64 / total as f64
    }
}

/// Lock-free counters shared by the cache and its background tasks
#[derive(Debug, Default)]
pub(crate) struct StatsRecorder {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
    semantic_hits: AtomicU64,
    promotions: AtomicU64,
    storage_failures: AtomicU64,
    consecutive_storage_failures: AtomicU32,
}

impl StatsRecorder {
    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_semantic_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        self.semantic_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_promotion(&self) {
        self.promotions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_evictions(&self, count: usize) {
        self.evictions.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_expirations(&self, count: usize) {
        self.expirations.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_load_failure(&self) {
        self.storage_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the length of the current failure streak
    pub fn record_save_failure(&self) -> u32 {
        self.storage_failures.fetch_add(1, Ordering::Relaxed);
        self.consecutive_storage_failures
            .fetch_add(1, Ordering::Relaxed)
            .saturating_add(1)
    }

    pub fn record_save_success(&self) {
        self.consecutive_storage_failures.store(0, Ordering::Relaxed);
    }

    pub fn hit_rate(&self) -> f64 {
        hit_rate(
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }

    pub fn snapshot(&self, total_entries: usize, total_size_bytes: u64) -> CacheStatistics {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        CacheStatistics {
            hits,
            misses,
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            semantic_hits: self.semantic_hits.load(Ordering::Relaxed),
            promotions: self.promotions.load(Ordering::Relaxed),
            storage_failures: self.storage_failures.load(Ordering::Relaxed),
            consecutive_storage_failures: self.consecutive_storage_failures.load(Ordering::Relaxed),
            total_entries,
            total_size_bytes,
            hit_rate: hit_rate(hits, misses),
        }
    }
}
