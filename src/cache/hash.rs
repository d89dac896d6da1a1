//! Exact-match response cache
//!
//! Entries are keyed by the request fingerprint, so lookups are a single
//! hash-map probe. Lookups only take the read lock: per-entry bookkeeping
//! (`hit_count`, `last_accessed_at`, LRU position) lives in atomics. Inserts,
//! removals and evictions take the write lock for the whole mutation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{Notify, RwLock};
use tracing::{debug, error, info, warn};

use super::background::BackgroundTasks;
use super::entry::{short_key, CacheEntry, CacheKey};
use super::stats::{CacheStatistics, SizeInfo, StatsRecorder};
use super::storage::CacheStorage;
use super::store::BaseCache;
use crate::config::{CacheConfig, CacheMode};
use crate::error::{CacheError, Result};

fn to_nanos(at: DateTime<Utc>) -> i64 {
    at.timestamp_nanos_opt().unwrap_or(i64::MAX)
}

/// One stored entry plus its mutable bookkeeping
struct Slot {
    entry: CacheEntry,
    size: u64,
    hit_count: AtomicU64,
    last_accessed_nanos: AtomicI64,
    /// Position on the logical access clock; the smallest value is the LRU entry
    access_tick: AtomicU64,
    /// Tick this slot is filed under in `Index::lru`. Never newer than
    /// `access_tick`; only changes under the write lock.
    filed_tick: u64,
}

impl Slot {
    fn new(entry: CacheEntry, tick: u64) -> Self {
        let size = entry.size_bytes() as u64;
        Self {
            hit_count: AtomicU64::new(entry.hit_count),
            last_accessed_nanos: AtomicI64::new(to_nanos(entry.last_accessed_at)),
            access_tick: AtomicU64::new(tick),
            filed_tick: tick,
            size,
            entry,
        }
    }

    fn record_access(&self, now: DateTime<Utc>, tick: u64) {
        self.hit_count.fetch_add(1, Ordering::Relaxed);
        self.last_accessed_nanos
            .fetch_max(to_nanos(now), Ordering::Relaxed);
        self.access_tick.fetch_max(tick, Ordering::Relaxed);
    }

    fn snapshot(&self) -> CacheEntry {
        let mut entry = self.entry.clone();
        entry.hit_count = self.hit_count.load(Ordering::Relaxed);
        entry.last_accessed_at =
            DateTime::from_timestamp_nanos(self.last_accessed_nanos.load(Ordering::Relaxed));
        entry
    }
}

#[derive(Default)]
struct Index {
    slots: HashMap<String, Slot>,
    /// Keys ordered by `filed_tick`. Reads advance `access_tick` without
    /// touching this map, so a key is refiled lazily when it reaches the front.
    lru: BTreeMap<u64, String>,
    total_bytes: u64,
}

impl Index {
    /// Store a slot under a key that is not present.
    fn insert(&mut self, key: String, slot: Slot) {
        self.total_bytes += slot.size;
        self.lru.insert(slot.filed_tick, key.clone());
        self.slots.insert(key, slot);
    }

    fn remove(&mut self, key: &str) -> Option<Slot> {
        let slot = self.slots.remove(key)?;
        self.lru.remove(&slot.filed_tick);
        self.total_bytes = self.total_bytes.saturating_sub(slot.size);
        Some(slot)
    }

    fn clear(&mut self) -> Vec<String> {
        self.lru.clear();
        self.total_bytes = 0;
        self.slots.drain().map(|(key, _)| key).collect()
    }

    /// The least recently used key, in amortized logarithmic time.
    ///
    /// Every other slot was filed at or after the front tick, and an access
    /// only moves a slot's tick forward. So once the front slot's current
    /// tick equals its filed tick it is the true minimum.
    fn lru_key(&mut self) -> Option<String> {
        while let Some((filed, key)) = self.lru.pop_first() {
            let Some(slot) = self.slots.get_mut(&key) else {
                continue;
            };
            let current = slot.access_tick.load(Ordering::Relaxed);
            slot.filed_tick = current;
            self.lru.insert(current, key.clone());
            if current == filed {
                return Some(key);
            }
        }
        None
    }

    fn expired_keys(&self, now: DateTime<Utc>) -> Vec<String> {
        self.slots
            .iter()
            .filter(|(_, slot)| slot.entry.is_expired_at(now))
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Copy of every entry, least recently used first
    fn snapshot(&self) -> Vec<CacheEntry> {
        let mut slots: Vec<&Slot> = self.slots.values().collect();
        slots.sort_by_key(|slot| slot.access_tick.load(Ordering::Relaxed));
        slots.into_iter().map(Slot::snapshot).collect()
    }
}

/// State shared between a cache handle and its background tasks
pub(crate) struct HashCore {
    config: CacheConfig,
    keep_embeddings: bool,
    index: RwLock<Index>,
    stats: StatsRecorder,
    clock: AtomicU64,
    storage: Option<CacheStorage>,
    save_signal: Arc<Notify>,
    /// Set by mutations that auto-save should persist, cleared when a save starts
    dirty: AtomicBool,
    save_seq: AtomicU64,
    /// Keys removed since the last drain, collected only for a semantic layer
    removed: Option<Mutex<Vec<String>>>,
}

impl HashCore {
    fn next_tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub(crate) fn save_signal(&self) -> Arc<Notify> {
        Arc::clone(&self.save_signal)
    }

    fn mark_dirty(&self) {
        if self.storage.is_some() && self.config.auto_save {
            self.dirty.store(true, Ordering::Release);
            self.save_signal.notify_one();
        }
    }

    fn note_removed(&self, keys: &[String]) {
        if keys.is_empty() {
            return;
        }
        if let Some(removed) = &self.removed {
            removed
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .extend_from_slice(keys);
        }
    }

    pub(crate) fn drain_removed(&self) -> Vec<String> {
        match &self.removed {
            Some(removed) => std::mem::take(
                &mut *removed
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner()),
            ),
            None => Vec::new(),
        }
    }

    /// Find an entry that is live at `now` and record the access on it.
    ///
    /// Expired entries found on the way are purged. Hit/miss counters are
    /// left to the caller.
    pub(crate) async fn lookup(&self, key: &str, now: DateTime<Utc>) -> Option<CacheEntry> {
        {
            let index = self.index.read().await;
            match index.slots.get(key) {
                None => return None,
                Some(slot) if !slot.entry.is_expired_at(now) => {
                    slot.record_access(now, self.next_tick());
                    return Some(slot.snapshot());
                }
                Some(_) => {}
            }
        }

        debug!(key = %short_key(key), "Cache entry expired, removing");
        self.remove_if_expired(key).await;
        None
    }

    async fn remove_if_expired(&self, key: &str) {
        let mut index = self.index.write().await;
        let still_expired = index
            .slots
            .get(key)
            .map(|slot| slot.entry.is_expired())
            .unwrap_or(false);
        if still_expired {
            index.remove(key);
            drop(index);
            self.stats.record_expirations(1);
            self.note_removed(&[key.to_string()]);
            self.mark_dirty();
        }
    }

    /// Guard against an entry that was expired at `now` escaping as a hit.
    ///
    /// `now` must be the instant the lookup judged liveness against.
    pub(crate) async fn verify_live(
        &self,
        entry: CacheEntry,
        now: DateTime<Utc>,
    ) -> Option<CacheEntry> {
        if !entry.is_expired_at(now) {
            return Some(entry);
        }
        let defect = CacheError::Consistency(format!(
            "expired entry {} surfaced as a hit",
            short_key(&entry.key)
        ));
        error!("{}", defect);
        self.remove_if_expired(&entry.key).await;
        None
    }

    /// Access clock positions of the given keys that are still live
    pub(crate) async fn access_ticks(&self, keys: &[&str]) -> HashMap<String, u64> {
        let now = Utc::now();
        let index = self.index.read().await;
        keys.iter()
            .filter_map(|key| {
                index.slots.get(*key).and_then(|slot| {
                    (!slot.entry.is_expired_at(now))
                        .then(|| (key.to_string(), slot.access_tick.load(Ordering::Relaxed)))
                })
            })
            .collect()
    }

    /// Validate and store an entry, evicting as needed.
    pub(crate) async fn insert(&self, mut entry: CacheEntry) -> Result<()> {
        entry.validate()?;
        if !self.keep_embeddings {
            entry.embedding = None;
        }

        let size = entry.size_bytes() as u64;
        let max_bytes = self.config.max_bytes;
        if max_bytes > 0 && size > max_bytes {
            return Err(CacheError::validation(format!(
                "entry of {} bytes exceeds max_bytes {}",
                size, max_bytes
            )));
        }

        let now = Utc::now();
        if entry.is_expired_at(now) {
            debug!(key = %short_key(&entry.key), "Not caching an already expired entry");
            return Ok(());
        }

        let mut index = self.index.write().await;

        if let Some(existing) = index.slots.get(&entry.key) {
            if existing.entry.same_content(&entry) && !existing.entry.is_expired_at(now) {
                return Ok(());
            }
        }
        index.remove(&entry.key);

        let mut expired = Vec::new();
        let mut evicted = Vec::new();
        let max_entries = self.config.max_entries;
        let over_capacity = |index: &Index| {
            (max_entries > 0 && index.slots.len() >= max_entries)
                || (max_bytes > 0 && index.total_bytes + size > max_bytes)
        };

        if over_capacity(&*index) {
            for key in index.expired_keys(now) {
                index.remove(&key);
                expired.push(key);
            }
        }
        while over_capacity(&*index) {
            let Some(victim) = index.lru_key() else {
                break;
            };
            debug!(key = %short_key(&victim), "Evicting LRU cache entry");
            index.remove(&victim);
            evicted.push(victim);
        }

        let key = entry.key.clone();
        let slot = Slot::new(entry, self.next_tick());
        index.insert(key.clone(), slot);
        drop(index);

        self.stats.record_expirations(expired.len());
        self.stats.record_evictions(evicted.len());
        self.note_removed(&expired);
        self.note_removed(&evicted);
        debug!(key = %short_key(&key), "Cached response");
        self.mark_dirty();
        Ok(())
    }

    pub(crate) async fn remove(&self, key: &str) -> bool {
        let removed = self.index.write().await.remove(key).is_some();
        if removed {
            self.note_removed(&[key.to_string()]);
            self.mark_dirty();
        }
        removed
    }

    pub(crate) async fn clear(&self) {
        let keys = self.index.write().await.clear();
        self.note_removed(&keys);
        self.mark_dirty();
    }

    pub(crate) async fn purge_expired(&self) -> usize {
        let removed = {
            let mut index = self.index.write().await;
            let keys = index.expired_keys(Utc::now());
            for key in &keys {
                index.remove(key);
            }
            keys
        };
        if !removed.is_empty() {
            debug!(count = removed.len(), "Purged expired cache entries");
            self.stats.record_expirations(removed.len());
            self.note_removed(&removed);
            self.mark_dirty();
        }
        removed.len()
    }

    /// Copy of every entry, least recently used first
    pub(crate) async fn snapshot_entries(&self) -> Vec<CacheEntry> {
        self.index.read().await.snapshot()
    }

    fn next_save_seq(&self) -> u64 {
        self.save_seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Snapshot under the read lock, then write outside of it.
    pub(crate) async fn save_now(&self) -> Result<()> {
        let Some(storage) = &self.storage else {
            return Ok(());
        };

        self.dirty.store(false, Ordering::Release);
        // Numbered under the lock, so a higher number never holds older data
        let (seq, entries) = {
            let index = self.index.read().await;
            (self.next_save_seq(), index.snapshot())
        };
        let result = storage.save_snapshot(seq, entries).await;
        self.record_save(result)
    }

    /// Write pending auto-save changes on the calling thread.
    ///
    /// Returns `false` when the index is locked by a writer and nothing was
    /// attempted; the changes stay pending.
    pub(crate) fn save_pending_blocking(&self) -> bool {
        let Some(storage) = &self.storage else {
            return true;
        };
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return true;
        }
        let Ok(index) = self.index.try_read() else {
            self.dirty.store(true, Ordering::Release);
            return false;
        };
        let seq = self.next_save_seq();
        let entries = index.snapshot();
        drop(index);

        if self
            .record_save(storage.save_snapshot_blocking(seq, entries))
            .is_ok()
        {
            debug!("Saved pending response cache changes on close");
        }
        true
    }

    fn record_save(&self, result: Result<()>) -> Result<()> {
        match result {
            Ok(()) => {
                self.stats.record_save_success();
                Ok(())
            }
            Err(e) => {
                if self.config.auto_save {
                    self.dirty.store(true, Ordering::Release);
                }
                let streak = self.stats.record_save_failure();
                let threshold = self.config.storage_failure_alert_threshold;
                if threshold > 0 && streak == threshold {
                    warn!(
                        failures = streak,
                        "Response cache keeps failing to save: {}", e
                    );
                } else {
                    debug!(failures = streak, "Response cache save failed: {}", e);
                }
                Err(e)
            }
        }
    }

    pub(crate) async fn size_info(&self) -> SizeInfo {
        let index = self.index.read().await;
        SizeInfo {
            entries: index.slots.len(),
            bytes: index.total_bytes,
            hit_rate: self.stats.hit_rate(),
        }
    }

    pub(crate) async fn len(&self) -> usize {
        self.index.read().await.slots.len()
    }

    pub(crate) async fn stats(&self) -> CacheStatistics {
        let index = self.index.read().await;
        self.stats.snapshot(index.slots.len(), index.total_bytes)
    }

    pub(crate) fn recorder(&self) -> &StatsRecorder {
        &self.stats
    }
}

/// Exact-match cache keyed by the canonical request fingerprint
///
/// With `auto_save` on, changes still waiting out the debounce are written
/// when the cache is dropped.
pub struct HashOnlyCache {
    core: Arc<HashCore>,
    tasks: BackgroundTasks,
}

impl HashOnlyCache {
    /// Build the cache, loading any persisted entries.
    ///
    /// Storage problems never fail construction; the cache starts empty.
    pub async fn open(config: CacheConfig) -> Result<Self> {
        Self::open_with(config, false, false).await
    }

    pub(crate) async fn open_with(
        config: CacheConfig,
        keep_embeddings: bool,
        track_removals: bool,
    ) -> Result<Self> {
        config.validate()?;

        let storage = config.storage_path().map(CacheStorage::new);
        let core = Arc::new(HashCore {
            keep_embeddings,
            index: RwLock::new(Index::default()),
            stats: StatsRecorder::default(),
            clock: AtomicU64::new(0),
            save_signal: Arc::new(Notify::new()),
            dirty: AtomicBool::new(false),
            save_seq: AtomicU64::new(0),
            removed: track_removals.then(|| Mutex::new(Vec::new())),
            storage,
            config,
        });

        if let Some(storage) = &core.storage {
            let loaded = match storage.load().await {
                Ok(entries) => entries,
                Err(e) => {
                    core.stats.record_load_failure();
                    warn!("Response cache could not be loaded, starting empty: {}", e);
                    Vec::new()
                }
            };
            let total = loaded.len();
            for entry in loaded {
                let key = entry.key.clone();
                if let Err(e) = core.insert(entry).await {
                    warn!(key = %short_key(&key), "Dropping persisted entry: {}", e);
                }
            }
            info!(
                path = %storage.path().display(),
                entries = core.len().await,
                persisted = total,
                "Response cache loaded"
            );
        }

        let tasks = BackgroundTasks::spawn(&core);
        Ok(Self { core, tasks })
    }

    pub(crate) fn core(&self) -> &Arc<HashCore> {
        &self.core
    }

    pub fn config(&self) -> &CacheConfig {
        &self.core.config
    }

    /// Every live entry, least recently used first
    pub async fn entries(&self) -> Vec<CacheEntry> {
        let now = Utc::now();
        self.core
            .snapshot_entries()
            .await
            .into_iter()
            .filter(|entry| !entry.is_expired_at(now))
            .collect()
    }
}

impl Drop for HashOnlyCache {
    fn drop(&mut self) {
        self.tasks.abort();
        if self.core.save_pending_blocking() {
            return;
        }
        // A background writer holds the index; finish on the runtime instead
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let core = Arc::clone(&self.core);
                runtime.spawn(async move {
                    let _ = core.save_now().await;
                });
            }
            Err(_) => warn!("Response cache closed with unsaved changes"),
        }
    }
}

pub(crate) fn check_key(key: &CacheKey, entry: &CacheEntry) -> Result<()> {
    if entry.key != key.as_str() {
        return Err(CacheError::validation(format!(
            "entry key {} does not match request key {}",
            short_key(&entry.key),
            short_key(key.as_str())
        )));
    }
    Ok(())
}

#[async_trait]
impl BaseCache for HashOnlyCache {
    fn mode(&self) -> CacheMode {
        CacheMode::Hash
    }

    async fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
        let now = Utc::now();
        let found = match self.core.lookup(key.as_str(), now).await {
            Some(entry) => self.core.verify_live(entry, now).await,
            None => None,
        };
        match found {
            Some(entry) => {
                self.core.recorder().record_hit();
                debug!(key = %short_key(key.as_str()), hits = entry.hit_count, "Cache hit");
                Some(entry)
            }
            None => {
                self.core.recorder().record_miss();
                debug!(key = %short_key(key.as_str()), "Cache miss");
                None
            }
        }
    }

    async fn put(&self, key: &CacheKey, entry: CacheEntry) -> Result<()> {
        check_key(key, &entry)?;
        self.core.insert(entry).await
    }

    async fn invalidate(&self, key: &CacheKey) -> bool {
        self.core.remove(key.as_str()).await
    }

    async fn clear(&self) {
        self.core.clear().await;
    }

    async fn purge_expired(&self) -> usize {
        self.core.purge_expired().await
    }

    async fn flush(&self) -> Result<()> {
        self.core.save_now().await
    }

    async fn len(&self) -> usize {
        self.core.len().await
    }

    async fn size_info(&self) -> SizeInfo {
        self.core.size_info().await
    }

    async fn stats(&self) -> CacheStatistics {
        self.core.stats().await
    }
}
