//! Durable cache persistence
//!
//! The cache is stored as a single JSON document:
//!
//! ```json
//! { "format_version": 1, "saved_at": "...", "entries": [ ... ] }
//! ```
//!
//! Saves go to a temporary file in the destination directory which is then
//! renamed over the destination, so a crash mid-write leaves either the old
//! complete file or the new complete file behind. A missing file loads as an
//! empty cache; corrupt or foreign-version files are errors that the cache
//! turns into an empty start when it opens.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use super::entry::{short_key, CacheEntry};
use crate::error::{CacheError, Result};

/// Version tag written into every persisted document
pub const FORMAT_VERSION: u32 = 1;

/// The persisted document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedCache {
    pub format_version: u32,
    pub saved_at: DateTime<Utc>,
    pub entries: Vec<CacheEntry>,
}

/// Minimal view used to check the version before touching any entry
#[derive(Debug, Deserialize)]
struct Envelope {
    format_version: u32,
    #[serde(default)]
    entries: Vec<serde_json::Value>,
}

/// Loads and saves the cache document at a fixed path
#[derive(Debug, Clone)]
pub struct CacheStorage {
    path: PathBuf,
    /// Sequence number of the newest snapshot on disk
    written: Arc<Mutex<u64>>,
}

impl CacheStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            written: Arc::new(Mutex::new(0)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the document and return its live entries.
    ///
    /// Expired entries are dropped, as are entries that fail validation.
    /// Duplicate keys keep the most recently accessed copy. The result is
    /// ordered from least to most recently used. A missing file is an empty
    /// cache; unreadable, corrupt or incompatible files are errors.
    pub async fn load(&self) -> Result<Vec<CacheEntry>> {
        let data = match tokio::fs::read(&self.path).await {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No cache file yet, starting empty");
                return Ok(Vec::new());
            }
            Err(e) => return Err(CacheError::storage(&self.path, e)),
        };

        let envelope: Envelope = serde_json::from_slice(&data)
            .map_err(|e| CacheError::storage(&self.path, format!("corrupt cache file: {}", e)))?;

        if envelope.format_version != FORMAT_VERSION {
            return Err(CacheError::storage(
                &self.path,
                format!(
                    "unsupported format_version {} (expected {})",
                    envelope.format_version, FORMAT_VERSION
                ),
            ));
        }

        Ok(self.live_entries(envelope.entries, Utc::now()))
    }

    fn live_entries(&self, raw: Vec<serde_json::Value>, now: DateTime<Utc>) -> Vec<CacheEntry> {
        let total = raw.len();
        let mut expired = 0usize;
        let mut by_key: HashMap<String, CacheEntry> = HashMap::with_capacity(total);

        for (index, value) in raw.into_iter().enumerate() {
            let entry: CacheEntry = match serde_json::from_value(value) {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(index, "Skipping malformed cache entry: {}", e);
                    continue;
                }
            };
            if let Err(e) = entry.validate() {
                warn!(index, key = %short_key(&entry.key), "Skipping invalid cache entry: {}", e);
                continue;
            }
            if entry.is_expired_at(now) {
                expired += 1;
                continue;
            }
            match by_key.get(&entry.key) {
                Some(existing) if existing.last_accessed_at >= entry.last_accessed_at => {}
                _ => {
                    by_key.insert(entry.key.clone(), entry);
                }
            }
        }

        let mut entries: Vec<CacheEntry> = by_key.into_values().collect();
        entries.sort_by(|a, b| {
            a.last_accessed_at
                .cmp(&b.last_accessed_at)
                .then(a.created_at.cmp(&b.created_at))
        });

        debug!(
            path = %self.path.display(),
            total,
            loaded = entries.len(),
            expired,
            "Loaded response cache"
        );
        entries
    }

    /// Atomically replace the document with `entries`.
    ///
    /// Serialization and disk I/O run on the blocking pool; callers pass a
    /// snapshot so no cache lock is held meanwhile.
    pub async fn save(&self, entries: Vec<CacheEntry>) -> Result<()> {
        self.write_on_blocking_pool(None, entries).await
    }

    /// Save a numbered snapshot. A snapshot older than the one already on
    /// disk is skipped, so overlapping saves never roll the file back.
    pub(crate) async fn save_snapshot(&self, seq: u64, entries: Vec<CacheEntry>) -> Result<()> {
        self.write_on_blocking_pool(Some(seq), entries).await
    }

    /// [`save_snapshot`](Self::save_snapshot) on the calling thread.
    pub(crate) fn save_snapshot_blocking(
        &self,
        seq: u64,
        entries: Vec<CacheEntry>,
    ) -> Result<()> {
        self.write(Some(seq), entries)
    }

    async fn write_on_blocking_pool(
        &self,
        seq: Option<u64>,
        entries: Vec<CacheEntry>,
    ) -> Result<()> {
        let storage = self.clone();
        tokio::task::spawn_blocking(move || storage.write(seq, entries))
            .await
            .map_err(|e| CacheError::storage(&self.path, format!("save task failed: {}", e)))?
    }

    fn write(&self, seq: Option<u64>, entries: Vec<CacheEntry>) -> Result<()> {
        let mut written = self
            .written
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(seq) = seq {
            if seq < *written {
                debug!(seq, newest = *written, "Skipping stale cache snapshot");
                return Ok(());
            }
        }

        let count = entries.len();
        let document = PersistedCache {
            format_version: FORMAT_VERSION,
            saved_at: Utc::now(),
            entries,
        };
        let bytes = serde_json::to_vec_pretty(&document)?;
        let staged = stage(&self.path, &bytes).map_err(|e| CacheError::storage(&self.path, e))?;
        commit(staged, &self.path).map_err(|e| CacheError::storage(&self.path, e))?;

        if let Some(seq) = seq {
            *written = seq;
        }
        debug!(path = %self.path.display(), entries = count, "Saved response cache");
        Ok(())
    }
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}

/// Write `bytes` to a synced temp file next to `path`.
fn stage(path: &Path, bytes: &[u8]) -> io::Result<NamedTempFile> {
    let dir = parent_dir(path);
    std::fs::create_dir_all(dir)?;

    let prefix = format!(
        ".{}.",
        path.file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "cache".to_string())
    );
    let mut file = tempfile::Builder::new()
        .prefix(&prefix)
        .suffix(".tmp")
        .tempfile_in(dir)?;
    file.write_all(bytes)?;
    file.as_file().sync_all()?;
    Ok(file)
}

/// Rename the staged file over `path`.
fn commit(staged: NamedTempFile, path: &Path) -> io::Result<()> {
    staged.persist(path).map_err(|e| e.error)?;
    Ok(())
}
