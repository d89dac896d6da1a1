//! Cache configuration
//!
//! Every option has a serde default, so a partial TOML file (or none at all)
//! yields a usable config. [`CacheConfig::validate`] runs on every load.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{CacheError, Result};

/// Which cache implementation to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheMode {
    /// Exact-match only
    #[default]
    Hash,
    /// Exact-match with semantic-similarity fallback
    Hybrid,
}

impl CacheMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheMode::Hash => "hash",
            CacheMode::Hybrid => "hybrid",
        }
    }
}

/// Configuration for the response cache
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Whether caching is enabled at all (default: true)
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Lookup strategy (default: hash)
    #[serde(default)]
    pub mode: CacheMode,

    /// Entry lifetime in seconds (default: 24h)
    #[serde(default = "default_ttl_secs", alias = "ttl_seconds")]
    pub ttl_secs: u64,

    /// Maximum number of entries, 0 for unbounded (default: 10000)
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,

    /// Maximum approximate size in bytes, 0 for unbounded (default: 64MB)
    #[serde(default = "default_max_bytes")]
    pub max_bytes: u64,

    /// Minimum cosine similarity for a semantic hit (default: 0.95)
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,

    /// Where the cache is persisted. `None` keeps it in memory only.
    #[serde(default)]
    pub storage_path: Option<PathBuf>,

    /// Save automatically after mutations (default: true)
    #[serde(default = "default_true")]
    pub auto_save: bool,

    /// Quiet period before an auto-save is written (default: 500ms)
    #[serde(default = "default_autosave_debounce_ms")]
    pub autosave_debounce_ms: u64,

    /// Interval of the background expiry sweep, 0 disables it (default: 300)
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Consecutive save failures before an operator warning (default: 3)
    #[serde(default = "default_storage_failure_alert_threshold")]
    pub storage_failure_alert_threshold: u32,
}

fn default_true() -> bool {
    true
}

fn default_ttl_secs() -> u64 {
    24 * 60 * 60
}

fn default_max_entries() -> usize {
    10_000
}

fn default_max_bytes() -> u64 {
    64 * 1024 * 1024 // 64MB
}

fn default_similarity_threshold() -> f32 {
    0.95
}

fn default_autosave_debounce_ms() -> u64 {
    500
}

fn default_sweep_interval_secs() -> u64 {
    300
}

fn default_storage_failure_alert_threshold() -> u32 {
    3
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: CacheMode::default(),
            ttl_secs: default_ttl_secs(),
            max_entries: default_max_entries(),
            max_bytes: default_max_bytes(),
            similarity_threshold: default_similarity_threshold(),
            storage_path: None,
            auto_save: true,
            autosave_debounce_ms: default_autosave_debounce_ms(),
            sweep_interval_secs: default_sweep_interval_secs(),
            storage_failure_alert_threshold: default_storage_failure_alert_threshold(),
        }
    }
}

impl CacheConfig {
    /// Create a config with caching disabled
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    /// Create an in-memory hybrid config
    pub fn hybrid() -> Self {
        Self {
            mode: CacheMode::Hybrid,
            ..Default::default()
        }
    }

    /// Attach a storage path
    pub fn with_storage_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.storage_path = Some(path.into());
        self
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file. A missing file yields the defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_toml_string()?)?;
        Ok(())
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| CacheError::validation(format!("Failed to serialize config: {}", e)))
    }

    /// `<cache dir>/workflow-cache/responses.json`
    pub fn default_storage_path() -> Option<PathBuf> {
        dirs::cache_dir().map(|dir| dir.join("workflow-cache").join("responses.json"))
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn autosave_debounce(&self) -> Duration {
        Duration::from_millis(self.autosave_debounce_ms)
    }

    pub fn sweep_interval(&self) -> Option<Duration> {
        (self.sweep_interval_secs > 0).then(|| Duration::from_secs(self.sweep_interval_secs))
    }

    pub fn storage_path(&self) -> Option<&Path> {
        self.storage_path.as_deref()
    }

    /// Reject settings the cache cannot honour.
    pub fn validate(&self) -> Result<()> {
        if self.ttl_secs == 0 {
            return Err(CacheError::validation("ttl_secs must be greater than 0"));
        }
        // Entries stamp `expires_at = now + ttl`; that sum has to exist
        let representable = chrono::Duration::from_std(self.ttl())
            .ok()
            .and_then(|ttl| Utc::now().checked_add_signed(ttl))
            .is_some();
        if !representable {
            return Err(CacheError::validation(format!(
                "ttl_secs {} is out of range",
                self.ttl_secs
            )));
        }
        let threshold = self.similarity_threshold;
        if threshold.is_nan() || threshold <= 0.0 || threshold > 1.0 {
            return Err(CacheError::validation(format!(
                "similarity_threshold must be in (0, 1], got {}",
                threshold
            )));
        }
        if self.auto_save && self.autosave_debounce_ms == 0 {
            return Err(CacheError::validation(
                "autosave_debounce_ms must be greater than 0 when auto_save is on",
            ));
        }
        if let Some(path) = &self.storage_path {
            if path.as_os_str().is_empty() {
                return Err(CacheError::validation("storage_path must not be empty"));
            }
        }
        Ok(())
    }
}
