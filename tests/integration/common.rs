use assert_fs::TempDir;
use chrono::{Duration as ChronoDuration, Utc};
use std::path::PathBuf;
use std::sync::Once;
use std::time::Duration;
use workflow_cache::cache::{CacheEntry, CacheKey};
use workflow_cache::CacheConfig;

static LOGGING: Once = Once::new();

/// Route `tracing` output to the test harness. Set RUST_LOG to see it.
pub fn init_test_logging() {
    LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// A scratch directory holding one cache file
pub struct TestEnvironment {
    pub temp_dir: TempDir,
}

impl TestEnvironment {
    pub fn new() -> Self {
        init_test_logging();
        Self {
            temp_dir: TempDir::new().expect("Failed to create temp dir"),
        }
    }

    pub fn storage_path(&self) -> PathBuf {
        self.temp_dir.path().join("cache").join("responses.json")
    }

    /// Persistent config without background tasks, saved only on flush
    pub fn config(&self) -> CacheConfig {
        CacheConfig {
            auto_save: false,
            sweep_interval_secs: 0,
            ..Default::default()
        }
        .with_storage_path(self.storage_path())
    }

    pub fn hybrid_config(&self) -> CacheConfig {
        CacheConfig {
            mode: workflow_cache::CacheMode::Hybrid,
            ..self.config()
        }
    }
}

pub const HOUR: Duration = Duration::from_secs(3600);

pub fn key(stage: &str, prompt: &str) -> CacheKey {
    CacheKey::from_request("review", stage, "modelX", prompt)
}

pub fn entry(key: &CacheKey, prompt: &str, response: &str) -> CacheEntry {
    CacheEntry::new(key, prompt, response, HOUR).expect("valid entry")
}

/// An entry created two hours ago that expired an hour ago
pub fn expired_entry(key: &CacheKey, prompt: &str, response: &str) -> CacheEntry {
    let mut entry = entry(key, prompt, response);
    entry.created_at = Utc::now() - ChronoDuration::hours(2);
    entry.last_accessed_at = entry.created_at;
    entry.expires_at = Utc::now() - ChronoDuration::hours(1);
    entry
}
