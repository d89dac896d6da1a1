//! Background maintenance: periodic expiry sweep and debounced auto-save
//!
//! Tasks hold only a `Weak` reference to the cache state and are aborted
//! when the owning cache is dropped. The cache itself writes whatever the
//! auto-saver had not yet saved.

use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;
use tracing::debug;

use super::hash::HashCore;

pub(crate) struct BackgroundTasks {
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundTasks {
    pub(crate) fn spawn(core: &Arc<HashCore>) -> Self {
        let mut handles = Vec::new();
        let config = core.config();

        if let Some(period) = config.sweep_interval() {
            handles.push(spawn_sweeper(Arc::downgrade(core), period));
        }
        if config.auto_save && config.storage_path.is_some() {
            handles.push(spawn_autosaver(
                Arc::downgrade(core),
                config.autosave_debounce(),
            ));
        }

        Self { handles }
    }

    pub(crate) fn abort(&self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}

impl Drop for BackgroundTasks {
    fn drop(&mut self) {
        self.abort();
    }
}

fn spawn_sweeper(core: Weak<HashCore>, period: std::time::Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(core) = core.upgrade() else {
                break;
            };
            let purged = core.purge_expired().await;
            if purged > 0 {
                debug!(purged, "Expiry sweep finished");
            }
        }
    })
}

fn spawn_autosaver(core: Weak<HashCore>, debounce: std::time::Duration) -> JoinHandle<()> {
    let signal = match core.upgrade() {
        Some(core) => core.save_signal(),
        None => return tokio::spawn(async {}),
    };

    tokio::spawn(async move {
        loop {
            signal.notified().await;
            // Mutations arriving during the quiet period fold into this save
            tokio::time::sleep(debounce).await;
            let Some(core) = core.upgrade() else {
                break;
            };
            // Failures are counted and reported by save_now itself
            let _ = core.save_now().await;
        }
    })
}
