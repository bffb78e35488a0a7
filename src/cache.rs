//! Startup barrier across independently populated watch caches.
//!
//! Each cache feed gets a [`SyncNotifier`] and the coordinator keeps the
//! matching [`CacheSource`]. The feed flips its flag once its initial list
//! has been applied; [`CacheSyncBarrier::wait_for_all`] waits for every flag
//! concurrently, so the wait is bounded by the slowest source rather than
//! the sum of all of them.

use std::time::Duration;

use futures::future::join_all;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

/// Create a named cache source and the notifier its feed uses to report sync.
pub fn cache_source(name: impl Into<String>) -> (SyncNotifier, CacheSource) {
    let name = name.into();
    let (tx, rx) = watch::channel(false);
    (SyncNotifier { name: name.clone(), tx }, CacheSource { name, synced: rx })
}

/// Write side of a cache's sync flag, owned by the cache's population task.
#[derive(Debug)]
pub struct SyncNotifier {
    name: String,
    tx: watch::Sender<bool>,
}

impl SyncNotifier {
    /// Mark the cache as synced. Later calls are no-ops; the flag never resets.
    pub fn mark_synced(&self) {
        let changed = self.tx.send_if_modified(|synced| {
            if *synced {
                false
            } else {
                *synced = true;
                true
            }
        });
        if changed {
            debug!(source = %self.name, "cache reported synced");
        }
    }

    /// Name of the cache this notifier reports for.
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Read side of a cache's sync flag.
#[derive(Debug, Clone)]
pub struct CacheSource {
    name: String,
    synced: watch::Receiver<bool>,
}

impl CacheSource {
    /// Name of the cache.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the cache has reported initial consistency.
    pub fn is_synced(&self) -> bool {
        *self.synced.borrow()
    }

    /// Wait until synced. Never completes if the feed drops its notifier first.
    async fn wait_synced(&self) {
        let mut rx = self.synced.clone();
        if rx.wait_for(|synced| *synced).await.is_err() {
            warn!(source = %self.name, "cache feed stopped before syncing");
            std::future::pending::<()>().await;
        }
    }
}

/// Result of [`CacheSyncBarrier::wait_for_all`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Every source reported synced.
    AllSynced,
    /// The timeout elapsed first; names are in registration order.
    PartialTimeout {
        /// Sources that never reported synced.
        unsynced: Vec<String>,
    },
    /// Cancellation fired before the barrier resolved.
    Cancelled,
}

/// Waits for a fixed set of caches to reach initial consistency.
#[derive(Debug, Clone, Default)]
pub struct CacheSyncBarrier {
    sources: Vec<CacheSource>,
}

impl CacheSyncBarrier {
    /// Create a barrier over `sources`.
    pub fn new(sources: Vec<CacheSource>) -> Self {
        Self { sources }
    }

    /// Add another source to wait on.
    pub fn push(&mut self, source: CacheSource) {
        self.sources.push(source);
    }

    /// Wait, concurrently, for every source to sync.
    ///
    /// Returns promptly with [`SyncOutcome::Cancelled`] when `cancel` fires.
    pub async fn wait_for_all(&self, timeout: Duration, cancel: &CancellationToken) -> SyncOutcome {
        let all = join_all(self.sources.iter().map(CacheSource::wait_synced));

        let outcome = tokio::select! {
            _ = cancel.cancelled() => return SyncOutcome::Cancelled,
            result = tokio::time::timeout(timeout, all) => match result {
                Ok(_) => SyncOutcome::AllSynced,
                Err(_) => SyncOutcome::PartialTimeout { unsynced: self.unsynced() },
            },
        };

        let status: Vec<String> =
            self.sources.iter().map(|s| format!("{}={}", s.name(), s.is_synced())).collect();
        match &outcome {
            SyncOutcome::AllSynced => info!(sources = ?status, "local caches are synced"),
            SyncOutcome::PartialTimeout { unsynced } => {
                warn!(sources = ?status, unsynced = ?unsynced, timeout_ms = timeout.as_millis() as u64, "cache sync timed out")
            }
            SyncOutcome::Cancelled => {}
        }
        outcome
    }

    fn unsynced(&self) -> Vec<String> {
        self.sources.iter().filter(|s| !s.is_synced()).map(|s| s.name().to_string()).collect()
    }
}
