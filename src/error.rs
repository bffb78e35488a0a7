//! Errors returned by [`crate::SingletonCoordinator::run`].

use snafu::Snafu;

use crate::config::ConfigError;

/// Fatal outcomes of a coordinator run.
///
/// Election and renewal failures are not here: they are handled inside the
/// elector by retrying or stepping down.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum RunError {
    /// Configuration was rejected before any store access.
    #[snafu(display("invalid configuration: {source}"))]
    Config { source: ConfigError },

    /// Caches did not report initial consistency after election.
    #[snafu(display("timed out after {timeout_ms}ms waiting for caches to sync: {}", unsynced.join(", ")))]
    CacheSyncTimeout { unsynced: Vec<String>, timeout_ms: u64 },

    /// The elector task panicked or was aborted.
    #[snafu(display("leader election task failed: {source}"))]
    ElectorTask { source: tokio::task::JoinError },
}

impl RunError {
    /// Names of caches that never synced, if this is a cache timeout.
    pub fn unsynced_caches(&self) -> Option<&[String]> {
        match self {
            RunError::CacheSyncTimeout { unsynced, .. } => Some(unsynced),
            _ => None,
        }
    }
}
