//! In-memory implementation of [`KeyValueStore`] for tests and the
//! deterministic backend.
//!
//! Mirrors the semantics a production control-plane store offers to the
//! lease lock: per-key versions starting at 1 and compare-and-swap on those
//! versions. Faults can be injected to exercise transient-error paths.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::KeyValueStore;
use super::KeyValueStoreError;
use super::KeyValueWithRevision;
use super::ReadRequest;
use super::ReadResult;
use super::WriteCommand;
use super::WriteRequest;
use super::WriteResult;
use super::validate_write_command;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    version: u64,
}

/// In-memory deterministic implementation of [`KeyValueStore`].
///
/// # Limitations
///
/// - No persistence across restarts
/// - Single process only (replicas share it through an `Arc`)
///
/// # Example
///
/// ```ignore
/// use aspen_singleton::api::{DeterministicKeyValueStore, KeyValueStore, WriteCommand, WriteRequest};
///
/// let store = DeterministicKeyValueStore::new();
/// store.write(WriteRequest {
///     command: WriteCommand::CompareAndSwap {
///         key: "k".into(),
///         expected_version: None,
///         new_value: "v".into(),
///     },
/// }).await?;
/// ```
#[derive(Default)]
pub struct DeterministicKeyValueStore {
    inner: Mutex<HashMap<String, Entry>>,
    unavailable: AtomicBool,
    failing_writes: AtomicU32,
}

impl DeterministicKeyValueStore {
    /// Create a new, empty store.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make every read and write fail with [`KeyValueStoreError::Unavailable`]
    /// until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Fail the next `count` writes with [`KeyValueStoreError::Unavailable`].
    pub fn fail_next_writes(&self, count: u32) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    /// Current version of `key`, if present.
    pub async fn version(&self, key: &str) -> Option<u64> {
        self.inner.lock().await.get(key).map(|e| e.version)
    }

    /// Current value of `key`, ignoring injected faults.
    pub async fn value(&self, key: &str) -> Option<String> {
        self.inner.lock().await.get(key).map(|e| e.value.clone())
    }

    fn check_available(&self) -> Result<(), KeyValueStoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(KeyValueStoreError::Unavailable {
                reason: "injected outage".into(),
            });
        }
        Ok(())
    }

    fn take_write_failure(&self) -> bool {
        self.failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl KeyValueStore for DeterministicKeyValueStore {
    async fn write(&self, request: WriteRequest) -> Result<WriteResult, KeyValueStoreError> {
        self.check_available()?;
        if self.take_write_failure() {
            return Err(KeyValueStoreError::Unavailable {
                reason: "injected write failure".into(),
            });
        }
        validate_write_command(&request.command)?;

        let mut inner = self.inner.lock().await;
        match request.command {
            WriteCommand::Set { key, value } => {
                let version = inner.get(&key).map_or(1, |e| e.version + 1);
                inner.insert(key, Entry { value, version });
                Ok(WriteResult { version: Some(version) })
            }
            WriteCommand::CompareAndSwap {
                key,
                expected_version,
                new_value,
            } => {
                let current = inner.get(&key).map(|e| e.version);
                if current != expected_version {
                    let actual = inner.get(&key).map(|e| KeyValueWithRevision {
                        key: key.clone(),
                        value: e.value.clone(),
                        version: e.version,
                    });
                    return Err(KeyValueStoreError::CompareAndSwapFailed {
                        key,
                        expected_version,
                        actual,
                    });
                }
                let version = current.map_or(1, |v| v + 1);
                inner.insert(key, Entry {
                    value: new_value,
                    version,
                });
                Ok(WriteResult { version: Some(version) })
            }
            WriteCommand::Delete { key } => {
                inner.remove(&key);
                Ok(WriteResult { version: None })
            }
        }
    }

    async fn read(&self, request: ReadRequest) -> Result<ReadResult, KeyValueStoreError> {
        self.check_available()?;
        let inner = self.inner.lock().await;
        match inner.get(&request.key) {
            Some(entry) => Ok(ReadResult {
                kv: Some(KeyValueWithRevision {
                    key: request.key,
                    value: entry.value.clone(),
                    version: entry.version,
                }),
            }),
            None => Err(KeyValueStoreError::NotFound { key: request.key }),
        }
    }
}
