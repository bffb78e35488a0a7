//! Control-plane client abstraction.
//!
//! The lease lock only needs two things from the backing store: a read that
//! reports the key's version, and a write that applies only when the version
//! is unchanged. Any linearizable store with per-key versions (etcd, a Raft
//! state machine, a Kubernetes API server) can implement [`KeyValueStore`].

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use snafu::Snafu;

pub mod inmemory;
pub use inmemory::DeterministicKeyValueStore;

/// Maximum key length in bytes.
pub const MAX_KEY_SIZE: u32 = 1024;

/// Maximum value length in bytes.
pub const MAX_VALUE_SIZE: u32 = 64 * 1024;

/// A stored value together with its per-key version.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeyValueWithRevision {
    /// The key identifying this entry.
    pub key: String,
    /// The stored value.
    pub value: String,
    /// Key-specific version number, incremented on each modification to this key.
    ///
    /// Starts at 1 when the key is first created. Use for optimistic locking:
    /// read the version, compute locally, then compare-and-swap on it.
    pub version: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReadRequest {
    pub key: String,
}

impl ReadRequest {
    /// Create a read request for the specified key.
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReadResult {
    pub kv: Option<KeyValueWithRevision>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum WriteCommand {
    /// Unconditional write.
    Set { key: String, value: String },
    /// Write only if the key's current version equals `expected_version`.
    ///
    /// `None` means the key must not exist.
    CompareAndSwap {
        key: String,
        expected_version: Option<u64>,
        new_value: String,
    },
    Delete { key: String },
}

impl WriteCommand {
    /// The key this command targets.
    pub fn key(&self) -> &str {
        match self {
            WriteCommand::Set { key, .. } | WriteCommand::CompareAndSwap { key, .. } | WriteCommand::Delete { key } => {
                key
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WriteRequest {
    pub command: WriteCommand,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct WriteResult {
    /// Version of the key after the write, `None` for deletes.
    pub version: Option<u64>,
}

#[derive(Debug, Snafu, Clone, PartialEq, Eq)]
#[snafu(visibility(pub))]
pub enum KeyValueStoreError {
    #[snafu(display("key '{key}' not found"))]
    NotFound { key: String },

    #[snafu(display("compare-and-swap failed for key '{key}': expected version {expected_version:?}, found {:?}", actual.as_ref().map(|kv| kv.version)))]
    CompareAndSwapFailed {
        key: String,
        expected_version: Option<u64>,
        /// The entry that was present when the swap was rejected.
        actual: Option<KeyValueWithRevision>,
    },

    #[snafu(display("store unavailable: {reason}"))]
    Unavailable { reason: String },

    #[snafu(display("operation timed out after {duration_ms}ms"))]
    Timeout { duration_ms: u64 },

    #[snafu(display("key cannot be empty"))]
    EmptyKey,

    #[snafu(display("key size {size} exceeds maximum of {max} bytes"))]
    KeyTooLarge { size: u32, max: u32 },

    #[snafu(display("value size {size} exceeds maximum of {max} bytes"))]
    ValueTooLarge { size: u32, max: u32 },
}

/// Reject writes with empty or oversized keys and values before they reach a backend.
pub fn validate_write_command(command: &WriteCommand) -> Result<(), KeyValueStoreError> {
    let key = command.key();
    if key.is_empty() {
        return Err(KeyValueStoreError::EmptyKey);
    }
    if key.len() > MAX_KEY_SIZE as usize {
        return Err(KeyValueStoreError::KeyTooLarge {
            size: key.len() as u32,
            max: MAX_KEY_SIZE,
        });
    }

    let value = match command {
        WriteCommand::Set { value, .. } => Some(value),
        WriteCommand::CompareAndSwap { new_value, .. } => Some(new_value),
        WriteCommand::Delete { .. } => None,
    };
    if let Some(value) = value
        && value.len() > MAX_VALUE_SIZE as usize
    {
        return Err(KeyValueStoreError::ValueTooLarge {
            size: value.len() as u32,
            max: MAX_VALUE_SIZE,
        });
    }

    Ok(())
}

/// Versioned key-value access used for lease coordination.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Apply a write. Compare-and-swap rejections surface as
    /// [`KeyValueStoreError::CompareAndSwapFailed`].
    async fn write(&self, request: WriteRequest) -> Result<WriteResult, KeyValueStoreError>;

    /// Read a key. Missing keys return [`KeyValueStoreError::NotFound`].
    async fn read(&self, request: ReadRequest) -> Result<ReadResult, KeyValueStoreError>;
}

#[async_trait]
impl<T: KeyValueStore + ?Sized> KeyValueStore for std::sync::Arc<T> {
    async fn write(&self, request: WriteRequest) -> Result<WriteResult, KeyValueStoreError> {
        (**self).write(request).await
    }

    async fn read(&self, request: ReadRequest) -> Result<ReadResult, KeyValueStoreError> {
        (**self).read(request).await
    }
}
