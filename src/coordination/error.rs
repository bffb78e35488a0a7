//! Error types for lease coordination.

use snafu::Snafu;

use crate::api::KeyValueStoreError;

/// Transient failures talking to the lease record.
///
/// Held-by-other and lost leases are outcomes, not errors; everything here
/// means the store could not be read or written reliably and the caller
/// should retry (while standing by) or give up leadership (while leading).
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum LeaseError {
    /// Underlying storage error.
    #[snafu(display("storage error on lease '{key}': {source}"))]
    Storage {
        /// The lease key.
        key: String,
        /// The underlying error.
        source: KeyValueStoreError,
    },

    /// JSON serialization error.
    #[snafu(display("failed to encode lease record: {source}"))]
    Serialization {
        /// The underlying error.
        source: serde_json::Error,
    },

    /// Data in storage is not a lease record.
    #[snafu(display("corrupted lease record in key '{key}': {reason}"))]
    CorruptedRecord {
        /// The key with corrupted data.
        key: String,
        /// Description of what went wrong.
        reason: String,
    },

    /// A store call did not answer within its budget.
    #[snafu(display("lease '{key}' call timed out after {timeout_ms}ms"))]
    Timeout {
        /// The lease key.
        key: String,
        /// The budget that elapsed.
        timeout_ms: u64,
    },

    /// Record written by a replica with a different schema.
    #[snafu(display("lease '{key}' has schema version {found}, this replica understands {expected}"))]
    UnsupportedSchema {
        /// The lease key.
        key: String,
        /// Version found in storage.
        found: u32,
        /// Version this build writes.
        expected: u32,
    },
}
