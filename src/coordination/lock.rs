//! Lease lock over a versioned key-value store.
//!
//! Provides mutual exclusion across replicas with:
//! - Compare-and-swap on the record version for every write
//! - Monotonically increasing terms for fencing
//! - Deadline-based expiry so a crashed holder's lease can be reclaimed

use std::sync::Arc;

use snafu::ResultExt;
use tracing::debug;
use tracing::warn;

use crate::api::KeyValueStore;
use crate::api::KeyValueStoreError;
use crate::api::KeyValueWithRevision;
use crate::api::ReadRequest;
use crate::api::WriteCommand;
use crate::api::WriteRequest;
use crate::coordination::error::LeaseError;
use crate::coordination::error::SerializationSnafu;
use crate::coordination::pure::compute_next_term;
use crate::coordination::types::LEASE_SCHEMA_VERSION;
use crate::coordination::types::LeaseRecord;
use crate::coordination::types::Term;
use crate::coordination::types::lease_key;
use crate::time::Clock;
use crate::time::SystemClock;

/// Result of [`LeaseLock::try_acquire`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// The caller now holds the lease for `term`.
    Acquired {
        /// The new term.
        term: Term,
        /// When the lease expires unless renewed (Unix ms).
        deadline_ms: u64,
    },
    /// Another identity holds a valid lease.
    HeldByOther {
        /// Current holder.
        holder: String,
        /// When their lease expires (Unix ms).
        deadline_ms: u64,
    },
}

/// Result of [`LeaseLock::renew`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenewOutcome {
    /// The lease was extended.
    Renewed {
        /// New expiry deadline (Unix ms).
        deadline_ms: u64,
    },
    /// The caller no longer holds the lease.
    Lost {
        /// Holder observed in the store, if any.
        current_holder: Option<String>,
    },
}

/// Result of [`LeaseLock::release`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// The caller's term was released.
    Released,
    /// Nothing to release: the record is gone, released, or owned by someone else.
    AlreadyReleased,
}

/// A lease stored in the control-plane store.
///
/// Every mutation is a compare-and-swap against the version that was read,
/// which is the only thing preventing two replicas from both believing they
/// hold the lease.
pub struct LeaseLock<S: KeyValueStore + ?Sized> {
    store: Arc<S>,
    key: String,
    lease_duration_ms: u64,
    clock: Arc<dyn Clock>,
}

impl<S: KeyValueStore + ?Sized + 'static> LeaseLock<S> {
    /// Create a lease handle for `namespace`/`name`.
    pub fn new(store: Arc<S>, namespace: &str, name: &str, lease_duration_ms: u64) -> Self {
        Self {
            store,
            key: lease_key(namespace, name),
            lease_duration_ms,
            clock: Arc::new(SystemClock),
        }
    }

    /// Replace the wall clock used to stamp and judge deadlines.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// The store key backing this lease.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Current time on the clock deadlines are judged against (Unix ms).
    pub fn now_unix_ms(&self) -> u64 {
        self.clock.now_unix_ms()
    }

    /// Try to acquire the lease without blocking.
    ///
    /// Succeeds only if the lease is absent, released, expired, or already
    /// carries `identity` (a holder that lost track of its own term).
    pub async fn try_acquire(&self, identity: &str) -> Result<AcquireOutcome, LeaseError> {
        let now_ms = self.clock.now_unix_ms();
        let current = self.read_record().await?;

        let (expected_version, current_term) = match current {
            Some((ref record, _))
                if !record.is_released() && !record.is_expired_at(now_ms) && record.holder_identity != identity =>
            {
                return Ok(AcquireOutcome::HeldByOther {
                    holder: record.holder_identity.clone(),
                    deadline_ms: record.deadline_ms,
                });
            }
            Some((ref record, version)) => {
                if !record.is_released() {
                    debug!(
                        key = %self.key,
                        previous_holder = %record.holder_identity,
                        previous_term = record.term,
                        "taking over lease"
                    );
                }
                (Some(version), Some(record.term))
            }
            None => (None, None),
        };

        let term = compute_next_term(current_term);
        let record = LeaseRecord::acquired(identity, term, self.lease_duration_ms, now_ms);

        match self.compare_and_swap(expected_version, &record).await? {
            Ok(()) => {
                debug!(
                    key = %self.key,
                    identity,
                    term,
                    lease_duration_ms = self.lease_duration_ms,
                    "lease acquired"
                );
                Ok(AcquireOutcome::Acquired {
                    term: Term(term),
                    deadline_ms: record.deadline_ms,
                })
            }
            Err(actual) => {
                // Someone else wrote between our read and our swap.
                let winner = self.decode_actual(actual)?;
                Ok(AcquireOutcome::HeldByOther {
                    holder: winner.as_ref().map(|r| r.holder_identity.clone()).unwrap_or_default(),
                    deadline_ms: winner.map_or(0, |r| r.deadline_ms),
                })
            }
        }
    }

    /// Extend the lease held by `identity` for `term`.
    ///
    /// Reports [`RenewOutcome::Lost`] if the record changed hands, vanished,
    /// or already expired. Never overwrites a record it does not own.
    pub async fn renew(&self, identity: &str, term: Term) -> Result<RenewOutcome, LeaseError> {
        let now_ms = self.clock.now_unix_ms();
        let Some((record, version)) = self.read_record().await? else {
            return Ok(RenewOutcome::Lost { current_holder: None });
        };

        if !record.is_held_by(identity, term) {
            return Ok(RenewOutcome::Lost {
                current_holder: Some(record.holder_identity).filter(|h| !h.is_empty()),
            });
        }
        if record.is_expired_at(now_ms) {
            // Others may already consider the lease free.
            return Ok(RenewOutcome::Lost {
                current_holder: Some(record.holder_identity),
            });
        }

        let renewed = record.renewed(now_ms);
        match self.compare_and_swap(Some(version), &renewed).await? {
            Ok(()) => {
                debug!(key = %self.key, identity, term = term.value(), "lease renewed");
                Ok(RenewOutcome::Renewed {
                    deadline_ms: renewed.deadline_ms,
                })
            }
            Err(actual) => {
                let current = self.decode_actual(actual)?;
                Ok(RenewOutcome::Lost {
                    current_holder: current.map(|r| r.holder_identity).filter(|h| !h.is_empty()),
                })
            }
        }
    }

    /// Release the lease held by `identity` for `term`.
    ///
    /// Idempotent: releasing a term that is no longer held returns
    /// [`ReleaseOutcome::AlreadyReleased`].
    pub async fn release(&self, identity: &str, term: Term) -> Result<ReleaseOutcome, LeaseError> {
        let Some((record, version)) = self.read_record().await? else {
            return Ok(ReleaseOutcome::AlreadyReleased);
        };
        if !record.is_held_by(identity, term) {
            return Ok(ReleaseOutcome::AlreadyReleased);
        }

        match self.compare_and_swap(Some(version), &record.released()).await? {
            Ok(()) => {
                debug!(key = %self.key, identity, term = term.value(), "lease released");
                Ok(ReleaseOutcome::Released)
            }
            Err(_) => {
                warn!(
                    key = %self.key,
                    identity,
                    term = term.value(),
                    "lease release raced with another writer"
                );
                Ok(ReleaseOutcome::AlreadyReleased)
            }
        }
    }

    /// Read the current record and its version.
    pub async fn read_record(&self) -> Result<Option<(LeaseRecord, u64)>, LeaseError> {
        match self.store.read(ReadRequest::new(self.key.clone())).await {
            Ok(result) => match result.kv {
                Some(kv) => {
                    let version = kv.version;
                    Ok(Some((self.decode(&kv.value)?, version)))
                }
                None => Ok(None),
            },
            Err(KeyValueStoreError::NotFound { .. }) => Ok(None),
            Err(source) => Err(LeaseError::Storage {
                key: self.key.clone(),
                source,
            }),
        }
    }

    /// Write `record` if the stored version is still `expected_version`.
    ///
    /// The inner `Err` carries the entry that won the race.
    async fn compare_and_swap(
        &self,
        expected_version: Option<u64>,
        record: &LeaseRecord,
    ) -> Result<Result<(), Option<KeyValueWithRevision>>, LeaseError> {
        let new_value = serde_json::to_string(record).context(SerializationSnafu)?;
        match self
            .store
            .write(WriteRequest {
                command: WriteCommand::CompareAndSwap {
                    key: self.key.clone(),
                    expected_version,
                    new_value,
                },
            })
            .await
        {
            Ok(_) => Ok(Ok(())),
            Err(KeyValueStoreError::CompareAndSwapFailed { actual, .. }) => Ok(Err(actual)),
            Err(source) => Err(LeaseError::Storage {
                key: self.key.clone(),
                source,
            }),
        }
    }

    fn decode_actual(&self, actual: Option<KeyValueWithRevision>) -> Result<Option<LeaseRecord>, LeaseError> {
        actual.map(|kv| self.decode(&kv.value)).transpose()
    }

    fn decode(&self, json: &str) -> Result<LeaseRecord, LeaseError> {
        let corrupted = |e: serde_json::Error| LeaseError::CorruptedRecord {
            key: self.key.clone(),
            reason: e.to_string(),
        };

        // Check the version before the layout; newer layouts may not parse.
        let header: SchemaHeader = serde_json::from_str(json).map_err(corrupted)?;
        if header.schema_version != LEASE_SCHEMA_VERSION {
            return Err(LeaseError::UnsupportedSchema {
                key: self.key.clone(),
                found: header.schema_version,
                expected: LEASE_SCHEMA_VERSION,
            });
        }
        serde_json::from_str(json).map_err(corrupted)
    }
}

#[derive(serde::Deserialize)]
struct SchemaHeader {
    schema_version: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::DeterministicKeyValueStore;
    use crate::time::ManualClock;

    const LEASE_MS: u64 = 10_000;

    fn lock_with_clock(store: &Arc<DeterministicKeyValueStore>, clock: &ManualClock) -> LeaseLock<DeterministicKeyValueStore> {
        LeaseLock::new(store.clone(), "ns", "singleton", LEASE_MS).with_clock(Arc::new(clock.clone()))
    }

    fn acquired_term(outcome: AcquireOutcome) -> Term {
        match outcome {
            AcquireOutcome::Acquired { term, .. } => term,
            other => panic!("expected Acquired, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_acquire_absent_lease() {
        let store = DeterministicKeyValueStore::new();
        let clock = ManualClock::new(1_000_000);
        let lock = lock_with_clock(&store, &clock);

        let outcome = lock.try_acquire("r1").await.unwrap();
        assert_eq!(outcome, AcquireOutcome::Acquired {
            term: Term(1),
            deadline_ms: 1_000_000 + LEASE_MS,
        });

        let (record, version) = lock.read_record().await.unwrap().unwrap();
        assert_eq!(record.holder_identity, "r1");
        assert_eq!(version, 1);
    }

    #[tokio::test]
    async fn test_contention_reports_holder() {
        let store = DeterministicKeyValueStore::new();
        let clock = ManualClock::new(1_000_000);
        let lock = lock_with_clock(&store, &clock);

        lock.try_acquire("r1").await.unwrap();
        let outcome = lock.try_acquire("r2").await.unwrap();
        assert_eq!(outcome, AcquireOutcome::HeldByOther {
            holder: "r1".into(),
            deadline_ms: 1_000_000 + LEASE_MS,
        });
    }

    #[tokio::test]
    async fn test_reclaim_only_after_expiry() {
        let store = DeterministicKeyValueStore::new();
        let clock = ManualClock::new(1_000_000);
        let lock = lock_with_clock(&store, &clock);

        let t1 = acquired_term(lock.try_acquire("r1").await.unwrap());

        clock.advance_ms(LEASE_MS);
        assert!(matches!(lock.try_acquire("r2").await.unwrap(), AcquireOutcome::HeldByOther { .. }));

        clock.advance_ms(1);
        let t2 = acquired_term(lock.try_acquire("r2").await.unwrap());
        assert!(t2 > t1);
    }

    #[tokio::test]
    async fn test_renew_extends_deadline() {
        let store = DeterministicKeyValueStore::new();
        let clock = ManualClock::new(1_000_000);
        let lock = lock_with_clock(&store, &clock);

        let term = acquired_term(lock.try_acquire("r1").await.unwrap());
        clock.advance_ms(LEASE_MS / 2);

        let outcome = lock.renew("r1", term).await.unwrap();
        assert_eq!(outcome, RenewOutcome::Renewed {
            deadline_ms: 1_000_000 + LEASE_MS / 2 + LEASE_MS,
        });

        // Still protected past the original deadline.
        clock.advance_ms(LEASE_MS / 2 + 1);
        assert!(matches!(lock.try_acquire("r2").await.unwrap(), AcquireOutcome::HeldByOther { .. }));
    }

    #[tokio::test]
    async fn test_renew_after_takeover_is_lost_and_does_not_overwrite() {
        let store = DeterministicKeyValueStore::new();
        let clock = ManualClock::new(1_000_000);
        let lock = lock_with_clock(&store, &clock);

        let t1 = acquired_term(lock.try_acquire("r1").await.unwrap());
        clock.advance_ms(LEASE_MS + 1);
        let t2 = acquired_term(lock.try_acquire("r2").await.unwrap());

        let outcome = lock.renew("r1", t1).await.unwrap();
        assert_eq!(outcome, RenewOutcome::Lost {
            current_holder: Some("r2".into()),
        });

        let (record, _) = lock.read_record().await.unwrap().unwrap();
        assert_eq!(record.holder_identity, "r2");
        assert_eq!(record.term, t2.value());
    }

    #[tokio::test]
    async fn test_renew_expired_lease_is_lost() {
        let store = DeterministicKeyValueStore::new();
        let clock = ManualClock::new(1_000_000);
        let lock = lock_with_clock(&store, &clock);

        let term = acquired_term(lock.try_acquire("r1").await.unwrap());
        clock.advance_ms(LEASE_MS + 1);
        assert!(matches!(lock.renew("r1", term).await.unwrap(), RenewOutcome::Lost { .. }));
    }

    #[tokio::test]
    async fn test_renew_transient_error() {
        let store = DeterministicKeyValueStore::new();
        let clock = ManualClock::new(1_000_000);
        let lock = lock_with_clock(&store, &clock);

        let term = acquired_term(lock.try_acquire("r1").await.unwrap());
        store.fail_next_writes(1);
        assert!(matches!(lock.renew("r1", term).await, Err(LeaseError::Storage { .. })));
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let store = DeterministicKeyValueStore::new();
        let clock = ManualClock::new(1_000_000);
        let lock = lock_with_clock(&store, &clock);

        let term = acquired_term(lock.try_acquire("r1").await.unwrap());
        assert_eq!(lock.release("r1", term).await.unwrap(), ReleaseOutcome::Released);
        assert_eq!(lock.release("r1", term).await.unwrap(), ReleaseOutcome::AlreadyReleased);
    }

    #[tokio::test]
    async fn test_release_lets_others_acquire_immediately() {
        let store = DeterministicKeyValueStore::new();
        let clock = ManualClock::new(1_000_000);
        let lock = lock_with_clock(&store, &clock);

        let t1 = acquired_term(lock.try_acquire("r1").await.unwrap());
        lock.release("r1", t1).await.unwrap();

        let t2 = acquired_term(lock.try_acquire("r2").await.unwrap());
        assert_eq!(t2.value(), t1.value() + 1);
    }

    #[tokio::test]
    async fn test_release_of_foreign_term_is_noop() {
        let store = DeterministicKeyValueStore::new();
        let clock = ManualClock::new(1_000_000);
        let lock = lock_with_clock(&store, &clock);

        let term = acquired_term(lock.try_acquire("r1").await.unwrap());
        assert_eq!(lock.release("r2", term).await.unwrap(), ReleaseOutcome::AlreadyReleased);

        let (record, _) = lock.read_record().await.unwrap().unwrap();
        assert_eq!(record.holder_identity, "r1");
    }

    #[tokio::test]
    async fn test_same_identity_reacquires_with_new_term() {
        let store = DeterministicKeyValueStore::new();
        let clock = ManualClock::new(1_000_000);
        let lock = lock_with_clock(&store, &clock);

        let t1 = acquired_term(lock.try_acquire("r1").await.unwrap());
        let t2 = acquired_term(lock.try_acquire("r1").await.unwrap());
        assert!(t2 > t1);
        assert!(matches!(lock.renew("r1", t1).await.unwrap(), RenewOutcome::Lost { .. }));
    }

    #[tokio::test]
    async fn test_corrupted_record() {
        let store = DeterministicKeyValueStore::new();
        store
            .write(WriteRequest {
                command: WriteCommand::Set {
                    key: lease_key("ns", "singleton"),
                    value: "not json".into(),
                },
            })
            .await
            .unwrap();
        let lock = LeaseLock::new(store, "ns", "singleton", LEASE_MS);
        assert!(matches!(lock.try_acquire("r1").await, Err(LeaseError::CorruptedRecord { .. })));
    }

    #[tokio::test]
    async fn test_unknown_schema_is_never_overwritten() {
        let store = DeterministicKeyValueStore::new();
        let mut future = LeaseRecord::acquired("r9", 4, LEASE_MS, 0);
        future.schema_version = LEASE_SCHEMA_VERSION + 1;
        store
            .write(WriteRequest {
                command: WriteCommand::Set {
                    key: lease_key("ns", "singleton"),
                    value: serde_json::to_string(&future).unwrap(),
                },
            })
            .await
            .unwrap();

        let lock = LeaseLock::new(store.clone(), "ns", "singleton", LEASE_MS);
        assert!(matches!(lock.try_acquire("r1").await, Err(LeaseError::UnsupportedSchema { found: 2, .. })));
        assert_eq!(store.version(lock.key()).await, Some(1));
    }

    #[tokio::test]
    async fn test_unknown_schema_with_new_layout() {
        let store = DeterministicKeyValueStore::new();
        store
            .write(WriteRequest {
                command: WriteCommand::Set {
                    key: lease_key("ns", "singleton"),
                    value: r#"{"schema_version":2,"holders":["r9"]}"#.into(),
                },
            })
            .await
            .unwrap();

        let lock = LeaseLock::new(store, "ns", "singleton", LEASE_MS);
        assert!(matches!(lock.try_acquire("r1").await, Err(LeaseError::UnsupportedSchema { found: 2, .. })));
    }
}
