//! Shared types for lease coordination.

use serde::Deserialize;
use serde::Serialize;

/// Lease key prefix.
pub const LEASE_PREFIX: &str = "__lease:";

/// Schema version written into every [`LeaseRecord`].
///
/// Replicas refuse to overwrite records carrying a version they do not know,
/// so a mixed-version rollout cannot produce ambiguous CAS outcomes.
pub const LEASE_SCHEMA_VERSION: u32 = 1;

/// Store key for the lease `name` in `namespace`.
pub fn lease_key(namespace: &str, name: &str) -> String {
    format!("{LEASE_PREFIX}{namespace}/{name}")
}

/// Lease record stored in the KV store.
///
/// Serialized as JSON for human readability and debugging.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LeaseRecord {
    /// Layout version of this record.
    pub schema_version: u32,
    /// Identity of the current holder, empty once released.
    pub holder_identity: String,
    /// Monotonically increasing term, bumped on every acquisition.
    pub term: u64,
    /// When the current term was acquired (Unix ms).
    pub acquired_at_ms: u64,
    /// When the holder last renewed (Unix ms).
    pub renewed_at_ms: u64,
    /// Lease duration in milliseconds.
    pub lease_duration_ms: u64,
    /// Deadline = renewed_at_ms + lease_duration_ms. 0 means released.
    pub deadline_ms: u64,
}

impl LeaseRecord {
    /// Create a record for a freshly acquired term.
    pub fn acquired(holder_identity: impl Into<String>, term: u64, lease_duration_ms: u64, now_ms: u64) -> Self {
        Self {
            schema_version: LEASE_SCHEMA_VERSION,
            holder_identity: holder_identity.into(),
            term,
            acquired_at_ms: now_ms,
            renewed_at_ms: now_ms,
            lease_duration_ms,
            deadline_ms: now_ms.saturating_add(lease_duration_ms),
        }
    }

    /// Same holder and term with the deadline pushed out from `now_ms`.
    pub fn renewed(&self, now_ms: u64) -> Self {
        Self {
            renewed_at_ms: now_ms,
            deadline_ms: now_ms.saturating_add(self.lease_duration_ms),
            ..self.clone()
        }
    }

    /// Released record (preserves the term for fencing history).
    pub fn released(&self) -> Self {
        Self {
            holder_identity: String::new(),
            deadline_ms: 0,
            ..self.clone()
        }
    }

    /// Whether the record has been explicitly released.
    pub fn is_released(&self) -> bool {
        self.holder_identity.is_empty() || self.deadline_ms == 0
    }

    /// Whether the lease no longer protects its holder at `now_ms`.
    pub fn is_expired_at(&self, now_ms: u64) -> bool {
        crate::coordination::pure::is_lease_expired(self.deadline_ms, now_ms)
    }

    /// Whether `identity` holds `term` of this lease.
    pub fn is_held_by(&self, identity: &str, term: Term) -> bool {
        !self.is_released() && self.holder_identity == identity && self.term == term.value()
    }
}

/// Leadership term returned on successful acquisition.
///
/// Doubles as a fencing token: include it in operations performed on behalf
/// of the leader so downstream systems can reject stale leaders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Term(pub u64);

impl Term {
    /// Create a new term.
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    /// Get the raw term value.
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for Term {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_key_format() {
        assert_eq!(lease_key("kube-bind", "konnector"), "__lease:kube-bind/konnector");
    }

    #[test]
    fn test_record_expiry() {
        let record = LeaseRecord::acquired("r1", 1, 5_000, 10_000);
        assert_eq!(record.deadline_ms, 15_000);
        assert!(!record.is_expired_at(15_000));
        assert!(record.is_expired_at(15_001));
    }

    #[test]
    fn test_renewed_keeps_term_and_extends_deadline() {
        let record = LeaseRecord::acquired("r1", 3, 5_000, 10_000);
        let renewed = record.renewed(12_000);
        assert_eq!(renewed.term, 3);
        assert_eq!(renewed.acquired_at_ms, 10_000);
        assert_eq!(renewed.deadline_ms, 17_000);
    }

    #[test]
    fn test_released_preserves_term() {
        let record = LeaseRecord::acquired("r1", 7, 5_000, 10_000).released();
        assert!(record.is_released());
        assert!(record.is_expired_at(0));
        assert_eq!(record.term, 7);
        assert!(!record.is_held_by("r1", Term(7)));
    }

    #[test]
    fn test_record_json_field_names() {
        let record = LeaseRecord::acquired("r1", 1, 5_000, 10_000);
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["schema_version"], 1);
        assert_eq!(json["holder_identity"], "r1");
        assert_eq!(json["deadline_ms"], 15_000);
    }

    #[test]
    fn test_term_ordering() {
        assert!(Term::new(1) < Term::new(2));
    }
}
