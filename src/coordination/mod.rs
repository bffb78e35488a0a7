//! Lease-based coordination built on CAS operations.
//!
//! - [`LeaseLock`] - acquire / renew / release of a single lease record
//! - [`LeaderElector`] - renewal loop and leadership transition events
//!
//! Both are generic over [`crate::api::KeyValueStore`], so any store with
//! per-key versions and compare-and-swap can back the election.

mod election;
mod error;
mod lock;
pub mod pure;
mod types;

pub use election::ElectionConfig;
pub use election::ElectionState;
pub use election::LeaderElector;
pub use election::LeadershipEvent;
pub use election::LossReason;
pub use error::LeaseError;
pub use lock::AcquireOutcome;
pub use lock::LeaseLock;
pub use lock::ReleaseOutcome;
pub use lock::RenewOutcome;
pub use types::LEASE_PREFIX;
pub use types::LEASE_SCHEMA_VERSION;
pub use types::LeaseRecord;
pub use types::Term;
pub use types::lease_key;
