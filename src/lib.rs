//! Leader-election and cache-sync gated startup for singleton controllers.
//!
//! Several replicas of a controller run against one shared control-plane
//! store. [`SingletonCoordinator::run`] makes sure that:
//!
//! - at most one replica holds the lease, and so reconciles, at any instant
//! - the leader starts its workers only after every local cache has synced
//! - workers are fully stopped before the lease is handed back
//!
//! # Modules
//!
//! - [`api`]: the versioned key-value store the lease lives in
//! - [`coordination`]: lease lock, leader elector and their pure helpers
//! - [`cache`]: the cache sync barrier
//! - [`controller`]: worker pool and work queue
//! - [`coordinator`]: the top-level run loop
//!
//! # Example
//!
//! ```ignore
//! let store = DeterministicKeyValueStore::new();
//! let (feed, source) = cache_source("widgets");
//! let config = SingletonConfig::from_env().with_default_identity();
//!
//! let coordinator = SingletonCoordinator::new(store, config)
//!     .with_cache_source(source)
//!     .with_reconciler(Arc::new(MyReconciler));
//! coordinator.run(cancel).await?;
//! ```

pub mod api;
pub mod cache;
pub mod config;
pub mod controller;
pub mod coordination;
pub mod coordinator;
pub mod error;
pub mod time;

pub use api::DeterministicKeyValueStore;
pub use api::KeyValueStore;
pub use cache::CacheSource;
pub use cache::CacheSyncBarrier;
pub use cache::SyncNotifier;
pub use cache::SyncOutcome;
pub use cache::cache_source;
pub use config::ConfigError;
pub use config::SingletonConfig;
pub use controller::ControllerHandle;
pub use controller::ControllerRunner;
pub use controller::ReconcileError;
pub use controller::Reconciler;
pub use controller::WorkQueue;
pub use coordination::ElectionConfig;
pub use coordination::ElectionState;
pub use coordination::LeaderElector;
pub use coordination::LeaseLock;
pub use coordination::Term;
pub use coordinator::LeadershipObserver;
pub use coordinator::NoopObserver;
pub use coordinator::SingletonCoordinator;
pub use coordinator::run;
pub use error::RunError;
