//! Leader-gated, cache-gated startup of a singleton controller.
//!
//! [`SingletonCoordinator::run`] contends for the lease and, for each
//! leadership period:
//!
//! 1. notifies the [`LeadershipObserver`],
//! 2. waits for every registered cache to sync,
//! 3. starts the [`ControllerRunner`] workers,
//! 4. on loss or shutdown, stops the workers before the observer hears about
//!    it and before the lease is released.
//!
//! A cache sync timeout ends the whole run with
//! [`RunError::CacheSyncTimeout`]; the lease is released on the way out.

use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use snafu::ResultExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::api::KeyValueStore;
use crate::cache::CacheSource;
use crate::cache::CacheSyncBarrier;
use crate::cache::SyncOutcome;
use crate::config::SingletonConfig;
use crate::controller::ControllerRunner;
use crate::controller::Reconciler;
use crate::controller::WorkQueue;
use crate::coordination::LeaderElector;
use crate::coordination::LeadershipEvent;
use crate::coordination::LeaseLock;
use crate::coordination::Term;
use crate::error::ConfigSnafu;
use crate::error::ElectorTaskSnafu;
use crate::error::RunError;
use crate::time::Clock;
use crate::time::SystemClock;

/// Hooks invoked on leadership transitions.
///
/// `on_lost_leadership` runs after every worker of that term has exited and
/// before the lease is released.
#[async_trait]
pub trait LeadershipObserver: Send + Sync + 'static {
    /// This replica became the leader for `term`.
    async fn on_became_leader(&self, _term: Term) {}

    /// Leadership for `term` ended and its workers are stopped.
    async fn on_lost_leadership(&self, _term: Term) {}
}

/// Observer that does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl LeadershipObserver for NoopObserver {}

/// Wires leader election, the cache barrier and the controller runner together.
pub struct SingletonCoordinator<S: KeyValueStore + ?Sized + 'static> {
    store: Arc<S>,
    config: SingletonConfig,
    barrier: CacheSyncBarrier,
    queue: Arc<WorkQueue>,
    reconciler: Option<Arc<dyn Reconciler>>,
    observer: Arc<dyn LeadershipObserver>,
    clock: Arc<dyn Clock>,
    active_workers: Arc<AtomicUsize>,
}

impl<S: KeyValueStore + ?Sized + Send + Sync + 'static> SingletonCoordinator<S> {
    /// Create a coordinator for `config` against `store`.
    pub fn new(store: Arc<S>, config: SingletonConfig) -> Self {
        Self {
            store,
            config,
            barrier: CacheSyncBarrier::default(),
            queue: Arc::new(WorkQueue::new()),
            reconciler: None,
            observer: Arc::new(NoopObserver),
            clock: Arc::new(SystemClock),
            active_workers: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Require `source` to sync before workers start.
    pub fn with_cache_source(mut self, source: CacheSource) -> Self {
        self.barrier.push(source);
        self
    }

    /// Business logic run by the workers while leading.
    pub fn with_reconciler(mut self, reconciler: Arc<dyn Reconciler>) -> Self {
        self.reconciler = Some(reconciler);
        self
    }

    /// Use `queue` as the workers' work source.
    pub fn with_work_queue(mut self, queue: Arc<WorkQueue>) -> Self {
        self.queue = queue;
        self
    }

    /// Receive leadership transition hooks.
    pub fn with_observer(mut self, observer: Arc<dyn LeadershipObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Clock used for lease deadlines.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// The work source shared by every leadership period.
    pub fn work_queue(&self) -> Arc<WorkQueue> {
        self.queue.clone()
    }

    /// Live worker count; zero whenever this replica is not leading.
    pub fn active_workers(&self) -> usize {
        self.active_workers.load(Ordering::SeqCst)
    }

    /// Counter behind [`Self::active_workers`], for observers.
    pub fn active_workers_counter(&self) -> Arc<AtomicUsize> {
        self.active_workers.clone()
    }

    /// The configuration in effect.
    pub fn config(&self) -> &SingletonConfig {
        &self.config
    }

    /// Run until `cancel` fires or a fatal error occurs.
    ///
    /// Configuration is validated before the store is touched.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), RunError> {
        self.config.validate().context(ConfigSnafu)?;
        for warning in self.config.check_timing_sanity() {
            warn!("{warning}");
        }

        info!(
            version = env!("CARGO_PKG_VERSION"),
            identity = %self.config.identity,
            lease_namespace = %self.config.lease_namespace,
            lease_name = %self.config.lease_name,
            "starting singleton coordinator"
        );

        // Cancelled by the caller, or by us on a fatal leadership error.
        let run_cancel = cancel.child_token();

        let lock = LeaseLock::new(
            self.store.clone(),
            &self.config.lease_namespace,
            &self.config.lease_name,
            self.config.lease_duration_ms,
        )
        .with_clock(self.clock.clone());
        let elector = LeaderElector::new(lock, self.config.identity.clone(), self.config.election_config());

        let (events_tx, mut events_rx) = mpsc::channel(4);
        let elector_task = tokio::spawn(elector.run(run_cancel.clone(), events_tx));

        let mut work: Option<JoinHandle<Result<(), RunError>>> = None;
        let mut fatal: Option<RunError> = None;

        // The elector owns the sender, so this ends once the elector exits.
        while let Some(event) = events_rx.recv().await {
            match event {
                LeadershipEvent::BecameLeader { term, leadership } => {
                    self.observer.on_became_leader(term).await;
                    let work_future = self.leadership_work().run(term, leadership, run_cancel.clone());
                    work = Some(tokio::spawn(work_future));
                }
                LeadershipEvent::LostLeadership { term, reason, stopped } => {
                    if let Some(handle) = work.take() {
                        match handle.await {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => {
                                fatal.get_or_insert(e);
                            }
                            Err(e) => error!(term = term.value(), error = %e, "leadership work task failed"),
                        }
                    }
                    info!(term = term.value(), reason = ?reason, "leadership work stopped");
                    self.observer.on_lost_leadership(term).await;
                    let _ = stopped.send(());
                }
            }
        }

        let joined = elector_task.await;
        if let Some(e) = fatal {
            return Err(e);
        }
        joined.context(ElectorTaskSnafu)?;

        info!(identity = %self.config.identity, "singleton coordinator stopped");
        Ok(())
    }

    fn leadership_work(&self) -> LeadershipWork {
        let runner = self.reconciler.clone().map(|reconciler| {
            ControllerRunner::new(reconciler, self.queue.clone())
                .with_requeue_delay(self.config.requeue_delay())
                .with_active_counter(self.active_workers.clone())
        });
        LeadershipWork {
            barrier: self.barrier.clone(),
            timeout: self.config.cache_sync_timeout(),
            worker_count: self.config.worker_count,
            runner,
        }
    }
}

/// Everything that runs only while leading one term.
struct LeadershipWork {
    barrier: CacheSyncBarrier,
    timeout: Duration,
    worker_count: u32,
    runner: Option<ControllerRunner>,
}

impl LeadershipWork {
    /// Returns once `leadership` is cancelled and all workers have exited.
    async fn run(self, term: Term, leadership: CancellationToken, run_cancel: CancellationToken) -> Result<(), RunError> {
        match self.barrier.wait_for_all(self.timeout, &leadership).await {
            SyncOutcome::AllSynced => {}
            SyncOutcome::Cancelled => return Ok(()),
            SyncOutcome::PartialTimeout { unsynced } => {
                error!(term = term.value(), unsynced = ?unsynced, "caches failed to sync, stopping");
                run_cancel.cancel();
                return Err(RunError::CacheSyncTimeout {
                    unsynced,
                    timeout_ms: self.timeout.as_millis() as u64,
                });
            }
        }

        let Some(runner) = self.runner else {
            warn!(term = term.value(), "no reconciler configured, leading without workers");
            leadership.cancelled().await;
            return Ok(());
        };

        let handle = runner.start(&leadership, self.worker_count);
        info!(term = term.value(), worker_count = self.worker_count, "controller started");
        leadership.cancelled().await;
        handle.stop().await;
        Ok(())
    }
}

/// Contend for `lease_namespace/lease_name` as `identity` until `cancel` fires.
///
/// Uses default timings and no cache sources or workers; build a
/// [`SingletonCoordinator`] directly for those.
pub async fn run<S>(
    store: Arc<S>,
    cancel: CancellationToken,
    identity: impl Into<String>,
    lease_name: impl Into<String>,
    lease_namespace: impl Into<String>,
    observer: Arc<dyn LeadershipObserver>,
) -> Result<(), RunError>
where
    S: KeyValueStore + ?Sized + Send + Sync + 'static,
{
    let config = SingletonConfig {
        identity: identity.into(),
        lease_name: lease_name.into(),
        lease_namespace: lease_namespace.into(),
        ..SingletonConfig::default()
    };
    SingletonCoordinator::new(store, config).with_observer(observer).run(cancel).await
}
