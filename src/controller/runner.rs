//! Reconciliation worker pool scoped to one leadership period.

use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use snafu::Snafu;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::queue::WorkQueue;

/// Failure reconciling a single key.
#[derive(Debug, Snafu)]
#[snafu(display("failed to reconcile '{key}': {message}"))]
pub struct ReconcileError {
    /// The key that failed.
    pub key: String,
    /// What went wrong.
    pub message: String,
}

/// The business logic run by each worker.
#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    /// Bring the object named by `key` to its desired state.
    ///
    /// `cancel` fires when leadership ends; long reconciles should observe it.
    async fn reconcile(&self, key: &str, cancel: &CancellationToken) -> Result<(), ReconcileError>;
}

/// Starts reconciliation workers against a shared [`WorkQueue`].
#[derive(Clone)]
pub struct ControllerRunner {
    reconciler: Arc<dyn Reconciler>,
    queue: Arc<WorkQueue>,
    requeue_delay: Duration,
    active: Arc<AtomicUsize>,
}

impl ControllerRunner {
    /// Create a runner feeding `queue` into `reconciler`.
    pub fn new(reconciler: Arc<dyn Reconciler>, queue: Arc<WorkQueue>) -> Self {
        Self {
            reconciler,
            queue,
            requeue_delay: Duration::from_secs(1),
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Count live workers in `counter` instead of a private one.
    pub fn with_active_counter(mut self, counter: Arc<AtomicUsize>) -> Self {
        self.active = counter;
        self
    }

    /// Delay before a failed key is retried.
    pub fn with_requeue_delay(mut self, delay: Duration) -> Self {
        self.requeue_delay = delay;
        self
    }

    /// Spawn `worker_count` workers that run until `parent` (or the returned
    /// handle) is cancelled.
    pub fn start(&self, parent: &CancellationToken, worker_count: u32) -> ControllerHandle {
        let cancel = parent.child_token();
        let tracker = TaskTracker::new();
        let active = self.active.clone();

        info!(worker_count, "starting controller workers");
        for worker_id in 0..worker_count {
            // Count before spawning so `active_workers` is exact as soon as start returns.
            active.fetch_add(1, Ordering::SeqCst);
            let worker = Worker {
                id: worker_id,
                reconciler: self.reconciler.clone(),
                queue: self.queue.clone(),
                requeue_delay: self.requeue_delay,
                cancel: cancel.clone(),
                tracker: tracker.clone(),
                _active: ActiveGuard(active.clone()),
            };
            tracker.spawn(worker.run());
        }

        ControllerHandle {
            worker_count,
            cancel,
            tracker,
            active,
        }
    }
}

/// Live worker pool for one leadership period.
pub struct ControllerHandle {
    worker_count: u32,
    cancel: CancellationToken,
    tracker: TaskTracker,
    active: Arc<AtomicUsize>,
}

impl ControllerHandle {
    /// Number of workers started.
    pub fn worker_count(&self) -> u32 {
        self.worker_count
    }

    /// Workers that have not exited yet.
    pub fn active_workers(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Counter behind [`Self::active_workers`].
    pub fn active_counter(&self) -> Arc<AtomicUsize> {
        self.active.clone()
    }

    /// Cancel every worker and wait until all have exited.
    pub async fn stop(self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        info!(worker_count = self.worker_count, "controller workers stopped");
    }
}

/// Decrements the active-worker count when a worker exits, even by panic.
struct ActiveGuard(Arc<AtomicUsize>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

struct Worker {
    id: u32,
    reconciler: Arc<dyn Reconciler>,
    queue: Arc<WorkQueue>,
    requeue_delay: Duration,
    cancel: CancellationToken,
    tracker: TaskTracker,
    _active: ActiveGuard,
}

impl Worker {
    async fn run(self) {
        debug!(worker = self.id, "worker started");
        while let Some(key) = self.queue.next(&self.cancel).await {
            match self.reconciler.reconcile(&key, &self.cancel).await {
                Ok(()) => debug!(worker = self.id, key = %key, "reconciled"),
                Err(e) => {
                    warn!(worker = self.id, error = %e, retry_in_ms = self.requeue_delay.as_millis() as u64, "reconcile failed");
                    self.requeue_later(key);
                }
            }
        }
        debug!(worker = self.id, "worker exiting");
    }

    /// Re-add `key` after the requeue delay unless the pool stops first.
    fn requeue_later(&self, key: String) {
        let queue = self.queue.clone();
        let cancel = self.cancel.clone();
        let delay = self.requeue_delay;
        self.tracker.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    queue.add(key).await;
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use tokio::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct RecordingReconciler {
        seen: Mutex<HashMap<String, u32>>,
        fail_first: Mutex<HashMap<String, bool>>,
    }

    #[async_trait]
    impl Reconciler for RecordingReconciler {
        async fn reconcile(&self, key: &str, _cancel: &CancellationToken) -> Result<(), ReconcileError> {
            *self.seen.lock().await.entry(key.to_string()).or_default() += 1;
            if self.fail_first.lock().await.remove(key).is_some() {
                return Err(ReconcileError {
                    key: key.to_string(),
                    message: "injected".into(),
                });
            }
            Ok(())
        }
    }

    /// Blocks in reconcile until cancelled.
    struct BlockingReconciler;

    #[async_trait]
    impl Reconciler for BlockingReconciler {
        async fn reconcile(&self, _key: &str, cancel: &CancellationToken) -> Result<(), ReconcileError> {
            cancel.cancelled().await;
            Ok(())
        }
    }

    async fn wait_until<F: Fn() -> bool>(check: F) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    #[tokio::test]
    async fn test_workers_drain_queue() {
        let reconciler = Arc::new(RecordingReconciler::default());
        let queue = Arc::new(WorkQueue::new());
        for i in 0..20 {
            queue.add(format!("obj-{i}")).await;
        }

        let runner = ControllerRunner::new(reconciler.clone(), queue.clone());
        let handle = runner.start(&CancellationToken::new(), 4);
        assert_eq!(handle.worker_count(), 4);
        assert_eq!(handle.active_workers(), 4);

        tokio::time::timeout(Duration::from_secs(5), async {
            while reconciler.seen.lock().await.len() < 20 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        handle.stop().await;
        assert!(reconciler.seen.lock().await.values().all(|&n| n == 1));
    }

    #[tokio::test]
    async fn test_stop_waits_for_all_workers() {
        let queue = Arc::new(WorkQueue::new());
        queue.add("a").await;
        queue.add("b").await;

        let runner = ControllerRunner::new(Arc::new(BlockingReconciler), queue);
        let handle = runner.start(&CancellationToken::new(), 3);
        let active = handle.active_counter();

        handle.stop().await;
        assert_eq!(active.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_parent_cancellation_stops_workers() {
        let parent = CancellationToken::new();
        let runner = ControllerRunner::new(Arc::new(RecordingReconciler::default()), Arc::new(WorkQueue::new()));
        let handle = runner.start(&parent, 2);
        let active = handle.active_counter();

        parent.cancel();
        wait_until(|| active.load(Ordering::SeqCst) == 0).await;
        handle.stop().await;
    }

    #[tokio::test]
    async fn test_failed_key_is_requeued() {
        let reconciler = Arc::new(RecordingReconciler::default());
        reconciler.fail_first.lock().await.insert("flaky".into(), true);
        let queue = Arc::new(WorkQueue::new());
        queue.add("flaky").await;

        let runner =
            ControllerRunner::new(reconciler.clone(), queue).with_requeue_delay(Duration::from_millis(10));
        let handle = runner.start(&CancellationToken::new(), 1);

        tokio::time::timeout(Duration::from_secs(5), async {
            while reconciler.seen.lock().await.get("flaky").copied().unwrap_or(0) < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        handle.stop().await;
    }

    #[tokio::test]
    async fn test_stop_cancels_pending_requeues() {
        let reconciler = Arc::new(RecordingReconciler::default());
        reconciler.fail_first.lock().await.insert("flaky".into(), true);
        let queue = Arc::new(WorkQueue::new());
        queue.add("flaky").await;

        let runner = ControllerRunner::new(reconciler.clone(), queue.clone()).with_requeue_delay(Duration::from_secs(60));
        let handle = runner.start(&CancellationToken::new(), 1);
        tokio::time::timeout(Duration::from_secs(5), async {
            while reconciler.seen.lock().await.is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        // Would hang for a minute if the requeue timer were not cancellable.
        tokio::time::timeout(Duration::from_secs(1), handle.stop()).await.unwrap();
        assert!(queue.is_empty().await);
    }
}
