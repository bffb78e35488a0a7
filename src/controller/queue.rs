//! Shared work source for reconciliation workers.

use std::collections::HashSet;
use std::collections::VecDeque;

use tokio::sync::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Default)]
struct QueueState {
    items: VecDeque<String>,
    /// Keys currently waiting in `items`.
    queued: HashSet<String>,
}

/// FIFO of object keys awaiting reconciliation.
///
/// A key already waiting in the queue is not added twice; workers always
/// reconcile the latest state, so one pending entry per key is enough.
#[derive(Debug, Default)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl WorkQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue `key` unless it is already waiting. Returns whether it was added.
    pub async fn add(&self, key: impl Into<String>) -> bool {
        let key = key.into();
        let mut state = self.state.lock().await;
        if !state.queued.insert(key.clone()) {
            return false;
        }
        state.items.push_back(key);
        drop(state);
        self.notify.notify_one();
        true
    }

    /// Wait for the next key, or `None` once `cancel` fires.
    pub async fn next(&self, cancel: &CancellationToken) -> Option<String> {
        loop {
            if cancel.is_cancelled() {
                return None;
            }
            if let Some(key) = self.try_next().await {
                return Some(key);
            }
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = self.notify.notified() => {}
            }
        }
    }

    /// Pop a key without waiting.
    pub async fn try_next(&self) -> Option<String> {
        let mut state = self.state.lock().await;
        let key = state.items.pop_front()?;
        state.queued.remove(&key);
        // Wake another worker if more work is waiting.
        if !state.items.is_empty() {
            self.notify.notify_one();
        }
        Some(key)
    }

    /// Number of keys waiting.
    pub async fn len(&self) -> usize {
        self.state.lock().await.items.len()
    }

    /// Whether no keys are waiting.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = WorkQueue::new();
        queue.add("a").await;
        queue.add("b").await;

        let cancel = CancellationToken::new();
        assert_eq!(queue.next(&cancel).await.as_deref(), Some("a"));
        assert_eq!(queue.next(&cancel).await.as_deref(), Some("b"));
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_dedups_waiting_keys() {
        let queue = WorkQueue::new();
        assert!(queue.add("a").await);
        assert!(!queue.add("a").await);
        assert_eq!(queue.len().await, 1);

        queue.try_next().await;
        // Once taken, the key can be queued again.
        assert!(queue.add("a").await);
    }

    #[tokio::test]
    async fn test_next_wakes_on_add() {
        let queue = Arc::new(WorkQueue::new());
        let cancel = CancellationToken::new();

        let waiter = {
            let queue = queue.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { queue.next(&cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.add("late").await;

        let key = tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert_eq!(key.as_deref(), Some("late"));
    }

    #[tokio::test]
    async fn test_next_returns_none_on_cancel() {
        let queue = WorkQueue::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(queue.next(&cancel).await, None);
    }
}
