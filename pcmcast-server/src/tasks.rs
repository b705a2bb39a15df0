//! Tracked, abortable background tasks
//!
//! Every task a session spawns (the control listener and each broadcast run)
//! goes through [`RunTasks`]. The tracker lets shutdown wait for them; the
//! abort handles let it end whatever is still running once the grace period
//! is over, so nothing keeps the relay socket alive past `Stopped`.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::AbortHandle;
use tokio_util::task::TaskTracker;

/// Cloneable handle to the session's task set
#[derive(Debug, Clone, Default)]
pub struct RunTasks {
    tracker: TaskTracker,
    aborts: Arc<Mutex<Vec<AbortHandle>>>,
}

impl RunTasks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `task` on the current runtime, tracked and abortable
    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = self.tracker.spawn(task);

        let mut aborts = self.handles();
        aborts.retain(|h| !h.is_finished());
        aborts.push(handle.abort_handle());
    }

    /// Tasks spawned and not yet finished
    pub fn len(&self) -> usize {
        self.tracker.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracker.is_empty()
    }

    /// Mark the set closed; `wait` resolves once it is also empty
    pub fn close(&self) {
        self.tracker.close();
    }

    /// Wait for every tracked task to finish (or be dropped after an abort)
    pub async fn wait(&self) {
        self.tracker.wait().await;
    }

    /// Abort every task still running. Returns how many were aborted.
    pub fn abort_all(&self) -> usize {
        let mut aborted = 0;
        for handle in self.handles().drain(..) {
            if !handle.is_finished() {
                handle.abort();
                aborted += 1;
            }
        }
        aborted
    }

    fn handles(&self) -> MutexGuard<'_, Vec<AbortHandle>> {
        // A panic while holding the lock leaves the list itself intact
        self.aborts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_wait_after_completion() {
        let tasks = RunTasks::new();
        let done = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&done);
        tasks.spawn(async move {
            flag.store(true, Ordering::SeqCst);
        });

        tasks.close();
        tokio::time::timeout(Duration::from_secs(1), tasks.wait())
            .await
            .unwrap();
        assert!(done.load(Ordering::SeqCst));
        assert!(tasks.is_empty());
        assert_eq!(tasks.abort_all(), 0);
    }

    #[tokio::test]
    async fn test_abort_ends_endless_task() {
        let tasks = RunTasks::new();
        let held = Arc::new(());

        let clone = Arc::clone(&held);
        tasks.spawn(async move {
            let _held = clone;
            std::future::pending::<()>().await;
        });

        tasks.close();
        assert!(
            tokio::time::timeout(Duration::from_millis(50), tasks.wait())
                .await
                .is_err()
        );

        assert_eq!(tasks.abort_all(), 1);
        tokio::time::timeout(Duration::from_secs(1), tasks.wait())
            .await
            .unwrap();

        // The aborted task dropped everything it owned
        assert_eq!(Arc::strong_count(&held), 1);
    }
}
