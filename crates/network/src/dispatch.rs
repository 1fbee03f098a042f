//! Scheduling of per-frame callbacks.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::config::DispatchPolicy;

/// Spawns callback tasks according to a [`DispatchPolicy`].
#[derive(Debug, Clone)]
pub(crate) struct Dispatcher {
    permits: Option<Arc<Semaphore>>,
}

impl Dispatcher {
    pub(crate) fn new(policy: DispatchPolicy) -> Self {
        let permits = match policy {
            DispatchPolicy::Unbounded => None,
            DispatchPolicy::Bounded(limit) => Some(Arc::new(Semaphore::new(limit.max(1)))),
        };
        Self { permits }
    }

    /// Run `task` on its own tokio task, waiting for a free slot first when bounded.
    pub(crate) async fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Some(permits) = &self.permits else {
            tokio::spawn(task);
            return;
        };

        // The semaphore is never closed.
        let Ok(permit) = Arc::clone(permits).acquire_owned().await else {
            return;
        };
        tokio::spawn(async move {
            task.await;
            drop(permit);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_bounded_limits_concurrency() {
        let dispatcher = Dispatcher::new(DispatchPolicy::Bounded(2));
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicUsize::new(0));

        for _ in 0..6 {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            let done = Arc::clone(&done);
            dispatcher
                .spawn(async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    done.fetch_add(1, Ordering::SeqCst);
                })
                .await;
        }

        while done.load(Ordering::SeqCst) < 6 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_unbounded_spawns_immediately() {
        let dispatcher = Dispatcher::new(DispatchPolicy::Unbounded);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        for i in 0..3 {
            let tx = tx.clone();
            dispatcher
                .spawn(async move {
                    let _ = tx.send(i);
                })
                .await;
        }
        drop(tx);

        let mut seen = Vec::new();
        while let Some(i) = rx.recv().await {
            seen.push(i);
        }
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2]);
    }
}
