//! Bounded-concurrency executor for fan-out work (resubscribe storms
//! during recovery, per-server connect attempts during bootstrap).
//!
//! Grounded on the semaphore-gated task spawning idiom; unlike the
//! teacher's `Registry`, which spawns an unbounded task per lingering
//! symbol, this pool caps how many jobs run at once so a large fleet
//! resubscribing after a reconnect doesn't open hundreds of sockets or
//! HTTP requests in the same instant.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Runs async jobs with at most `concurrency` running at any time.
pub(crate) struct WorkerPool {
    semaphore: Arc<Semaphore>,
}

impl WorkerPool {
    pub(crate) fn new(concurrency: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(concurrency.max(1))),
        }
    }

    /// Runs every job to completion, respecting the concurrency bound,
    /// and returns the results in the order the jobs were submitted.
    pub(crate) async fn run_all<F, Fut, T>(&self, jobs: Vec<F>) -> Vec<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let mut set = JoinSet::new();
        for (index, job) in jobs.into_iter().enumerate() {
            let permit = Arc::clone(&self.semaphore);
            set.spawn(async move {
                let _permit = permit
                    .acquire_owned()
                    .await
                    .expect("worker pool semaphore is never closed");
                (index, job().await)
            });
        }

        let mut results: Vec<Option<T>> = Vec::new();
        while let Some(joined) = set.join_next().await {
            if let Ok((index, value)) = joined {
                if results.len() <= index {
                    results.resize_with(index + 1, || None);
                }
                results[index] = Some(value);
            }
        }
        results.into_iter().flatten().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn run_all_preserves_submission_order() {
        let pool = WorkerPool::new(2);
        let results = pool
            .run_all(
                (0..5)
                    .map(|i| move || async move { i * 10 })
                    .collect::<Vec<_>>(),
            )
            .await;
        assert_eq!(results, vec![0, 10, 20, 30, 40]);
    }

    #[tokio::test]
    async fn run_all_respects_concurrency_bound() {
        let pool = WorkerPool::new(2);
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let jobs: Vec<_> = (0..6)
            .map(|_| {
                let in_flight = Arc::clone(&in_flight);
                let max_seen = Arc::clone(&max_seen);
                move || async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                }
            })
            .collect();

        pool.run_all(jobs).await;
        assert!(max_seen.load(Ordering::SeqCst) <= 2);
    }
}
