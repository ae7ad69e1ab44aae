use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Runs background jobs with at most `max_concurrency` executing at once.
#[derive(Debug, Clone)]
pub struct InProcessQueue {
    semaphore: Arc<Semaphore>,
}

impl InProcessQueue {
    pub fn new(max_concurrency: usize) -> Self {
        let permits = max_concurrency.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(permits)),
        }
    }

    /// Spawns `fut` once a slot frees up. If `cancel` fires first, `fut` starts
    /// right away without a slot and is expected to see the token and return.
    pub fn spawn<F>(&self, cancel: CancellationToken, fut: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let semaphore = Arc::clone(&self.semaphore);
        tokio::spawn(async move {
            let _permit = tokio::select! {
                biased;
                permit = semaphore.acquire_owned() => permit.ok(),
                _ = cancel.cancelled() => None,
            };
            fut.await
        })
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn limits_concurrent_jobs() {
        let queue = InProcessQueue::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..5)
            .map(|_| {
                let running = Arc::clone(&running);
                let peak = Arc::clone(&peak);
                queue.spawn(CancellationToken::new(), async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn cancelled_job_stops_waiting_for_a_slot() {
        let queue = InProcessQueue::new(1);
        let hold = CancellationToken::new();
        let held = hold.clone();
        let blocker = queue.spawn(CancellationToken::new(), async move { held.cancelled().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(queue.available(), 0);

        let cancel = CancellationToken::new();
        let waiting = queue.spawn(cancel.clone(), async { "ran" });
        cancel.cancel();
        let out = tokio::time::timeout(Duration::from_secs(1), waiting)
            .await
            .expect("queued job returns once cancelled")
            .unwrap();
        assert_eq!(out, "ran");
        assert_eq!(queue.available(), 0);

        hold.cancel();
        blocker.await.unwrap();
        assert_eq!(queue.available(), 1);
    }
}
