//! Bounded-concurrency scheduler for epoch-scoped requests.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;

/// Counting semaphore wrapper: at most `permits` scheduled tasks run at
/// once; waiters are served in FIFO order.
pub struct RateLimiter {
    semaphore: Arc<Semaphore>,
}

impl RateLimiter {
    pub fn new(permits: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(permits)),
        }
    }

    /// Run `task` once a permit is available; the permit is released when
    /// the task completes or fails.
    pub async fn schedule<F, T>(&self, task: F) -> T
    where
        F: Future<Output = T>,
    {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .expect("rate limiter semaphore closed");
        task.await
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}
