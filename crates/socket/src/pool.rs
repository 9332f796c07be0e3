//! Bounded worker pool for encoding, decoding and subscriber callbacks.

use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::SocketError;

/// Runs blocking work with at most `size` jobs in flight.
///
/// Network I/O never runs here; the pool only carries codec work and
/// user callbacks so a slow subscriber cannot stall the pumps.
#[derive(Debug, Clone)]
pub(crate) struct WorkerPool {
    permits: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    pub(crate) fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub(crate) fn size(&self) -> usize {
        self.size
    }

    /// Runs `work` on a blocking thread once a permit is available.
    pub(crate) async fn execute<F, T>(&self, work: F) -> Result<T, SocketError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let _permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| SocketError::PoolClosed)?;
        tokio::task::spawn_blocking(work)
            .await
            .map_err(|e| SocketError::Worker(e.to_string()))
    }

    /// Releases the pool. Pending and future `execute` calls fail with
    /// [`SocketError::PoolClosed`].
    pub(crate) fn close(&self) {
        self.permits.close();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.permits.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn size_is_at_least_one() {
        assert_eq!(WorkerPool::new(0).size(), 1);
        assert_eq!(WorkerPool::new(4).size(), 4);
    }

    #[tokio::test]
    async fn execute_returns_result() {
        let pool = WorkerPool::new(2);
        let value = pool.execute(|| 21 * 2).await.unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn closed_pool_rejects_work() {
        let pool = WorkerPool::new(1);
        pool.close();
        assert!(pool.is_closed());
        assert!(matches!(
            pool.execute(|| ()).await,
            Err(SocketError::PoolClosed)
        ));
    }

    #[tokio::test]
    async fn panicking_job_reports_worker_error() {
        let pool = WorkerPool::new(1);
        let result = pool.execute(|| -> u32 { panic!("boom") }).await;
        assert!(matches!(result, Err(SocketError::Worker(_))));
        // The permit is returned even when the job panics.
        assert_eq!(pool.execute(|| 1).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn concurrency_is_bounded() {
        let pool = WorkerPool::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut jobs = Vec::new();
        for _ in 0..8 {
            let pool = pool.clone();
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            jobs.push(tokio::spawn(async move {
                pool.execute(move || {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(20));
                    running.fetch_sub(1, Ordering::SeqCst);
                })
                .await
            }));
        }
        for job in jobs {
            job.await.unwrap().unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }
}
