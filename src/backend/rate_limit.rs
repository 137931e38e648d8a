//! Retry backoff and bounded I/O concurrency

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::{Error, Result};

/// Exponential backoff with jitter for retrying transient failures
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base_delay_ms: u64,
    max_delay_ms: u64,
    max_retries: u32,
    attempt: u32,
}

impl ExponentialBackoff {
    /// Backoff starting at `base_delay_ms` allowing `max_retries` retries
    pub fn new(base_delay_ms: u64, max_retries: u32) -> Self {
        ExponentialBackoff {
            base_delay_ms,
            max_delay_ms: u64::MAX,
            max_retries,
            attempt: 0,
        }
    }

    /// Cap a single delay
    pub fn with_max_delay(mut self, max_delay_ms: u64) -> Self {
        self.max_delay_ms = max_delay_ms;
        self
    }

    /// Delay before the next retry, or `None` when retries are exhausted
    ///
    /// The delay doubles every attempt, with up to 50% random jitter added.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.max_retries {
            return None;
        }

        let exp = self
            .base_delay_ms
            .saturating_mul(1u64 << self.attempt.min(32))
            .min(self.max_delay_ms);
        let jitter = rand::thread_rng().gen_range(0..=exp / 2);
        self.attempt += 1;

        Some(Duration::from_millis(exp.saturating_add(jitter)))
    }

    /// Number of retries handed out so far
    pub fn retries(&self) -> u32 {
        self.attempt
    }
}

/// Bounded worker pool for backend I/O
///
/// Every network call holds a permit while it runs.
#[derive(Debug, Clone)]
pub struct IoPool {
    semaphore: Arc<Semaphore>,
    size: usize,
}

impl IoPool {
    pub fn new(size: usize) -> Self {
        IoPool {
            semaphore: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    /// Wait for a free slot
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit> {
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::Internal("I/O pool closed".to_string()))
    }

    /// Configured pool size
    pub fn size(&self) -> usize {
        self.size
    }

    /// Slots currently free
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_stops() {
        let mut backoff = ExponentialBackoff::new(100, 3);

        let first = backoff.next_delay().unwrap();
        assert!(first >= Duration::from_millis(100) && first <= Duration::from_millis(150));

        let second = backoff.next_delay().unwrap();
        assert!(second >= Duration::from_millis(200) && second <= Duration::from_millis(300));

        let third = backoff.next_delay().unwrap();
        assert!(third >= Duration::from_millis(400) && third <= Duration::from_millis(600));

        assert!(backoff.next_delay().is_none());
        assert_eq!(backoff.retries(), 3);
    }

    #[test]
    fn test_backoff_cap() {
        let mut backoff = ExponentialBackoff::new(1000, 10).with_max_delay(1500);
        for _ in 0..5 {
            let delay = backoff.next_delay().unwrap();
            assert!(delay <= Duration::from_millis(2250));
        }
    }

    #[test]
    fn test_zero_retries() {
        let mut backoff = ExponentialBackoff::new(10, 0);
        assert!(backoff.next_delay().is_none());
    }

    #[tokio::test]
    async fn test_io_pool_bounds() {
        let pool = IoPool::new(2);
        assert_eq!(pool.size(), 2);

        let a = pool.acquire().await.unwrap();
        let _b = pool.acquire().await.unwrap();
        assert_eq!(pool.available(), 0);

        drop(a);
        assert_eq!(pool.available(), 1);
    }
}
