//! Backend pool
//!
//! Every backend call of the engine goes through here: a bounded I/O pool,
//! retry with backoff on transient errors, circuit-breaker checks and health
//! bookkeeping, and an optional deadline after which no new call or retry is
//! issued.

use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::backend::{BackendId, BackendSet, ETag, ExponentialBackoff, IoPool, StorageBackend};
use crate::config::RetryConfig;
use crate::error::{Error, Result};
use crate::health::HealthTracker;

/// Pool of configured backends
pub struct BackendPool {
    /// Configured backends
    backends: BackendSet,
    /// Bounded worker pool for network calls
    io: IoPool,
    /// Health tracker
    health: Arc<HealthTracker>,
    /// Retry settings
    retry: RetryConfig,
}

impl BackendPool {
    /// Create a new backend pool
    pub fn new(
        backends: BackendSet,
        health: Arc<HealthTracker>,
        worker_pool: usize,
        retry: RetryConfig,
    ) -> Self {
        health.register(backends.ids().iter());
        debug!(
            "Created backend pool with {} backends and {} I/O workers",
            backends.len(),
            worker_pool
        );
        BackendPool {
            backends,
            io: IoPool::new(worker_pool.max(1)),
            health,
            retry,
        }
    }

    pub fn backends(&self) -> &BackendSet {
        &self.backends
    }

    pub fn health(&self) -> &Arc<HealthTracker> {
        &self.health
    }

    /// Identifiers of all backends, in configuration order
    pub fn ids(&self) -> Vec<BackendId> {
        self.backends.ids()
    }

    /// Whether the circuit of `backend` lets requests through
    pub fn is_available(&self, backend: &BackendId) -> bool {
        self.backends.contains(backend) && self.health.allow_request(backend)
    }

    /// Store an object
    pub async fn put(
        &self,
        backend: &BackendId,
        key: &str,
        data: Bytes,
        deadline: Option<Instant>,
    ) -> Result<ETag> {
        self.call(backend, "PUT", key, deadline, move |b| {
            let data = data.clone();
            async move { b.put(key, data).await }
        })
        .await
    }

    /// Fetch an object
    pub async fn get(&self, backend: &BackendId, key: &str, deadline: Option<Instant>) -> Result<Bytes> {
        self.call(backend, "GET", key, deadline, |b| async move { b.get(key).await })
            .await
    }

    /// Check whether an object exists
    pub async fn exists(&self, backend: &BackendId, key: &str, deadline: Option<Instant>) -> Result<bool> {
        self.call(backend, "HEAD", key, deadline, |b| async move { b.exists(key).await })
            .await
    }

    /// List keys under a prefix
    pub async fn list(&self, backend: &BackendId, prefix: &str) -> Result<Vec<String>> {
        self.call(backend, "LIST", prefix, None, |b| async move { b.list(prefix).await })
            .await
    }

    /// Run one backend call with retry on transient errors
    ///
    /// `ObjectNotFound` is an answer, not a backend fault, and does not count
    /// against the backend's health. A call counts as one health failure no
    /// matter how many attempts it took, and the circuit is only consulted
    /// before the first attempt.
    async fn call<T, F, Fut>(
        &self,
        backend: &BackendId,
        op_name: &str,
        key: &str,
        deadline: Option<Instant>,
        f: F,
    ) -> Result<T>
    where
        F: Fn(Arc<dyn StorageBackend>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let handle = self.backends.get(backend)?;
        let mut backoff = ExponentialBackoff::new(self.retry.base_delay_ms, self.retry.max_retries)
            .with_max_delay(self.retry.max_delay_ms);
        let mut last_error: Option<Error> = None;

        loop {
            if deadline_passed(deadline) {
                return Err(self.cut_short(backend, last_error));
            }

            if last_error.is_none() && !self.health.allow_request(backend) {
                return Err(Error::PermanentBackend {
                    backend: backend.to_string(),
                    reason: "circuit open".to_string(),
                });
            }

            let result = {
                let _permit = match deadline {
                    Some(d) => match tokio::time::timeout_at(d, self.io.acquire()).await {
                        Ok(permit) => permit?,
                        Err(_) => return Err(self.cut_short(backend, last_error)),
                    },
                    None => self.io.acquire().await?,
                };
                // Waiting for a worker may have used up the deadline
                if deadline_passed(deadline) {
                    debug!("{} {} on {}: deadline passed while queued", op_name, key, backend);
                    return Err(self.cut_short(backend, last_error));
                }
                f(handle.clone()).await
            };

            match result {
                Ok(value) => {
                    self.health.record_success(backend);
                    return Ok(value);
                }
                Err(e @ Error::ObjectNotFound { .. }) => return Err(e),
                Err(e) if e.is_transient() => {
                    let delay = match backoff.next_delay() {
                        Some(delay) => delay,
                        None => {
                            warn!(
                                "{} {} on {} failed after {} retries: {}",
                                op_name,
                                key,
                                backend,
                                backoff.retries(),
                                e
                            );
                            self.health.record_failure(backend, &e.to_string());
                            return Err(e);
                        }
                    };
                    if deadline.map_or(false, |d| Instant::now() + delay >= d) {
                        debug!("{} {} on {}: no time left to retry", op_name, key, backend);
                        self.health.record_failure(backend, &e.to_string());
                        return Err(e);
                    }
                    warn!(
                        "{} {} on {} failed, retrying in {:?}: {}",
                        op_name, key, backend, delay, e
                    );
                    tokio::time::sleep(delay).await;
                    last_error = Some(e);
                }
                Err(e) => {
                    self.health.record_failure(backend, &e.to_string());
                    return Err(e);
                }
            }
        }
    }

    /// Error for a call the deadline stopped before its next attempt
    ///
    /// A call that already failed transiently reports that failure and counts
    /// it against the backend; otherwise nothing was issued.
    fn cut_short(&self, backend: &BackendId, last_error: Option<Error>) -> Error {
        match last_error {
            Some(e) => {
                self.health.record_failure(backend, &e.to_string());
                e
            }
            None => Error::DeadlineExceeded(backend.to_string()),
        }
    }
}

fn deadline_passed(deadline: Option<Instant>) -> bool {
    deadline.map_or(false, |d| Instant::now() >= d)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Fault, MemoryBackend};
    use crate::health::CircuitState;
    use std::time::Duration;

    fn quick_retry(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            base_delay_ms: 1,
            max_delay_ms: 5,
        }
    }

    fn pool_with(backend: Arc<MemoryBackend>, retry: RetryConfig) -> BackendPool {
        let set = BackendSet::new(vec![backend as Arc<dyn StorageBackend>]).unwrap();
        BackendPool::new(set, Arc::new(HealthTracker::default()), 4, retry)
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let mem = Arc::new(MemoryBackend::new("s3"));
        mem.fail_writes(Fault::Transient { remaining: 2 });
        let pool = pool_with(mem.clone(), quick_retry(3));

        let etag = pool
            .put(&BackendId::from("s3"), "objects/a", Bytes::from_static(b"a"), None)
            .await
            .unwrap();

        assert!(!etag.is_empty());
        assert_eq!(mem.put_attempts(), 3);
        assert_eq!(mem.put_count("objects/a"), 1);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let mem = Arc::new(MemoryBackend::new("s3"));
        mem.fail_writes(Fault::Unavailable);
        let pool = pool_with(mem.clone(), quick_retry(2));

        let err = pool
            .put(&BackendId::from("s3"), "objects/a", Bytes::from_static(b"a"), None)
            .await
            .unwrap_err();

        assert!(err.is_transient());
        assert_eq!(mem.put_attempts(), 3);
    }

    #[tokio::test]
    async fn test_permanent_errors_are_not_retried() {
        let mem = Arc::new(MemoryBackend::new("gcs"));
        mem.fail_writes(Fault::Permanent("access denied".to_string()));
        let pool = pool_with(mem.clone(), quick_retry(5));

        let err = pool
            .put(&BackendId::from("gcs"), "objects/a", Bytes::from_static(b"a"), None)
            .await
            .unwrap_err();

        assert!(err.is_permanent_backend());
        assert_eq!(mem.put_attempts(), 1);
    }

    #[tokio::test]
    async fn test_not_found_does_not_hurt_health() {
        let mem = Arc::new(MemoryBackend::new("s3"));
        let pool = pool_with(mem, quick_retry(3));
        let id = BackendId::from("s3");

        for _ in 0..10 {
            assert!(matches!(
                pool.get(&id, "objects/missing", None).await,
                Err(Error::ObjectNotFound { .. })
            ));
        }
        let health = pool.health().backend_health(&id).unwrap();
        assert_eq!(health.failed_operations, 0);
    }

    #[tokio::test]
    async fn test_open_circuit_skips_backend() {
        let mem = Arc::new(MemoryBackend::new("s3"));
        mem.fail_all(Fault::Permanent("gone".to_string()));
        let set = BackendSet::new(vec![mem.clone() as Arc<dyn StorageBackend>]).unwrap();
        let health = Arc::new(HealthTracker::new(2, Duration::from_secs(600)));
        let pool = BackendPool::new(set, health.clone(), 4, quick_retry(0));
        let id = BackendId::from("s3");

        let _ = pool.exists(&id, "k", None).await;
        let _ = pool.exists(&id, "k", None).await;
        assert_eq!(health.circuit(&id), CircuitState::Open);
        assert!(!pool.is_available(&id));

        mem.clear_faults();
        let err = pool.exists(&id, "k", None).await.unwrap_err();
        assert!(matches!(err, Error::PermanentBackend { ref reason, .. } if reason == "circuit open"));
    }

    #[tokio::test]
    async fn test_expired_deadline_issues_no_call() {
        let mem = Arc::new(MemoryBackend::new("s3"));
        let pool = pool_with(mem.clone(), quick_retry(3));

        let past = Instant::now() - Duration::from_millis(1);
        let err = pool
            .put(&BackendId::from("s3"), "k", Bytes::from_static(b"x"), Some(past))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::DeadlineExceeded(_)));
        assert_eq!(mem.put_attempts(), 0);
    }

    #[tokio::test]
    async fn test_queued_call_past_deadline_is_not_issued() {
        let mem = Arc::new(MemoryBackend::new("s3"));
        mem.set_latency(Duration::from_millis(200));
        let set = BackendSet::new(vec![mem.clone() as Arc<dyn StorageBackend>]).unwrap();
        let pool = BackendPool::new(set, Arc::new(HealthTracker::default()), 1, quick_retry(0));
        let id = BackendId::from("s3");

        let deadline = Instant::now() + Duration::from_millis(100);
        let (first, second) = tokio::join!(
            pool.put(&id, "objects/a", Bytes::from_static(b"a"), Some(deadline)),
            pool.put(&id, "objects/b", Bytes::from_static(b"b"), Some(deadline)),
        );

        let results = [first, second];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert_eq!(
            results
                .iter()
                .filter(|r| matches!(r, Err(Error::DeadlineExceeded(_))))
                .count(),
            1
        );
        assert_eq!(mem.put_attempts(), 1);
    }

    #[tokio::test]
    async fn test_retried_burst_does_not_open_circuit() {
        let mem = Arc::new(MemoryBackend::new("s3"));
        mem.fail_writes(Fault::Transient { remaining: 2 });
        let set = BackendSet::new(vec![mem.clone() as Arc<dyn StorageBackend>]).unwrap();
        let health = Arc::new(HealthTracker::new(2, Duration::from_secs(600)));
        let pool = BackendPool::new(set, health.clone(), 4, quick_retry(3));
        let id = BackendId::from("s3");

        pool.put(&id, "objects/a", Bytes::from_static(b"a"), None)
            .await
            .unwrap();

        assert_eq!(mem.put_attempts(), 3);
        assert_eq!(health.circuit(&id), CircuitState::Closed);
        assert_eq!(health.backend_health(&id).unwrap().failed_operations, 0);
    }

    #[tokio::test]
    async fn test_exhausted_retries_count_once() {
        let mem = Arc::new(MemoryBackend::new("s3"));
        mem.fail_writes(Fault::Unavailable);
        let set = BackendSet::new(vec![mem.clone() as Arc<dyn StorageBackend>]).unwrap();
        let health = Arc::new(HealthTracker::new(2, Duration::from_secs(600)));
        let pool = BackendPool::new(set, health.clone(), 4, quick_retry(4));
        let id = BackendId::from("s3");

        assert!(pool
            .put(&id, "objects/a", Bytes::from_static(b"a"), None)
            .await
            .is_err());
        assert_eq!(mem.put_attempts(), 5);
        assert_eq!(health.backend_health(&id).unwrap().failed_operations, 1);
        assert_eq!(health.circuit(&id), CircuitState::Closed);

        // A second exhausted call reaches the threshold
        let _ = pool.put(&id, "objects/a", Bytes::from_static(b"a"), None).await;
        assert_eq!(health.circuit(&id), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_unknown_backend() {
        let pool = pool_with(Arc::new(MemoryBackend::new("s3")), quick_retry(0));
        assert!(matches!(
            pool.get(&BackendId::from("azure"), "k", None).await,
            Err(Error::UnknownBackend(_))
        ));
    }
}
