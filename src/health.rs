//! Backend health monitoring
//!
//! Tracks per-backend failure counters and a circuit breaker. Health is kept
//! in memory only and rebuilt from operation outcomes after a restart.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{info, warn};

use crate::backend::BackendId;

/// Default number of consecutive failures before the circuit opens
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;

/// Default time an open circuit waits before letting a probe through
pub const DEFAULT_OPEN_COOLDOWN: Duration = Duration::from_secs(30);

/// Circuit breaker state of a backend
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Requests flow normally
    Closed,
    /// Requests are refused until the cooldown elapses
    Open,
    /// Cooldown elapsed; the next outcome decides
    HalfOpen,
}

/// Health information for a single backend
#[derive(Debug, Clone, Serialize)]
pub struct BackendHealth {
    pub backend: BackendId,
    pub circuit: CircuitState,
    /// Consecutive failure count
    pub consecutive_failures: u32,
    pub total_operations: u64,
    pub failed_operations: u64,
    /// Times a stored copy on this backend was found corrupt or missing
    pub suspect_marks: u64,
    pub last_error: Option<String>,
    pub last_success: Option<DateTime<Utc>>,
    #[serde(skip)]
    opened_at: Option<Instant>,
}

impl BackendHealth {
    fn new(backend: BackendId) -> Self {
        BackendHealth {
            backend,
            circuit: CircuitState::Closed,
            consecutive_failures: 0,
            total_operations: 0,
            failed_operations: 0,
            suspect_marks: 0,
            last_error: None,
            last_success: None,
            opened_at: None,
        }
    }

    /// Calculate error rate
    pub fn error_rate(&self) -> f64 {
        if self.total_operations == 0 {
            return 0.0;
        }
        self.failed_operations as f64 / self.total_operations as f64
    }
}

/// Health tracker for all configured backends
pub struct HealthTracker {
    backends: RwLock<HashMap<BackendId, BackendHealth>>,
    failure_threshold: u32,
    open_cooldown: Duration,
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new(DEFAULT_FAILURE_THRESHOLD, DEFAULT_OPEN_COOLDOWN)
    }
}

impl HealthTracker {
    /// Create a new health tracker
    pub fn new(failure_threshold: u32, open_cooldown: Duration) -> Self {
        Self {
            backends: RwLock::new(HashMap::new()),
            failure_threshold: failure_threshold.max(1),
            open_cooldown,
        }
    }

    /// Start tracking the given backends with a clean slate
    pub fn register<'a>(&self, ids: impl IntoIterator<Item = &'a BackendId>) {
        let mut backends = self.backends.write();
        for id in ids {
            backends
                .entry(id.clone())
                .or_insert_with(|| BackendHealth::new(id.clone()));
        }
    }

    /// Whether a request to `backend` may be issued now
    ///
    /// An open circuit moves to half-open once the cooldown has elapsed.
    pub fn allow_request(&self, backend: &BackendId) -> bool {
        let mut backends = self.backends.write();
        let health = backends
            .entry(backend.clone())
            .or_insert_with(|| BackendHealth::new(backend.clone()));

        match health.circuit {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let cooled = health
                    .opened_at
                    .map(|at| at.elapsed() >= self.open_cooldown)
                    .unwrap_or(true);
                if cooled {
                    health.circuit = CircuitState::HalfOpen;
                    info!("Backend {} circuit half-open, allowing probe", backend);
                }
                cooled
            }
        }
    }

    /// Record a successful operation for a backend
    pub fn record_success(&self, backend: &BackendId) {
        let mut backends = self.backends.write();
        let health = backends
            .entry(backend.clone())
            .or_insert_with(|| BackendHealth::new(backend.clone()));

        health.total_operations += 1;
        health.consecutive_failures = 0;
        health.last_success = Some(Utc::now());
        if health.circuit != CircuitState::Closed {
            info!("Backend {} recovered, circuit closed", backend);
        }
        health.circuit = CircuitState::Closed;
        health.opened_at = None;
    }

    /// Record a failed operation for a backend
    pub fn record_failure(&self, backend: &BackendId, error: &str) {
        let mut backends = self.backends.write();
        let health = backends
            .entry(backend.clone())
            .or_insert_with(|| BackendHealth::new(backend.clone()));

        health.total_operations += 1;
        health.failed_operations += 1;
        health.consecutive_failures += 1;
        health.last_error = Some(error.to_string());

        let trip = match health.circuit {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => health.consecutive_failures >= self.failure_threshold,
            CircuitState::Open => false,
        };
        if trip {
            warn!(
                "Backend {} circuit open after {} consecutive failures: {}",
                backend, health.consecutive_failures, error
            );
            health.circuit = CircuitState::Open;
            health.opened_at = Some(Instant::now());
        }
    }

    /// Record that a stored copy on `backend` failed verification
    pub fn mark_suspect(&self, backend: &BackendId, reason: &str) {
        let mut backends = self.backends.write();
        let health = backends
            .entry(backend.clone())
            .or_insert_with(|| BackendHealth::new(backend.clone()));
        health.suspect_marks += 1;
        health.last_error = Some(reason.to_string());
    }

    /// Current circuit state of a backend
    pub fn circuit(&self, backend: &BackendId) -> CircuitState {
        self.backends
            .read()
            .get(backend)
            .map(|h| h.circuit)
            .unwrap_or(CircuitState::Closed)
    }

    /// Get health of a specific backend
    pub fn backend_health(&self, backend: &BackendId) -> Option<BackendHealth> {
        self.backends.read().get(backend).cloned()
    }

    /// Health of every tracked backend, sorted by id
    pub fn snapshot(&self) -> Vec<BackendHealth> {
        let mut all: Vec<BackendHealth> = self.backends.read().values().cloned().collect();
        all.sort_by(|a, b| a.backend.cmp(&b.backend));
        all
    }

    /// Forget all failures of a backend (operator override)
    pub fn reset(&self, backend: &BackendId) {
        self.backends
            .write()
            .insert(backend.clone(), BackendHealth::new(backend.clone()));
    }
}
