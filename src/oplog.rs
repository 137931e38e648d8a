//! Operation log
//!
//! Structured events for every upload, download, verification and recovery
//! attempt, success and failure alike. Events of one operation share an id.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::backend::BackendId;
use crate::error::Error;

/// Kind of operation an event belongs to
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Upload,
    Download,
    Verify,
    Recover,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Upload => "upload",
            Operation::Download => "download",
            Operation::Verify => "verify",
            Operation::Recover => "recover",
        };
        f.write_str(name)
    }
}

/// Result of one step or of the whole operation
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Success,
    /// Nothing to do (dedup hit, already healthy)
    Skipped,
    /// Succeeded with reduced redundancy, or a backend was excluded
    Degraded,
    Failure,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Outcome::Success => "success",
            Outcome::Skipped => "skipped",
            Outcome::Degraded => "degraded",
            Outcome::Failure => "failure",
        };
        f.write_str(name)
    }
}

/// One structured log event
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OperationEvent {
    /// Shared by all events of one operation
    pub operation_id: Uuid,
    pub operation: Operation,
    pub identity: String,
    /// Backend the event concerns, `None` for operation-level events
    pub backend: Option<BackendId>,
    pub outcome: Outcome,
    pub detail: String,
    pub timestamp: DateTime<Utc>,
}

/// Destination for operation events
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &OperationEvent);
}

/// Emits events as `tracing` events on target `cloudstripe::oplog`
#[derive(Debug, Default, Clone)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: &OperationEvent) {
        let backend = event.backend.as_ref().map(|b| b.as_str()).unwrap_or("-");
        match event.outcome {
            Outcome::Failure | Outcome::Degraded => warn!(
                target: "cloudstripe::oplog",
                operation_id = %event.operation_id,
                operation = %event.operation,
                identity = %event.identity,
                backend = backend,
                outcome = %event.outcome,
                "{}",
                event.detail
            ),
            Outcome::Success | Outcome::Skipped => info!(
                target: "cloudstripe::oplog",
                operation_id = %event.operation_id,
                operation = %event.operation,
                identity = %event.identity,
                backend = backend,
                outcome = %event.outcome,
                "{}",
                event.detail
            ),
        }
    }
}

/// Forwards events to an mpsc channel for an external consumer
///
/// Events are dropped when the channel is full or closed.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<OperationEvent>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<OperationEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (ChannelSink { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: &OperationEvent) {
        if self.tx.try_send(event.clone()).is_err() {
            warn!("Operation event channel full or closed, dropping event");
        }
    }
}

/// Keeps events in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<OperationEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<OperationEvent> {
        self.events.lock().clone()
    }

    /// Events of one operation kind
    pub fn of(&self, operation: Operation) -> Vec<OperationEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.operation == operation)
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: &OperationEvent) {
        self.events.lock().push(event.clone());
    }
}

/// Sends every event to several sinks
#[derive(Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        FanoutSink { sinks }
    }

    pub fn push(&mut self, sink: Arc<dyn EventSink>) {
        self.sinks.push(sink);
    }
}

impl EventSink for FanoutSink {
    fn emit(&self, event: &OperationEvent) {
        for sink in &self.sinks {
            sink.emit(event);
        }
    }
}

/// Events of one running operation
#[derive(Clone)]
pub struct OpScope {
    sink: Arc<dyn EventSink>,
    operation_id: Uuid,
    operation: Operation,
    identity: String,
}

impl OpScope {
    /// Start a new operation on `identity`
    pub fn begin(sink: Arc<dyn EventSink>, operation: Operation, identity: impl Into<String>) -> Self {
        OpScope {
            sink,
            operation_id: Uuid::new_v4(),
            operation,
            identity: identity.into(),
        }
    }

    pub fn operation_id(&self) -> Uuid {
        self.operation_id
    }

    fn emit(&self, backend: Option<&BackendId>, outcome: Outcome, detail: String) {
        self.sink.emit(&OperationEvent {
            operation_id: self.operation_id,
            operation: self.operation,
            identity: self.identity.clone(),
            backend: backend.cloned(),
            outcome,
            detail,
            timestamp: Utc::now(),
        });
    }

    /// A step against one backend
    pub fn backend(&self, backend: &BackendId, outcome: Outcome, detail: impl Into<String>) {
        self.emit(Some(backend), outcome, detail.into());
    }

    /// A failed step against one backend
    pub fn backend_error(&self, backend: &BackendId, err: &Error) {
        let outcome = if err.is_permanent_backend() {
            Outcome::Degraded
        } else {
            Outcome::Failure
        };
        self.emit(Some(backend), outcome, format!("{}: {}", err.kind(), err));
    }

    /// Final outcome of the operation
    pub fn finish(&self, outcome: Outcome, detail: impl Into<String>) {
        self.emit(None, outcome, detail.into());
    }

    /// Final failure of the operation
    pub fn fail(&self, err: &Error) {
        self.emit(None, Outcome::Failure, format!("{}: {}", err.kind(), err));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_shares_operation_id() {
        let sink = Arc::new(MemorySink::new());
        let scope = OpScope::begin(sink.clone(), Operation::Upload, "/a.txt");

        scope.backend(&BackendId::from("s3"), Outcome::Success, "stored");
        scope.backend_error(
            &BackendId::from("gcs"),
            &Error::PermanentBackend {
                backend: "gcs".to_string(),
                reason: "denied".to_string(),
            },
        );
        scope.finish(Outcome::Degraded, "1 of 2 replicas");

        let events = sink.events();
        assert_eq!(events.len(), 3);
        assert!(events.iter().all(|e| e.operation_id == scope.operation_id()));
        assert_eq!(events[1].outcome, Outcome::Degraded);
        assert!(events[1].detail.starts_with("permanent_backend"));
        assert_eq!(events[2].backend, None);
    }

    #[tokio::test]
    async fn test_channel_sink() {
        let (sink, mut rx) = ChannelSink::new(4);
        let scope = OpScope::begin(Arc::new(sink), Operation::Verify, "/a.txt");
        scope.finish(Outcome::Success, "ok");

        let event = rx.recv().await.unwrap();
        assert_eq!(event.operation, Operation::Verify);
        assert_eq!(event.identity, "/a.txt");
    }

    #[test]
    fn test_fanout() {
        let a = Arc::new(MemorySink::new());
        let b = Arc::new(MemorySink::new());
        let fanout = FanoutSink::new(vec![a.clone(), b.clone(), Arc::new(TracingSink)]);

        let scope = OpScope::begin(Arc::new(fanout), Operation::Recover, "/x");
        scope.fail(&Error::FileNotIndexed("/x".to_string()));

        assert_eq!(a.events().len(), 1);
        assert_eq!(b.of(Operation::Recover).len(), 1);
        assert_eq!(a.events()[0].outcome, Outcome::Failure);
    }
}
