//! In-memory backend with fault injection
//!
//! Used by tests and dry runs. Faults can be injected separately for writes
//! and reads, objects can be corrupted or removed behind the engine's back,
//! and every successful write is counted per key.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use super::{BackendId, BackendKind, ETag, StorageBackend};
use crate::checksum;
use crate::error::{Error, Result};

/// A failure to inject into backend calls
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// Fail the next `remaining` calls with a transient error, then recover
    Transient { remaining: u32 },
    /// Fail every call with a transient error
    Unavailable,
    /// Fail every call with a permanent error
    Permanent(String),
}

#[derive(Default)]
struct State {
    objects: BTreeMap<String, Bytes>,
    put_counts: HashMap<String, usize>,
    total_puts: usize,
    put_attempts: usize,
    get_attempts: usize,
    write_fault: Option<Fault>,
    read_fault: Option<Fault>,
    latency: Option<Duration>,
}

/// Backend keeping objects in a map
pub struct MemoryBackend {
    id: BackendId,
    kind: BackendKind,
    state: Mutex<State>,
}

impl MemoryBackend {
    pub fn new(id: impl Into<BackendId>) -> Self {
        MemoryBackend {
            id: id.into(),
            kind: BackendKind::Memory,
            state: Mutex::new(State::default()),
        }
    }

    /// Pretend to be another provider family (affects key naming only)
    pub fn with_kind(mut self, kind: BackendKind) -> Self {
        self.kind = kind;
        self
    }

    /// Inject a fault into put/delete
    pub fn fail_writes(&self, fault: Fault) {
        self.state.lock().write_fault = Some(fault);
    }

    /// Inject a fault into get/exists/list
    pub fn fail_reads(&self, fault: Fault) {
        self.state.lock().read_fault = Some(fault);
    }

    /// Inject the same fault into every call
    pub fn fail_all(&self, fault: Fault) {
        let mut state = self.state.lock();
        state.write_fault = Some(fault.clone());
        state.read_fault = Some(fault);
    }

    pub fn clear_faults(&self) {
        let mut state = self.state.lock();
        state.write_fault = None;
        state.read_fault = None;
    }

    /// Delay every call by `latency`
    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().latency = Some(latency);
    }

    /// Flip the first byte of a stored object; returns false if absent
    pub fn corrupt(&self, key: &str) -> bool {
        let mut state = self.state.lock();
        let Some(data) = state.objects.get(key).cloned() else {
            return false;
        };
        let mut bytes = data.to_vec();
        match bytes.first_mut() {
            Some(b) => *b ^= 0xFF,
            None => bytes.push(0xFF),
        }
        state.objects.insert(key.to_string(), Bytes::from(bytes));
        true
    }

    /// Drop an object without going through `delete`
    pub fn remove(&self, key: &str) -> Option<Bytes> {
        self.state.lock().objects.remove(key)
    }

    /// Store an object without counting it as a write
    pub fn insert(&self, key: &str, data: Bytes) {
        self.state.lock().objects.insert(key.to_string(), data);
    }

    /// Current contents of `key`
    pub fn object(&self, key: &str) -> Option<Bytes> {
        self.state.lock().objects.get(key).cloned()
    }

    /// All stored keys, sorted
    pub fn keys(&self) -> Vec<String> {
        self.state.lock().objects.keys().cloned().collect()
    }

    /// Successful writes to `key`
    pub fn put_count(&self, key: &str) -> usize {
        self.state.lock().put_counts.get(key).copied().unwrap_or(0)
    }

    /// Successful writes to any key
    pub fn total_puts(&self) -> usize {
        self.state.lock().total_puts
    }

    /// Put calls including failed ones
    pub fn put_attempts(&self) -> usize {
        self.state.lock().put_attempts
    }

    /// Get calls including failed ones
    pub fn get_attempts(&self) -> usize {
        self.state.lock().get_attempts
    }

    fn latency(&self) -> Option<Duration> {
        self.state.lock().latency
    }

    async fn simulate_latency(&self) {
        if let Some(latency) = self.latency() {
            tokio::time::sleep(latency).await;
        }
    }

    fn check_fault(&self, slot: &mut Option<Fault>) -> Result<()> {
        match slot {
            None => Ok(()),
            Some(Fault::Transient { remaining }) => {
                if *remaining == 0 {
                    *slot = None;
                    return Ok(());
                }
                *remaining -= 1;
                if *remaining == 0 {
                    *slot = None;
                }
                Err(Error::TransientBackend {
                    backend: self.id.to_string(),
                    reason: "injected transient fault".to_string(),
                })
            }
            Some(Fault::Unavailable) => Err(Error::TransientBackend {
                backend: self.id.to_string(),
                reason: "backend unavailable".to_string(),
            }),
            Some(Fault::Permanent(reason)) => Err(Error::PermanentBackend {
                backend: self.id.to_string(),
                reason: reason.clone(),
            }),
        }
    }

    fn check_write(&self) -> Result<()> {
        let mut state = self.state.lock();
        let mut slot = state.write_fault.take();
        let result = self.check_fault(&mut slot);
        state.write_fault = slot;
        result
    }

    fn check_read(&self) -> Result<()> {
        let mut state = self.state.lock();
        let mut slot = state.read_fault.take();
        let result = self.check_fault(&mut slot);
        state.read_fault = slot;
        result
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    fn id(&self) -> &BackendId {
        &self.id
    }

    fn kind(&self) -> BackendKind {
        self.kind
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<ETag> {
        self.simulate_latency().await;
        self.state.lock().put_attempts += 1;
        self.check_write()?;

        let etag = checksum::sha256_hex(&data);
        let mut state = self.state.lock();
        state.objects.insert(key.to_string(), data);
        *state.put_counts.entry(key.to_string()).or_insert(0) += 1;
        state.total_puts += 1;
        Ok(etag)
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        self.simulate_latency().await;
        self.state.lock().get_attempts += 1;
        self.check_read()?;

        self.state
            .lock()
            .objects
            .get(key)
            .cloned()
            .ok_or_else(|| Error::ObjectNotFound {
                backend: self.id.to_string(),
                key: key.to_string(),
            })
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        self.simulate_latency().await;
        self.check_read()?;

        Ok(self
            .state
            .lock()
            .objects
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.simulate_latency().await;
        self.check_write()?;
        self.state.lock().objects.remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.simulate_latency().await;
        self.check_read()?;
        Ok(self.state.lock().objects.contains_key(key))
    }
}
