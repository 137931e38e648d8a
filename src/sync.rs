//! Sync manager
//!
//! Uploads files to their placement (whole-file replicas or erasure-coded
//! fragments), enforces the redundancy threshold, and downloads files back
//! from whichever backends still hold intact copies.

use std::collections::{HashSet, VecDeque};
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::backend::{fragment_key, object_key, BackendId, ETag};
use crate::checksum;
use crate::erasure::{Encoder, ErasureConfig, Fragment, StripePlanner};
use crate::error::{Error, Result};
use crate::index::{FileId, FileIndex, FragmentEntry, IndexRecord, Layout, Target, TargetStatus};
use crate::oplog::{EventSink, OpScope, Operation, Outcome};
use crate::policy::{file_type_of, Placement, PolicyEngine};
use crate::pool::BackendPool;

/// What an upload did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadOutcome {
    /// Content unchanged and every copy present; nothing written
    Skipped,
    /// Whole-file replicas written
    Replicated,
    /// Erasure-coded fragments written
    Fragmented,
}

/// Result of a successful upload
#[derive(Debug, Clone)]
pub struct UploadReport {
    pub identity: FileId,
    pub content_hash: String,
    pub outcome: UploadOutcome,
    /// Replicas or fragments now stored
    pub stored: usize,
    /// Replicas or fragments required for success
    pub required: usize,
    /// Backends excluded from this upload after a permanent error
    pub degraded: Vec<BackendId>,
}

/// One object to write
struct PendingWrite {
    slot: usize,
    backend: BackendId,
    key: String,
    data: Bytes,
}

struct WriteResult {
    slot: usize,
    backend: BackendId,
    result: Result<ETag>,
}

struct WriteRound {
    results: Vec<WriteResult>,
    timed_out: bool,
}

impl WriteRound {
    /// Backends with at least one successful write, in first-success order
    fn completed(&self) -> Vec<String> {
        let mut done: Vec<String> = Vec::new();
        for r in &self.results {
            let name = r.backend.to_string();
            if r.result.is_ok() && !done.contains(&name) {
                done.push(name);
            }
        }
        done
    }
}

/// Outcome of fetching one fragment
struct FragmentFetch {
    fragment: Option<Fragment>,
    /// The assigned copy is missing or corrupt
    suspect: bool,
    timed_out: bool,
}

fn deadline_passed(deadline: Option<Instant>) -> bool {
    deadline.map_or(false, |d| Instant::now() >= d)
}

/// Uploads and downloads files across the backend pool
pub struct SyncManager {
    pool: Arc<BackendPool>,
    index: Arc<FileIndex>,
    policy: Arc<PolicyEngine>,
    erasure: ErasureConfig,
    min_replicas: usize,
    sink: Arc<dyn EventSink>,
}

impl SyncManager {
    pub fn new(
        pool: Arc<BackendPool>,
        index: Arc<FileIndex>,
        policy: Arc<PolicyEngine>,
        erasure: ErasureConfig,
        min_replicas: usize,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        SyncManager {
            pool,
            index,
            policy,
            erasure,
            min_replicas: min_replicas.max(1),
            sink,
        }
    }

    /// Upload a file from disk
    pub async fn upload_file(&self, path: &Path, deadline: Option<Instant>) -> Result<UploadReport> {
        let identity = FileId::from_path(path)?;
        let data = tokio::fs::read(path).await?;
        let modified_at = tokio::fs::metadata(path)
            .await?
            .modified()
            .ok()
            .map(DateTime::<Utc>::from);

        self.upload_data(
            identity,
            Bytes::from(data),
            &file_type_of(path),
            modified_at,
            deadline,
        )
        .await
    }

    /// Upload in-memory content under a logical identity
    ///
    /// Holds the identity's lock for the whole upload.
    pub async fn upload_data(
        &self,
        identity: FileId,
        data: Bytes,
        file_type: &str,
        modified_at: Option<DateTime<Utc>>,
        deadline: Option<Instant>,
    ) -> Result<UploadReport> {
        let _guard = self.index.lock(&identity).await;
        let scope = OpScope::begin(self.sink.clone(), Operation::Upload, identity.as_str());

        let result = self
            .upload_locked(&identity, data, file_type, modified_at, deadline, &scope)
            .await;
        match &result {
            Ok(report) => {
                let outcome = match report.outcome {
                    UploadOutcome::Skipped => Outcome::Skipped,
                    _ if !report.degraded.is_empty() => Outcome::Degraded,
                    _ => Outcome::Success,
                };
                scope.finish(
                    outcome,
                    format!("{:?}: {} of {} stored", report.outcome, report.stored, report.required),
                );
            }
            Err(e) => scope.fail(e),
        }
        result
    }

    async fn upload_locked(
        &self,
        identity: &FileId,
        data: Bytes,
        file_type: &str,
        modified_at: Option<DateTime<Utc>>,
        deadline: Option<Instant>,
        scope: &OpScope,
    ) -> Result<UploadReport> {
        let content_hash = checksum::sha256_hex(&data);
        let existing = self.index.get(identity)?;

        if let Some(record) = existing.as_ref().filter(|r| r.content_hash == content_hash) {
            if self.all_targets_exist(record, deadline).await {
                debug!("{} unchanged, skipping upload", identity);
                return Ok(UploadReport {
                    identity: identity.clone(),
                    content_hash,
                    outcome: UploadOutcome::Skipped,
                    stored: record.stored_count(),
                    required: self.required_for(record),
                    degraded: Vec::new(),
                });
            }
            info!("{} unchanged but copies are missing, re-uploading", identity);
        }

        // Same content keeps its placement for the whole generation
        let placement = match existing.as_ref() {
            Some(r) if r.content_hash == content_hash => r.placement.clone(),
            _ => self.policy.select(file_type, data.len() as u64),
        };
        if placement.is_empty() {
            return Err(Error::InvalidConfig(format!(
                "no backends selected for {}",
                identity
            )));
        }

        let size = data.len() as u64;
        let (layout, writes, required) = if self.erasure.should_fragment(size) {
            self.plan_fragments(&content_hash, &data, &placement)?
        } else {
            self.plan_replicas(&content_hash, &data, &placement)
        };

        info!(
            "Uploading {} ({} bytes) as {} writes to {:?}",
            identity,
            size,
            writes.len(),
            placement.backends()
        );

        let round = self.write_all(writes, deadline, scope).await;

        let mut layout = layout;
        let mut degraded = Vec::new();
        apply_writes(&mut layout, &round, &mut degraded);
        let stored = layout_targets(&layout).iter().filter(|t| t.is_stored()).count();

        if stored > 0 {
            let now = Utc::now();
            let (generation, created_at) = match existing.as_ref() {
                Some(r) if r.content_hash == content_hash => (r.generation, r.created_at),
                Some(r) => (r.generation + 1, r.created_at),
                None => (1, now),
            };
            let fragmented = matches!(layout, Layout::Fragmented { .. });
            let record = IndexRecord {
                identity: identity.clone(),
                content_hash: content_hash.clone(),
                size,
                file_type: file_type.to_lowercase(),
                modified_at,
                placement,
                layout,
                generation,
                created_at,
                updated_at: now,
                last_verified_at: None,
            };
            self.index.put(&record)?;
            debug!(
                "Recorded {} generation {} ({} of {} {} stored)",
                identity,
                generation,
                stored,
                record.targets().len(),
                if fragmented { "fragments" } else { "replicas" }
            );

            if round.timed_out {
                return Err(Error::Timeout {
                    completed: round.completed(),
                });
            }
            if stored < required {
                warn!(
                    "Upload of {} degraded: {} of {} required placements",
                    identity, stored, required
                );
                return Err(Error::RedundancyUnmet {
                    achieved: stored,
                    required,
                });
            }

            return Ok(UploadReport {
                identity: identity.clone(),
                content_hash,
                outcome: if fragmented {
                    UploadOutcome::Fragmented
                } else {
                    UploadOutcome::Replicated
                },
                stored,
                required,
                degraded,
            });
        }

        if round.timed_out {
            return Err(Error::Timeout {
                completed: Vec::new(),
            });
        }
        Err(Error::RedundancyUnmet {
            achieved: 0,
            required,
        })
    }

    fn required_for(&self, record: &IndexRecord) -> usize {
        match &record.layout {
            Layout::Replicated { .. } => self.min_replicas,
            Layout::Fragmented { k, .. } => *k,
        }
    }

    /// Whether every target of `record` reports `exists`
    async fn all_targets_exist(&self, record: &IndexRecord, deadline: Option<Instant>) -> bool {
        let checks = record
            .targets()
            .into_iter()
            .map(|t| async move { self.pool.exists(&t.backend, &t.key, deadline).await });
        join_all(checks)
            .await
            .into_iter()
            .all(|r| matches!(r, Ok(true)))
    }

    fn plan_replicas(
        &self,
        content_hash: &str,
        data: &Bytes,
        placement: &Placement,
    ) -> (Layout, Vec<PendingWrite>, usize) {
        let key = object_key(content_hash);
        let mut replicas = Vec::with_capacity(placement.len());
        let mut writes = Vec::with_capacity(placement.len());

        for (slot, backend) in placement.backends().iter().enumerate() {
            replicas.push(Target::pending(
                backend.clone(),
                key.clone(),
                content_hash.to_string(),
            ));
            writes.push(PendingWrite {
                slot,
                backend: backend.clone(),
                key: key.clone(),
                data: data.clone(),
            });
        }

        (Layout::Replicated { replicas }, writes, self.min_replicas)
    }

    fn plan_fragments(
        &self,
        content_hash: &str,
        data: &Bytes,
        placement: &Placement,
    ) -> Result<(Layout, Vec<PendingWrite>, usize)> {
        let encoder = Encoder::from_config(&self.erasure)?;
        let encoded = encoder.encode(data)?;
        let planner = StripePlanner::new(encoder.data_fragments(), encoder.total_fragments());
        let assignment = planner.assign_round_robin(placement.backends())?;

        let mut fragments = Vec::with_capacity(encoded.fragments.len());
        let mut writes = Vec::with_capacity(encoded.fragments.len());

        let (k, m) = (encoder.data_fragments(), encoder.parity_fragments());
        for (fragment, backend) in encoded.fragments.into_iter().zip(assignment) {
            let key = fragment_key(content_hash, k, m, fragment.index);
            fragments.push(FragmentEntry {
                index: fragment.index,
                role: fragment.role,
                target: Target::pending(backend.clone(), key.clone(), fragment.checksum.clone()),
            });
            writes.push(PendingWrite {
                slot: fragment.index,
                backend,
                key,
                data: fragment.data,
            });
        }

        let layout = Layout::Fragmented {
            k,
            m,
            shard_len: encoded.shard_len,
            padding: encoded.padding,
            fragments,
        };
        Ok((layout, writes, k))
    }

    /// Issue all writes concurrently, collecting results until the deadline
    ///
    /// Writes still in flight at the deadline keep running but their results
    /// are not collected. A permanent error excludes the backend from the
    /// writes of this round that have not started yet.
    async fn write_all(
        &self,
        writes: Vec<PendingWrite>,
        deadline: Option<Instant>,
        scope: &OpScope,
    ) -> WriteRound {
        let excluded: Arc<Mutex<HashSet<BackendId>>> = Arc::default();
        let mut tasks = FuturesUnordered::new();

        for write in writes {
            let pool = self.pool.clone();
            let excluded = excluded.clone();
            let (slot, backend) = (write.slot, write.backend.clone());
            let handle = tokio::spawn(async move {
                let skip = excluded.lock().contains(&write.backend);
                let result = if skip {
                    Err(Error::PermanentBackend {
                        backend: write.backend.to_string(),
                        reason: "excluded for this operation".to_string(),
                    })
                } else {
                    let result = pool.put(&write.backend, &write.key, write.data, deadline).await;
                    if matches!(&result, Err(e) if e.is_permanent_backend()) {
                        excluded.lock().insert(write.backend.clone());
                    }
                    result
                };
                WriteResult {
                    slot: write.slot,
                    backend: write.backend,
                    result,
                }
            });
            tasks.push(async move { (slot, backend, handle.await) });
        }

        let mut results = Vec::new();
        let mut timed_out = false;
        loop {
            let next = match deadline {
                Some(d) => match tokio::time::timeout_at(d, tasks.next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        timed_out = true;
                        break;
                    }
                },
                None => tasks.next().await,
            };

            match next {
                None => break,
                Some((_, _, Ok(write))) => {
                    match &write.result {
                        Ok(_) => scope.backend(&write.backend, Outcome::Success, format!("stored slot {}", write.slot)),
                        Err(Error::DeadlineExceeded(_)) => timed_out = true,
                        Err(e) => {
                            if e.is_permanent_backend() {
                                warn!("Degraded placement: {} excluded: {}", write.backend, e);
                            }
                            scope.backend_error(&write.backend, e);
                        }
                    }
                    results.push(write);
                }
                Some((slot, backend, Err(e))) => {
                    let error = Error::Internal(format!("upload task for slot {} failed: {}", slot, e));
                    warn!("Upload task on {} failed: {}", backend, e);
                    scope.backend_error(&backend, &error);
                    results.push(WriteResult {
                        slot,
                        backend,
                        result: Err(error),
                    });
                }
            }
        }

        WriteRound { results, timed_out }
    }

    /// Download a file by identity
    pub async fn download_file(&self, identity: &FileId, deadline: Option<Instant>) -> Result<Bytes> {
        let scope = OpScope::begin(self.sink.clone(), Operation::Download, identity.as_str());

        let result = match self.index.require(identity) {
            Ok(record) => match &record.layout {
                Layout::Replicated { replicas } => {
                    self.download_replicated(&record, replicas, deadline, &scope).await
                }
                Layout::Fragmented {
                    k,
                    m,
                    shard_len,
                    padding,
                    fragments,
                } => {
                    self.download_fragmented(
                        &record, *k, *m, *shard_len, *padding, fragments, deadline, &scope,
                    )
                    .await
                }
            },
            Err(e) => Err(e),
        };

        match &result {
            Ok(data) => scope.finish(Outcome::Success, format!("{} bytes", data.len())),
            Err(e) => scope.fail(e),
        }
        result
    }

    async fn download_replicated(
        &self,
        record: &IndexRecord,
        replicas: &[Target],
        deadline: Option<Instant>,
        scope: &OpScope,
    ) -> Result<Bytes> {
        // Stored copies first, then anything else in placement order
        let mut ordered: Vec<&Target> = replicas.iter().filter(|t| t.is_stored()).collect();
        ordered.extend(replicas.iter().filter(|t| !t.is_stored()));

        let mut suspects = Vec::new();
        let mut found = None;
        let mut timed_out = false;

        for target in ordered {
            if deadline_passed(deadline) {
                timed_out = true;
                break;
            }
            if !self.pool.is_available(&target.backend) {
                scope.backend(&target.backend, Outcome::Degraded, "circuit open, skipped");
                continue;
            }

            match self.pool.exists(&target.backend, &target.key, deadline).await {
                Ok(true) => {}
                Ok(false) => {
                    scope.backend(&target.backend, Outcome::Failure, "replica missing");
                    suspects.push((target.backend.clone(), target.key.clone(), "replica missing"));
                    continue;
                }
                Err(Error::DeadlineExceeded(_)) => {
                    timed_out = true;
                    break;
                }
                Err(e) => {
                    scope.backend_error(&target.backend, &e);
                    continue;
                }
            }

            match self.pool.get(&target.backend, &target.key, deadline).await {
                Ok(data) if checksum::matches(&data, &target.checksum) => {
                    scope.backend(&target.backend, Outcome::Success, "replica read");
                    found = Some(data);
                    break;
                }
                Ok(_) => {
                    warn!(
                        "Replica of {} on {} failed checksum verification",
                        record.identity, target.backend
                    );
                    scope.backend(&target.backend, Outcome::Failure, "checksum mismatch");
                    suspects.push((target.backend.clone(), target.key.clone(), "checksum mismatch"));
                }
                Err(Error::DeadlineExceeded(_)) => {
                    timed_out = true;
                    break;
                }
                Err(e @ Error::ObjectNotFound { .. }) => {
                    scope.backend_error(&target.backend, &e);
                    suspects.push((target.backend.clone(), target.key.clone(), "replica missing"));
                }
                Err(e) => scope.backend_error(&target.backend, &e),
            }
        }

        self.mark_suspects(&record.identity, &suspects)?;

        match found {
            Some(data) => Ok(data),
            None if timed_out => Err(Error::Timeout {
                completed: Vec::new(),
            }),
            None => Err(Error::FileUnrecoverable {
                identity: record.identity.to_string(),
                available: 0,
                required: 1,
            }),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn download_fragmented(
        &self,
        record: &IndexRecord,
        k: usize,
        m: usize,
        shard_len: usize,
        padding: usize,
        fragments: &[FragmentEntry],
        deadline: Option<Instant>,
        scope: &OpScope,
    ) -> Result<Bytes> {
        let alternates = self.fallback_backends(&record.placement);

        // Stored fragments in index order (data first), then the rest
        let mut queue: VecDeque<&FragmentEntry> =
            fragments.iter().filter(|f| f.target.is_stored()).collect();
        queue.extend(fragments.iter().filter(|f| !f.target.is_stored()));

        let mut valid: Vec<Fragment> = Vec::with_capacity(k);
        let mut suspects = Vec::new();
        let mut timed_out = false;

        while valid.len() < k && !timed_out {
            let want = k - valid.len();
            let wave: Vec<&FragmentEntry> = (0..want).filter_map(|_| queue.pop_front()).collect();
            if wave.is_empty() {
                break;
            }

            let fetched = join_all(
                wave.iter()
                    .map(|entry| self.fetch_fragment(entry, &alternates, deadline, scope)),
            )
            .await;

            for (entry, fetch) in wave.iter().zip(fetched) {
                if fetch.suspect {
                    suspects.push((
                        entry.target.backend.clone(),
                        entry.target.key.clone(),
                        "fragment missing or corrupt",
                    ));
                }
                timed_out |= fetch.timed_out;
                if let Some(fragment) = fetch.fragment {
                    valid.push(fragment);
                }
            }
        }

        self.mark_suspects(&record.identity, &suspects)?;

        if valid.len() < k {
            if timed_out {
                return Err(Error::Timeout {
                    completed: Vec::new(),
                });
            }
            warn!(
                "{} unrecoverable: {} valid fragments of {} required",
                record.identity,
                valid.len(),
                k
            );
            return Err(Error::FileUnrecoverable {
                identity: record.identity.to_string(),
                available: valid.len(),
                required: k,
            });
        }

        let encoder = Encoder::new(k, m)?;
        let data = encoder.decode(&valid, shard_len, padding)?;
        if !checksum::matches(&data, &record.content_hash) {
            return Err(Error::ErasureDecode(format!(
                "reconstructed content of {} does not match its hash",
                record.identity
            )));
        }
        Ok(Bytes::from(data))
    }

    /// Placement backends followed by every other configured backend
    fn fallback_backends(&self, placement: &Placement) -> Vec<BackendId> {
        let mut order: Vec<BackendId> = placement.backends().to_vec();
        for id in self.pool.ids() {
            if !order.contains(&id) {
                order.push(id);
            }
        }
        order
    }

    /// Fetch one fragment, trying its assigned backend first
    async fn fetch_fragment(
        &self,
        entry: &FragmentEntry,
        alternates: &[BackendId],
        deadline: Option<Instant>,
        scope: &OpScope,
    ) -> FragmentFetch {
        let assigned = &entry.target.backend;
        let mut fetch = FragmentFetch {
            fragment: None,
            suspect: false,
            timed_out: false,
        };

        let order = std::iter::once(assigned).chain(alternates.iter().filter(|b| *b != assigned));
        for backend in order {
            if deadline_passed(deadline) {
                fetch.timed_out = true;
                break;
            }
            if !self.pool.is_available(backend) {
                continue;
            }

            match self.pool.get(backend, &entry.target.key, deadline).await {
                Ok(data) => {
                    let fragment = Fragment::with_checksum(
                        entry.index,
                        entry.role,
                        data,
                        entry.target.checksum.clone(),
                    );
                    match fragment.verify() {
                        Ok(()) => {
                            scope.backend(backend, Outcome::Success, format!("fragment {}", entry.index));
                            fetch.fragment = Some(fragment);
                            break;
                        }
                        Err(e) => {
                            scope.backend_error(backend, &e);
                            if backend == assigned {
                                fetch.suspect = true;
                            }
                        }
                    }
                }
                Err(Error::DeadlineExceeded(_)) => {
                    fetch.timed_out = true;
                    break;
                }
                Err(e @ Error::ObjectNotFound { .. }) => {
                    if backend == assigned {
                        scope.backend_error(backend, &e);
                        fetch.suspect = true;
                    }
                }
                Err(e) => scope.backend_error(backend, &e),
            }
        }

        fetch
    }

    /// Mark stored copies that failed a read as suspect
    fn mark_suspects(&self, identity: &FileId, suspects: &[(BackendId, String, &str)]) -> Result<()> {
        if suspects.is_empty() {
            return Ok(());
        }

        for (backend, _, reason) in suspects {
            self.pool.health().mark_suspect(backend, reason);
        }

        self.index.update(identity, |record| {
            for (backend, key, _) in suspects {
                if let Some(target) = record.target_mut(backend, key) {
                    if target.status == TargetStatus::Stored {
                        target.status = TargetStatus::Suspect;
                    }
                }
            }
            Ok(())
        })?;
        Ok(())
    }
}

/// Every target of a layout, in slot order
fn layout_targets(layout: &Layout) -> Vec<&Target> {
    match layout {
        Layout::Replicated { replicas } => replicas.iter().collect(),
        Layout::Fragmented { fragments, .. } => fragments.iter().map(|f| &f.target).collect(),
    }
}

/// Copy write results into the layout's targets
fn apply_writes(layout: &mut Layout, round: &WriteRound, degraded: &mut Vec<BackendId>) {
    let mut targets: Vec<&mut Target> = match layout {
        Layout::Replicated { replicas } => replicas.iter_mut().collect(),
        Layout::Fragmented { fragments, .. } => fragments.iter_mut().map(|f| &mut f.target).collect(),
    };

    for write in &round.results {
        let Some(target) = targets.get_mut(write.slot) else {
            continue;
        };
        match &write.result {
            Ok(etag) => target.mark_stored(etag.clone()),
            Err(Error::DeadlineExceeded(_)) => {}
            Err(e) => {
                target.status = TargetStatus::Failed;
                if e.is_permanent_backend() && !degraded.contains(&write.backend) {
                    degraded.push(write.backend.clone());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendSet, Fault, MemoryBackend, StorageBackend};
    use crate::config::RetryConfig;
    use crate::health::HealthTracker;
    use crate::oplog::MemorySink;
    use crate::policy::{PolicyConfig, PolicyRule};
    use std::time::Duration;

    struct Harness {
        sync: SyncManager,
        pool: Arc<BackendPool>,
        policy: Arc<PolicyEngine>,
        index: Arc<FileIndex>,
        backends: Vec<Arc<MemoryBackend>>,
        sink: Arc<MemorySink>,
    }

    fn harness(names: &[&str], rules: Vec<PolicyRule>, erasure: ErasureConfig) -> Harness {
        let backends: Vec<Arc<MemoryBackend>> =
            names.iter().map(|n| Arc::new(MemoryBackend::new(*n))).collect();
        let set = BackendSet::new(
            backends
                .iter()
                .map(|b| b.clone() as Arc<dyn StorageBackend>)
                .collect(),
        )
        .unwrap();
        let ids = set.ids();
        let retry = RetryConfig {
            max_retries: 2,
            base_delay_ms: 1,
            max_delay_ms: 2,
        };
        let pool = Arc::new(BackendPool::new(set, Arc::new(HealthTracker::default()), 8, retry));
        let policy = PolicyEngine::new(
            &PolicyConfig {
                rules,
                default: ids.clone(),
            },
            &ids,
        )
        .unwrap();
        let policy = Arc::new(policy);
        let index = Arc::new(FileIndex::in_memory().unwrap());
        let sink = Arc::new(MemorySink::new());
        let sync = SyncManager::new(
            pool.clone(),
            index.clone(),
            policy.clone(),
            erasure,
            2,
            sink.clone(),
        );
        Harness {
            sync,
            pool,
            policy,
            index,
            backends,
            sink,
        }
    }

    /// Backend whose writes panic inside the upload task
    struct PanickingBackend {
        id: BackendId,
    }

    #[async_trait::async_trait]
    impl StorageBackend for PanickingBackend {
        fn id(&self) -> &BackendId {
            &self.id
        }

        fn kind(&self) -> crate::backend::BackendKind {
            crate::backend::BackendKind::Memory
        }

        async fn put(&self, _key: &str, _data: Bytes) -> Result<ETag> {
            panic!("write path bug");
        }

        async fn get(&self, key: &str) -> Result<Bytes> {
            Err(Error::ObjectNotFound {
                backend: self.id.to_string(),
                key: key.to_string(),
            })
        }

        async fn list(&self, _prefix: &str) -> Result<Vec<String>> {
            Ok(Vec::new())
        }

        async fn delete(&self, _key: &str) -> Result<()> {
            Ok(())
        }

        async fn exists(&self, _key: &str) -> Result<bool> {
            Ok(false)
        }
    }

    fn ids(names: &[&str]) -> Vec<BackendId> {
        names.iter().map(|n| BackendId::from(*n)).collect()
    }

    fn payload(len: usize) -> Bytes {
        Bytes::from((0..len).map(|i| (i % 251) as u8).collect::<Vec<u8>>())
    }

    #[tokio::test]
    async fn test_replicated_upload_and_download() {
        let h = harness(&["s3", "gcs"], vec![], ErasureConfig::default());
        let id = FileId::from("/data/notes.txt");
        let data = payload(10 * 1024);

        let report = h
            .sync
            .upload_data(id.clone(), data.clone(), "txt", None, None)
            .await
            .unwrap();
        assert_eq!(report.outcome, UploadOutcome::Replicated);
        assert_eq!(report.stored, 2);

        let key = object_key(&checksum::sha256_hex(&data));
        assert_eq!(h.backends[0].put_count(&key), 1);
        assert_eq!(h.backends[1].put_count(&key), 1);

        assert_eq!(h.sync.download_file(&id, None).await.unwrap(), data);

        let record = h.index.get(&id).unwrap().unwrap();
        assert_eq!(record.generation, 1);
        assert!(!record.needs_repair());
    }

    #[tokio::test]
    async fn test_dedup_skips_writes() {
        let h = harness(&["s3", "gcs"], vec![], ErasureConfig::default());
        let id = FileId::from("/data/a.txt");
        let data = payload(100);

        h.sync.upload_data(id.clone(), data.clone(), "txt", None, None).await.unwrap();
        let before: usize = h.backends.iter().map(|b| b.total_puts()).sum();

        let report = h.sync.upload_data(id, data, "txt", None, None).await.unwrap();
        assert_eq!(report.outcome, UploadOutcome::Skipped);

        let after: usize = h.backends.iter().map(|b| b.total_puts()).sum();
        assert_eq!(before, after);
        assert!(h
            .sink
            .of(Operation::Upload)
            .iter()
            .any(|e| e.outcome == Outcome::Skipped));
    }

    #[tokio::test]
    async fn test_changed_content_bumps_generation() {
        let h = harness(&["s3", "gcs"], vec![], ErasureConfig::default());
        let id = FileId::from("/data/a.txt");

        h.sync.upload_data(id.clone(), payload(10), "txt", None, None).await.unwrap();
        h.sync.upload_data(id.clone(), payload(20), "txt", None, None).await.unwrap();

        let record = h.index.get(&id).unwrap().unwrap();
        assert_eq!(record.generation, 2);
        assert_eq!(record.size, 20);
    }

    #[tokio::test]
    async fn test_permanent_error_gives_redundancy_unmet() {
        let h = harness(
            &["s3", "gcs"],
            vec![PolicyRule::new("txt", ids(&["s3", "gcs"]))],
            ErasureConfig::default(),
        );
        h.backends[1].fail_writes(Fault::Permanent("access denied".to_string()));
        let id = FileId::from("/data/a.txt");

        let err = h
            .sync
            .upload_data(id.clone(), payload(10 * 1024), "txt", None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RedundancyUnmet { achieved: 1, required: 2 }));
        assert_eq!(h.backends[1].put_attempts(), 1);

        // The successful write is kept and recorded
        let record = h.index.get(&id).unwrap().unwrap();
        assert_eq!(record.targets()[0].status, TargetStatus::Stored);
        assert_eq!(record.targets()[1].status, TargetStatus::Failed);
    }

    #[tokio::test]
    async fn test_fragmented_upload_spreads_round_robin() {
        let erasure = ErasureConfig::new(2, 1).with_threshold(64);
        let h = harness(&["a", "b"], vec![], erasure);
        let id = FileId::from("/data/movie.mp4");
        let data = payload(1000);

        let report = h.sync.upload_data(id.clone(), data.clone(), "mp4", None, None).await.unwrap();
        assert_eq!(report.outcome, UploadOutcome::Fragmented);
        assert_eq!(report.stored, 3);
        assert_eq!(report.required, 2);

        let hash = checksum::sha256_hex(&data);
        assert!(h.backends[0].object(&fragment_key(&hash, 2, 1, 0)).is_some());
        assert!(h.backends[1].object(&fragment_key(&hash, 2, 1, 1)).is_some());
        assert!(h.backends[0].object(&fragment_key(&hash, 2, 1, 2)).is_some());

        h.backends[0].remove(&fragment_key(&hash, 2, 1, 0));
        assert_eq!(h.sync.download_file(&id, None).await.unwrap(), data);

        let record = h.index.get(&id).unwrap().unwrap();
        assert_eq!(record.targets()[0].status, TargetStatus::Suspect);
    }

    #[tokio::test]
    async fn test_fragment_read_falls_back_to_other_backends() {
        let erasure = ErasureConfig::new(2, 1).with_threshold(64);
        let h = harness(&["a", "b", "c"], vec![PolicyRule::new("bin", ids(&["a", "b"]))], erasure);
        let id = FileId::from("/data/x.bin");
        let data = payload(500);

        h.sync.upload_data(id.clone(), data.clone(), "bin", None, None).await.unwrap();
        let hash = checksum::sha256_hex(&data);

        // Fragment 1 moved to an unrelated backend behind the index's back
        let moved = h.backends[1].remove(&fragment_key(&hash, 2, 1, 1)).unwrap();
        h.backends[2].insert(&fragment_key(&hash, 2, 1, 1), moved);
        h.backends[0].remove(&fragment_key(&hash, 2, 1, 2));

        assert_eq!(h.sync.download_file(&id, None).await.unwrap(), data);
    }

    #[tokio::test]
    async fn test_corrupt_replica_marked_suspect_on_read() {
        let h = harness(&["s3", "gcs"], vec![], ErasureConfig::default());
        let id = FileId::from("/data/a.txt");
        let data = payload(64);
        h.sync.upload_data(id.clone(), data.clone(), "txt", None, None).await.unwrap();

        h.backends[0].corrupt(&object_key(&checksum::sha256_hex(&data)));
        assert_eq!(h.sync.download_file(&id, None).await.unwrap(), data);

        let record = h.index.get(&id).unwrap().unwrap();
        assert_eq!(record.targets()[0].status, TargetStatus::Suspect);
        assert_eq!(record.targets()[1].status, TargetStatus::Stored);
    }

    #[tokio::test]
    async fn test_no_valid_replica_is_unrecoverable() {
        let h = harness(&["s3", "gcs"], vec![], ErasureConfig::default());
        let id = FileId::from("/data/a.txt");
        let data = payload(64);
        h.sync.upload_data(id.clone(), data.clone(), "txt", None, None).await.unwrap();

        let key = object_key(&checksum::sha256_hex(&data));
        h.backends[0].remove(&key);
        h.backends[1].corrupt(&key);

        assert!(matches!(
            h.sync.download_file(&id, None).await,
            Err(Error::FileUnrecoverable { .. })
        ));
    }

    #[tokio::test]
    async fn test_unknown_identity() {
        let h = harness(&["s3"], vec![], ErasureConfig::default());
        assert!(matches!(
            h.sync.download_file(&FileId::from("/nope"), None).await,
            Err(Error::FileNotIndexed(_))
        ));
        assert_eq!(h.sink.of(Operation::Download).len(), 1);
    }

    #[tokio::test]
    async fn test_deadline_reports_completed_backends() {
        let h = harness(&["fast", "slow"], vec![], ErasureConfig::default());
        h.backends[1].set_latency(Duration::from_millis(500));
        let id = FileId::from("/data/a.txt");

        let deadline = Instant::now() + Duration::from_millis(100);
        let err = h
            .sync
            .upload_data(id.clone(), payload(32), "txt", None, Some(deadline))
            .await
            .unwrap_err();

        match err {
            Error::Timeout { completed } => assert_eq!(completed, vec!["fast".to_string()]),
            other => panic!("expected timeout, got {other:?}"),
        }

        let record = h.index.get(&id).unwrap().unwrap();
        assert_eq!(record.targets()[0].status, TargetStatus::Stored);
        assert_eq!(record.targets()[1].status, TargetStatus::Pending);
    }

    #[tokio::test]
    async fn test_upload_file_from_disk() {
        let h = harness(&["s3", "gcs"], vec![], ErasureConfig::default());
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Report.TXT");
        std::fs::write(&path, b"quarterly numbers").unwrap();

        let report = h.sync.upload_file(&path, None).await.unwrap();
        let record = h.index.get(&report.identity).unwrap().unwrap();
        assert_eq!(record.file_type, "txt");
        assert!(record.modified_at.is_some());
        assert_eq!(record.identity, FileId::from_path(&path).unwrap());
    }

    #[tokio::test]
    async fn test_same_content_with_different_geometry_keeps_both_files() {
        let h = harness(&["a", "b", "c"], vec![], ErasureConfig::new(2, 1).with_threshold(64));
        let wide = SyncManager::new(
            h.pool.clone(),
            h.index.clone(),
            h.policy.clone(),
            ErasureConfig::new(3, 1).with_threshold(64),
            2,
            h.sink.clone(),
        );
        let data = payload(900);
        let first = FileId::from("/data/a.bin");
        let second = FileId::from("/data/b.bin");

        h.sync.upload_data(first.clone(), data.clone(), "bin", None, None).await.unwrap();
        wide.upload_data(second.clone(), data.clone(), "bin", None, None).await.unwrap();

        let hash = checksum::sha256_hex(&data);
        let narrow_keys: Vec<String> = (0..3).map(|i| fragment_key(&hash, 2, 1, i)).collect();
        let wide_keys: Vec<String> = (0..4).map(|i| fragment_key(&hash, 3, 1, i)).collect();
        assert!(narrow_keys.iter().all(|k| !wide_keys.contains(k)));

        assert_eq!(h.sync.download_file(&first, None).await.unwrap(), data);
        assert_eq!(wide.download_file(&second, None).await.unwrap(), data);
    }

    #[tokio::test]
    async fn test_fragmented_upload_with_exactly_k_fragments_succeeds() {
        let erasure = ErasureConfig::new(2, 1).with_threshold(64);
        let h = harness(&["a", "b", "c"], vec![], erasure);
        h.backends[2].fail_writes(Fault::Permanent("bucket deleted".to_string()));
        let id = FileId::from("/data/x.bin");
        let data = payload(600);

        let report = h.sync.upload_data(id.clone(), data.clone(), "bin", None, None).await.unwrap();
        assert_eq!(report.outcome, UploadOutcome::Fragmented);
        assert_eq!(report.stored, 2);
        assert_eq!(report.required, 2);
        assert_eq!(report.degraded, ids(&["c"]));

        let record = h.index.get(&id).unwrap().unwrap();
        assert_eq!(record.targets()[2].status, TargetStatus::Failed);
        assert_eq!(h.sync.download_file(&id, None).await.unwrap(), data);
    }

    #[tokio::test]
    async fn test_fragmented_upload_below_k_fragments_is_unmet() {
        let erasure = ErasureConfig::new(2, 1).with_threshold(64);
        let h = harness(&["a", "b", "c"], vec![], erasure);
        h.backends[1].fail_writes(Fault::Permanent("access denied".to_string()));
        h.backends[2].fail_writes(Fault::Permanent("bucket deleted".to_string()));
        let id = FileId::from("/data/x.bin");

        let err = h
            .sync
            .upload_data(id.clone(), payload(600), "bin", None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RedundancyUnmet { achieved: 1, required: 2 }));

        let record = h.index.get(&id).unwrap().unwrap();
        assert_eq!(record.stored_count(), 1);
        assert!(record.needs_repair());
    }

    #[tokio::test]
    async fn test_transient_burst_across_fragments_is_absorbed() {
        let erasure = ErasureConfig::new(4, 2).with_threshold(64);
        let h = harness(&["a", "b"], vec![], erasure);
        // Fragments 1, 3 and 5 land on b; five failures fit in their retry budget
        h.backends[1].fail_writes(Fault::Transient { remaining: 5 });
        let id = FileId::from("/data/movie.mp4");
        let data = payload(4000);

        let report = h.sync.upload_data(id.clone(), data.clone(), "mp4", None, None).await.unwrap();
        assert!(report.stored >= 5);
        assert!(report.degraded.is_empty());
        assert!(h.pool.is_available(&BackendId::from("b")));
        assert_eq!(h.sync.download_file(&id, None).await.unwrap(), data);
    }

    #[tokio::test]
    async fn test_panicked_write_task_is_failed_and_logged() {
        let good = Arc::new(MemoryBackend::new("s3"));
        let set = BackendSet::new(vec![
            good.clone() as Arc<dyn StorageBackend>,
            Arc::new(PanickingBackend {
                id: BackendId::from("broken"),
            }),
        ])
        .unwrap();
        let backend_ids = set.ids();
        let retry = RetryConfig {
            max_retries: 1,
            base_delay_ms: 1,
            max_delay_ms: 1,
        };
        let pool = Arc::new(BackendPool::new(set, Arc::new(HealthTracker::default()), 4, retry));
        let policy = PolicyEngine::new(
            &PolicyConfig {
                rules: vec![],
                default: backend_ids.clone(),
            },
            &backend_ids,
        )
        .unwrap();
        let index = Arc::new(FileIndex::in_memory().unwrap());
        let sink = Arc::new(MemorySink::new());
        let sync = SyncManager::new(
            pool,
            index.clone(),
            Arc::new(policy),
            ErasureConfig::default(),
            2,
            sink.clone(),
        );
        let id = FileId::from("/data/a.txt");

        let err = sync
            .upload_data(id.clone(), payload(32), "txt", None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RedundancyUnmet { achieved: 1, required: 2 }));

        let record = index.get(&id).unwrap().unwrap();
        assert_eq!(record.targets()[0].status, TargetStatus::Stored);
        assert_eq!(record.targets()[1].status, TargetStatus::Failed);
        assert!(sink.of(Operation::Upload).iter().any(|e| {
            e.backend == Some(BackendId::from("broken")) && e.outcome == Outcome::Failure
        }));
    }
}
