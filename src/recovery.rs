//! Verification and recovery
//!
//! `verify` reads every stored copy of a file back and compares it with the
//! checksum in the index. `recover` rebuilds what verification (or a read)
//! flagged: replicas are copied from a healthy replica, fragments are
//! re-derived from any k healthy fragments. Healthy copies are never
//! rewritten, so repeated recovery converges without extra writes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use futures::future::join_all;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::backend::BackendId;
use crate::checksum;
use crate::erasure::{Encoder, Fragment, StripePlanner};
use crate::error::{Error, Result};
use crate::index::{FileId, FileIndex, FileStatus, IndexRecord, Layout, TargetStatus};
use crate::oplog::{EventSink, OpScope, Operation, Outcome};
use crate::pool::BackendPool;

/// Result of verifying one file
#[derive(Debug, Clone)]
pub struct VerifyReport {
    pub identity: FileId,
    /// Copies read back
    pub checked: usize,
    /// Copies matching their checksum
    pub intact: usize,
    /// (backend, key) of copies found missing, corrupt or unreadable
    pub suspect: Vec<(BackendId, String)>,
    pub status: FileStatus,
}

/// A copy moved to another backend during recovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relocation {
    pub key: String,
    pub from: BackendId,
    pub to: BackendId,
}

/// Result of recovering one file
#[derive(Debug, Clone, Default)]
pub struct RecoveryReport {
    /// (backend, key) of copies rewritten in place
    pub repaired: Vec<(BackendId, String)>,
    pub relocated: Vec<Relocation>,
    /// (backend, key) of copies that could not be restored
    pub unresolved: Vec<(BackendId, String)>,
}

impl RecoveryReport {
    /// Nothing was left to repair
    pub fn is_complete(&self) -> bool {
        self.unresolved.is_empty()
    }

    /// Number of objects written
    pub fn writes(&self) -> usize {
        self.repaired.len() + self.relocated.len()
    }
}

/// Totals of a verification pass over the whole index
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScrubSummary {
    pub files: usize,
    pub healthy: usize,
    pub degraded: usize,
    pub unrecoverable: usize,
    pub errors: usize,
}

/// Totals of a recovery pass over the whole index
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoverySummary {
    pub attempted: usize,
    pub completed: usize,
    pub partial: usize,
    pub unrecoverable: usize,
    pub errors: usize,
}

/// Pending change to one target, applied to the index in one update
#[derive(Debug, Clone)]
struct TargetChange {
    backend: BackendId,
    key: String,
    new_backend: Option<BackendId>,
    status: TargetStatus,
    etag: Option<String>,
}

/// Verifies stored copies and repairs the ones that are missing or corrupt
pub struct RecoveryManager {
    pool: Arc<BackendPool>,
    index: Arc<FileIndex>,
    sink: Arc<dyn EventSink>,
}

impl RecoveryManager {
    pub fn new(pool: Arc<BackendPool>, index: Arc<FileIndex>, sink: Arc<dyn EventSink>) -> Self {
        RecoveryManager { pool, index, sink }
    }

    /// Check every stored copy of a file against the index
    pub async fn verify(&self, identity: &FileId) -> Result<VerifyReport> {
        let _guard = self.index.lock(identity).await;
        let scope = OpScope::begin(self.sink.clone(), Operation::Verify, identity.as_str());

        let result = self.verify_locked(identity, &scope).await;
        match &result {
            Ok(report) if report.suspect.is_empty() => scope.finish(
                Outcome::Success,
                format!("{} of {} copies intact", report.intact, report.checked),
            ),
            Ok(report) => scope.finish(
                Outcome::Degraded,
                format!("{} suspect copies, file {}", report.suspect.len(), report.status),
            ),
            Err(e) => scope.fail(e),
        }
        result
    }

    async fn verify_locked(&self, identity: &FileId, scope: &OpScope) -> Result<VerifyReport> {
        let record = self.index.require(identity)?;
        let targets = record.targets();

        let reads = targets.iter().map(|t| async move {
            match self.pool.get(&t.backend, &t.key, None).await {
                Ok(data) => Ok(checksum::sha256_hex(&data)),
                Err(e) => Err(e),
            }
        });
        let observed: Vec<Result<String>> = join_all(reads).await;

        let mut outcomes: Vec<(BackendId, String, Option<String>, bool)> = Vec::with_capacity(targets.len());
        let mut suspect = Vec::new();
        for (target, result) in targets.iter().zip(observed) {
            match result {
                Ok(hash) => {
                    let intact = hash.eq_ignore_ascii_case(&target.checksum);
                    if intact {
                        scope.backend(&target.backend, Outcome::Success, format!("{} verified", target.key));
                    } else {
                        warn!(
                            "{}: {} on {} has checksum {}, expected {}",
                            identity, target.key, target.backend, hash, target.checksum
                        );
                        scope.backend(&target.backend, Outcome::Failure, format!("{} checksum mismatch", target.key));
                    }
                    outcomes.push((target.backend.clone(), target.key.clone(), Some(hash), intact));
                }
                Err(e) => {
                    warn!("{}: cannot read {} on {}: {}", identity, target.key, target.backend, e);
                    scope.backend_error(&target.backend, &e);
                    outcomes.push((target.backend.clone(), target.key.clone(), None, false));
                }
            }
        }

        for (backend, key, _, intact) in &outcomes {
            if !intact {
                self.pool.health().mark_suspect(backend, "verification failed");
                suspect.push((backend.clone(), key.clone()));
            }
        }

        let now = Utc::now();
        let updated = self.index.update(identity, |rec| {
            rec.last_verified_at = Some(now);
            for (backend, key, hash, intact) in &outcomes {
                if let Some(target) = rec.target_mut(backend, key) {
                    target.last_verified_at = Some(now);
                    target.last_verified_checksum = hash.clone();
                    target.status = if *intact {
                        TargetStatus::Stored
                    } else {
                        TargetStatus::Suspect
                    };
                }
            }
            Ok(())
        })?;

        let intact = outcomes.iter().filter(|o| o.3).count();
        debug!("Verified {}: {} of {} intact", identity, intact, outcomes.len());

        Ok(VerifyReport {
            identity: identity.clone(),
            checked: outcomes.len(),
            intact,
            suspect,
            status: updated.status(),
        })
    }

    /// Repair every copy of a file that is not marked stored
    pub async fn recover(&self, identity: &FileId) -> Result<RecoveryReport> {
        let _guard = self.index.lock(identity).await;
        let scope = OpScope::begin(self.sink.clone(), Operation::Recover, identity.as_str());

        let result = self.recover_locked(identity, &scope).await;
        match &result {
            Ok(report) if report.writes() == 0 && report.is_complete() => {
                scope.finish(Outcome::Skipped, "nothing to repair")
            }
            Ok(report) if report.is_complete() => scope.finish(
                Outcome::Success,
                format!(
                    "{} repaired, {} relocated",
                    report.repaired.len(),
                    report.relocated.len()
                ),
            ),
            Ok(report) => scope.finish(
                Outcome::Degraded,
                format!("{} copies still unresolved", report.unresolved.len()),
            ),
            Err(e) => scope.fail(e),
        }
        result
    }

    async fn recover_locked(&self, identity: &FileId, scope: &OpScope) -> Result<RecoveryReport> {
        let record = self.index.require(identity)?;
        if !record.needs_repair() {
            debug!("{} is healthy, nothing to recover", identity);
            return Ok(RecoveryReport::default());
        }

        info!(
            "Recovering {}: {} of {} copies stored",
            identity,
            record.stored_count(),
            record.targets().len()
        );

        match &record.layout {
            Layout::Replicated { .. } => self.recover_replicas(&record, scope).await,
            Layout::Fragmented { .. } => self.recover_fragments(&record, scope).await,
        }
    }

    async fn recover_replicas(&self, record: &IndexRecord, scope: &OpScope) -> Result<RecoveryReport> {
        let mut changes = Vec::new();
        let mut source: Option<Bytes> = None;

        // Find a healthy replica to copy from
        for target in record.targets().into_iter().filter(|t| t.is_stored()) {
            match self.pool.get(&target.backend, &target.key, None).await {
                Ok(data) if checksum::matches(&data, &target.checksum) => {
                    source = Some(data);
                    break;
                }
                Ok(_) => {
                    scope.backend(&target.backend, Outcome::Failure, "source replica corrupt");
                    self.pool.health().mark_suspect(&target.backend, "checksum mismatch");
                    changes.push(status_change(&target.backend, &target.key, TargetStatus::Suspect));
                }
                Err(e) => {
                    scope.backend_error(&target.backend, &e);
                    if matches!(e, Error::ObjectNotFound { .. }) {
                        changes.push(status_change(&target.backend, &target.key, TargetStatus::Suspect));
                    }
                }
            }
        }

        let Some(data) = source else {
            self.apply_changes(&record.identity, &changes)?;
            error!("{} unrecoverable: no intact replica left", record.identity);
            return Err(Error::FileUnrecoverable {
                identity: record.identity.to_string(),
                available: 0,
                required: 1,
            });
        };

        let suspect_keys: Vec<(BackendId, String)> = changes
            .iter()
            .map(|c| (c.backend.clone(), c.key.clone()))
            .collect();
        let to_repair: Vec<(BackendId, String)> = record
            .targets()
            .into_iter()
            .filter(|t| !t.is_stored())
            .map(|t| (t.backend.clone(), t.key.clone()))
            .chain(suspect_keys)
            .collect();

        let mut report = RecoveryReport::default();
        let mut occupied: Vec<BackendId> = record
            .targets()
            .into_iter()
            .filter(|t| t.is_stored() && !to_repair.iter().any(|(b, k)| b == &t.backend && k == &t.key))
            .map(|t| t.backend.clone())
            .collect();

        for (backend, key) in to_repair {
            match self.pool.put(&backend, &key, data.clone(), None).await {
                Ok(etag) => {
                    scope.backend(&backend, Outcome::Success, format!("{} rewritten", key));
                    changes.push(stored_change(&backend, &key, None, etag));
                    occupied.push(backend.clone());
                    report.repaired.push((backend, key));
                }
                Err(e) if e.is_permanent_backend() => {
                    scope.backend_error(&backend, &e);
                    let candidates: Vec<BackendId> = self
                        .fallback_backends(record)
                        .into_iter()
                        .filter(|b| b != &backend && !occupied.contains(b))
                        .collect();
                    match self.relocate(&key, data.clone(), &candidates, scope).await {
                        Some((to, etag)) => {
                            changes.push(stored_change(&backend, &key, Some(to.clone()), etag));
                            occupied.push(to.clone());
                            report.relocated.push(Relocation {
                                key,
                                from: backend,
                                to,
                            });
                        }
                        None => {
                            changes.push(status_change(&backend, &key, TargetStatus::Failed));
                            report.unresolved.push((backend, key));
                        }
                    }
                }
                Err(e) => {
                    scope.backend_error(&backend, &e);
                    report.unresolved.push((backend, key));
                }
            }
        }

        self.apply_changes(&record.identity, &changes)?;
        Ok(report)
    }

    async fn recover_fragments(&self, record: &IndexRecord, scope: &OpScope) -> Result<RecoveryReport> {
        let Layout::Fragmented {
            k,
            m,
            shard_len,
            padding,
            fragments,
        } = &record.layout
        else {
            return Err(Error::Internal("expected a fragmented layout".to_string()));
        };
        let (k, m) = (*k, *m);

        // Read every fragment still marked stored
        let healthy_entries: Vec<_> = fragments.iter().filter(|f| f.target.is_stored()).collect();
        let reads = healthy_entries.iter().map(|entry| async move {
            let result = self.pool.get(&entry.target.backend, &entry.target.key, None).await;
            (*entry, result)
        });

        let mut valid: Vec<Fragment> = Vec::new();
        let mut changes = Vec::new();
        let mut to_repair: Vec<usize> = fragments
            .iter()
            .filter(|f| !f.target.is_stored())
            .map(|f| f.index)
            .collect();

        for (entry, result) in join_all(reads).await {
            let fragment = result.map(|data| {
                Fragment::with_checksum(entry.index, entry.role, data, entry.target.checksum.clone())
            });
            match fragment {
                Ok(fragment) if fragment.verify().is_ok() => valid.push(fragment),
                Ok(_) => {
                    scope.backend(&entry.target.backend, Outcome::Failure, format!("fragment {} corrupt", entry.index));
                    self.pool.health().mark_suspect(&entry.target.backend, "fragment corrupt");
                    changes.push(status_change(&entry.target.backend, &entry.target.key, TargetStatus::Suspect));
                    to_repair.push(entry.index);
                }
                Err(e) => {
                    scope.backend_error(&entry.target.backend, &e);
                    if matches!(e, Error::ObjectNotFound { .. }) {
                        self.pool.health().mark_suspect(&entry.target.backend, "fragment missing");
                        changes.push(status_change(&entry.target.backend, &entry.target.key, TargetStatus::Suspect));
                        to_repair.push(entry.index);
                    }
                }
            }
        }

        if valid.len() < k {
            self.apply_changes(&record.identity, &changes)?;
            error!(
                "{} unrecoverable: {} healthy fragments of {} required",
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
        let data = encoder.decode(&valid, *shard_len, *padding)?;
        if !checksum::matches(&data, &record.content_hash) {
            return Err(Error::ErasureDecode(format!(
                "reconstructed content of {} does not match its hash",
                record.identity
            )));
        }
        let encoded = encoder.encode(&data)?;

        to_repair.sort_unstable();
        to_repair.dedup();

        let mut report = RecoveryReport::default();
        let mut rejected: Vec<(usize, BackendId)> = Vec::new();

        for index in &to_repair {
            let (Some(entry), Some(fragment)) = (
                fragments.iter().find(|f| f.index == *index),
                encoded.fragments.get(*index),
            ) else {
                continue;
            };
            if fragment.checksum != entry.target.checksum {
                return Err(Error::ErasureEncode(format!(
                    "re-encoded fragment {} of {} differs from the recorded one",
                    index, record.identity
                )));
            }

            let backend = &entry.target.backend;
            let key = &entry.target.key;
            match self.pool.put(backend, key, fragment.data.clone(), None).await {
                Ok(etag) => {
                    scope.backend(backend, Outcome::Success, format!("fragment {} rewritten", index));
                    changes.push(stored_change(backend, key, None, etag));
                    report.repaired.push((backend.clone(), key.clone()));
                }
                Err(e) if e.is_permanent_backend() => {
                    scope.backend_error(backend, &e);
                    rejected.push((*index, backend.clone()));
                }
                Err(e) => {
                    scope.backend_error(backend, &e);
                    report.unresolved.push((backend.clone(), key.clone()));
                }
            }
        }

        // Fragments whose backend refused the rewrite move round-robin to the others
        if !rejected.is_empty() {
            let planner = StripePlanner::new(k, k + m);
            let candidates: Vec<BackendId> = self
                .fallback_backends(record)
                .into_iter()
                .filter(|b| self.pool.is_available(b))
                .collect();

            let mut by_backend: HashMap<BackendId, Vec<(usize, BackendId)>> = HashMap::new();
            for (index, backend) in rejected {
                by_backend.entry(backend.clone()).or_default().push((index, backend));
            }

            for (failed, assignments) in by_backend {
                let plan = planner.plan_relocation(&assignments, &failed, &candidates);
                for (index, _) in assignments {
                    let (Some(entry), Some(fragment)) = (
                        fragments.iter().find(|f| f.index == index),
                        encoded.fragments.get(index),
                    ) else {
                        continue;
                    };
                    let key = entry.target.key.clone();

                    let preferred = plan.get(&index).cloned();
                    let order: Vec<BackendId> = preferred
                        .iter()
                        .cloned()
                        .chain(candidates.iter().filter(|b| **b != failed && Some(*b) != preferred.as_ref()).cloned())
                        .collect();

                    match self.relocate(&key, fragment.data.clone(), &order, scope).await {
                        Some((to, etag)) => {
                            changes.push(stored_change(&failed, &key, Some(to.clone()), etag));
                            report.relocated.push(Relocation {
                                key,
                                from: failed.clone(),
                                to,
                            });
                        }
                        None => {
                            changes.push(status_change(&failed, &key, TargetStatus::Failed));
                            report.unresolved.push((failed.clone(), key));
                        }
                    }
                }
            }
        }

        self.apply_changes(&record.identity, &changes)?;
        Ok(report)
    }

    /// Write `data` under `key` to the first candidate that accepts it
    async fn relocate(
        &self,
        key: &str,
        data: Bytes,
        candidates: &[BackendId],
        scope: &OpScope,
    ) -> Option<(BackendId, String)> {
        for candidate in candidates {
            if !self.pool.is_available(candidate) {
                continue;
            }
            match self.pool.put(candidate, key, data.clone(), None).await {
                Ok(etag) => {
                    info!("Relocated {} to {}", key, candidate);
                    scope.backend(candidate, Outcome::Success, format!("{} relocated", key));
                    return Some((candidate.clone(), etag));
                }
                Err(e) => scope.backend_error(candidate, &e),
            }
        }
        warn!("No backend accepted {}", key);
        None
    }

    fn fallback_backends(&self, record: &IndexRecord) -> Vec<BackendId> {
        let mut order: Vec<BackendId> = record.placement.backends().to_vec();
        for id in self.pool.ids() {
            if !order.contains(&id) {
                order.push(id);
            }
        }
        order
    }

    fn apply_changes(&self, identity: &FileId, changes: &[TargetChange]) -> Result<()> {
        if changes.is_empty() {
            return Ok(());
        }
        self.index.update(identity, |record| {
            for change in changes {
                if let Some(target) = record.target_mut(&change.backend, &change.key) {
                    target.status = change.status;
                    if let Some(etag) = &change.etag {
                        target.etag = Some(etag.clone());
                    }
                    if let Some(to) = &change.new_backend {
                        target.backend = to.clone();
                    }
                }
            }
            Ok(())
        })?;
        Ok(())
    }

    /// Verify every indexed file
    pub async fn verify_all(&self) -> Result<ScrubSummary> {
        let records = self.index.list()?;
        let mut summary = ScrubSummary {
            files: records.len(),
            ..Default::default()
        };

        for record in records {
            match self.verify(&record.identity).await {
                Ok(report) => match report.status {
                    FileStatus::Healthy => summary.healthy += 1,
                    FileStatus::Degraded => summary.degraded += 1,
                    FileStatus::Unrecoverable => summary.unrecoverable += 1,
                },
                Err(e) => {
                    warn!("Verification of {} failed: {}", record.identity, e);
                    summary.errors += 1;
                }
            }
        }

        info!(
            "Scrub verified {} files: {} healthy, {} degraded, {} unrecoverable",
            summary.files, summary.healthy, summary.degraded, summary.unrecoverable
        );
        Ok(summary)
    }

    /// Recover every indexed file that needs repair
    pub async fn recover_all(&self) -> Result<RecoverySummary> {
        let mut summary = RecoverySummary::default();

        for record in self.index.list()? {
            if !record.needs_repair() {
                continue;
            }
            summary.attempted += 1;
            match self.recover(&record.identity).await {
                Ok(report) if report.is_complete() => summary.completed += 1,
                Ok(_) => summary.partial += 1,
                Err(Error::FileUnrecoverable { .. }) => summary.unrecoverable += 1,
                Err(e) => {
                    warn!("Recovery of {} failed: {}", record.identity, e);
                    summary.errors += 1;
                }
            }
        }
        Ok(summary)
    }

    /// Verify and recover the whole index every `interval` until shutdown
    ///
    /// The first pass starts immediately.
    pub async fn scrub_loop(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.verify_all().await {
                        error!("Scrub verification pass failed: {}", e);
                    }
                    match self.recover_all().await {
                        Ok(summary) if summary.attempted > 0 => info!(
                            "Scrub recovered {} of {} files ({} unrecoverable)",
                            summary.completed, summary.attempted, summary.unrecoverable
                        ),
                        Ok(_) => {}
                        Err(e) => error!("Scrub recovery pass failed: {}", e),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Scrub loop stopping");
                        break;
                    }
                }
            }
        }
    }
}

fn status_change(backend: &BackendId, key: &str, status: TargetStatus) -> TargetChange {
    TargetChange {
        backend: backend.clone(),
        key: key.to_string(),
        new_backend: None,
        status,
        etag: None,
    }
}

fn stored_change(backend: &BackendId, key: &str, new_backend: Option<BackendId>, etag: String) -> TargetChange {
    TargetChange {
        backend: backend.clone(),
        key: key.to_string(),
        new_backend,
        status: TargetStatus::Stored,
        etag: Some(etag),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{fragment_key, object_key, BackendSet, Fault, MemoryBackend, StorageBackend};
    use crate::config::RetryConfig;
    use crate::erasure::ErasureConfig;
    use crate::health::HealthTracker;
    use crate::oplog::MemorySink;
    use crate::policy::{PolicyConfig, PolicyEngine};
    use crate::sync::SyncManager;

    struct Harness {
        sync: SyncManager,
        recovery: RecoveryManager,
        index: Arc<FileIndex>,
        backends: Vec<Arc<MemoryBackend>>,
        sink: Arc<MemorySink>,
    }

    fn harness(names: &[&str], placement: &[&str], erasure: ErasureConfig) -> Harness {
        let backends: Vec<Arc<MemoryBackend>> =
            names.iter().map(|n| Arc::new(MemoryBackend::new(*n))).collect();
        let set = BackendSet::new(
            backends
                .iter()
                .map(|b| b.clone() as Arc<dyn StorageBackend>)
                .collect(),
        )
        .unwrap();
        let all = set.ids();
        let retry = RetryConfig {
            max_retries: 1,
            base_delay_ms: 1,
            max_delay_ms: 1,
        };
        let pool = Arc::new(BackendPool::new(set, Arc::new(HealthTracker::default()), 8, retry));
        let policy = PolicyEngine::new(
            &PolicyConfig {
                rules: vec![],
                default: placement.iter().map(|p| BackendId::from(*p)).collect(),
            },
            &all,
        )
        .unwrap();
        let index = Arc::new(FileIndex::in_memory().unwrap());
        let sink = Arc::new(MemorySink::new());
        let sync = SyncManager::new(
            pool.clone(),
            index.clone(),
            Arc::new(policy),
            erasure,
            2,
            sink.clone(),
        );
        let recovery = RecoveryManager::new(pool, index.clone(), sink.clone());
        Harness {
            sync,
            recovery,
            index,
            backends,
            sink,
        }
    }

    fn payload(len: usize) -> Bytes {
        Bytes::from((0..len).map(|i| (i * 7 % 256) as u8).collect::<Vec<u8>>())
    }

    fn total_puts(h: &Harness) -> usize {
        h.backends.iter().map(|b| b.total_puts()).sum()
    }

    #[tokio::test]
    async fn test_verify_healthy_file() {
        let h = harness(&["s3", "gcs"], &["s3", "gcs"], ErasureConfig::default());
        let id = FileId::from("/a.txt");
        h.sync.upload_data(id.clone(), payload(100), "txt", None, None).await.unwrap();

        let report = h.recovery.verify(&id).await.unwrap();
        assert_eq!(report.checked, 2);
        assert_eq!(report.intact, 2);
        assert!(report.suspect.is_empty());
        assert_eq!(report.status, FileStatus::Healthy);

        let record = h.index.get(&id).unwrap().unwrap();
        assert!(record.last_verified_at.is_some());
        for target in record.targets() {
            assert!(target.last_verified_at.is_some());
            assert_eq!(target.last_verified_checksum.as_deref(), Some(target.checksum.as_str()));
        }
    }

    #[tokio::test]
    async fn test_verify_flags_corrupt_replica() {
        let h = harness(&["s3", "gcs"], &["s3", "gcs"], ErasureConfig::default());
        let id = FileId::from("/a.txt");
        let data = payload(100);
        h.sync.upload_data(id.clone(), data.clone(), "txt", None, None).await.unwrap();

        h.backends[1].corrupt(&object_key(&checksum::sha256_hex(&data)));
        let report = h.recovery.verify(&id).await.unwrap();

        assert_eq!(report.suspect, vec![(BackendId::from("gcs"), object_key(&checksum::sha256_hex(&data)))]);
        assert_eq!(report.status, FileStatus::Degraded);
        let health = h.recovery.pool.health().backend_health(&BackendId::from("gcs")).unwrap();
        assert_eq!(health.suspect_marks, 1);
    }

    #[tokio::test]
    async fn test_recover_replica_converges() {
        let h = harness(&["s3", "gcs"], &["s3", "gcs"], ErasureConfig::default());
        let id = FileId::from("/a.txt");
        let data = payload(100);
        h.sync.upload_data(id.clone(), data.clone(), "txt", None, None).await.unwrap();
        let key = object_key(&checksum::sha256_hex(&data));

        h.backends[1].remove(&key);
        h.recovery.verify(&id).await.unwrap();

        let s3_writes = h.backends[0].put_count(&key);
        let report = h.recovery.recover(&id).await.unwrap();
        assert_eq!(report.repaired, vec![(BackendId::from("gcs"), key.clone())]);
        assert!(report.is_complete());

        // The healthy replica was not rewritten
        assert_eq!(h.backends[0].put_count(&key), s3_writes);
        assert_eq!(h.backends[1].object(&key).unwrap(), data);

        // Second call writes nothing
        let before = total_puts(&h);
        let again = h.recovery.recover(&id).await.unwrap();
        assert_eq!(again.writes(), 0);
        assert_eq!(total_puts(&h), before);
        assert_eq!(h.index.get(&id).unwrap().unwrap().status(), FileStatus::Healthy);
    }

    #[tokio::test]
    async fn test_recover_fragment_converges() {
        let erasure = ErasureConfig::new(2, 1).with_threshold(64);
        let h = harness(&["a", "b", "c"], &["a", "b", "c"], erasure);
        let id = FileId::from("/movie.mp4");
        let data = payload(3000);
        h.sync.upload_data(id.clone(), data.clone(), "mp4", None, None).await.unwrap();
        let hash = checksum::sha256_hex(&data);

        h.backends[1].corrupt(&fragment_key(&hash, 2, 1, 1));
        let verify = h.recovery.verify(&id).await.unwrap();
        assert_eq!(verify.suspect.len(), 1);

        let healthy: Vec<(usize, String)> = vec![(0, fragment_key(&hash, 2, 1, 0)), (2, fragment_key(&hash, 2, 1, 2))];
        let before: Vec<usize> = healthy.iter().map(|(i, k)| h.backends[*i].put_count(k)).collect();

        let report = h.recovery.recover(&id).await.unwrap();
        assert_eq!(report.repaired, vec![(BackendId::from("b"), fragment_key(&hash, 2, 1, 1))]);

        let after: Vec<usize> = healthy.iter().map(|(i, k)| h.backends[*i].put_count(k)).collect();
        assert_eq!(before, after);

        let record = h.index.get(&id).unwrap().unwrap();
        assert_eq!(record.status(), FileStatus::Healthy);
        assert_eq!(h.sync.download_file(&id, None).await.unwrap(), data);
    }

    #[tokio::test]
    async fn test_recover_relocates_on_permanent_rejection() {
        let erasure = ErasureConfig::new(2, 1).with_threshold(64);
        let h = harness(&["a", "b", "c"], &["a", "b"], erasure);
        let id = FileId::from("/x.bin");
        let data = payload(500);
        h.sync.upload_data(id.clone(), data.clone(), "bin", None, None).await.unwrap();
        let hash = checksum::sha256_hex(&data);

        h.backends[1].remove(&fragment_key(&hash, 2, 1, 1));
        h.backends[1].fail_writes(Fault::Permanent("bucket deleted".to_string()));
        h.recovery.verify(&id).await.unwrap();

        let report = h.recovery.recover(&id).await.unwrap();
        assert_eq!(report.relocated.len(), 1);
        assert_eq!(report.relocated[0].from, BackendId::from("b"));
        assert_ne!(report.relocated[0].to, BackendId::from("b"));

        let record = h.index.get(&id).unwrap().unwrap();
        assert_eq!(record.status(), FileStatus::Healthy);
        assert_eq!(h.sync.download_file(&id, None).await.unwrap(), data);
    }

    #[tokio::test]
    async fn test_recover_unrecoverable_fragments() {
        let erasure = ErasureConfig::new(2, 1).with_threshold(64);
        let h = harness(&["a", "b", "c"], &["a", "b", "c"], erasure);
        let id = FileId::from("/x.bin");
        let data = payload(500);
        h.sync.upload_data(id.clone(), data.clone(), "bin", None, None).await.unwrap();
        let hash = checksum::sha256_hex(&data);

        h.backends[0].remove(&fragment_key(&hash, 2, 1, 0));
        h.backends[1].corrupt(&fragment_key(&hash, 2, 1, 1));
        h.recovery.verify(&id).await.unwrap();

        assert!(matches!(
            h.recovery.recover(&id).await,
            Err(Error::FileUnrecoverable { available: 1, required: 2, .. })
        ));
        assert!(h
            .sink
            .of(Operation::Recover)
            .iter()
            .any(|e| e.outcome == Outcome::Failure && e.backend.is_none()));
    }

    #[tokio::test]
    async fn test_recover_healthy_is_noop() {
        let h = harness(&["s3", "gcs"], &["s3", "gcs"], ErasureConfig::default());
        let id = FileId::from("/a.txt");
        h.sync.upload_data(id.clone(), payload(10), "txt", None, None).await.unwrap();

        let before = total_puts(&h);
        let report = h.recovery.recover(&id).await.unwrap();
        assert_eq!(report.writes(), 0);
        assert_eq!(total_puts(&h), before);
    }

    #[tokio::test]
    async fn test_scrub_passes() {
        let h = harness(&["s3", "gcs"], &["s3", "gcs"], ErasureConfig::default());
        let data = payload(10);
        h.sync.upload_data(FileId::from("/a.txt"), data.clone(), "txt", None, None).await.unwrap();
        h.sync.upload_data(FileId::from("/b.txt"), payload(20), "txt", None, None).await.unwrap();
        h.backends[0].remove(&object_key(&checksum::sha256_hex(&data)));

        let scrub = h.recovery.verify_all().await.unwrap();
        assert_eq!(scrub.files, 2);
        assert_eq!(scrub.healthy, 1);
        assert_eq!(scrub.degraded, 1);

        let summary = h.recovery.recover_all().await.unwrap();
        assert_eq!(summary.attempted, 1);
        assert_eq!(summary.completed, 1);
    }

    #[tokio::test]
    async fn test_scrub_loop_stops_on_shutdown() {
        let h = harness(&["s3", "gcs"], &["s3", "gcs"], ErasureConfig::default());
        let (tx, rx) = watch::channel(false);

        let stop = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            tx.send(true).unwrap();
        };
        let run = h.recovery.scrub_loop(Duration::from_millis(5), rx);

        tokio::time::timeout(Duration::from_secs(5), async { tokio::join!(run, stop) })
            .await
            .unwrap();
    }
}
