//! Backup engine
//!
//! Wires configuration, backends, the index, sync and recovery together and
//! exposes the operations the command line triggers.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::backend::{BackendId, BackendSet, StorageBackend, FRAGMENT_PREFIX, OBJECT_PREFIX};
use crate::config::Config;
use crate::error::Result;
use crate::health::{BackendHealth, HealthTracker};
use crate::index::{FileId, FileIndex, FileStatus};
use crate::oplog::EventSink;
use crate::policy::PolicyEngine;
use crate::pool::BackendPool;
use crate::recovery::{RecoveryManager, RecoveryReport, RecoverySummary, ScrubSummary, VerifyReport};
use crate::sync::{SyncManager, UploadReport};

/// One row of the file listing
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct FileSummary {
    pub identity: FileId,
    pub primary_backend: Option<BackendId>,
    pub status: FileStatus,
    pub size: u64,
    pub fragmented: bool,
    pub generation: u64,
}

/// An object on a backend that no index record refers to
#[derive(Debug, Clone, Serialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct UntrackedObject {
    pub backend: BackendId,
    pub key: String,
}

/// Multi-cloud backup engine
pub struct BackupEngine {
    pool: Arc<BackendPool>,
    index: Arc<FileIndex>,
    sync: SyncManager,
    recovery: RecoveryManager,
    max_concurrent_files: usize,
    deadline: Option<Duration>,
    scrub_interval: Duration,
}

impl BackupEngine {
    /// Build an engine from configuration, opening the on-disk index
    pub fn from_config(config: &Config, sink: Arc<dyn EventSink>) -> Result<Self> {
        config.validate()?;
        let backends = config.build_backends()?;
        let index = FileIndex::open(&config.index.path)?;
        Self::new(backends, config, index, sink)
    }

    /// Build an engine over already constructed backends
    pub fn new(
        backends: Vec<Arc<dyn StorageBackend>>,
        config: &Config,
        index: FileIndex,
        sink: Arc<dyn EventSink>,
    ) -> Result<Self> {
        let set = BackendSet::new(backends)?;
        let ids = set.ids();
        let policy = PolicyEngine::new(&config.policy, &ids)?;
        config.erasure.validate()?;

        let health = Arc::new(HealthTracker::new(
            config.health.failure_threshold,
            config.health.open_cooldown(),
        ));
        let pool = Arc::new(BackendPool::new(
            set,
            health,
            config.sync.worker_pool,
            config.sync.retry.clone(),
        ));
        let index = Arc::new(index);

        let sync = SyncManager::new(
            pool.clone(),
            index.clone(),
            Arc::new(policy),
            config.erasure.clone(),
            config.sync.min_replicas,
            sink.clone(),
        );
        let recovery = RecoveryManager::new(pool.clone(), index.clone(), sink);

        info!(
            "Backup engine ready: {} backends, {} indexed files",
            ids.len(),
            index.len()
        );

        Ok(BackupEngine {
            pool,
            index,
            sync,
            recovery,
            max_concurrent_files: config.sync.max_concurrent_files.max(1),
            deadline: config.sync.deadline(),
            scrub_interval: Duration::from_secs(config.scrub_interval_secs.max(1)),
        })
    }

    pub fn index(&self) -> &Arc<FileIndex> {
        &self.index
    }

    pub fn pool(&self) -> &Arc<BackendPool> {
        &self.pool
    }

    fn deadline(&self) -> Option<Instant> {
        self.deadline.map(|d| Instant::now() + d)
    }

    /// Upload one file from disk
    pub async fn upload(&self, path: &Path) -> Result<UploadReport> {
        self.sync.upload_file(path, self.deadline()).await
    }

    /// Upload in-memory content under a logical identity
    pub async fn upload_data(&self, identity: FileId, data: Bytes, file_type: &str) -> Result<UploadReport> {
        self.sync
            .upload_data(identity, data, file_type, None, self.deadline())
            .await
    }

    /// Fetch a file's content
    pub async fn download(&self, identity: &FileId) -> Result<Bytes> {
        self.sync.download_file(identity, self.deadline()).await
    }

    /// Fetch a file and write it to `output`
    pub async fn restore(&self, identity: &FileId, output: &Path) -> Result<u64> {
        let data = self.download(identity).await?;
        if let Some(parent) = output.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        tokio::fs::write(output, &data).await?;
        info!("Restored {} to {} ({} bytes)", identity, output.display(), data.len());
        Ok(data.len() as u64)
    }

    /// Upload several files, at most `max_concurrent_files` at a time
    ///
    /// One result per path, in completion order.
    pub async fn trigger_upload(&self, paths: Vec<PathBuf>) -> Vec<(PathBuf, Result<UploadReport>)> {
        stream::iter(paths)
            .map(|path| async move {
                let result = self.upload(&path).await;
                (path, result)
            })
            .buffer_unordered(self.max_concurrent_files)
            .collect()
            .await
    }

    /// Download several files, at most `max_concurrent_files` at a time
    pub async fn trigger_download(&self, identities: Vec<FileId>) -> Vec<(FileId, Result<Bytes>)> {
        stream::iter(identities)
            .map(|identity| async move {
                let result = self.download(&identity).await;
                (identity, result)
            })
            .buffer_unordered(self.max_concurrent_files)
            .collect()
            .await
    }

    /// Every indexed file with its primary backend and status
    pub fn list_files(&self) -> Result<Vec<FileSummary>> {
        let mut files: Vec<FileSummary> = self
            .index
            .list()?
            .into_iter()
            .map(|record| FileSummary {
                primary_backend: record.primary_backend().cloned(),
                status: record.status(),
                size: record.size,
                fragmented: record.is_fragmented(),
                generation: record.generation,
                identity: record.identity,
            })
            .collect();
        files.sort_by(|a, b| a.identity.as_str().cmp(b.identity.as_str()));
        Ok(files)
    }

    /// Objects on reachable backends that no index record refers to
    ///
    /// Backends whose circuit is open or whose listing fails are skipped.
    pub async fn list_untracked(&self) -> Result<Vec<UntrackedObject>> {
        let referenced: HashSet<(BackendId, String)> = self.index.referenced_keys()?;
        let mut untracked = Vec::new();

        for backend in self.pool.ids() {
            if !self.pool.is_available(&backend) {
                warn!("Skipping {} while listing: circuit open", backend);
                continue;
            }
            for prefix in [OBJECT_PREFIX, FRAGMENT_PREFIX] {
                let keys = match self.pool.list(&backend, prefix).await {
                    Ok(keys) => keys,
                    Err(e) => {
                        warn!("Failed to list {} on {}: {}", prefix, backend, e);
                        continue;
                    }
                };
                for key in keys {
                    if !referenced.contains(&(backend.clone(), key.clone())) {
                        untracked.push(UntrackedObject {
                            backend: backend.clone(),
                            key,
                        });
                    }
                }
            }
        }

        untracked.sort();
        Ok(untracked)
    }

    pub async fn verify(&self, identity: &FileId) -> Result<VerifyReport> {
        self.recovery.verify(identity).await
    }

    pub async fn recover(&self, identity: &FileId) -> Result<RecoveryReport> {
        self.recovery.recover(identity).await
    }

    pub async fn verify_all(&self) -> Result<ScrubSummary> {
        self.recovery.verify_all().await
    }

    pub async fn recover_all(&self) -> Result<RecoverySummary> {
        self.recovery.recover_all().await
    }

    /// Run periodic verification and recovery until `shutdown` turns true
    pub async fn scrub(&self, shutdown: watch::Receiver<bool>) {
        info!("Scrubbing every {:?}", self.scrub_interval);
        self.recovery.scrub_loop(self.scrub_interval, shutdown).await;
    }

    /// Health of every backend
    pub fn health(&self) -> Vec<BackendHealth> {
        self.pool.health().snapshot()
    }

    /// Flush the index to disk
    pub async fn flush(&self) -> Result<()> {
        self.index.flush().await
    }
}
