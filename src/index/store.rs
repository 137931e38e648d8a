//! Sled-based file index
//!
//! One tree keyed by file identity, values are bincode-encoded
//! `IndexRecord`s. Single-record read-modify-write goes through a
//! compare-and-swap loop; uploads and recoveries of one identity are
//! serialized by an async mutex per identity.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use dashmap::DashMap;
use sled::{Db, Tree};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info};

use super::record::{FileId, IndexRecord};
use crate::backend::BackendId;
use crate::error::{Error, Result};

const FILES_TREE: &str = "files";

/// Durable mapping of logical files to their placements
pub struct FileIndex {
    /// Sled database
    db: Db,
    /// Records keyed by identity
    files: Tree,
    /// Per-identity operation locks
    locks: Arc<DashMap<FileId, Arc<Mutex<()>>>>,
}

/// Exclusive access to one identity, released on drop
///
/// The identity's lock entry is removed once no other task holds or waits
/// for it.
pub struct IdentityGuard {
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<DashMap<FileId, Arc<Mutex<()>>>>,
    id: FileId,
}

impl Drop for IdentityGuard {
    fn drop(&mut self) {
        self.guard.take();
        self.locks
            .remove_if(&self.id, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

impl FileIndex {
    /// Open or create an index
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = sled::open(path.as_ref())?;
        let index = Self::from_db(db)?;
        info!(
            "File index opened at {:?} with {} records",
            path.as_ref(),
            index.files.len()
        );
        Ok(index)
    }

    /// Create an in-memory index (for testing)
    pub fn in_memory() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> Result<Self> {
        let files = db.open_tree(FILES_TREE)?;
        Ok(FileIndex {
            db,
            files,
            locks: Arc::default(),
        })
    }

    /// Get the record of a file
    pub fn get(&self, id: &FileId) -> Result<Option<IndexRecord>> {
        match self.files.get(id.as_str().as_bytes())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Get the record of a file, failing if it is not indexed
    pub fn require(&self, id: &FileId) -> Result<IndexRecord> {
        self.get(id)?
            .ok_or_else(|| Error::FileNotIndexed(id.to_string()))
    }

    /// Insert or replace a record
    pub fn put(&self, record: &IndexRecord) -> Result<()> {
        let bytes = bincode::serialize(record)?;
        self.files
            .insert(record.identity.as_str().as_bytes(), bytes)?;
        debug!("Indexed {} (generation {})", record.identity, record.generation);
        Ok(())
    }

    /// Atomically modify an existing record
    ///
    /// `f` may run more than once if another writer changes the record
    /// concurrently; it must not have side effects outside the record.
    pub fn update<F>(&self, id: &FileId, mut f: F) -> Result<IndexRecord>
    where
        F: FnMut(&mut IndexRecord) -> Result<()>,
    {
        let key = id.as_str().as_bytes();
        loop {
            let current = self
                .files
                .get(key)?
                .ok_or_else(|| Error::FileNotIndexed(id.to_string()))?;

            let mut record: IndexRecord = bincode::deserialize(&current)?;
            f(&mut record)?;
            record.touch();
            let updated = bincode::serialize(&record)?;

            match self.files.compare_and_swap(key, Some(current), Some(updated))? {
                Ok(()) => return Ok(record),
                Err(_) => {
                    debug!("Concurrent update of {}, retrying", id);
                    continue;
                }
            }
        }
    }

    /// All records, ordered by identity
    pub fn list(&self) -> Result<Vec<IndexRecord>> {
        let mut records = Vec::new();
        for entry in self.files.iter() {
            let (_, value) = entry?;
            records.push(bincode::deserialize(&value)?);
        }
        Ok(records)
    }

    /// Every (backend, key) pair referenced by some record
    pub fn referenced_keys(&self) -> Result<HashSet<(BackendId, String)>> {
        let mut keys = HashSet::new();
        for record in self.list()? {
            for target in record.targets() {
                keys.insert((target.backend.clone(), target.key.clone()));
            }
        }
        Ok(keys)
    }

    /// Number of indexed files
    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Wait for exclusive access to one identity
    ///
    /// At most one upload or recovery runs per identity; the guard releases
    /// the identity when dropped.
    pub async fn lock(&self, id: &FileId) -> IdentityGuard {
        let mutex = self.locks.entry(id.clone()).or_default().clone();
        let guard = mutex.lock_owned().await;
        IdentityGuard {
            guard: Some(guard),
            locks: self.locks.clone(),
            id: id.clone(),
        }
    }

    /// Flush pending writes to disk
    pub async fn flush(&self) -> Result<()> {
        self.db.flush_async().await?;
        Ok(())
    }
}
