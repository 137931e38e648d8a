//! Index record types
//!
//! One `IndexRecord` per logical file: its identity and content hash, the
//! placement chosen for the current generation, and the status of every
//! replica or fragment on every backend.

use std::fmt;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::backend::{BackendId, ETag};
use crate::erasure::FragmentRole;
use crate::error::Result;
use crate::policy::Placement;

/// Logical identity of a file: its absolute source path
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileId(String);

impl FileId {
    pub fn new(id: impl Into<String>) -> Self {
        FileId(id.into())
    }

    /// Identity of a path, made absolute against the working directory
    pub fn from_path(path: &Path) -> Result<Self> {
        let absolute = std::path::absolute(path)?;
        Ok(FileId(absolute.to_string_lossy().into_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for FileId {
    fn from(s: &str) -> Self {
        FileId(s.to_string())
    }
}

/// Upload/verification status of one stored copy
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TargetStatus {
    /// Assigned but not yet written
    Pending,
    /// Written and believed intact
    Stored,
    /// Write failed
    Failed,
    /// Missing or corrupt at last read
    Suspect,
}

/// One replica or fragment on one backend
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Target {
    pub backend: BackendId,
    pub key: String,
    /// Expected SHA-256 of the stored bytes
    pub checksum: String,
    pub etag: Option<ETag>,
    pub status: TargetStatus,
    pub last_verified_at: Option<DateTime<Utc>>,
    /// Checksum actually observed at the last verification
    pub last_verified_checksum: Option<String>,
}

impl Target {
    /// A target that has not been written yet
    pub fn pending(backend: BackendId, key: String, checksum: String) -> Self {
        Target {
            backend,
            key,
            checksum,
            etag: None,
            status: TargetStatus::Pending,
            last_verified_at: None,
            last_verified_checksum: None,
        }
    }

    pub fn is_stored(&self) -> bool {
        self.status == TargetStatus::Stored
    }

    /// Record a successful write
    pub fn mark_stored(&mut self, etag: ETag) {
        self.etag = Some(etag);
        self.status = TargetStatus::Stored;
    }
}

/// A fragment of an erasure-coded file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FragmentEntry {
    pub index: usize,
    pub role: FragmentRole,
    pub target: Target,
}

/// How a file is stored
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Layout {
    /// Whole-file copies, one per placement backend
    Replicated { replicas: Vec<Target> },
    /// k data + m parity fragments spread over the placement
    Fragmented {
        k: usize,
        m: usize,
        shard_len: usize,
        padding: usize,
        fragments: Vec<FragmentEntry>,
    },
}

/// Overall state of a file's stored copies
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    /// Every target is stored
    Healthy,
    /// Some targets need repair but the file can be rebuilt
    Degraded,
    /// Not enough intact targets remain to rebuild the file
    Unrecoverable,
}

impl fmt::Display for FileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FileStatus::Healthy => "healthy",
            FileStatus::Degraded => "degraded",
            FileStatus::Unrecoverable => "unrecoverable",
        };
        f.write_str(name)
    }
}

/// Durable record of one logical file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IndexRecord {
    pub identity: FileId,
    /// SHA-256 of the whole file content
    pub content_hash: String,
    pub size: u64,
    pub file_type: String,
    pub modified_at: Option<DateTime<Utc>>,
    pub placement: Placement,
    pub layout: Layout,
    /// Bumped whenever a new content hash replaces the old one
    pub generation: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_verified_at: Option<DateTime<Utc>>,
}

impl IndexRecord {
    /// Every replica or fragment target, in layout order
    pub fn targets(&self) -> Vec<&Target> {
        match &self.layout {
            Layout::Replicated { replicas } => replicas.iter().collect(),
            Layout::Fragmented { fragments, .. } => fragments.iter().map(|f| &f.target).collect(),
        }
    }

    pub fn targets_mut(&mut self) -> Vec<&mut Target> {
        match &mut self.layout {
            Layout::Replicated { replicas } => replicas.iter_mut().collect(),
            Layout::Fragmented { fragments, .. } => {
                fragments.iter_mut().map(|f| &mut f.target).collect()
            }
        }
    }

    /// Target stored under `key` on `backend`
    pub fn target_mut(&mut self, backend: &BackendId, key: &str) -> Option<&mut Target> {
        self.targets_mut()
            .into_iter()
            .find(|t| &t.backend == backend && t.key == key)
    }

    pub fn is_fragmented(&self) -> bool {
        matches!(self.layout, Layout::Fragmented { .. })
    }

    /// Intact copies needed to rebuild: 1 replica, or k fragments
    pub fn required_intact(&self) -> usize {
        match &self.layout {
            Layout::Replicated { .. } => 1,
            Layout::Fragmented { k, .. } => *k,
        }
    }

    /// Targets currently marked stored
    pub fn stored_count(&self) -> usize {
        self.targets().iter().filter(|t| t.is_stored()).count()
    }

    /// Whether any target needs repair
    pub fn needs_repair(&self) -> bool {
        self.targets().iter().any(|t| !t.is_stored())
    }

    /// Backends that hold at least one target of this record
    pub fn backends(&self) -> Vec<BackendId> {
        let mut seen: Vec<BackendId> = Vec::new();
        for target in self.targets() {
            if !seen.contains(&target.backend) {
                seen.push(target.backend.clone());
            }
        }
        seen
    }

    pub fn primary_backend(&self) -> Option<&BackendId> {
        self.placement.primary()
    }

    pub fn status(&self) -> FileStatus {
        let stored = self.stored_count();
        if !self.needs_repair() {
            FileStatus::Healthy
        } else if stored >= self.required_intact() {
            FileStatus::Degraded
        } else {
            FileStatus::Unrecoverable
        }
    }

    /// Record an update
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
