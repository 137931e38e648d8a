//! Storage backend interface
//!
//! One capability trait over heterogeneous object stores. Provider variants
//! differ only in how they authenticate and how logical keys are named on
//! the provider; everything above this module sees `Arc<dyn StorageBackend>`.

pub mod memory;
pub mod provider;
pub mod rate_limit;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub use memory::{Fault, MemoryBackend};
pub use provider::ProviderBackend;
pub use rate_limit::{ExponentialBackoff, IoPool};

/// Prefix for whole-file replicas
pub const OBJECT_PREFIX: &str = "objects/";

/// Prefix for erasure-coded fragments
pub const FRAGMENT_PREFIX: &str = "fragments/";

/// Entity tag returned by a successful put (SHA-256 hex of the stored bytes)
pub type ETag = String;

/// Key of a whole-file replica
pub fn object_key(content_hash: &str) -> String {
    format!("{}{}", OBJECT_PREFIX, content_hash)
}

/// Key of one fragment of a file encoded as `k` data and `m` parity fragments
///
/// The geometry is part of the key: the same content encoded with a
/// different (k, m) produces different fragment bytes.
pub fn fragment_key(content_hash: &str, k: usize, m: usize, index: usize) -> String {
    format!("{}{}/{}-{}/{:02}", FRAGMENT_PREFIX, content_hash, k, m, index)
}

/// Configured name of a backend, e.g. "s3" or "gcs-archive"
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BackendId(String);

impl BackendId {
    pub fn new(id: impl Into<String>) -> Self {
        BackendId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BackendId {
    fn from(s: &str) -> Self {
        BackendId(s.to_string())
    }
}

impl From<String> for BackendId {
    fn from(s: String) -> Self {
        BackendId(s)
    }
}

/// Provider family of a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    S3,
    Gcs,
    Azure,
    Fs,
    Memory,
}

impl BackendKind {
    /// Provider-side object name for a logical key
    ///
    /// S3, GCS and the local variants store keys verbatim. Azure Blob names
    /// percent-escape anything outside the URL-safe set and cannot end a
    /// path segment with a dot.
    pub fn object_name(&self, key: &str) -> String {
        match self {
            BackendKind::S3 | BackendKind::Gcs | BackendKind::Fs | BackendKind::Memory => {
                key.to_string()
            }
            BackendKind::Azure => azure_blob_name(key),
        }
    }

    /// Inverse of [`BackendKind::object_name`]
    pub fn logical_key(&self, name: &str) -> String {
        match self {
            BackendKind::Azure => azure_logical_key(name),
            _ => name.to_string(),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackendKind::S3 => "s3",
            BackendKind::Gcs => "gcs",
            BackendKind::Azure => "azure",
            BackendKind::Fs => "fs",
            BackendKind::Memory => "memory",
        };
        f.write_str(name)
    }
}

fn azure_blob_name(key: &str) -> String {
    key.split('/')
        .map(|segment| urlencoding::encode(segment.trim_end_matches('.')).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

fn azure_logical_key(name: &str) -> String {
    match urlencoding::decode(name) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => name.to_string(),
    }
}

/// Capability contract every provider adapter implements
///
/// All operations are idempotent at the key level. Failures are reported as
/// [`Error::TransientBackend`] (may be retried), [`Error::ObjectNotFound`], or
/// [`Error::PermanentBackend`].
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Configured identifier
    fn id(&self) -> &BackendId;

    /// Provider family
    fn kind(&self) -> BackendKind;

    /// Store `data` under `key`, replacing any existing object
    async fn put(&self, key: &str, data: Bytes) -> Result<ETag>;

    /// Fetch the object stored under `key`
    async fn get(&self, key: &str) -> Result<Bytes>;

    /// List logical keys starting with `prefix`
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Remove `key`; removing a missing key succeeds
    async fn delete(&self, key: &str) -> Result<()>;

    /// Whether an object exists under `key`
    async fn exists(&self, key: &str) -> Result<bool>;
}

/// The configured backends, in configuration order
#[derive(Clone, Default)]
pub struct BackendSet {
    ordered: Vec<Arc<dyn StorageBackend>>,
    by_id: HashMap<BackendId, Arc<dyn StorageBackend>>,
}

impl BackendSet {
    /// Build a set, rejecting duplicate identifiers
    pub fn new(backends: Vec<Arc<dyn StorageBackend>>) -> Result<Self> {
        let mut by_id = HashMap::with_capacity(backends.len());
        for backend in &backends {
            if by_id.insert(backend.id().clone(), backend.clone()).is_some() {
                return Err(Error::InvalidConfig(format!(
                    "duplicate backend id: {}",
                    backend.id()
                )));
            }
        }
        Ok(BackendSet {
            ordered: backends,
            by_id,
        })
    }

    /// Look up a backend by id
    pub fn get(&self, id: &BackendId) -> Result<Arc<dyn StorageBackend>> {
        self.by_id
            .get(id)
            .cloned()
            .ok_or_else(|| Error::UnknownBackend(id.to_string()))
    }

    pub fn contains(&self, id: &BackendId) -> bool {
        self.by_id.contains_key(id)
    }

    /// Identifiers in configuration order
    pub fn ids(&self) -> Vec<BackendId> {
        self.ordered.iter().map(|b| b.id().clone()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn StorageBackend>> {
        self.ordered.iter()
    }

    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }
}

impl fmt::Debug for BackendSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.ids()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_addressed_keys() {
        assert_eq!(object_key("abc"), "objects/abc");
        assert_eq!(fragment_key("abc", 4, 2, 3), "fragments/abc/4-2/03");
        assert_eq!(fragment_key("abc", 10, 4, 12), "fragments/abc/10-4/12");
        assert_ne!(fragment_key("abc", 2, 1, 0), fragment_key("abc", 3, 1, 0));
    }

    #[test]
    fn test_verbatim_naming() {
        let key = "objects/a b.txt";
        assert_eq!(BackendKind::S3.object_name(key), key);
        assert_eq!(BackendKind::Gcs.object_name(key), key);
    }

    #[test]
    fn test_azure_naming() {
        assert_eq!(
            BackendKind::Azure.object_name("objects/a b.txt"),
            "objects/a%20b.txt"
        );
        assert_eq!(BackendKind::Azure.object_name("dir./file.."), "dir/file");
        assert_eq!(
            BackendKind::Azure.object_name("fragments/abc/4-2/01"),
            "fragments/abc/4-2/01"
        );
        assert_eq!(
            BackendKind::Azure.object_name("objects/caf\u{e9}#1"),
            "objects/caf%C3%A9%231"
        );
        assert_eq!(
            BackendKind::Azure.logical_key("objects/a%20b.txt"),
            "objects/a b.txt"
        );
        assert_eq!(
            BackendKind::Azure.logical_key("objects/caf%C3%A9%231"),
            "objects/caf\u{e9}#1"
        );
        assert_eq!(BackendKind::Azure.logical_key("objects/%E9"), "objects/%E9");
    }

    #[test]
    fn test_backend_set_lookup() {
        let set = BackendSet::new(vec![
            Arc::new(MemoryBackend::new("s3")) as Arc<dyn StorageBackend>,
            Arc::new(MemoryBackend::new("gcs")),
        ])
        .unwrap();

        assert_eq!(set.len(), 2);
        assert_eq!(set.ids(), vec![BackendId::from("s3"), BackendId::from("gcs")]);
        assert!(set.get(&BackendId::from("gcs")).is_ok());
        assert!(matches!(
            set.get(&BackendId::from("azure")),
            Err(Error::UnknownBackend(_))
        ));
    }

    #[test]
    fn test_backend_set_rejects_duplicates() {
        let result = BackendSet::new(vec![
            Arc::new(MemoryBackend::new("s3")) as Arc<dyn StorageBackend>,
            Arc::new(MemoryBackend::new("s3")),
        ]);
        assert!(result.is_err());
    }
}
