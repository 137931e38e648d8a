//! Cloud provider adapters built on opendal
//!
//! One `ProviderBackend` per configured backend. The constructors differ only
//! in authentication; the operator then behaves identically for every
//! provider, with key naming delegated to [`BackendKind::object_name`].

use async_trait::async_trait;
use bytes::Bytes;
use opendal::{ErrorKind, Operator};
use tracing::debug;

use super::{BackendId, BackendKind, ETag, StorageBackend};
use crate::checksum;
use crate::error::{Error, Result};

/// Object store reached through an opendal operator
pub struct ProviderBackend {
    id: BackendId,
    kind: BackendKind,
    op: Operator,
}

impl ProviderBackend {
    /// S3 or any S3-compatible store (MinIO, R2, ...)
    pub fn s3(
        id: BackendId,
        bucket: &str,
        region: &str,
        root: &str,
        endpoint: Option<&str>,
        access_key_id: Option<&str>,
        secret_access_key: Option<&str>,
    ) -> Result<Self> {
        let mut builder = opendal::services::S3::default()
            .bucket(bucket)
            .region(region)
            .root(root);
        if let Some(ep) = endpoint {
            builder = builder.endpoint(ep);
        }
        if let Some(key_id) = access_key_id {
            builder = builder.access_key_id(key_id);
        }
        if let Some(secret) = secret_access_key {
            builder = builder.secret_access_key(secret);
        }
        let op = Operator::new(builder)
            .map_err(|e| Error::Config(format!("s3 backend {}: {}", id, e)))?
            .finish();
        Ok(Self::from_operator(id, BackendKind::S3, op))
    }

    /// Google Cloud Storage, authenticated with a service-account file
    pub fn gcs(
        id: BackendId,
        bucket: &str,
        root: &str,
        endpoint: Option<&str>,
        credential_path: Option<&str>,
    ) -> Result<Self> {
        let mut builder = opendal::services::Gcs::default().bucket(bucket).root(root);
        if let Some(ep) = endpoint {
            builder = builder.endpoint(ep);
        }
        if let Some(path) = credential_path {
            builder = builder.credential_path(path);
        }
        let op = Operator::new(builder)
            .map_err(|e| Error::Config(format!("gcs backend {}: {}", id, e)))?
            .finish();
        Ok(Self::from_operator(id, BackendKind::Gcs, op))
    }

    /// Azure Blob Storage, authenticated with an account name and key
    pub fn azure(
        id: BackendId,
        container: &str,
        root: &str,
        endpoint: &str,
        account_name: Option<&str>,
        account_key: Option<&str>,
    ) -> Result<Self> {
        let mut builder = opendal::services::Azblob::default()
            .container(container)
            .root(root)
            .endpoint(endpoint);
        if let Some(name) = account_name {
            builder = builder.account_name(name);
        }
        if let Some(key) = account_key {
            builder = builder.account_key(key);
        }
        let op = Operator::new(builder)
            .map_err(|e| Error::Config(format!("azure backend {}: {}", id, e)))?
            .finish();
        Ok(Self::from_operator(id, BackendKind::Azure, op))
    }

    /// Local directory, for development and dry runs
    pub fn fs(id: BackendId, root: &str) -> Result<Self> {
        let builder = opendal::services::Fs::default().root(root);
        let op = Operator::new(builder)
            .map_err(|e| Error::Config(format!("fs backend {}: {}", id, e)))?
            .finish();
        Ok(Self::from_operator(id, BackendKind::Fs, op))
    }

    fn from_operator(id: BackendId, kind: BackendKind, op: Operator) -> Self {
        ProviderBackend { id, kind, op }
    }

    fn classify(&self, key: &str, err: opendal::Error) -> Error {
        classify_error(&self.id, key, err)
    }
}

/// Map an opendal error onto the transient/permanent taxonomy
fn classify_error(id: &BackendId, key: &str, err: opendal::Error) -> Error {
    match err.kind() {
        ErrorKind::NotFound => Error::ObjectNotFound {
            backend: id.to_string(),
            key: key.to_string(),
        },
        ErrorKind::RateLimited | ErrorKind::Unexpected => Error::TransientBackend {
            backend: id.to_string(),
            reason: err.to_string(),
        },
        _ if err.is_temporary() => Error::TransientBackend {
            backend: id.to_string(),
            reason: err.to_string(),
        },
        _ => Error::PermanentBackend {
            backend: id.to_string(),
            reason: err.to_string(),
        },
    }
}

#[async_trait]
impl StorageBackend for ProviderBackend {
    fn id(&self) -> &BackendId {
        &self.id
    }

    fn kind(&self) -> BackendKind {
        self.kind
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<ETag> {
        let name = self.kind.object_name(key);
        let etag = checksum::sha256_hex(&data);
        debug!("{}: PUT {} ({} bytes)", self.id, name, data.len());
        self.op
            .write(&name, data)
            .await
            .map_err(|e| self.classify(key, e))?;
        Ok(etag)
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        let name = self.kind.object_name(key);
        debug!("{}: GET {}", self.id, name);
        let buf = self
            .op
            .read(&name)
            .await
            .map_err(|e| self.classify(key, e))?;
        Ok(buf.to_bytes())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let name = self.kind.object_name(prefix);
        let entries = self
            .op
            .list_with(&name)
            .recursive(true)
            .await
            .map_err(|e| self.classify(prefix, e))?;

        let mut keys = Vec::with_capacity(entries.len());
        for entry in entries {
            let path = entry.path();
            // Skip directory markers
            if !path.ends_with('/') {
                keys.push(self.kind.logical_key(path));
            }
        }
        Ok(keys)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let name = self.kind.object_name(key);
        match self.op.delete(&name).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(self.classify(key, e)),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let name = self.kind.object_name(key);
        match self.op.stat(&name).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(self.classify(key, e)),
        }
    }
}
