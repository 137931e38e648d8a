//! cloudstripe - Multi-cloud backup engine
//!
//! Files are placed on S3, GCS, Azure Blob or local storage according to a
//! per-file-type policy, either as whole replicas or as Reed-Solomon
//! fragments. A local index tracks every copy; verification and recovery
//! keep the configured redundancy in place when a provider loses or
//! corrupts data.

pub mod backend;
pub mod checksum;
pub mod config;
pub mod engine;
pub mod erasure;
pub mod error;
pub mod health;
pub mod index;
pub mod oplog;
pub mod policy;
pub mod pool;
pub mod recovery;
pub mod sync;

pub use config::Config;
pub use engine::BackupEngine;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::backend::{BackendId, StorageBackend};
    pub use crate::config::Config;
    pub use crate::engine::BackupEngine;
    pub use crate::error::{Error, Result};
    pub use crate::index::{FileId, FileStatus};
}
