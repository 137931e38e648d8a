//! Error types for cloudstripe

use std::io;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for cloudstripe
#[derive(Error, Debug)]
pub enum Error {
    // Backend errors
    #[error("Transient error on backend {backend}: {reason}")]
    TransientBackend { backend: String, reason: String },

    #[error("Permanent error on backend {backend}: {reason}")]
    PermanentBackend { backend: String, reason: String },

    #[error("Object {key} not found on backend {backend}")]
    ObjectNotFound { backend: String, key: String },

    #[error("Unknown backend: {0}")]
    UnknownBackend(String),

    #[error("Deadline exceeded before backend {0} could be called")]
    DeadlineExceeded(String),

    // Operation-level errors
    #[error("Redundancy unmet: {achieved} successful placements, need {required}")]
    RedundancyUnmet { achieved: usize, required: usize },

    #[error("Operation timed out; completed backends: {completed:?}")]
    Timeout { completed: Vec<String> },

    #[error("File unrecoverable: {identity} ({available} valid of {required} required)")]
    FileUnrecoverable {
        identity: String,
        available: usize,
        required: usize,
    },

    #[error("File not indexed: {0}")]
    FileNotIndexed(String),

    // Erasure coding errors
    #[error("Insufficient fragments: have {available}, need {required}")]
    InsufficientFragments { available: usize, required: usize },

    #[error("Fragment {index} is corrupt: expected {expected}, got {got}")]
    CorruptFragment {
        index: usize,
        expected: String,
        got: String,
    },

    #[error("Erasure encoding failed: {0}")]
    ErasureEncode(String),

    #[error("Erasure decoding failed: {0}")]
    ErasureDecode(String),

    #[error("Invalid erasure configuration: {0}")]
    InvalidErasureConfig(String),

    // Config errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Index errors
    #[error("Database error: {0}")]
    Database(#[from] sled::Error),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    // General errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether retrying the same call may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::TransientBackend { .. })
    }

    /// Whether the error should exclude the backend from the current operation
    pub fn is_permanent_backend(&self) -> bool {
        matches!(
            self,
            Error::PermanentBackend { .. } | Error::ObjectNotFound { .. } | Error::UnknownBackend(_)
        )
    }

    /// Short machine-readable name, used in operation-log events
    pub fn kind(&self) -> &'static str {
        match self {
            Error::TransientBackend { .. } => "transient_backend",
            Error::PermanentBackend { .. } => "permanent_backend",
            Error::ObjectNotFound { .. } => "object_not_found",
            Error::UnknownBackend(_) => "unknown_backend",
            Error::DeadlineExceeded(_) => "deadline_exceeded",
            Error::RedundancyUnmet { .. } => "redundancy_unmet",
            Error::Timeout { .. } => "timeout",
            Error::FileUnrecoverable { .. } => "file_unrecoverable",
            Error::FileNotIndexed(_) => "file_not_indexed",
            Error::InsufficientFragments { .. } => "insufficient_fragments",
            Error::CorruptFragment { .. } => "corrupt_fragment",
            Error::ErasureEncode(_) => "erasure_encode",
            Error::ErasureDecode(_) => "erasure_decode",
            Error::InvalidErasureConfig(_) => "invalid_erasure_config",
            Error::Config(_) | Error::InvalidConfig(_) => "config",
            Error::Database(_) => "database",
            Error::Io(_) => "io",
            Error::Serialization(_) | Error::Deserialization(_) => "serialization",
            Error::Internal(_) => "internal",
        }
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
