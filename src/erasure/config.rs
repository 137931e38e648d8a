//! Configuration types for erasure coding
//!
//! Defines the Reed-Solomon parameters and the size threshold above which
//! files are fragmented instead of replicated.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Default size above which files are erasure-coded: 8 MiB
pub const DEFAULT_FRAGMENT_THRESHOLD: u64 = 8 * 1024 * 1024;

/// Largest stripe supported by the GF(2^8) codec
pub const MAX_TOTAL_FRAGMENTS: usize = 256;

/// Erasure coding configuration
///
/// Defines the Reed-Solomon parameters for data distribution:
/// - `data_fragments` (k): Number of fragments required to reconstruct
/// - `parity_fragments` (m): Number of extra parity fragments
///
/// Any k fragments out of k+m can reconstruct the original data.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErasureConfig {
    /// Number of data fragments (k)
    #[serde(default = "default_data_fragments")]
    pub data_fragments: usize,

    /// Number of parity fragments (m)
    #[serde(default = "default_parity_fragments")]
    pub parity_fragments: usize,

    /// Files strictly larger than this many bytes are fragmented
    #[serde(default = "default_threshold")]
    pub threshold_bytes: u64,

    /// Whether erasure coding is enabled
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_data_fragments() -> usize {
    4
}

fn default_parity_fragments() -> usize {
    2
}

fn default_threshold() -> u64 {
    DEFAULT_FRAGMENT_THRESHOLD
}

fn default_enabled() -> bool {
    true
}

impl Default for ErasureConfig {
    fn default() -> Self {
        ErasureConfig {
            data_fragments: default_data_fragments(),
            parity_fragments: default_parity_fragments(),
            threshold_bytes: default_threshold(),
            enabled: true,
        }
    }
}

impl ErasureConfig {
    /// Create a new erasure config with explicit k and m
    pub fn new(data_fragments: usize, parity_fragments: usize) -> Self {
        ErasureConfig {
            data_fragments,
            parity_fragments,
            ..Default::default()
        }
    }

    /// Set the fragmentation threshold
    pub fn with_threshold(mut self, threshold_bytes: u64) -> Self {
        self.threshold_bytes = threshold_bytes;
        self
    }

    /// Validate the erasure configuration
    ///
    /// # Validation Rules
    /// - k must be >= 1
    /// - m must be >= 1
    /// - k + m must fit in one GF(2^8) stripe
    pub fn validate(&self) -> Result<()> {
        if self.data_fragments < 1 {
            return Err(Error::InvalidErasureConfig(
                "data_fragments (k) must be at least 1".to_string(),
            ));
        }

        if self.parity_fragments < 1 {
            return Err(Error::InvalidErasureConfig(
                "parity_fragments (m) must be at least 1".to_string(),
            ));
        }

        if self.total_fragments() > MAX_TOTAL_FRAGMENTS {
            return Err(Error::InvalidErasureConfig(format!(
                "k + m = {} exceeds the maximum of {}",
                self.total_fragments(),
                MAX_TOTAL_FRAGMENTS
            )));
        }

        Ok(())
    }

    /// Get the total number of fragments (k + m)
    pub fn total_fragments(&self) -> usize {
        self.data_fragments + self.parity_fragments
    }

    /// Whether a file of the given size should be fragmented
    pub fn should_fragment(&self, size: u64) -> bool {
        self.enabled && size > self.threshold_bytes
    }
}
