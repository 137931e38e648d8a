//! Reed-Solomon erasure coding for file fragments
//!
//! Provides encode/decode operations for k-of-(k+m) erasure coding.
//! Any k fragments can reconstruct the original data.

use bytes::Bytes;
use reed_solomon_erasure::galois_8::ReedSolomon;
use serde::{Deserialize, Serialize};

use crate::checksum;
use crate::error::{Error, Result};

use super::config::ErasureConfig;

/// Whether a fragment carries original bytes or parity
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum FragmentRole {
    Data,
    Parity,
}

/// One encoded fragment together with its integrity hash
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    /// Position within the stripe (0..k+m)
    pub index: usize,
    pub role: FragmentRole,
    pub data: Bytes,
    /// SHA-256 of `data` as recorded when the fragment was produced
    pub checksum: String,
}

impl Fragment {
    /// Create a fragment, hashing its contents
    pub fn new(index: usize, role: FragmentRole, data: Bytes) -> Self {
        let checksum = checksum::sha256_hex(&data);
        Fragment {
            index,
            role,
            data,
            checksum,
        }
    }

    /// Rebuild a fragment read back from storage with its recorded checksum
    pub fn with_checksum(index: usize, role: FragmentRole, data: Bytes, checksum: String) -> Self {
        Fragment {
            index,
            role,
            data,
            checksum,
        }
    }

    /// Check the content against the recorded checksum
    pub fn verify(&self) -> Result<()> {
        let got = checksum::sha256_hex(&self.data);
        if got.eq_ignore_ascii_case(&self.checksum) {
            Ok(())
        } else {
            Err(Error::CorruptFragment {
                index: self.index,
                expected: self.checksum.clone(),
                got,
            })
        }
    }
}

/// Result of encoding one payload
#[derive(Debug, Clone)]
pub struct EncodedFile {
    /// All k+m fragments in index order
    pub fragments: Vec<Fragment>,
    /// Length of every fragment
    pub shard_len: usize,
    /// Zero bytes appended to the payload before striping
    pub padding: usize,
}

/// Reed-Solomon encoder/decoder
pub struct Encoder {
    rs: ReedSolomon,
    data_fragments: usize,   // k
    parity_fragments: usize, // m
}

impl Encoder {
    /// Create new encoder with k data fragments and m parity fragments
    ///
    /// # Errors
    /// Returns error if parameters are invalid (k and m must be > 0)
    pub fn new(data_fragments: usize, parity_fragments: usize) -> Result<Self> {
        ErasureConfig::new(data_fragments, parity_fragments).validate()?;

        let rs = ReedSolomon::new(data_fragments, parity_fragments).map_err(|e| {
            Error::InvalidErasureConfig(format!("Failed to create Reed-Solomon codec: {:?}", e))
        })?;

        Ok(Self {
            rs,
            data_fragments,
            parity_fragments,
        })
    }

    /// Create an encoder from configuration
    pub fn from_config(config: &ErasureConfig) -> Result<Self> {
        Self::new(config.data_fragments, config.parity_fragments)
    }

    /// Encode data into k+m fragments
    ///
    /// The payload is zero-padded to a multiple of k so every data fragment
    /// has the same length. The padding is returned alongside the fragments
    /// and must be supplied again to [`Encoder::decode`].
    pub fn encode(&self, data: &[u8]) -> Result<EncodedFile> {
        let shard_len = self.shard_len(data.len());
        let padding = shard_len * self.data_fragments - data.len();

        let mut padded = Vec::with_capacity(shard_len * self.data_fragments);
        padded.extend_from_slice(data);
        padded.resize(shard_len * self.data_fragments, 0);

        let mut shards: Vec<Vec<u8>> = padded
            .chunks(shard_len)
            .map(|chunk| chunk.to_vec())
            .collect();
        for _ in 0..self.parity_fragments {
            shards.push(vec![0u8; shard_len]);
        }

        self.rs
            .encode(&mut shards)
            .map_err(|e| Error::ErasureEncode(format!("{:?}", e)))?;

        let fragments = shards
            .into_iter()
            .enumerate()
            .map(|(index, shard)| Fragment::new(index, self.role_of(index), Bytes::from(shard)))
            .collect();

        Ok(EncodedFile {
            fragments,
            shard_len,
            padding,
        })
    }

    /// Decode from any k or more fragments back to the original data
    ///
    /// Fragments may be supplied in any order; duplicates of an index are
    /// ignored after the first.
    ///
    /// # Errors
    /// - `CorruptFragment` if a fragment does not match its checksum
    /// - `InsufficientFragments` if fewer than k distinct fragments are given
    pub fn decode(&self, fragments: &[Fragment], shard_len: usize, padding: usize) -> Result<Vec<u8>> {
        let total = self.total_fragments();
        let mut shards: Vec<Option<Vec<u8>>> = vec![None; total];

        for fragment in fragments {
            if fragment.index >= total {
                return Err(Error::ErasureDecode(format!(
                    "fragment index {} out of range for {} fragments",
                    fragment.index, total
                )));
            }
            fragment.verify()?;
            if fragment.data.len() != shard_len {
                return Err(Error::ErasureDecode(format!(
                    "fragment {} has length {}, expected {}",
                    fragment.index,
                    fragment.data.len(),
                    shard_len
                )));
            }
            if shards[fragment.index].is_none() {
                shards[fragment.index] = Some(fragment.data.to_vec());
            }
        }

        let available = shards.iter().filter(|s| s.is_some()).count();
        if available < self.data_fragments {
            return Err(Error::InsufficientFragments {
                available,
                required: self.data_fragments,
            });
        }

        let padded_len = shard_len * self.data_fragments;
        if padding > padded_len {
            return Err(Error::ErasureDecode(format!(
                "padding {} exceeds striped length {}",
                padding, padded_len
            )));
        }

        // Only data shards need rebuilding; parity is not part of the output
        self.rs
            .reconstruct_data(&mut shards)
            .map_err(|e| Error::ErasureDecode(format!("{:?}", e)))?;

        let mut reconstructed = Vec::with_capacity(padded_len);
        for shard in shards.iter().take(self.data_fragments) {
            match shard {
                Some(data) => reconstructed.extend_from_slice(data),
                None => {
                    return Err(Error::ErasureDecode(
                        "Reconstruction succeeded but data shard is missing".to_string(),
                    ))
                }
            }
        }

        reconstructed.truncate(padded_len - padding);
        Ok(reconstructed)
    }

    /// Get the fragment length for a payload of the given size
    ///
    /// Each fragment is ceil(data_len / k) bytes, and never empty.
    pub fn shard_len(&self, data_len: usize) -> usize {
        ((data_len + self.data_fragments - 1) / self.data_fragments).max(1)
    }

    /// Role of the fragment at `index`
    pub fn role_of(&self, index: usize) -> FragmentRole {
        if index < self.data_fragments {
            FragmentRole::Data
        } else {
            FragmentRole::Parity
        }
    }

    /// Get k (data fragments)
    pub fn data_fragments(&self) -> usize {
        self.data_fragments
    }

    /// Get m (parity fragments)
    pub fn parity_fragments(&self) -> usize {
        self.parity_fragments
    }

    /// Get k + m
    pub fn total_fragments(&self) -> usize {
        self.data_fragments + self.parity_fragments
    }
}
