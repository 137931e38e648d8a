//! SHA-256 content hashing
//!
//! Every checksum in the index (file content hash, fragment hash, ETag) is a
//! lowercase hex SHA-256 digest.

use sha2::{Digest, Sha256};

/// Hex-encoded SHA-256 of `data`
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Whether `data` hashes to `expected`
pub fn matches(data: &[u8], expected: &str) -> bool {
    sha256_hex(data).eq_ignore_ascii_case(expected)
}
