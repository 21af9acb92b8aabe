use sha2::{Digest, Sha256};

use crate::Checksum;

/// Deterministic content identity.
///
/// Must be stable across sessions: re-selecting the same file has to
/// produce the same checksum or dedup breaks.
pub trait ChecksumService: Send + Sync {
    fn hash(&self, bytes: &[u8]) -> Checksum;
}

/// Lowercase hex SHA-256 of the raw bytes
#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256Checksum;

impl ChecksumService for Sha256Checksum {
    fn hash(&self, bytes: &[u8]) -> Checksum {
        let digest = Sha256::digest(bytes);
        Checksum(hex::encode(digest))
    }
}
