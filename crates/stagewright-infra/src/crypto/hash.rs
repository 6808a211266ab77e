//! SHA-256 content hashing for artifact integrity verification.
//!
//! Implements the `ContentHasher` trait from `stagewright-core` using the
//! `sha2` crate (RustCrypto ecosystem).

use sha2::{Digest, Sha256};

use stagewright_core::hash::ContentHasher;

/// SHA-256 implementation of `ContentHasher`.
///
/// Checksums are written as `sha256:<lowercase hex>`.
#[derive(Debug, Clone, Copy)]
pub struct Sha256ContentHasher;

impl Sha256ContentHasher {
    /// Create a new hasher.
    pub fn new() -> Self {
        Self
    }
}

impl Default for Sha256ContentHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl ContentHasher for Sha256ContentHasher {
    fn algorithm(&self) -> &'static str {
        "sha256"
    }

    fn compute_hash(&self, content: &[u8]) -> String {
        let digest = Sha256::digest(content);
        format!("{:x}", digest)
    }
}
