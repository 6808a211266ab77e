//! ContentHasher trait for computing artifact checksums.
//!
//! Defined in stagewright-core so the artifact stores can hash bytes without
//! coupling to a specific algorithm. The `Sha256ContentHasher` adapter lives in
//! stagewright-infra.

use stagewright_types::artifact::Checksum;

/// Abstraction over content hashing for integrity verification.
pub trait ContentHasher: Send + Sync {
    /// Algorithm tag written in front of the digest (e.g. "sha256").
    fn algorithm(&self) -> &'static str;

    /// Compute a lowercase hex-encoded digest of `content`.
    fn compute_hash(&self, content: &[u8]) -> String;

    /// Algorithm-tagged checksum of `content`.
    fn checksum(&self, content: &[u8]) -> Checksum {
        Checksum::new(self.algorithm(), self.compute_hash(content))
    }

    /// Whether `content` hashes to `expected`. A different algorithm tag never matches.
    fn verify(&self, expected: &Checksum, content: &[u8]) -> bool {
        expected.algorithm == self.algorithm() && expected.digest == self.compute_hash(content)
    }
}

/// 64-bit FNV-1a. Not collision resistant; used by the in-memory store tests.
#[cfg(test)]
pub(crate) struct Fnv1aHasher;

#[cfg(test)]
impl ContentHasher for Fnv1aHasher {
    fn algorithm(&self) -> &'static str {
        "fnv1a64"
    }

    fn compute_hash(&self, content: &[u8]) -> String {
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in content {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        }
        format!("{hash:016x}")
    }
}
