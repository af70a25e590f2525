//! ContentHasher trait for computing workflow checksums.
//!
//! Defined in taskloom-core so the checksum engine can digest declarations
//! without coupling to a specific hashing algorithm. The
//! `Sha256ContentHasher` adapter lives in taskloom-infra.

/// Abstraction over content hashing.
pub trait ContentHasher: Send + Sync {
    /// Compute a hex-encoded hash of the given content.
    fn compute_hash(&self, content: &str) -> String;
}
