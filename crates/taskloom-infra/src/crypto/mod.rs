//! Cryptographic operations for Taskloom.
//!
//! - `hash`: SHA-256 digests backing workflow version checksums

pub mod hash;
